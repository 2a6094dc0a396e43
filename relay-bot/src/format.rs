//! Telegram reply formatting.
//!
//! Model replies are Markdown. Telegram's HTML parse mode is the most forgiving
//! target, so replies are converted to HTML and cut into message-sized chunks.
//! Large code blocks are sent as files and Mermaid diagrams as rendered images.

use base64::Engine;
use regex::Regex;
use std::sync::LazyLock;

/// Longest text sent in one Telegram message.
pub const MAX_MESSAGE_CHARS: usize = 4090;

/// Code blocks beyond either limit are sent as a file.
const CODE_FILE_MIN_LINES: usize = 30;
const CODE_FILE_MIN_CHARS: usize = 1500;

const MERMAID_INK_BASE: &str = "https://mermaid.ink/img/";

// ============================================================================
// Regex Patterns
// ============================================================================

static H1_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^# (.+)$").unwrap());
static H2_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^## (.+)$").unwrap());
static H3_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^### (.+)$").unwrap());
static H4_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#### (.+)$").unwrap());
static DASH_LIST_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\s*)- (.*)$").unwrap());
static ASTERISK_LIST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)\* (.*)$").unwrap());
static QUOTE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^> ?(.+)$").unwrap());
static BOLD_DOUBLE_ASTERISK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
// Content may not start or end with a space, so "2 * 3 * 4" is left alone.
static BOLD_SINGLE_ASTERISK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\s](?:[^*\n]*[^*\s])?)\*").unwrap());
// Word boundaries keep snake_case identifiers intact.
static ITALIC_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b_([^_\n]+?)_\b").unwrap());
static INLINE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`([^`\n]+?)`|\[([^\]\n]+)\]\(([^)\s]+)\)").unwrap()
});
static TABLE_HEADER_SEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\|?[\s:]*-+[\s:|-]*\|?$").unwrap());
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());

// ============================================================================
// Public API
// ============================================================================

/// One thing to send for a reply, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingItem {
    /// Telegram HTML, at most [`MAX_MESSAGE_CHARS`] characters.
    Text { html: String },
    File { file_name: String, bytes: Vec<u8> },
    /// A Mermaid diagram rendered by mermaid.ink. `source` is the fallback.
    Diagram { url: String, source: String },
}

/// Turn a Markdown reply into the items to send.
pub fn render_reply(markdown: &str) -> Vec<OutgoingItem> {
    let mut items = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut code_files = 0;

    for block in parse_blocks(markdown) {
        match block {
            Block::Prose(text) => {
                for paragraph in text.split("\n\n").filter(|p| !p.trim().is_empty()) {
                    prose_to_html_blocks(paragraph, &mut pending);
                }
            }
            Block::Code { lang, body } if lang.eq_ignore_ascii_case("mermaid") => {
                flush_text(&mut pending, &mut items);
                items.push(OutgoingItem::Diagram {
                    url: mermaid_url(&body),
                    source: body,
                });
            }
            Block::Code { lang, body } => {
                let html = code_block_html(&body);
                let too_big = body.lines().count() > CODE_FILE_MIN_LINES
                    || body.chars().count() > CODE_FILE_MIN_CHARS
                    || html.chars().count() > MAX_MESSAGE_CHARS;
                if too_big {
                    flush_text(&mut pending, &mut items);
                    code_files += 1;
                    items.push(OutgoingItem::File {
                        file_name: format!("code_{code_files}.{}", extension_for(&lang)),
                        bytes: body.into_bytes(),
                    });
                } else {
                    pending.push(html);
                }
            }
        }
    }

    flush_text(&mut pending, &mut items);
    items
}

/// Convert standard Markdown to Telegram-compatible HTML format.
///
/// # Conversion Rules
///
/// | Input              | Output                    |
/// |--------------------|---------------------------|
/// | `# Title`          | `<b>📌 Title</b>`         |
/// | `## Subtitle`      | `<b>Subtitle</b>`         |
/// | `### Section`      | `<i>Section</i>`          |
/// | `- Item`           | `• Item`                  |
/// | `> Quote`          | `┃ <i>Quote</i>`          |
/// | ` ```code``` `     | `<pre>code</pre>`         |
/// | `**bold**`         | `<b>bold</b>`             |
/// | `_italic_`         | `<i>italic</i>`           |
/// | `` `code` ``       | `<code>code</code>`       |
/// | `[text](url)`      | `<a href="url">text</a>`  |
/// | Markdown tables    | Monospace box table       |
pub fn to_telegram_html(markdown: &str) -> String {
    parse_blocks(markdown)
        .into_iter()
        .map(|block| match block {
            Block::Prose(text) => convert_prose(&text),
            Block::Code { body, .. } => code_block_html(&body),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip tags and entities from Telegram HTML, for resending as plain text.
pub fn html_to_plain(html: &str) -> String {
    HTML_TAG
        .replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Escape HTML special characters.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Split text into chunks of at most `max_chars` characters, preferring
/// paragraph, line, sentence and word boundaries in that order.
pub fn split_message(message: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if message.chars().count() <= max_chars {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_pos = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .or_else(|| window.rfind(". ").map(|i| i + 1))
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_pos].to_string());
        remaining = remaining[split_pos..].trim_start();
    }

    chunks
}

/// Image URL for a Mermaid diagram.
pub fn mermaid_url(source: &str) -> String {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(source.trim());
    format!("{MERMAID_INK_BASE}{encoded}")
}

// ============================================================================
// Block Parsing
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Block {
    Prose(String),
    Code { lang: String, body: String },
}

/// Separate fenced code blocks from the surrounding text. An unclosed fence
/// runs to the end of the input.
fn parse_blocks(markdown: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut fence: Option<(String, Vec<&str>)> = None;

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        match fence.as_mut() {
            Some((lang, body)) => {
                if trimmed.starts_with("```") {
                    blocks.push(Block::Code {
                        lang: std::mem::take(lang),
                        body: body.join("\n"),
                    });
                    fence = None;
                } else {
                    body.push(line);
                }
            }
            None => {
                if let Some(rest) = trimmed.strip_prefix("```") {
                    if !prose.is_empty() {
                        blocks.push(Block::Prose(prose.join("\n")));
                        prose.clear();
                    }
                    fence = Some((rest.trim().to_string(), Vec::new()));
                } else {
                    prose.push(line);
                }
            }
        }
    }

    if let Some((lang, body)) = fence {
        blocks.push(Block::Code {
            lang,
            body: body.join("\n"),
        });
    }
    if !prose.is_empty() {
        blocks.push(Block::Prose(prose.join("\n")));
    }
    blocks
}

fn code_block_html(body: &str) -> String {
    format!("<pre>{}</pre>", escape_html(body.trim_matches('\n')))
}

fn extension_for(lang: &str) -> &'static str {
    match lang.to_ascii_lowercase().as_str() {
        "rust" | "rs" => "rs",
        "python" | "py" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "go" | "golang" => "go",
        "java" => "java",
        "kotlin" | "kt" => "kt",
        "c" => "c",
        "cpp" | "c++" => "cpp",
        "csharp" | "cs" | "c#" => "cs",
        "ruby" | "rb" => "rb",
        "php" => "php",
        "swift" => "swift",
        "bash" | "sh" | "shell" | "zsh" => "sh",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        "markdown" | "md" => "md",
        _ => "txt",
    }
}

// ============================================================================
// Chunk Packing
// ============================================================================

/// Convert a paragraph, halving it until each piece fits in one message.
fn prose_to_html_blocks(raw: &str, out: &mut Vec<String>) {
    let html = convert_prose(raw);
    if html.chars().count() <= MAX_MESSAGE_CHARS {
        out.push(html);
        return;
    }
    let half = (raw.chars().count() / 2).max(1);
    for piece in split_message(raw, half) {
        prose_to_html_blocks(&piece, out);
    }
}

/// Pack whole HTML blocks into messages so no tag is cut in half.
fn flush_text(pending: &mut Vec<String>, items: &mut Vec<OutgoingItem>) {
    let mut current = String::new();
    let mut current_len = 0;

    for block in pending.drain(..) {
        let block_len = block.chars().count();
        if current_len > 0 && current_len + 2 + block_len > MAX_MESSAGE_CHARS {
            items.push(OutgoingItem::Text {
                html: std::mem::take(&mut current),
            });
            current_len = 0;
        }
        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(&block);
        current_len += block_len;
    }

    if !current.trim().is_empty() {
        items.push(OutgoingItem::Text { html: current });
    }
}

// ============================================================================
// Table Conversion
// ============================================================================

/// Convert prose lines, rendering Markdown tables as box tables.
fn convert_prose(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut result = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if is_table_row(lines[i]) && i + 1 < lines.len() && TABLE_HEADER_SEP.is_match(lines[i + 1].trim())
        {
            let mut table_lines = vec![lines[i]];
            let mut j = i + 2;
            while j < lines.len() && is_table_row(lines[j]) {
                table_lines.push(lines[j]);
                j += 1;
            }
            result.push(render_box_table(&table_lines));
            i = j;
        } else {
            result.push(convert_line(lines[i]));
            i += 1;
        }
    }

    result.join("\n")
}

/// Check if a line looks like a table row (contains | separators).
fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.contains('|') && !TABLE_HEADER_SEP.is_match(trimmed)
}

/// Render a Markdown table with box-drawing characters inside `<pre>`.
fn render_box_table(rows: &[&str]) -> String {
    let parsed_rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            row.trim()
                .trim_matches('|')
                .split('|')
                .map(|cell| cell.trim().to_string())
                .collect()
        })
        .collect();

    let col_count = parsed_rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut col_widths: Vec<usize> = vec![3; col_count];
    for row in &parsed_rows {
        for (i, cell) in row.iter().enumerate() {
            col_widths[i] = col_widths[i].max(unicode_width(cell));
        }
    }

    let mut output = vec![build_border(&col_widths, '┌', '┬', '┐')];
    if let Some(header) = parsed_rows.first() {
        output.push(build_row(header, &col_widths));
        output.push(build_border(&col_widths, '├', '┼', '┤'));
    }
    for row in parsed_rows.iter().skip(1) {
        output.push(build_row(row, &col_widths));
    }
    output.push(build_border(&col_widths, '└', '┴', '┘'));

    format!("<pre>{}</pre>", escape_html(&output.join("\n")))
}

fn build_border(widths: &[usize], left: char, mid: char, right: char) -> String {
    let segments: Vec<String> = widths.iter().map(|&w| "─".repeat(w + 2)).collect();
    format!("{left}{}{right}", segments.join(&mid.to_string()))
}

fn build_row(cells: &[String], widths: &[usize]) -> String {
    let padded: Vec<String> = widths
        .iter()
        .enumerate()
        .map(|(i, &width)| {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            let padding = width.saturating_sub(unicode_width(cell));
            format!(" {cell}{} ", " ".repeat(padding))
        })
        .collect();
    format!("│{}│", padded.join("│"))
}

/// Display width of a string, counting CJK characters as two columns.
fn unicode_width(s: &str) -> usize {
    s.chars().map(|c| if is_wide_char(c) { 2 } else { 1 }).sum()
}

fn is_wide_char(c: char) -> bool {
    let code = c as u32;
    (0x4E00..=0x9FFF).contains(&code)
        || (0x3400..=0x4DBF).contains(&code)
        || (0xF900..=0xFAFF).contains(&code)
        || (0x3000..=0x303F).contains(&code)
        || (0xFF00..=0xFFEF).contains(&code)
        || (0xAC00..=0xD7AF).contains(&code)
}

// ============================================================================
// Line Conversion
// ============================================================================

fn capture<'a>(caps: &regex::Captures<'a>, i: usize) -> &'a str {
    caps.get(i).map_or("", |m| m.as_str())
}

fn convert_line(line: &str) -> String {
    if let Some(caps) = H1_PATTERN.captures(line) {
        return format!("<b>📌 {}</b>", escape_html(capture(&caps, 1)));
    }
    if let Some(caps) = H2_PATTERN.captures(line) {
        return format!("<b>{}</b>", escape_html(capture(&caps, 1)));
    }
    if let Some(caps) = H3_PATTERN
        .captures(line)
        .or_else(|| H4_PATTERN.captures(line))
    {
        return format!("<i>{}</i>", escape_html(capture(&caps, 1)));
    }
    if let Some(caps) = QUOTE_PATTERN.captures(line) {
        return format!("┃ <i>{}</i>", escape_html(capture(&caps, 1)));
    }
    if let Some(caps) = DASH_LIST_PATTERN
        .captures(line)
        .or_else(|| ASTERISK_LIST_PATTERN.captures(line))
    {
        return format!("{}• {}", capture(&caps, 1), convert_inline(capture(&caps, 2)));
    }
    convert_inline(line)
}

// ============================================================================
// Inline Formatting
// ============================================================================

/// Escape a span and apply inline code, links and emphasis.
fn convert_inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in INLINE_TOKEN.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&emphasis(&escape_html(&text[last..whole.start()])));

        if let Some(code) = caps.get(1) {
            out.push_str(&format!("<code>{}</code>", escape_html(code.as_str())));
        } else {
            let label = emphasis(&escape_html(capture(&caps, 2)));
            let url = escape_html(capture(&caps, 3)).replace('"', "&quot;");
            out.push_str(&format!("<a href=\"{url}\">{label}</a>"));
        }
        last = whole.end();
    }

    out.push_str(&emphasis(&escape_html(&text[last..])));
    out
}

fn emphasis(escaped: &str) -> String {
    let bold = BOLD_DOUBLE_ASTERISK.replace_all(escaped, "<b>$1</b>");
    let bold = BOLD_SINGLE_ASTERISK.replace_all(&bold, "<b>$1</b>");
    ITALIC_UNDERSCORE.replace_all(&bold, "<i>$1</i>").into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------------
    // Heading Tests
    // ------------------------------------------------------------------------

    #[test]
    fn convert_headings() {
        assert_eq!(to_telegram_html("# Title"), "<b>📌 Title</b>");
        assert_eq!(to_telegram_html("## Subtitle"), "<b>Subtitle</b>");
        assert_eq!(to_telegram_html("### Section"), "<i>Section</i>");
        assert_eq!(to_telegram_html("#### Minor"), "<i>Minor</i>");
    }

    // ------------------------------------------------------------------------
    // List and Quote Tests
    // ------------------------------------------------------------------------

    #[test]
    fn convert_nested_list() {
        assert_eq!(to_telegram_html("- Item 1\n  - Nested"), "• Item 1\n  • Nested");
        assert_eq!(to_telegram_html("* **Key**: value"), "• <b>Key</b>: value");
    }

    #[test]
    fn convert_quote() {
        assert_eq!(to_telegram_html("> Quote"), "┃ <i>Quote</i>");
    }

    // ------------------------------------------------------------------------
    // Code Tests
    // ------------------------------------------------------------------------

    #[test]
    fn convert_code_block() {
        assert_eq!(to_telegram_html("```rust\nfn main() {}\n```"), "<pre>fn main() {}</pre>");
        assert_eq!(
            to_telegram_html("```\nif a < b && c {}\n```"),
            "<pre>if a &lt; b &amp;&amp; c {}</pre>"
        );
    }

    #[test]
    fn convert_inline_code_is_not_formatted() {
        assert_eq!(
            to_telegram_html("Use `my_var_name * 2` here"),
            "Use <code>my_var_name * 2</code> here"
        );
    }

    // ------------------------------------------------------------------------
    // Inline Formatting Tests
    // ------------------------------------------------------------------------

    #[test]
    fn convert_emphasis() {
        assert_eq!(to_telegram_html("**bold**"), "<b>bold</b>");
        assert_eq!(to_telegram_html("*bold*"), "<b>bold</b>");
        assert_eq!(to_telegram_html("_italic_"), "<i>italic</i>");
        assert_eq!(to_telegram_html("2 * 3 * 4"), "2 * 3 * 4");
        assert_eq!(to_telegram_html("snake_case_name"), "snake_case_name");
    }

    #[test]
    fn convert_link() {
        assert_eq!(
            to_telegram_html("[Google](https://google.com/?a=1&b=2)"),
            "<a href=\"https://google.com/?a=1&amp;b=2\">Google</a>"
        );
    }

    #[test]
    fn plain_text_is_escaped() {
        assert_eq!(to_telegram_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
        assert_eq!(to_telegram_html("# A < B"), "<b>📌 A &lt; B</b>");
    }

    // ------------------------------------------------------------------------
    // Table Tests
    // ------------------------------------------------------------------------

    #[test]
    fn convert_simple_table() {
        let result = to_telegram_html("| Name | Age |\n|------|-----|\n| Alice | 30 |");
        assert!(result.starts_with("<pre>┌"));
        assert!(result.ends_with("┘</pre>"));
        assert!(result.contains("│ Alice │ 30  │"));
    }

    #[test]
    fn table_cells_are_escaped_and_unformatted() {
        let result = to_telegram_html("| a | b |\n|---|---|\n| *x* | <y> |");
        assert!(result.contains("*x*"));
        assert!(result.contains("&lt;y&gt;"));
        assert!(!result.contains("<b>"));
    }

    #[test]
    fn unicode_width_counts_cjk_double() {
        assert_eq!(unicode_width("hello"), 5);
        assert_eq!(unicode_width("你好"), 4);
        assert_eq!(unicode_width("hello你好"), 9);
    }

    // ------------------------------------------------------------------------
    // Reply Rendering Tests
    // ------------------------------------------------------------------------

    #[test]
    fn short_reply_is_one_text() {
        let items = render_reply("## Summary\n- Point 1\n\nDone.");
        assert_eq!(
            items,
            vec![OutgoingItem::Text {
                html: "<b>Summary</b>\n• Point 1\n\nDone.".into()
            }]
        );
    }

    #[test]
    fn mermaid_becomes_diagram_in_order() {
        let items = render_reply("Before\n```mermaid\ngraph TD; A-->B\n```\nAfter");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], OutgoingItem::Text { html: "Before".into() });
        let OutgoingItem::Diagram { url, source } = &items[1] else {
            panic!("expected a diagram");
        };
        assert_eq!(source, "graph TD; A-->B");
        assert_eq!(url, &mermaid_url("graph TD; A-->B"));
        assert!(url.starts_with("https://mermaid.ink/img/"));
        assert_eq!(items[2], OutgoingItem::Text { html: "After".into() });
    }

    #[test]
    fn long_code_becomes_file() {
        let body: Vec<String> = (0..40).map(|i| format!("print({i})")).collect();
        let reply = format!("Here:\n```python\n{}\n```", body.join("\n"));
        let items = render_reply(&reply);
        assert_eq!(items.len(), 2);
        let OutgoingItem::File { file_name, bytes } = &items[1] else {
            panic!("expected a file");
        };
        assert_eq!(file_name, "code_1.py");
        assert_eq!(String::from_utf8_lossy(bytes), body.join("\n"));
    }

    #[test]
    fn long_reply_is_chunked_within_limit() {
        let paragraph = "word ".repeat(300);
        let reply = vec![paragraph.trim(); 12].join("\n\n");
        let items = render_reply(&reply);
        assert!(items.len() > 1);
        for item in &items {
            let OutgoingItem::Text { html } = item else {
                panic!("expected text");
            };
            assert!(html.chars().count() <= MAX_MESSAGE_CHARS);
        }
    }

    #[test]
    fn single_huge_paragraph_is_split() {
        let reply = "a<b ".repeat(3000);
        let items = render_reply(&reply);
        assert!(items.len() > 1);
        for item in &items {
            let OutgoingItem::Text { html } = item else {
                panic!("expected text");
            };
            assert!(html.chars().count() <= MAX_MESSAGE_CHARS);
        }
    }

    #[test]
    fn unclosed_fence_runs_to_end() {
        assert_eq!(
            parse_blocks("intro\n```js\nlet x = 1;"),
            vec![
                Block::Prose("intro".into()),
                Block::Code {
                    lang: "js".into(),
                    body: "let x = 1;".into()
                }
            ]
        );
    }

    // ------------------------------------------------------------------------
    // Splitting and Plain Text Tests
    // ------------------------------------------------------------------------

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello, World!", 4096), vec!["Hello, World!"]);
    }

    #[test]
    fn split_message_prefers_boundaries() {
        let chunks = split_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line", "second line"]);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(5000);
        let chunks = split_message(&msg, 4090);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4090);
        assert_eq!(chunks[1].chars().count(), 910);
    }

    #[test]
    fn html_to_plain_round_trip() {
        let html = to_telegram_html("**Tom & Jerry** <3");
        assert_eq!(html, "<b>Tom &amp; Jerry</b> &lt;3");
        assert_eq!(html_to_plain(&html), "Tom & Jerry <3");
    }
}
