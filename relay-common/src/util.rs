//! Utility functions for relay services.

/// Keep the first `max_chars` characters of `s`, marking a cut with "...".
/// Used for button labels, which Telegram shows on a single line.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", s[..cut].trim_end()),
        None => s.to_string(),
    }
}

/// Mask a secret for display, keeping the first and last four characters.
///
/// Secrets of eight characters or fewer are fully masked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("gemini-1.5-pro", 27, "gemini-1.5-pro" ; "fits")]
    #[test_case("gemini-2.0-flash-preview-image-generation", 27, "gemini-2.0-flash-preview-im..." ; "cut")]
    #[test_case("gemini 1.5 pro", 7, "gemini..." ; "trailing space dropped")]
    #[test_case("模型名称很长", 2, "模型..." ; "multibyte")]
    fn test_truncate_with_ellipsis(input: &str, max: usize, expected: &str) {
        assert_eq!(truncate_with_ellipsis(input, max), expected);
    }

    #[test_case("AIzaSyA1234567890xyz", "AIza...0xyz" ; "typical key")]
    #[test_case("123456789", "1234...6789" ; "nine chars")]
    #[test_case("short", "****" ; "short secret")]
    #[test_case("", "****" ; "empty")]
    fn test_mask_secret(input: &str, expected: &str) {
        assert_eq!(mask_secret(input), expected);
    }
}
