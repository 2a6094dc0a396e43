//! Shared fakes for relay-bot integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use relay_bot::channels::{
    ChannelError, ChannelResult, DownloadedFile, InboundContent, InboundEvent, InboundMessage,
    InlineButton, ParseMode, Transport,
};
use relay_bot::providers::{
    GenerationError, GenerationRequest, Generator, ModelInfo,
};
use relay_bot::BotHandler;
use relay_common::Error;
use relay_core::{ContentPart, ConversationSession, UsagePolicy};
use relay_store::{InMemoryRowStore, RangeQuery, Row, RowKey, RowSelector, RowStore};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

pub const CHAT: i64 = 4242;
pub const DEFAULT_KEY: &str = "shared-default-key";
pub const DEFAULT_MODEL: &str = "models/gemini-1.5-flash-latest";

// ============================================================================
// Fake Transport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { chat_id: i64, text: String, mode: ParseMode },
    Document { chat_id: i64, file_name: String, bytes: Vec<u8> },
    Photo { chat_id: i64, url: String },
    Animation { chat_id: i64, file_id: String, message_id: i64 },
    Keyboard { chat_id: i64, text: String, buttons: Vec<Vec<InlineButton>> },
    Edit { chat_id: i64, message_id: i64, text: String },
    Delete { chat_id: i64, message_id: i64 },
    Answer { callback_id: String, text: Option<String> },
}

#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<Sent>>,
    pub file: Mutex<Option<DownloadedFile>>,
    pub fail_photos: bool,
    next_id: AtomicI64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            ..Self::default()
        }
    }

    pub fn with_file(self, file_path: &str, bytes: &[u8]) -> Self {
        *self.file.lock().unwrap() = Some(DownloadedFile {
            bytes: bytes.to_vec(),
            file_path: file_path.to_string(),
        });
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Texts sent with either parse mode, in order.
    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn last_text(&self) -> String {
        self.texts().pop().unwrap_or_default()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }

    fn next_message_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn send_text(&self, chat_id: i64, text: &str, mode: ParseMode) -> ChannelResult<i64> {
        self.record(Sent::Text {
            chat_id,
            text: text.to_string(),
            mode,
        });
        Ok(self.next_message_id())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        bytes: Vec<u8>,
        file_name: &str,
        _caption: Option<&str>,
    ) -> ChannelResult<()> {
        self.record(Sent::Document {
            chat_id,
            file_name: file_name.to_string(),
            bytes,
        });
        Ok(())
    }

    async fn send_photo_url(&self, chat_id: i64, url: &str, _caption: Option<&str>) -> ChannelResult<()> {
        if self.fail_photos {
            return Err(ChannelError::InvalidMessage("sendPhoto: wrong file identifier".into()));
        }
        self.record(Sent::Photo {
            chat_id,
            url: url.to_string(),
        });
        Ok(())
    }

    async fn send_animation(
        &self,
        chat_id: i64,
        file_id: &str,
        _caption: Option<&str>,
    ) -> ChannelResult<i64> {
        let message_id = self.next_message_id();
        self.record(Sent::Animation {
            chat_id,
            file_id: file_id.to_string(),
            message_id,
        });
        Ok(message_id)
    }

    async fn send_with_inline_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Vec<Vec<InlineButton>>,
    ) -> ChannelResult<i64> {
        self.record(Sent::Keyboard {
            chat_id,
            text: text.to_string(),
            buttons,
        });
        Ok(self.next_message_id())
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        _mode: ParseMode,
    ) -> ChannelResult<()> {
        self.record(Sent::Edit {
            chat_id,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> ChannelResult<()> {
        self.record(Sent::Delete { chat_id, message_id });
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> ChannelResult<()> {
        self.record(Sent::Answer {
            callback_id: callback_id.to_string(),
            text: text.map(String::from),
        });
        Ok(())
    }

    async fn download_file(&self, _file_id: &str) -> ChannelResult<DownloadedFile> {
        self.file
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChannelError::SendFailed("file not found".into()))
    }

    async fn health_check(&self) -> ChannelResult<()> {
        Ok(())
    }
}

// ============================================================================
// Fake Generator
// ============================================================================

pub struct FakeGenerator {
    pub requests: Mutex<Vec<GenerationRequest>>,
    pub replies: Mutex<VecDeque<Result<Vec<ContentPart>, GenerationError>>>,
    pub models: Vec<ModelInfo>,
    /// `validate_credential` rejects these keys.
    pub rejected_keys: Vec<String>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            models: vec![
                model("models/gemini-1.5-flash"),
                model("models/gemini-1.5-pro"),
            ],
            rejected_keys: vec!["bad-key".into()],
        }
    }

    pub fn push_reply(&self, reply: Result<Vec<ContentPart>, GenerationError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn model(name: &str) -> ModelInfo {
    ModelInfo {
        name: name.into(),
        description: Some(format!("{name} description")),
        input_token_limit: Some(1_048_576),
        output_token_limit: Some(8192),
        ..ModelInfo::default()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Vec<ContentPart>, GenerationError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![ContentPart::text("Hello from the model")]))
    }

    async fn list_models(&self, credential: &str) -> Result<Vec<ModelInfo>, GenerationError> {
        if self.rejected_keys.iter().any(|k| k == credential) {
            return Err(GenerationError::new(
                relay_bot::providers::GenerationErrorKind::PermissionDenied,
                "models",
                "API key not valid",
            )
            .with_status(403));
        }
        Ok(self.models.clone())
    }
}

// ============================================================================
// Faulty Store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Put,
    Insert,
    Merge,
    Increment,
    Delete,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Conflict,
}

impl Fault {
    fn error(self, op: StoreOp) -> Error {
        match self {
            Fault::Unavailable => Error::StoreUnavailable(format!("{op:?}: connection refused")),
            Fault::Conflict => Error::Conflict(format!("{op:?}: key already exists")),
        }
    }
}

/// In-memory store that fails chosen operations until healed.
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryRowStore,
    faults: Mutex<HashMap<StoreOp, Fault>>,
}

impl FaultyStore {
    pub fn fail(&self, op: StoreOp, fault: Fault) {
        self.faults.lock().unwrap().insert(op, fault);
    }

    pub fn heal(&self, op: StoreOp) {
        self.faults.lock().unwrap().remove(&op);
    }

    fn check(&self, op: StoreOp) -> relay_common::Result<()> {
        match self.faults.lock().unwrap().get(&op) {
            Some(fault) => Err(fault.error(op)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RowStore for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn get_row(&self, table: &str, key: &RowKey) -> relay_common::Result<Option<Value>> {
        self.check(StoreOp::Get)?;
        self.inner.get_row(table, key).await
    }

    async fn put_row(&self, table: &str, key: &RowKey, record: Value) -> relay_common::Result<()> {
        self.check(StoreOp::Put)?;
        self.inner.put_row(table, key, record).await
    }

    async fn insert_row(&self, table: &str, key: &RowKey, record: Value) -> relay_common::Result<()> {
        self.check(StoreOp::Insert)?;
        self.inner.insert_row(table, key, record).await
    }

    async fn merge_row(
        &self,
        table: &str,
        key: &RowKey,
        patch: Map<String, Value>,
    ) -> relay_common::Result<Value> {
        self.check(StoreOp::Merge)?;
        self.inner.merge_row(table, key, patch).await
    }

    async fn increment_field(
        &self,
        table: &str,
        key: &RowKey,
        field: &str,
        delta: i64,
    ) -> relay_common::Result<i64> {
        self.check(StoreOp::Increment)?;
        self.inner.increment_field(table, key, field, delta).await
    }

    async fn delete_rows(&self, table: &str, selector: &RowSelector) -> relay_common::Result<usize> {
        self.check(StoreOp::Delete)?;
        self.inner.delete_rows(table, selector).await
    }

    async fn query_range(
        &self,
        table: &str,
        partition: &str,
        query: RangeQuery,
    ) -> relay_common::Result<Vec<Row>> {
        self.check(StoreOp::Query)?;
        self.inner.query_range(table, partition, query).await
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub handler: BotHandler,
    pub transport: Arc<FakeTransport>,
    pub generator: Arc<FakeGenerator>,
    pub store: Arc<dyn RowStore>,
    /// Same store as `store`; no operation fails until told to.
    pub faults: Arc<FaultyStore>,
}

pub struct HarnessBuilder {
    default_key: Option<String>,
    ceiling: u64,
    max_turns: usize,
    transport: FakeTransport,
    generator: FakeGenerator,
    animation: Option<String>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            default_key: Some(DEFAULT_KEY.into()),
            ceiling: 5,
            max_turns: 20,
            transport: FakeTransport::new(),
            generator: FakeGenerator::new(),
            animation: None,
        }
    }

    pub fn no_default_key(mut self) -> Self {
        self.default_key = None;
        self
    }

    pub fn ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn transport(mut self, transport: FakeTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn generator(mut self, generator: FakeGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn animation(mut self, file_id: &str) -> Self {
        self.animation = Some(file_id.into());
        self
    }

    pub fn build(self) -> Harness {
        let faults = Arc::new(FaultyStore::default());
        let store: Arc<dyn RowStore> = faults.clone();
        let policy = UsagePolicy::new(self.default_key, self.ceiling);
        let session = ConversationSession::new(store.clone(), policy, DEFAULT_MODEL, self.max_turns);
        let transport = Arc::new(self.transport);
        let generator = Arc::new(self.generator);
        let handler = BotHandler::new(session, generator.clone(), transport.clone())
            .with_loading_animation(self.animation);
        Harness {
            handler,
            transport,
            generator,
            store,
            faults,
        }
    }
}

pub fn text_event(text: &str) -> InboundEvent {
    message_event(InboundContent::Text(text.into()))
}

pub fn message_event(content: InboundContent) -> InboundEvent {
    InboundEvent::Message(InboundMessage {
        chat_id: CHAT,
        message_id: 1,
        user_id: Some(CHAT),
        username: Some("tester".into()),
        content,
    })
}
