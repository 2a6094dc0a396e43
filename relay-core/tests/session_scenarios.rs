//! End-to-end conversation scenarios against both storage engines.

use relay_core::history::HISTORY_TABLE;
use relay_core::{
    Authorization, ContentPart, ConversationId, ConversationSession, DenialReason, Turn,
    UsagePolicy,
};
use relay_store::{InMemoryRowStore, RowKey, RowStore, SqliteRowStore};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const DEFAULT_MODEL: &str = "models/gemini-1.5-flash-latest";

struct Harness {
    store: Arc<dyn RowStore>,
    _tmp: Option<TempDir>,
}

impl Harness {
    fn memory() -> Self {
        Self {
            store: Arc::new(InMemoryRowStore::new()),
            _tmp: None,
        }
    }

    fn sqlite() -> Self {
        let tmp = TempDir::new().unwrap();
        let store = SqliteRowStore::new(&tmp.path().join("relay.db")).unwrap();
        Self {
            store: Arc::new(store),
            _tmp: Some(tmp),
        }
    }

    fn session(&self, ceiling: u64, max_turns: usize) -> ConversationSession {
        ConversationSession::new(
            self.store.clone(),
            UsagePolicy::new(Some("shared-default-key".into()), ceiling),
            DEFAULT_MODEL,
            max_turns,
        )
    }
}

fn text(s: &str) -> Vec<ContentPart> {
    vec![ContentPart::text(s)]
}

async fn order_survives_trims(h: Harness) {
    let session = h.session(0, 6);
    let id = ConversationId::new(100);

    for i in 0..10 {
        session
            .commit_exchange(id, text(&format!("q{i}")), text(&format!("a{i}")))
            .await
            .unwrap();
    }

    let recent = session.history().load_recent(id, 6).await.unwrap();
    let texts: Vec<String> = recent.iter().map(|t| t.turn.text()).collect();
    assert_eq!(texts, vec!["q7", "a7", "q8", "a8", "q9", "a9"]);

    let indices: Vec<i64> = recent.iter().map(|t| t.index).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]));

    // A smaller window is a suffix of what was retained.
    let last_two = session.history().load_recent(id, 2).await.unwrap();
    assert_eq!(last_two[0].turn.text(), "q9");
    assert_eq!(last_two[1].turn.text(), "a9");
}

#[tokio::test]
async fn order_survives_trims_memory() {
    order_survives_trims(Harness::memory()).await;
}

#[tokio::test]
async fn order_survives_trims_sqlite() {
    order_survives_trims(Harness::sqlite()).await;
}

async fn quota_boundary(h: Harness) {
    let session = h.session(10, 20);
    let id = ConversationId::new(200);

    for _ in 0..9 {
        session
            .record_default_usage(id, &Authorization::UseDefaultCredential)
            .await
            .unwrap();
    }

    let ctx = session.prepare_context(id, &text("hello")).await.unwrap();
    assert_eq!(ctx.authorization, Authorization::UseDefaultCredential);
    assert_eq!(session.policy().remaining(&ctx.settings), Some(1));

    let count = session.record_default_usage(id, &ctx.authorization).await.unwrap();
    assert_eq!(count, Some(10));

    let ctx = session.prepare_context(id, &text("hello again")).await.unwrap();
    assert_eq!(
        ctx.authorization,
        Authorization::Denied(DenialReason::QuotaExhausted { used: 10, limit: 10 })
    );
    assert!(ctx.authorization.require().unwrap_err().is_user_facing());
}

#[tokio::test]
async fn quota_boundary_memory() {
    quota_boundary(Harness::memory()).await;
}

#[tokio::test]
async fn quota_boundary_sqlite() {
    quota_boundary(Harness::sqlite()).await;
}

async fn reset_restores_defaults(h: Harness) {
    let session = h.session(10, 20);
    let id = ConversationId::new(300);

    session.select_model(id, "models/gemini-1.5-pro").await.unwrap();
    session.commit_exchange(id, text("q0"), text("a0")).await.unwrap();
    session.commit_exchange(id, text("q1"), text("a1")).await.unwrap();
    session.history().append(id, &Turn::user(text("q2"))).await.unwrap();
    session
        .record_default_usage(id, &Authorization::UseDefaultCredential)
        .await
        .unwrap();
    assert_eq!(session.history().load_all(id).await.unwrap().len(), 5);

    session.reset_conversation(id).await.unwrap();

    assert!(session.history().load_recent(id, 10).await.unwrap().is_empty());
    let settings = session.current_settings(id).await.unwrap();
    assert_eq!(settings.selected_model, DEFAULT_MODEL);
    assert_eq!(settings.default_credential_usage_count, 0);
    assert!(settings.credential_override.is_none());
}

#[tokio::test]
async fn reset_restores_defaults_memory() {
    reset_restores_defaults(Harness::memory()).await;
}

#[tokio::test]
async fn reset_restores_defaults_sqlite() {
    reset_restores_defaults(Harness::sqlite()).await;
}

async fn malformed_row_is_skipped(h: Harness) {
    let session = h.session(10, 20);
    let id = ConversationId::new(400);

    session.history().append(id, &Turn::user(text("one"))).await.unwrap();
    h.store
        .insert_row(
            HISTORY_TABLE,
            &RowKey::indexed(id.partition_key(), 1),
            json!({"role": "user", "parts": [{"type": "sticker", "id": "x"}]}),
        )
        .await
        .unwrap();
    session.history().append(id, &Turn::model(text("two"))).await.unwrap();
    session.history().append(id, &Turn::user(text("three"))).await.unwrap();

    let loaded = session.history().load_recent(id, 10).await.unwrap();
    let texts: Vec<String> = loaded.iter().map(|t| t.turn.text()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn malformed_row_is_skipped_memory() {
    malformed_row_is_skipped(Harness::memory()).await;
}

#[tokio::test]
async fn malformed_row_is_skipped_sqlite() {
    malformed_row_is_skipped(Harness::sqlite()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_usage_is_counted_exactly() {
    let h = Harness::sqlite();
    let session = h.session(0, 20);
    let id = ConversationId::new(500);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session
                .record_default_usage(id, &Authorization::UseDefaultCredential)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let settings = session.current_settings(id).await.unwrap();
    assert_eq!(settings.default_credential_usage_count, 16);
}

#[tokio::test]
async fn stale_index_does_not_overwrite() {
    let h = Harness::sqlite();
    let session = h.session(0, 20);
    let id = ConversationId::new(600);
    session.history().append(id, &Turn::user(text("first"))).await.unwrap();

    // A writer that computed index 0 before the first append landed.
    let err = h
        .store
        .insert_row(
            HISTORY_TABLE,
            &RowKey::indexed(id.partition_key(), 0),
            json!({"role": "user", "parts": [{"type": "text", "text": "late"}]}),
        )
        .await
        .unwrap_err();
    assert!(err.is_transient());

    let all = session.history().load_all(id).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].turn.text(), "first");
}

#[tokio::test]
async fn images_keep_reference_and_caption() {
    let h = Harness::sqlite();
    let session = h.session(0, 20);
    let id = ConversationId::new(700);

    let user = vec![
        ContentPart::image("image/jpeg", Some("my garden".into())),
        ContentPart::text("What plant is this?"),
    ];
    session.commit_exchange(id, user.clone(), text("A fern.")).await.unwrap();

    let ctx = session.prepare_context(id, &text("thanks")).await.unwrap();
    assert_eq!(ctx.history[0].parts, user);
}
