//! Relay Core - conversation state for the Gemini chat relay.
//!
//! ## Architecture
//!
//! ```text
//! handler ─→ ConversationSession ─┬─→ SettingsStore ─┐
//!                 │               ├─→ HistoryStore ──┼─→ codec ─→ RowStore
//!                 └─→ UsagePolicy └──────────────────┘
//! ```
//!
//! Nothing here caches state between calls: every operation reads what it
//! needs from the row store, so any number of relay processes can serve the
//! same conversations.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod codec;
pub mod history;
pub mod policy;
pub mod session;
pub mod settings;
pub mod types;

pub use history::HistoryStore;
pub use policy::{Authorization, DenialReason, UsagePolicy};
pub use session::{ConversationSession, CredentialChange, ModelChange, PreparedContext};
pub use settings::SettingsStore;
pub use types::{
    ContentPart, ConversationId, ConversationSettings, IndexedTurn, Role, SettingsUpdate, Turn,
};
