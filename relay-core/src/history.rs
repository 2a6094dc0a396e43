//! Ordered turn log per conversation.

use crate::codec::{decode_turn, encode_turn};
use crate::types::{ConversationId, IndexedTurn, Turn};
use relay_common::{Error, Result, ResultExt};
use relay_store::{RangeQuery, Row, RowKey, RowSelector, RowStore};
use std::sync::Arc;
use tracing::{debug, warn};

pub const HISTORY_TABLE: &str = "chat_history";

/// History store backed by a [`RowStore`] table keyed by (conversation, index).
#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn RowStore>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    async fn next_index(&self, id: ConversationId) -> Result<i64> {
        let latest = self
            .store
            .query_range(HISTORY_TABLE, &id.partition_key(), RangeQuery::latest(1))
            .await?;
        Ok(latest.first().map_or(0, |row| row.key.sort + 1))
    }

    /// Append a turn and return the index it was stored at.
    ///
    /// The insert never overwrites: if another writer claimed the same index
    /// first, this fails with [`Error::Conflict`].
    pub async fn append(&self, id: ConversationId, turn: &Turn) -> Result<i64> {
        if turn.parts.is_empty() {
            return Err(Error::InvalidInput("cannot store a turn without parts".into()));
        }

        let index = self.next_index(id).await?;
        self.store
            .insert_row(
                HISTORY_TABLE,
                &RowKey::indexed(id.partition_key(), index),
                encode_turn(turn),
            )
            .await
            .context(format!("append turn {index} for conversation {id}"))?;

        debug!(conversation = %id, index, role = %turn.role, "Appended turn");
        Ok(index)
    }

    /// The last `max_turns` turns in ascending index order.
    ///
    /// Rows that fail to decode are skipped with a warning rather than failing
    /// the whole load.
    pub async fn load_recent(&self, id: ConversationId, max_turns: usize) -> Result<Vec<IndexedTurn>> {
        if max_turns == 0 {
            return Ok(Vec::new());
        }
        let mut rows = self
            .store
            .query_range(HISTORY_TABLE, &id.partition_key(), RangeQuery::latest(max_turns))
            .await?;
        rows.reverse();
        Ok(decode_rows(id, rows))
    }

    /// Every stored turn in ascending index order.
    pub async fn load_all(&self, id: ConversationId) -> Result<Vec<IndexedTurn>> {
        let rows = self
            .store
            .query_range(HISTORY_TABLE, &id.partition_key(), RangeQuery::all())
            .await?;
        Ok(decode_rows(id, rows))
    }

    /// Keep only the `max_turns` most recent turns. Returns how many were removed.
    pub async fn trim(&self, id: ConversationId, max_turns: usize) -> Result<usize> {
        let partition = id.partition_key();
        if max_turns == 0 {
            return self.clear(id).await;
        }

        let retained = self
            .store
            .query_range(HISTORY_TABLE, &partition, RangeQuery::latest(max_turns))
            .await?;
        if retained.len() < max_turns {
            return Ok(0);
        }
        let Some(oldest_kept) = retained.last().map(|row| row.key.sort) else {
            return Ok(0);
        };

        let removed = self
            .store
            .delete_rows(
                HISTORY_TABLE,
                &RowSelector::Before {
                    partition,
                    sort: oldest_kept,
                },
            )
            .await?;
        if removed > 0 {
            debug!(conversation = %id, removed, oldest_kept, "Trimmed history");
        }
        Ok(removed)
    }

    /// Delete every turn of the conversation. Clearing an empty history is a no-op.
    pub async fn clear(&self, id: ConversationId) -> Result<usize> {
        let removed = self
            .store
            .delete_rows(HISTORY_TABLE, &RowSelector::Partition(id.partition_key()))
            .await?;
        debug!(conversation = %id, removed, "Cleared history");
        Ok(removed)
    }
}

fn decode_rows(id: ConversationId, rows: Vec<Row>) -> Vec<IndexedTurn> {
    rows.into_iter()
        .filter_map(|row| match decode_turn(&row.record) {
            Ok(turn) => Some(IndexedTurn {
                index: row.key.sort,
                turn,
            }),
            Err(e) => {
                warn!(conversation = %id, index = row.key.sort, error = %e, "Skipping unreadable turn");
                None
            }
        })
        .collect()
}
