//! Processed-event ledger backing idempotent consumption.
//!
//! Redelivery is a fact of at-least-once messaging, so every handler checks
//! this store before applying a side effect and records the event id
//! afterwards. The trait is the contract; durable implementations must keep
//! entries at least as long as the maximum plausible redelivery window.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors raised by a processed-event store.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("processed-event store unavailable: {0}")]
    Unavailable(String),
}

/// Ledger of event ids that have already been applied.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Whether this event id has been applied before.
    async fn is_processed(&self, event_id: Uuid) -> Result<bool, IdempotencyError>;

    /// Record an event id as applied. Must be called after the side effect
    /// so a crash in between re-applies rather than drops.
    async fn mark_processed(&self, event_id: Uuid) -> Result<(), IdempotencyError>;
}

/// In-memory store for tests and standalone runs.
///
/// Entries do not survive a restart; production deployments back the trait
/// with durable state instead.
#[derive(Default)]
pub struct InMemoryProcessedStore {
    seen: RwLock<HashSet<Uuid>>,
}

impl InMemoryProcessedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedStore {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool, IdempotencyError> {
        Ok(self.seen.read().await.contains(&event_id))
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<(), IdempotencyError> {
        self.seen.write().await.insert(event_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_event_is_not_processed() {
        let store = InMemoryProcessedStore::new();
        assert!(!store.is_processed(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn marked_event_is_processed() {
        let store = InMemoryProcessedStore::new();
        let id = Uuid::new_v4();

        store.mark_processed(id).await.unwrap();

        assert!(store.is_processed(id).await.unwrap());
        assert!(!store.is_processed(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn marking_twice_is_a_no_op() {
        let store = InMemoryProcessedStore::new();
        let id = Uuid::new_v4();

        store.mark_processed(id).await.unwrap();
        store.mark_processed(id).await.unwrap();

        assert!(store.is_processed(id).await.unwrap());
    }
}
