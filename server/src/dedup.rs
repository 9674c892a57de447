//! Inbound-event deduplication.
//!
//! Chat providers redeliver events on slow acknowledgements; a SET-NX with a
//! five-minute window keeps redeliveries from re-triggering side effects.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::store::Store;

const DEDUP_TTL: Duration = Duration::from_secs(300);

pub struct EventDedup {
    store: Arc<dyn Store>,
}

impl EventDedup {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(event_id: &str) -> String {
        format!("slack_event:{}", event_id)
    }

    /// True exactly once per event id within the window; callers skip
    /// processing on false.
    pub async fn first_sighting(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .store
            .kv_set_nx(&Self::key(event_id), "1", DEDUP_TTL)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn repeat_event_ids_are_skipped() {
        let dedup = EventDedup::new(Arc::new(MemoryStore::new()));

        assert!(dedup.first_sighting("Ev123").await.unwrap());
        assert!(!dedup.first_sighting("Ev123").await.unwrap());
        assert!(dedup.first_sighting("Ev124").await.unwrap());
    }
}
