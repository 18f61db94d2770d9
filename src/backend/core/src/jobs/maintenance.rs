//! Retention sweeper.
//!
//! Terminal events are soft-archived once they have not been touched for the
//! configured retention period. Nothing is ever deleted.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RetentionConfig;
use crate::error::{GovernanceError, Result};
use crate::store::Store;

pub struct RetentionSweeper {
    store: Arc<dyn Store>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn Store>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// Archive everything past retention. Returns the number of events archived.
    pub async fn sweep(&self) -> Result<u64> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.archive_after).map_err(|e| {
            GovernanceError::configuration(format!("retention period out of range: {}", e))
        })?;

        let archived = self.store.archive_terminal_events(now - retention, now).await?;
        if archived > 0 {
            counter!("vmgov_events_archived_total").increment(archived);
            info!(archived = archived, "Archived terminal events");
        } else {
            debug!("Retention sweep found nothing to archive");
        }
        Ok(archived)
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("Retention sweeper disabled");
                return;
            }

            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep().await {
                            e.log();
                        }
                    }
                }
            }
            info!("Retention sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::event::{Event, EventId, EventStatus, EventType};
    use crate::provider::VmOperation;
    use crate::store::{EventFilter, InMemoryStore};
    use std::time::Duration;

    async fn insert(store: &InMemoryStore, status: EventStatus, age: chrono::Duration) -> EventId {
        let then = Utc::now() - age;
        let event = Event::request(VmOperation::Delete, "vm", "vm-1", b"{}".to_vec(), "alice", status, then);
        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.commit().await.unwrap();
        event.id
    }

    #[tokio::test]
    async fn test_sweep_archives_old_terminal_events_only() {
        let store = Arc::new(InMemoryStore::new());
        let old_done = insert(&store, EventStatus::Completed, chrono::Duration::days(40)).await;
        let old_pending = insert(&store, EventStatus::Pending, chrono::Duration::days(40)).await;
        let fresh_done = insert(&store, EventStatus::Failed, chrono::Duration::days(1)).await;

        let sweeper = RetentionSweeper::new(
            store.clone(),
            RetentionConfig {
                enabled: true,
                archive_after: Duration::from_secs(30 * 24 * 3600),
                sweep_interval: Duration::from_secs(3600),
            },
        );
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert_eq!(sweeper.sweep().await.unwrap(), 0);

        let archived = store.get_event(old_done).await.unwrap().unwrap();
        assert!(archived.archived_at.is_some());
        assert_eq!(archived.event_type, EventType::Requested(VmOperation::Delete));
        assert!(store.get_event(old_pending).await.unwrap().unwrap().archived_at.is_none());
        assert!(store.get_event(fresh_done).await.unwrap().unwrap().archived_at.is_none());

        let visible = store.list_events(&EventFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 2);
        let all = store
            .list_events(&EventFilter {
                include_archived: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let token = CancellationToken::new();
        let handle = RetentionSweeper::new(store, RetentionConfig::default()).spawn(token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
