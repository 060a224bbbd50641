//! Proctoring activity logger.
//!
//! Every recorded event lands in the tamper-evident local chain and in
//! the outbound queue in one transaction (see
//! [`LocalStore::append_activity`]). This layer adds per-kind counters
//! for the invigilation surface and restores them when an attempt is
//! reopened.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::{ActivityEvent, ActivityKind};
use crate::store::LocalStore;

/// Running totals per event kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub tab_hidden: u32,
    pub tab_visible: u32,
    pub window_blur: u32,
    pub window_focus: u32,
    pub paste: u32,
}

impl ActivityCounts {
    pub fn total(&self) -> u32 {
        self.tab_hidden
            .saturating_add(self.tab_visible)
            .saturating_add(self.window_blur)
            .saturating_add(self.window_focus)
            .saturating_add(self.paste)
    }

    fn bump(&mut self, kind: ActivityKind) {
        let slot = match kind {
            ActivityKind::TabHidden => &mut self.tab_hidden,
            ActivityKind::TabVisible => &mut self.tab_visible,
            ActivityKind::WindowBlur => &mut self.window_blur,
            ActivityKind::WindowFocus => &mut self.window_focus,
            ActivityKind::Paste => &mut self.paste,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Records proctoring events for one attempt.
pub struct ActivityLogger {
    store: LocalStore,
    attempt_id: Uuid,
    session_id: Uuid,
    counts_tx: watch::Sender<ActivityCounts>,
}

impl ActivityLogger {
    /// Open the logger for an attempt, restoring counters from events
    /// already on disk.
    pub async fn open(store: LocalStore, attempt_id: Uuid, session_id: Uuid) -> EngineResult<Self> {
        let mut counts = ActivityCounts::default();
        for event in store.events_for_attempt(attempt_id).await? {
            counts.bump(event.kind);
        }

        let (counts_tx, _) = watch::channel(counts);

        Ok(Self {
            store,
            attempt_id,
            session_id,
            counts_tx,
        })
    }

    /// Watch counter updates
    pub fn counts_watch(&self) -> watch::Receiver<ActivityCounts> {
        self.counts_tx.subscribe()
    }

    pub fn counts(&self) -> ActivityCounts {
        *self.counts_tx.borrow()
    }

    /// Append one event to the chain and the outbound queue.
    pub async fn record(
        &self,
        kind: ActivityKind,
        metadata: serde_json::Value,
    ) -> EngineResult<ActivityEvent> {
        let event = self
            .store
            .append_activity(self.attempt_id, self.session_id, kind, metadata)
            .await?;

        self.counts_tx.send_modify(|counts| counts.bump(kind));

        Ok(event)
    }

    /// All events for the attempt, oldest first
    pub async fn events(&self) -> EngineResult<Vec<ActivityEvent>> {
        self.store.events_for_attempt(self.attempt_id).await
    }

    /// Recompute the hash chain and compare it against the stored links
    pub async fn verify_chain(&self) -> EngineResult<bool> {
        self.store.verify_activity_chain(self.attempt_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExamAttempt, SyncItemKind};
    use crate::store::LocalStoreConfig;

    async fn test_setup() -> (LocalStore, ExamAttempt, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = LocalStoreConfig {
            db_path: dir
                .path()
                .join("activity_test.db")
                .to_string_lossy()
                .into_owned(),
            ..LocalStoreConfig::default()
        };
        let store = LocalStore::new(config).await.unwrap();

        let attempt = ExamAttempt::new(Uuid::new_v4(), Uuid::new_v4());
        store.insert_attempt(&attempt).await.unwrap();
        (store, attempt, dir)
    }

    #[tokio::test]
    async fn test_record_chains_events_and_counts_them() {
        let (store, attempt, _dir) = test_setup().await;
        let logger = ActivityLogger::open(store.clone(), attempt.id, attempt.session_id)
            .await
            .unwrap();
        let counts = logger.counts_watch();

        logger
            .record(ActivityKind::TabHidden, serde_json::json!({}))
            .await
            .unwrap();
        logger
            .record(ActivityKind::WindowBlur, serde_json::json!({"ms": 1200}))
            .await
            .unwrap();

        let events = logger.events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(logger.verify_chain().await.unwrap());

        assert_eq!(counts.borrow().tab_hidden, 1);
        assert_eq!(counts.borrow().window_blur, 1);
        assert_eq!(counts.borrow().total(), 2);

        // Both events are queued for sync
        let queued: Vec<_> = store
            .pending_items(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.kind == SyncItemKind::ActivityLog)
            .collect();
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn test_counters_restore_when_reopened() {
        let (store, attempt, _dir) = test_setup().await;

        {
            let logger = ActivityLogger::open(store.clone(), attempt.id, attempt.session_id)
                .await
                .unwrap();
            for _ in 0..3 {
                logger
                    .record(ActivityKind::Paste, serde_json::json!({"length": 42}))
                    .await
                    .unwrap();
            }
        }

        let reopened = ActivityLogger::open(store, attempt.id, attempt.session_id)
            .await
            .unwrap();
        assert_eq!(reopened.counts().paste, 3);
        assert_eq!(reopened.counts().total(), 3);
    }

    #[tokio::test]
    async fn test_metadata_survives_the_round_trip() {
        let (store, attempt, _dir) = test_setup().await;
        let logger = ActivityLogger::open(store, attempt.id, attempt.session_id)
            .await
            .unwrap();

        logger
            .record(
                ActivityKind::Paste,
                serde_json::json!({"length": 42, "target": "q3"}),
            )
            .await
            .unwrap();

        let events = logger.events().await.unwrap();
        assert_eq!(events[0].metadata["length"], 42);
        assert_eq!(events[0].metadata["target"], "q3");
    }
}
