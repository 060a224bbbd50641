//! Outbound batch pusher.
//!
//! Drains the durable queue in FIFO batches, applies acknowledgements,
//! and backs off exponentially while the server is unreachable. Exactly
//! one flush runs at a time; overlapping triggers return
//! [`FlushOutcome::AlreadyRunning`] instead of queueing up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::SyncQueueItem;
use crate::store::LocalStore;
use crate::transport::{ExamTransport, SyncBatch, SyncItem, MAX_BATCH_ITEMS};

/// Sync behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Items per push request, capped at the server limit
    pub batch_size: u32,
    /// Seconds between automatic flushes
    pub flush_interval_secs: u64,
    /// Base delay for exponential backoff after a failed push
    pub retry_backoff_ms: u64,
    /// Consecutive failures before health degrades
    pub degraded_after: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval_secs: 30,
            retry_backoff_ms: 1000,
            degraded_after: 3,
        }
    }
}

/// What triggered a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Periodic timer; honors the backoff gate
    Interval,
    /// Connectivity restored; clears the backoff gate
    Reconnect,
    /// Explicit request, e.g. submission; ignores the backoff gate
    Manual,
}

/// Result of a single flush call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Queue drained; `pushed` items acknowledged
    Completed { pushed: usize },
    /// Nothing was pending
    Empty,
    /// Engine is offline, nothing attempted
    Offline,
    /// Another flush holds the gate
    AlreadyRunning,
    /// Backoff window still open
    Backoff,
    /// Push failed; items returned to pending
    Failed { error: String },
}

/// Observable sync health
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncHealth {
    Ok,
    /// Repeated push failures; queue keeps accumulating
    Degraded { consecutive_failures: u32 },
    /// The server refused an item as conflicting; it is parked
    Conflict { idempotency_key: Uuid },
}

/// Pushes queued operations to the server in order.
pub struct BatchPusher {
    store: LocalStore,
    transport: Arc<dyn ExamTransport>,
    config: SyncConfig,
    online: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Held for the duration of a flush; try_lock gives single-flight
    flush_gate: Mutex<()>,
    /// Earliest instant the next interval flush may run
    next_attempt_at: Mutex<Option<Instant>>,
    pending_tx: watch::Sender<usize>,
    health_tx: watch::Sender<SyncHealth>,
}

impl BatchPusher {
    pub fn new(store: LocalStore, transport: Arc<dyn ExamTransport>, config: SyncConfig) -> Self {
        let (pending_tx, _) = watch::channel(0);
        let (health_tx, _) = watch::channel(SyncHealth::Ok);

        Self {
            store,
            transport,
            config,
            online: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            flush_gate: Mutex::new(()),
            next_attempt_at: Mutex::new(None),
            pending_tx,
            health_tx,
        }
    }

    /// Watch the count of pending plus in-flight queue items
    pub fn pending_watch(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Watch sync health transitions
    pub fn health_watch(&self) -> watch::Receiver<SyncHealth> {
        self.health_tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Record a connectivity change. Returns the previous state; the
    /// caller follows an offline-to-online transition with a
    /// [`FlushReason::Reconnect`] flush.
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::AcqRel);
        if online && !was {
            self.consecutive_failures.store(0, Ordering::Release);
            tracing::info!("Connectivity restored");
        } else if !online && was {
            tracing::info!("Connectivity lost, queueing locally");
        }
        was
    }

    /// Recompute the pending count and publish it to watchers.
    pub async fn publish_pending(&self) -> EngineResult<usize> {
        let count = usize::try_from(self.store.unsynced_count().await?).unwrap_or(0);
        self.pending_tx.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
        Ok(count)
    }

    /// Drain the queue, one batch at a time, until it is empty or a
    /// push fails.
    ///
    /// Marks each batch in flight before the request, so a crash between
    /// request and acknowledgement leaves the items recoverable. Items
    /// the server accepts are completed; items it reports as conflicting
    /// are parked and never retried; everything else returns to pending.
    pub async fn flush(&self, reason: FlushReason) -> EngineResult<FlushOutcome> {
        let Ok(_gate) = self.flush_gate.try_lock() else {
            return Ok(FlushOutcome::AlreadyRunning);
        };

        if !self.online.load(Ordering::Acquire) {
            return Ok(FlushOutcome::Offline);
        }

        match reason {
            FlushReason::Interval => {
                if let Some(at) = *self.next_attempt_at.lock().await {
                    if Instant::now() < at {
                        return Ok(FlushOutcome::Backoff);
                    }
                }
            }
            FlushReason::Reconnect => {
                *self.next_attempt_at.lock().await = None;
            }
            FlushReason::Manual => {}
        }

        let cap = u32::try_from(MAX_BATCH_ITEMS).unwrap_or(u32::MAX);
        let limit = i64::from(self.config.batch_size.clamp(1, cap));

        let mut pushed = 0;
        let mut saw_items = false;

        loop {
            let items = self.store.pending_items(limit).await?;
            if items.is_empty() {
                break;
            }
            saw_items = true;

            let item_ids: Vec<i64> = items.iter().map(|i| i.id).collect();
            self.store.mark_in_flight(&item_ids).await?;

            let batch = SyncBatch {
                batch: items.iter().map(wire_item).collect(),
            };

            tracing::debug!(reason = ?reason, items = items.len(), "Pushing sync batch");

            match self.transport.push_batch(&batch).await {
                Ok(ack) => {
                    let accepted: HashSet<Uuid> = ack.accepted.iter().copied().collect();
                    let conflicts: HashMap<Uuid, &str> = ack
                        .conflicts
                        .iter()
                        .map(|c| (c.idempotency_key, c.reason.as_str()))
                        .collect();

                    let mut done = Vec::with_capacity(items.len());
                    let mut conflicted = Vec::new();
                    let mut unacked = Vec::new();

                    for item in &items {
                        if let Some(why) = conflicts.get(&item.idempotency_key) {
                            conflicted.push((item, *why));
                        } else if accepted.contains(&item.idempotency_key) {
                            done.push(item.clone());
                        } else {
                            unacked.push(item.id);
                        }
                    }

                    pushed += done.len();
                    self.store.mark_completed(&done).await?;

                    for (item, why) in &conflicted {
                        self.store.mark_conflict(item.id, why).await?;
                        self.set_health(SyncHealth::Conflict {
                            idempotency_key: item.idempotency_key,
                        });
                        tracing::error!(
                            idempotency_key = %item.idempotency_key,
                            reason = why,
                            "Server rejected item as conflicting, parked for review"
                        );
                    }

                    if !unacked.is_empty() {
                        tracing::warn!(
                            count = unacked.len(),
                            "Items missing from server ack, requeued"
                        );
                        self.store
                            .mark_batch_failed(&unacked, "missing from server ack")
                            .await?;
                    }

                    self.consecutive_failures.store(0, Ordering::Release);
                    *self.next_attempt_at.lock().await = None;
                    if conflicted.is_empty() {
                        self.set_health(SyncHealth::Ok);
                    }
                    self.publish_pending().await?;

                    if !unacked.is_empty() {
                        // Requeued items wait for the next flush instead of
                        // spinning in this one
                        break;
                    }
                }
                Err(e) => {
                    self.store.mark_batch_failed(&item_ids, &e.to_string()).await?;

                    let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    let exp = failures.saturating_sub(1).min(6);
                    let delay_ms = self.config.retry_backoff_ms.saturating_mul(1u64 << exp);
                    *self.next_attempt_at.lock().await =
                        Some(Instant::now() + Duration::from_millis(delay_ms));

                    if failures >= self.config.degraded_after {
                        self.set_health(SyncHealth::Degraded {
                            consecutive_failures: failures,
                        });
                    }

                    self.publish_pending().await?;
                    tracing::warn!(
                        error = %e,
                        failures = failures,
                        delay_ms = delay_ms,
                        "Sync push failed, backing off"
                    );

                    return Ok(FlushOutcome::Failed {
                        error: e.to_string(),
                    });
                }
            }
        }

        if saw_items {
            Ok(FlushOutcome::Completed { pushed })
        } else {
            Ok(FlushOutcome::Empty)
        }
    }

    /// Periodic flush loop. Runs until the shutdown watch flips to true;
    /// an in-progress flush always finishes before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.flush_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // The flush itself runs outside the select, so a shutdown
            // signal waits for it rather than cancelling it
            match self.flush(FlushReason::Interval).await {
                Ok(outcome) => tracing::trace!(outcome = ?outcome, "Interval flush finished"),
                Err(e) => tracing::warn!(error = %e, "Interval flush failed"),
            }
        }

        tracing::debug!("Sync pusher stopped");
    }

    fn set_health(&self, health: SyncHealth) {
        self.health_tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }
}

fn wire_item(item: &SyncQueueItem) -> SyncItem {
    SyncItem {
        kind: item.kind,
        attempt_id: item.attempt_id,
        idempotency_key: item.idempotency_key,
        payload: item.payload.clone(),
    }
}
