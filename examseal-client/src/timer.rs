//! Exam countdown timer.
//!
//! Remaining time is always recomputed from the recorded start instant,
//! never decremented tick by tick, so process restarts and wall clock
//! adjustments cannot mint extra time. Elapsed time is monotone: a
//! backward clock jump freezes the countdown instead of rewinding it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::error::{EngineError, EngineResult};

/// Time source for the countdown. Production uses [`SystemClock`];
/// tests drive a [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Hand-driven clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute instant, backwards included
    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Countdown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    Running,
    Paused,
    Expired,
}

/// Published view of the countdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub remaining_secs: u64,
    pub phase: TimerPhase,
}

struct TimerState {
    /// Shifted forward on resume so pauses do not consume exam time
    started_at_ms: u64,
    paused_at_ms: Option<u64>,
    /// High-water elapsed; keeps remaining monotone under clock jumps
    max_elapsed_ms: u64,
    phase: TimerPhase,
}

/// Exam countdown with pause support and exactly-once expiry.
pub struct ExamTimer {
    clock: Arc<dyn Clock>,
    duration_ms: u64,
    state: Mutex<TimerState>,
    snapshot_tx: watch::Sender<TimerSnapshot>,
}

impl ExamTimer {
    /// Create a timer that has already consumed `initial_elapsed_ms`.
    ///
    /// A fresh attempt passes zero; a restored one passes the elapsed
    /// time recomputed from the attempt's recorded start.
    pub fn new(clock: Arc<dyn Clock>, duration_secs: u64, initial_elapsed_ms: u64) -> Self {
        let duration_ms = duration_secs.saturating_mul(1000);
        let now = clock.now_ms();

        let phase = if initial_elapsed_ms >= duration_ms {
            TimerPhase::Expired
        } else {
            TimerPhase::Running
        };

        let state = TimerState {
            started_at_ms: now.saturating_sub(initial_elapsed_ms),
            paused_at_ms: None,
            max_elapsed_ms: initial_elapsed_ms,
            phase,
        };

        let initial = TimerSnapshot {
            remaining_secs: duration_ms.saturating_sub(initial_elapsed_ms) / 1000,
            phase,
        };
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            clock,
            duration_ms,
            state: Mutex::new(state),
            snapshot_tx,
        }
    }

    /// Watch countdown updates, including the expiry transition
    pub fn watch(&self) -> watch::Receiver<TimerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Recompute the countdown, transitioning to expired when the time
    /// is up, and publish the result. Expiry happens at most once.
    pub async fn tick(&self) -> TimerSnapshot {
        let mut state = self.state.lock().await;

        let reference = match state.phase {
            TimerPhase::Paused => state.paused_at_ms.unwrap_or_else(|| self.clock.now_ms()),
            _ => self.clock.now_ms(),
        };
        let raw = reference.saturating_sub(state.started_at_ms);
        state.max_elapsed_ms = state.max_elapsed_ms.max(raw);

        if state.phase == TimerPhase::Running && state.max_elapsed_ms >= self.duration_ms {
            state.phase = TimerPhase::Expired;
            tracing::info!("Exam time expired");
        }

        let snapshot = TimerSnapshot {
            remaining_secs: self.duration_ms.saturating_sub(state.max_elapsed_ms) / 1000,
            phase: state.phase,
        };
        drop(state);

        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });

        snapshot
    }

    /// Remaining time in milliseconds
    pub async fn remaining_ms(&self) -> u64 {
        self.tick().await;
        let state = self.state.lock().await;
        self.duration_ms.saturating_sub(state.max_elapsed_ms)
    }

    /// Freeze the countdown. Only a running timer can pause.
    pub async fn pause(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if state.phase != TimerPhase::Running {
            return Err(EngineError::TimerTransition(format!(
                "cannot pause while {:?}",
                state.phase
            )));
        }

        let now = self.clock.now_ms();
        let raw = now.saturating_sub(state.started_at_ms);
        state.max_elapsed_ms = state.max_elapsed_ms.max(raw);
        state.paused_at_ms = Some(now);
        state.phase = TimerPhase::Paused;
        drop(state);

        self.tick().await;
        Ok(())
    }

    /// Resume a paused countdown; the paused interval costs nothing.
    pub async fn resume(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if state.phase != TimerPhase::Paused {
            return Err(EngineError::TimerTransition(format!(
                "cannot resume while {:?}",
                state.phase
            )));
        }

        let now = self.clock.now_ms();
        let paused_for = state
            .paused_at_ms
            .map_or(0, |paused_at| now.saturating_sub(paused_at));
        state.started_at_ms = state.started_at_ms.saturating_add(paused_for);
        state.paused_at_ms = None;
        state.phase = TimerPhase::Running;
        drop(state);

        self.tick().await;
        Ok(())
    }

    /// Publish ticks every second until expiry or shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
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

            let snapshot = self.tick().await;
            if snapshot.phase == TimerPhase::Expired {
                break;
            }
        }

        tracing::debug!("Timer loop stopped");
    }
}
