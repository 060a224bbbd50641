//! Debounced answer autosave.
//!
//! Rapid edits to one question coalesce into a single durable write:
//! each edit re-arms a per-question timer, and only the timer that
//! survives the debounce window commits. Commits go through
//! [`LocalStore::save_answer_and_enqueue`], so every durable write also
//! refreshes the question's queue item under its lineage key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::{AnswerValue, LocalAnswer};
use crate::store::LocalStore;

/// Autosave configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveConfig {
    /// Quiet period after the last edit before it is committed
    pub debounce_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self { debounce_ms: 1500 }
    }
}

/// Latest buffered edit for one question
struct PendingEdit {
    value: AnswerValue,
    /// Cleared when a commit snapshots the value, set again on edit
    dirty: bool,
}

struct Inner {
    store: LocalStore,
    attempt_id: Uuid,
    session_id: Uuid,
    debounce: Duration,
    edits: Mutex<HashMap<String, PendingEdit>>,
    /// Armed debounce timers, one per question
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Serializes commits per question so a re-armed timer can never
    /// overtake an in-flight write
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Counts durable commits; watchers use it to nudge the pusher
    commit_tx: watch::Sender<u64>,
}

/// Buffers answer edits and writes them durably after a quiet period.
pub struct AnswerAutosave {
    inner: Arc<Inner>,
}

impl AnswerAutosave {
    pub fn new(
        store: LocalStore,
        attempt_id: Uuid,
        session_id: Uuid,
        config: AutosaveConfig,
    ) -> Self {
        let (commit_tx, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                store,
                attempt_id,
                session_id,
                debounce: Duration::from_millis(config.debounce_ms),
                edits: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                write_locks: Mutex::new(HashMap::new()),
                commit_tx,
            }),
        }
    }

    /// Watch the number of durable commits performed so far
    pub fn commit_watch(&self) -> watch::Receiver<u64> {
        self.inner.commit_tx.subscribe()
    }

    /// Buffer an edit and re-arm the question's debounce timer.
    ///
    /// Returns immediately; the durable write happens once the question
    /// has been quiet for the configured window.
    pub async fn record_edit(&self, question_id: &str, value: AnswerValue) {
        {
            let mut edits = self.inner.edits.lock().await;
            edits.insert(
                question_id.to_string(),
                PendingEdit { value, dirty: true },
            );
        }

        let mut timers = self.inner.timers.lock().await;
        if let Some(previous) = timers.remove(question_id) {
            previous.abort();
        }

        let inner = self.inner.clone();
        let question = question_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            // Detached, so aborting a re-armed timer can only ever cancel
            // the sleep, never a write in progress
            tokio::spawn(async move {
                if let Err(e) = commit(&inner, &question).await {
                    tracing::error!(
                        question_id = %question,
                        error = %e,
                        "Autosave commit failed, edit kept dirty"
                    );
                }
            });
        });
        timers.insert(question_id.to_string(), handle);
    }

    /// Commit one question's buffered edit right away, cancelling its
    /// timer. Returns whether anything was written.
    pub async fn flush_now(&self, question_id: &str) -> EngineResult<bool> {
        if let Some(timer) = self.inner.timers.lock().await.remove(question_id) {
            timer.abort();
        }
        commit(&self.inner, question_id).await
    }

    /// Commit every dirty edit. Used before submission and on close.
    pub async fn flush_all(&self) -> EngineResult<usize> {
        for (_, timer) in self.inner.timers.lock().await.drain() {
            timer.abort();
        }

        let questions: Vec<String> = self.inner.edits.lock().await.keys().cloned().collect();
        let mut written = 0;
        for question in &questions {
            if commit(&self.inner, question).await? {
                written += 1;
            }
        }

        Ok(written)
    }

    /// Flush everything and cancel any timer re-armed in the meantime.
    pub async fn close(&self) -> EngineResult<usize> {
        let written = self.flush_all().await?;
        for (_, timer) in self.inner.timers.lock().await.drain() {
            timer.abort();
        }
        Ok(written)
    }

    /// Number of edits not yet durably written
    pub async fn dirty_count(&self) -> usize {
        self.inner
            .edits
            .lock()
            .await
            .values()
            .filter(|edit| edit.dirty)
            .count()
    }
}

/// Write the latest buffered edit for a question, if it is dirty.
async fn commit(inner: &Arc<Inner>, question_id: &str) -> EngineResult<bool> {
    let lock = {
        let mut locks = inner.write_locks.lock().await;
        locks
            .entry(question_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };
    let _guard = lock.lock().await;

    let snapshot = {
        let mut edits = inner.edits.lock().await;
        match edits.get_mut(question_id) {
            Some(edit) if edit.dirty => {
                edit.dirty = false;
                Some(edit.value.clone())
            }
            _ => None,
        }
    };

    let Some(value) = snapshot else {
        return Ok(false);
    };

    let answer = LocalAnswer {
        attempt_id: inner.attempt_id,
        question_id: question_id.to_string(),
        session_id: inner.session_id,
        // Candidate only; the store keeps the key assigned on first save
        idempotency_key: Uuid::new_v4(),
        value,
        media_refs: vec![],
        saved_at: chrono::Utc::now(),
        synced: false,
    };

    match inner.store.save_answer_and_enqueue(&answer).await {
        Ok(()) => {
            inner.commit_tx.send_modify(|count| *count += 1);
            Ok(true)
        }
        Err(e) => {
            let mut edits = inner.edits.lock().await;
            if let Some(edit) = edits.get_mut(question_id) {
                edit.dirty = true;
            }
            Err(e)
        }
    }
}
