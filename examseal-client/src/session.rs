//! Exam session facade.
//!
//! [`ExamSession::begin`] performs the full entry sequence: download the
//! sealed package, verify and open it, create or resume the attempt,
//! then start the background pusher, countdown, and expiry listener.
//! From there the session is the only surface the shell talks to.
//!
//! Sessions hold key material and decrypted questions in memory only;
//! [`ExamSession::close`] releases both.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use examseal_crypto::SessionKeyring;

use crate::activity::{ActivityCounts, ActivityLogger};
use crate::autosave::{AnswerAutosave, AutosaveConfig};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    ActivityEvent, ActivityKind, AnswerValue, AttemptStatus, DecryptedExamPackage, ExamAttempt,
    ExamStateSnapshot, QuestionFlags, QuestionKind, SyncItemKind,
};
use crate::package::open_package;
use crate::store::{LocalStore, LocalStoreConfig};
use crate::sync::{BatchPusher, FlushOutcome, FlushReason, SyncConfig, SyncHealth};
use crate::timer::{Clock, ExamTimer, TimerPhase, TimerSnapshot};
use crate::transport::{DownloadRequest, ExamTransport, MediaChunk, MediaUploader};

/// Bytes per media upload chunk
const MEDIA_CHUNK_BYTES: usize = 512 * 1024;

/// Session-wide configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub store: LocalStoreConfig,
    pub sync: SyncConfig,
    pub autosave: AutosaveConfig,
}

/// Parameters for entering an exam
#[derive(Debug, Clone)]
pub struct BeginExam {
    pub session_id: Uuid,
    pub user_id: Uuid,
    /// One-time code handed out in the exam room
    pub token_code: String,
    /// Exam length in seconds, from the session listing
    pub duration_secs: u64,
}

/// A running exam attempt.
pub struct ExamSession {
    store: LocalStore,
    keyring: Arc<SessionKeyring>,
    plaintext: RwLock<Option<Arc<DecryptedExamPackage>>>,
    /// Question kinds, kept for answer validation after close
    question_kinds: HashMap<String, QuestionKind>,
    attempt_id: Uuid,
    session_id: Uuid,
    autosave: AnswerAutosave,
    logger: ActivityLogger,
    pusher: Arc<BatchPusher>,
    timer: Arc<ExamTimer>,
    media: Arc<dyn MediaUploader>,
    /// Cleared on submit, expiry, abandon, and close
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExamSession {
    /// Enter an exam session.
    ///
    /// Downloads the sealed package (the download idempotency key is
    /// persisted, so retries after dropped connections dedupe server
    /// side), opens it with integrity checked before decryption, and
    /// creates the attempt. If an in-progress attempt already exists
    /// for this session and user it is resumed instead, with the
    /// countdown restored from its recorded start.
    pub async fn begin(
        config: SessionConfig,
        transport: Arc<dyn ExamTransport>,
        media: Arc<dyn MediaUploader>,
        clock: Arc<dyn Clock>,
        request: BeginExam,
    ) -> EngineResult<Arc<Self>> {
        let store = LocalStore::new(config.store).await?;

        let existing = store
            .find_attempt(request.session_id, request.user_id)
            .await?;
        if let Some(attempt) = &existing {
            if attempt.status.is_terminal() {
                return Err(EngineError::AttemptLifecycle(format!(
                    "attempt {} is already {}",
                    attempt.id,
                    attempt.status.as_str()
                )));
            }
        }

        let download_key = store
            .persistent_uuid(&format!("download_key:{}", request.session_id))
            .await?;
        let download = DownloadRequest {
            session_id: request.session_id,
            token_code: request.token_code.clone(),
            device_fingerprint: store.device_id().to_string(),
            idempotency_key: download_key,
        };
        let response = transport.download_package(&download).await?;
        let (package, key_material) = response.decode(request.session_id)?;

        let keyring = Arc::new(SessionKeyring::new());
        let plaintext = open_package(&package, &key_material, &keyring)?;

        let attempt = match existing {
            Some(attempt) => {
                tracing::info!(
                    attempt_id = %attempt.id,
                    session_id = %request.session_id,
                    "Resuming interrupted attempt"
                );
                attempt
            }
            None => {
                let attempt = ExamAttempt::new(request.session_id, request.user_id);
                store.insert_attempt(&attempt).await?;
                tracing::info!(
                    attempt_id = %attempt.id,
                    session_id = %request.session_id,
                    "Attempt started"
                );
                attempt
            }
        };

        let started_ms = u64::try_from(attempt.started_at.timestamp_millis()).unwrap_or(0);
        let elapsed_ms = clock.now_ms().saturating_sub(started_ms);
        let timer = Arc::new(ExamTimer::new(clock, request.duration_secs, elapsed_ms));

        let autosave = AnswerAutosave::new(
            store.clone(),
            attempt.id,
            request.session_id,
            config.autosave,
        );
        let logger = ActivityLogger::open(store.clone(), attempt.id, request.session_id).await?;
        let pusher = Arc::new(BatchPusher::new(
            store.clone(),
            transport,
            config.sync,
        ));
        // Anything left over from a previous run shows up immediately
        pusher.publish_pending().await?;

        let question_kinds = plaintext
            .questions
            .iter()
            .map(|q| (q.id.clone(), q.kind))
            .collect();

        let (shutdown_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            store,
            keyring,
            plaintext: RwLock::new(Some(Arc::new(plaintext))),
            question_kinds,
            attempt_id: attempt.id,
            session_id: request.session_id,
            autosave,
            logger,
            pusher,
            timer,
            media,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // A restored attempt may already be past its deadline
        let initial_phase = session.timer.watch().borrow().phase;
        if initial_phase == TimerPhase::Expired {
            if let Err(e) = session.finalize(AttemptStatus::TimedOut).await {
                tracing::error!(error = %e, "Finalizing expired attempt failed");
            }
        }

        session.spawn_background().await;

        Ok(session)
    }

    async fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(
            self.pusher.clone().run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.timer.clone().run(self.shutdown_tx.subscribe()),
        ));

        // Expiry listener: exactly one auto-submission when time runs out
        let session = self.clone();
        let mut snapshots = self.timer.watch();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let phase = snapshots.borrow_and_update().phase;
                        if phase == TimerPhase::Expired {
                            if let Err(e) = session.finalize(AttemptStatus::TimedOut).await {
                                tracing::error!(error = %e, "Auto-submission on expiry failed");
                            }
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        // Every durable autosave commit refreshes the pending counter
        let pusher = self.pusher.clone();
        let mut commits = self.autosave.commit_watch();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = commits.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if let Err(e) = pusher.publish_pending().await {
                            tracing::warn!(error = %e, "Pending count refresh failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Current attempt row
    pub async fn attempt(&self) -> EngineResult<ExamAttempt> {
        self.store
            .get_attempt(self.attempt_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("attempt {}", self.attempt_id)))
    }

    /// The decrypted package. Fails once the session is closed.
    pub async fn package(&self) -> EngineResult<Arc<DecryptedExamPackage>> {
        self.plaintext
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::AttemptLifecycle("session is closed".to_string()))
    }

    pub fn timer_watch(&self) -> watch::Receiver<TimerSnapshot> {
        self.timer.watch()
    }

    pub fn pending_watch(&self) -> watch::Receiver<usize> {
        self.pusher.pending_watch()
    }

    pub fn health_watch(&self) -> watch::Receiver<SyncHealth> {
        self.pusher.health_watch()
    }

    pub fn activity_watch(&self) -> watch::Receiver<ActivityCounts> {
        self.logger.counts_watch()
    }

    /// Buffer an answer edit; it becomes durable after the debounce
    /// window or on the next flush, whichever comes first.
    pub async fn save_answer(&self, question_id: &str, value: AnswerValue) -> EngineResult<()> {
        self.ensure_accepting()?;

        let kind = self
            .question_kinds
            .get(question_id)
            .ok_or_else(|| EngineError::NotFound(format!("question {}", question_id)))?;
        if !value.matches_kind(*kind) {
            return Err(EngineError::AnswerKind(format!(
                "question {} expects a {} answer",
                question_id,
                kind.as_str()
            )));
        }

        self.autosave.record_edit(question_id, value).await;
        Ok(())
    }

    /// Force one question's buffered edit to disk now
    pub async fn flush_answer(&self, question_id: &str) -> EngineResult<bool> {
        self.autosave.flush_now(question_id).await
    }

    /// Force every buffered edit to disk now
    pub async fn flush_answers(&self) -> EngineResult<usize> {
        let written = self.autosave.flush_all().await?;
        self.pusher.publish_pending().await?;
        Ok(written)
    }

    /// Record a proctoring event in the tamper-evident chain.
    pub async fn record_activity(
        &self,
        kind: ActivityKind,
        metadata: serde_json::Value,
    ) -> EngineResult<ActivityEvent> {
        self.ensure_accepting()?;
        let event = self.logger.record(kind, metadata).await?;
        self.pusher.publish_pending().await?;
        Ok(event)
    }

    /// Verify the activity chain for this attempt
    pub async fn verify_activity_chain(&self) -> EngineResult<bool> {
        self.logger.verify_chain().await
    }

    /// Upload a media file in chunks and attach the resulting object
    /// key to the question's answer.
    ///
    /// Requires connectivity; media bytes are never spooled into the
    /// local queue. The attached reference itself syncs like any other
    /// queued operation.
    pub async fn attach_media(
        &self,
        question_id: &str,
        file_name: &str,
        data: &[u8],
    ) -> EngineResult<String> {
        self.ensure_accepting()?;

        if !self.question_kinds.contains_key(question_id) {
            return Err(EngineError::NotFound(format!("question {}", question_id)));
        }
        if data.is_empty() {
            return Err(EngineError::MediaUpload("media payload is empty".to_string()));
        }

        // The answer row must exist before a ref can attach to it
        self.autosave.flush_now(question_id).await?;

        let upload_id = Uuid::new_v4();
        let total_chunks = u32::try_from(data.chunks(MEDIA_CHUNK_BYTES).len()).unwrap_or(u32::MAX);

        let mut object_key = None;
        for (index, chunk) in data.chunks(MEDIA_CHUNK_BYTES).enumerate() {
            let ack = self
                .media
                .upload_chunk(&MediaChunk {
                    attempt_id: self.attempt_id,
                    question_id: question_id.to_string(),
                    upload_id,
                    chunk_index: u32::try_from(index).unwrap_or(u32::MAX),
                    total_chunks,
                    file_name: file_name.to_string(),
                    data: chunk.to_vec(),
                })
                .await?;
            object_key = ack;
        }

        let Some(object_key) = object_key else {
            return Err(EngineError::MediaUpload(
                "server did not return an object key for the final chunk".to_string(),
            ));
        };

        self.store
            .attach_media_ref(self.attempt_id, question_id, &object_key)
            .await?;
        self.pusher.publish_pending().await?;

        Ok(object_key)
    }

    /// Persist the navigation position and per-question flags
    pub async fn save_position(
        &self,
        current_question_index: u32,
        flags: BTreeMap<String, QuestionFlags>,
    ) -> EngineResult<()> {
        let snapshot = ExamStateSnapshot {
            attempt_id: self.attempt_id,
            current_question_index,
            flags,
            updated_at: chrono::Utc::now(),
        };
        self.store.put_exam_state(&snapshot).await
    }

    pub async fn position(&self) -> EngineResult<Option<ExamStateSnapshot>> {
        self.store.get_exam_state(self.attempt_id).await
    }

    /// Pause the countdown (proctor action)
    pub async fn pause_timer(&self) -> EngineResult<()> {
        self.timer.pause().await
    }

    /// Resume a paused countdown
    pub async fn resume_timer(&self) -> EngineResult<()> {
        self.timer.resume().await
    }

    /// Record a connectivity change. Coming back online triggers an
    /// immediate flush of the backlog.
    pub async fn set_online(&self, online: bool) -> EngineResult<Option<FlushOutcome>> {
        let was_online = self.pusher.set_online(online);
        if online && !was_online {
            let outcome = self.pusher.flush(FlushReason::Reconnect).await?;
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    /// Push everything pending right now
    pub async fn sync_now(&self) -> EngineResult<FlushOutcome> {
        self.pusher.flush(FlushReason::Manual).await
    }

    /// Submit the attempt.
    ///
    /// Flushes every buffered answer, moves the attempt to its terminal
    /// status exactly once (a race with timer expiry leaves one winner),
    /// queues the SUBMIT_EXAM operation under the attempt's idempotency
    /// key, and attempts a best-effort flush. Works fully offline; the
    /// submission then syncs on reconnect.
    pub async fn submit(&self) -> EngineResult<ExamAttempt> {
        self.finalize(AttemptStatus::Submitted).await
    }

    /// Walk away without submitting. Local status only; queued answers
    /// and events still sync.
    pub async fn abandon(&self) -> EngineResult<ExamAttempt> {
        self.finalize(AttemptStatus::Abandoned).await
    }

    async fn finalize(&self, status: AttemptStatus) -> EngineResult<ExamAttempt> {
        self.accepting.store(false, Ordering::Release);
        self.autosave.close().await?;

        let submitted_at = match status {
            AttemptStatus::Abandoned => None,
            _ => Some(chrono::Utc::now()),
        };
        self.store
            .update_attempt_status(self.attempt_id, status, submitted_at)
            .await?;

        let attempt = self.attempt().await?;

        if status != AttemptStatus::Abandoned {
            let answers = self.store.answers_for_attempt(self.attempt_id).await?;
            let payload = serde_json::json!({
                "attemptId": self.attempt_id,
                "sessionId": self.session_id,
                "status": status,
                "submittedAt": attempt.submitted_at.map(|t| t.to_rfc3339()),
                "answerCount": answers.len(),
            });
            self.store
                .enqueue_item(
                    SyncItemKind::SubmitExam,
                    self.attempt_id,
                    attempt.idempotency_key,
                    &payload,
                )
                .await?;
        }

        match self.pusher.flush(FlushReason::Manual).await {
            Ok(outcome) => {
                tracing::info!(
                    attempt_id = %self.attempt_id,
                    status = status.as_str(),
                    outcome = ?outcome,
                    "Attempt finalized"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Post-finalize flush failed, queue keeps the items");
            }
        }
        self.pusher.publish_pending().await?;

        self.attempt().await
    }

    /// Shut the session down and release key material and plaintext.
    ///
    /// Background tasks hold a reference to the session, so a session
    /// that is never closed stays alive until its timer expires; always
    /// close when the shell is done with it.
    pub async fn close(&self) -> EngineResult<()> {
        self.accepting.store(false, Ordering::Release);

        if let Err(e) = self.autosave.close().await {
            tracing::warn!(error = %e, "Final autosave flush failed");
        }

        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        drop(tasks);

        self.keyring.remove(self.session_id);
        *self.plaintext.write().await = None;

        tracing::info!(
            session_id = %self.session_id,
            attempt_id = %self.attempt_id,
            "Session closed, key material released"
        );

        Ok(())
    }

    fn ensure_accepting(&self) -> EngineResult<()> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EngineError::AttemptLifecycle(
                "attempt no longer accepts input".to_string(),
            ))
        }
    }
}
