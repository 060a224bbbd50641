//! Local SQLite store for offline-first exam delivery
//!
//! Provides:
//! - Durable attempts, answers, and navigation state
//! - Outbound sync queue with stable idempotency keys
//! - Tamper-evident activity log (hash chain per attempt)
//!
//! Question content never passes through this module; only answers, events,
//! and queue payloads are persisted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    ActivityEvent, ActivityKind, AttemptStatus, ExamAttempt, ExamStateSnapshot, GradingStatus,
    LocalAnswer, SyncItemKind, SyncItemStatus, SyncQueueItem, GENESIS_HASH,
};

/// Store schema version written to `store_meta`
pub const SCHEMA_VERSION: u32 = 1;

/// Configuration for the local store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Path to the database file
    pub db_path: String,
    /// Identity of this installation; applied on first open only, later
    /// opens keep the identity already pinned in the database
    pub device_id: Uuid,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether to enable secure deletion (overwrites freed pages)
    pub enable_secure_delete: bool,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "examseal_local.db".to_string(),
            device_id: Uuid::new_v4(),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
        }
    }
}

/// Local database handle
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    device_id: Uuid,
}

impl LocalStore {
    /// Open (or create) the local store
    pub async fn new(config: LocalStoreConfig) -> EngineResult<Self> {
        // Pragmas go through connect options so every pooled connection
        // gets them, not just the first one
        let mut options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        if config.enable_wal {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        if config.enable_secure_delete {
            options = options.pragma("secure_delete", "ON");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let mut store = Self {
            pool,
            device_id: config.device_id,
        };

        store.initialize_schema().await?;
        store.recover_stranded_items().await?;

        // The device identity is minted on first open and pinned in the
        // database; later opens keep it even if the config differs
        sqlx::query(
            "INSERT OR IGNORE INTO store_meta (key, value, updated_at) VALUES ('device_id', ?, ?)",
        )
        .bind(config.device_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&store.pool)
        .await?;
        let row = sqlx::query("SELECT value FROM store_meta WHERE key = 'device_id'")
            .fetch_one(&store.pool)
            .await?;
        let stored: String = row.try_get("value")?;
        store.device_id = parse_uuid(&stored)?;

        tracing::info!(
            db_path = %config.db_path,
            device_id = %store.device_id,
            "Local store opened"
        );

        Ok(store)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> EngineResult<()> {
        // Metadata table first so the schema version gate can run before
        // anything else is touched
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO store_meta (key, value, updated_at)
            VALUES ('schema_version', ?, ?)
            "#,
        )
        .bind(SCHEMA_VERSION.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let version = self.schema_version().await?;
        if version > SCHEMA_VERSION {
            return Err(EngineError::SchemaVersion {
                version,
                supported: SCHEMA_VERSION,
            });
        }

        // Create attempts table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                started_at TEXT NOT NULL,
                submitted_at TEXT,
                status TEXT NOT NULL,
                grading_status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attempts_session ON attempts(session_id)")
            .execute(&self.pool)
            .await?;

        // Create answers table; one logical row per question per attempt
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS answers (
                attempt_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                value TEXT NOT NULL,
                media_refs TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (attempt_id, question_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_answers_synced ON answers(synced)")
            .execute(&self.pool)
            .await?;

        // Create sync queue table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_key TEXT NOT NULL,
                attempt_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_key ON sync_queue(idempotency_key)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_attempt ON sync_queue(attempt_id)")
            .execute(&self.pool)
            .await?;

        // Create activity log table (append-only, hash chained per attempt)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                attempt_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                metadata TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                prev_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL,
                idempotency_key TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_activity_attempt ON activity_log(attempt_id)",
        )
        .execute(&self.pool)
        .await?;

        // Create navigation state table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exam_state (
                attempt_id TEXT PRIMARY KEY,
                current_question_index INTEGER NOT NULL,
                flags TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Schema version recorded in this database file
    pub async fn schema_version(&self) -> EngineResult<u32> {
        let row = sqlx::query("SELECT value FROM store_meta WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;

        let value: String = row.try_get("value")?;
        value
            .parse::<u32>()
            .map_err(|e| EngineError::Internal(format!("Invalid schema version: {}", e)))
    }

    /// A UUID minted once for `key` and returned unchanged ever after.
    ///
    /// Backs idempotency keys that must survive restarts, such as the
    /// package download key for a session.
    pub async fn persistent_uuid(&self, key: &str) -> EngineResult<Uuid> {
        sqlx::query("INSERT OR IGNORE INTO store_meta (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(Uuid::new_v4().to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT value FROM store_meta WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        let value: String = row.try_get("value")?;
        parse_uuid(&value)
    }

    // ------------------------------------------------------------------
    // Attempts
    // ------------------------------------------------------------------

    /// Insert a new attempt row
    pub async fn insert_attempt(&self, attempt: &ExamAttempt) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO attempts (
                id, session_id, user_id, idempotency_key,
                started_at, submitted_at, status, grading_status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.session_id.to_string())
        .bind(attempt.user_id.to_string())
        .bind(attempt.idempotency_key.to_string())
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.submitted_at.map(|t| t.to_rfc3339()))
        .bind(attempt.status.as_str())
        .bind(attempt.grading_status.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            attempt_id = %attempt.id,
            session_id = %attempt.session_id,
            "Attempt recorded"
        );

        Ok(())
    }

    /// Fetch an attempt by id
    pub async fn get_attempt(&self, attempt_id: Uuid) -> EngineResult<Option<ExamAttempt>> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, user_id, idempotency_key,
                   started_at, submitted_at, status, grading_status
            FROM attempts
            WHERE id = ?
            "#,
        )
        .bind(attempt_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| attempt_from_row(&row)).transpose()
    }

    /// Latest attempt for a session and user, if one exists. Used to
    /// resume an interrupted attempt instead of starting a second one.
    pub async fn find_attempt(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<Option<ExamAttempt>> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, user_id, idempotency_key,
                   started_at, submitted_at, status, grading_status
            FROM attempts
            WHERE session_id = ? AND user_id = ?
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(session_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| attempt_from_row(&row)).transpose()
    }

    /// Transition an in-progress attempt to a terminal status.
    ///
    /// The transition is guarded in SQL, so a second submission (for example
    /// a manual submit racing timer expiry) fails with
    /// [`EngineError::AttemptLifecycle`] instead of overwriting the first.
    pub async fn update_attempt_status(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        submitted_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        if !status.is_terminal() {
            return Err(EngineError::AttemptLifecycle(format!(
                "attempt {} cannot transition back to {}",
                attempt_id,
                status.as_str()
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE attempts
            SET status = ?, submitted_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(submitted_at.map(|t| t.to_rfc3339()))
        .bind(attempt_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_attempt(attempt_id).await? {
                Some(existing) => Err(EngineError::AttemptLifecycle(format!(
                    "attempt {} is already {}",
                    attempt_id,
                    existing.status.as_str()
                ))),
                None => Err(EngineError::NotFound(format!("attempt {}", attempt_id))),
            };
        }

        tracing::info!(
            attempt_id = %attempt_id,
            status = status.as_str(),
            "Attempt reached terminal status"
        );

        Ok(())
    }

    /// Record the grading state reported by the server
    pub async fn set_grading_status(
        &self,
        attempt_id: Uuid,
        grading_status: GradingStatus,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE attempts SET grading_status = ? WHERE id = ?")
            .bind(grading_status.as_str())
            .bind(attempt_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Answers
    // ------------------------------------------------------------------

    /// Durably save an answer and enqueue its SUBMIT_ANSWER operation in one
    /// transaction.
    ///
    /// The first save of a question assigns the lineage idempotency key;
    /// later edits keep it. While an item for that key is still pending its
    /// payload is refreshed in place, so rapid edits never fan out into
    /// multiple queue entries.
    pub async fn save_answer_and_enqueue(&self, answer: &LocalAnswer) -> EngineResult<()> {
        let value_json = serde_json::to_string(&answer.value)?;
        let media_json = serde_json::to_string(&answer.media_refs)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO answers (
                attempt_id, question_id, session_id, idempotency_key,
                value, media_refs, saved_at, synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(attempt_id, question_id) DO UPDATE SET
                value = excluded.value,
                saved_at = excluded.saved_at,
                synced = 0
            "#,
        )
        .bind(answer.attempt_id.to_string())
        .bind(&answer.question_id)
        .bind(answer.session_id.to_string())
        .bind(answer.idempotency_key.to_string())
        .bind(&value_json)
        .bind(&media_json)
        .bind(answer.saved_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        // The key assigned on first save survives later edits, and media
        // refs are only ever changed by attach_media_ref. Read both back
        // rather than trusting the caller's copy.
        let row = sqlx::query(
            "SELECT idempotency_key, media_refs FROM answers WHERE attempt_id = ? AND question_id = ?",
        )
        .bind(answer.attempt_id.to_string())
        .bind(&answer.question_id)
        .fetch_one(&mut *tx)
        .await?;
        let key: String = row.try_get("idempotency_key")?;
        let key = parse_uuid(&key)?;
        let stored_media: String = row.try_get("media_refs")?;

        let mut stored = answer.clone();
        stored.idempotency_key = key;
        stored.media_refs = serde_json::from_str(&stored_media)?;
        let payload = stored.sync_payload();

        Self::enqueue_in_tx(&mut tx, SyncItemKind::SubmitAnswer, answer.attempt_id, key, &payload)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            attempt_id = %answer.attempt_id,
            question_id = %answer.question_id,
            idempotency_key = %key,
            "Answer saved and queued for sync"
        );

        Ok(())
    }

    /// Fetch a single answer
    pub async fn get_answer(
        &self,
        attempt_id: Uuid,
        question_id: &str,
    ) -> EngineResult<Option<LocalAnswer>> {
        let row = sqlx::query(
            r#"
            SELECT attempt_id, question_id, session_id, idempotency_key,
                   value, media_refs, saved_at, synced
            FROM answers
            WHERE attempt_id = ? AND question_id = ?
            "#,
        )
        .bind(attempt_id.to_string())
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| answer_from_row(&row)).transpose()
    }

    /// All answers for an attempt, in question id order
    pub async fn answers_for_attempt(&self, attempt_id: Uuid) -> EngineResult<Vec<LocalAnswer>> {
        let rows = sqlx::query(
            r#"
            SELECT attempt_id, question_id, session_id, idempotency_key,
                   value, media_refs, saved_at, synced
            FROM answers
            WHERE attempt_id = ?
            ORDER BY question_id ASC
            "#,
        )
        .bind(attempt_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(answer_from_row).collect()
    }

    /// Attach an uploaded media object to an answer and enqueue the
    /// UPLOAD_MEDIA reference operation in one transaction.
    pub async fn attach_media_ref(
        &self,
        attempt_id: Uuid,
        question_id: &str,
        object_key: &str,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT session_id, media_refs FROM answers WHERE attempt_id = ? AND question_id = ?",
        )
        .bind(attempt_id.to_string())
        .bind(question_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(EngineError::NotFound(format!(
                "answer {}/{}",
                attempt_id, question_id
            )));
        };

        let session_id: String = row.try_get("session_id")?;
        let media_json: String = row.try_get("media_refs")?;
        let mut media_refs: Vec<String> = serde_json::from_str(&media_json)?;
        media_refs.push(object_key.to_string());

        sqlx::query(
            "UPDATE answers SET media_refs = ? WHERE attempt_id = ? AND question_id = ?",
        )
        .bind(serde_json::to_string(&media_refs)?)
        .bind(attempt_id.to_string())
        .bind(question_id)
        .execute(&mut *tx)
        .await?;

        // Each uploaded object is a new fact with its own key
        let payload = serde_json::json!({
            "questionId": question_id,
            "sessionId": session_id,
            "objectKey": object_key,
        });
        Self::enqueue_in_tx(
            &mut tx,
            SyncItemKind::UploadMedia,
            attempt_id,
            Uuid::new_v4(),
            &payload,
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(
            attempt_id = %attempt_id,
            question_id = %question_id,
            object_key = %object_key,
            "Media reference attached"
        );

        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync queue
    // ------------------------------------------------------------------

    /// Queue an operation for sync.
    ///
    /// If a pending item already carries `idempotency_key` its payload is
    /// refreshed instead of inserting a second row.
    pub async fn enqueue_item(
        &self,
        kind: SyncItemKind,
        attempt_id: Uuid,
        idempotency_key: Uuid,
        payload: &serde_json::Value,
    ) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        let item_id =
            Self::enqueue_in_tx(&mut tx, kind, attempt_id, idempotency_key, payload).await?;
        tx.commit().await?;

        tracing::debug!(
            item_id = item_id,
            kind = kind.as_str(),
            idempotency_key = %idempotency_key,
            "Queued operation for sync"
        );

        Ok(item_id)
    }

    async fn enqueue_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        kind: SyncItemKind,
        attempt_id: Uuid,
        idempotency_key: Uuid,
        payload: &serde_json::Value,
    ) -> EngineResult<i64> {
        let refreshed = sqlx::query(
            "UPDATE sync_queue SET payload = ? WHERE idempotency_key = ? AND status = 'pending'",
        )
        .bind(payload.to_string())
        .bind(idempotency_key.to_string())
        .execute(&mut **tx)
        .await?;

        if refreshed.rows_affected() > 0 {
            let row = sqlx::query(
                "SELECT id FROM sync_queue WHERE idempotency_key = ? AND status = 'pending'",
            )
            .bind(idempotency_key.to_string())
            .fetch_one(&mut **tx)
            .await?;
            return Ok(row.try_get("id")?);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO sync_queue (
                idempotency_key, attempt_id, kind, payload,
                status, retry_count, created_at
            ) VALUES (?, ?, ?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(idempotency_key.to_string())
        .bind(attempt_id.to_string())
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Pending operations in FIFO order, bounded by `limit`
    pub async fn pending_items(&self, limit: i64) -> EngineResult<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, idempotency_key, attempt_id, kind, payload,
                   status, retry_count, last_error, created_at
            FROM sync_queue
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    /// Return items left in flight by an interrupted run to pending.
    ///
    /// Runs once at open, before any pusher exists, so no flush can be
    /// racing it. A batch that was actually received by the server gets
    /// retransmitted with its original idempotency key and deduplicated
    /// there.
    async fn recover_stranded_items(&self) -> EngineResult<()> {
        let result =
            sqlx::query("UPDATE sync_queue SET status = 'pending' WHERE status = 'in_flight'")
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(
                recovered = result.rows_affected(),
                "Returned stranded in-flight sync items to pending"
            );
        }
        Ok(())
    }

    /// Move items into the in-flight state before transmission
    pub async fn mark_in_flight(&self, item_ids: &[i64]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        for item_id in item_ids {
            sqlx::query("UPDATE sync_queue SET status = 'in_flight' WHERE id = ? AND status = 'pending'")
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mark acknowledged items completed and propagate sync state to the
    /// rows they carried.
    ///
    /// An answer only flips to synced when no other live item still carries
    /// its key; if an edit was queued while this item was in flight, the
    /// newer payload remains pending and the answer stays unsynced.
    pub async fn mark_completed(&self, items: &[SyncQueueItem]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        for item in items {
            sqlx::query("UPDATE sync_queue SET status = 'completed', last_error = NULL WHERE id = ?")
                .bind(item.id)
                .execute(&mut *tx)
                .await?;

            match item.kind {
                SyncItemKind::SubmitAnswer => {
                    sqlx::query(
                        r#"
                        UPDATE answers SET synced = 1
                        WHERE idempotency_key = ?
                          AND NOT EXISTS (
                              SELECT 1 FROM sync_queue
                              WHERE idempotency_key = ?
                                AND status IN ('pending', 'in_flight')
                          )
                        "#,
                    )
                    .bind(item.idempotency_key.to_string())
                    .bind(item.idempotency_key.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                SyncItemKind::ActivityLog => {
                    sqlx::query("UPDATE activity_log SET synced = 1 WHERE idempotency_key = ?")
                        .bind(item.idempotency_key.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
                SyncItemKind::SubmitExam | SyncItemKind::UploadMedia => {}
            }
        }

        tx.commit().await?;

        tracing::debug!(count = items.len(), "Marked operations as completed");

        Ok(())
    }

    /// Return failed items to pending and record the delivery error
    pub async fn mark_batch_failed(&self, item_ids: &[i64], error: &str) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        for item_id in item_ids {
            sqlx::query(
                r#"
                UPDATE sync_queue
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    last_error = ?
                WHERE id = ? AND status = 'in_flight'
                "#,
            )
            .bind(error)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::warn!(
            count = item_ids.len(),
            error = error,
            "Batch sync failed, items returned to pending"
        );

        Ok(())
    }

    /// Park an item the server refused as an idempotency conflict.
    ///
    /// Conflicted items are never retried; they stay visible for support
    /// tooling until purged.
    pub async fn mark_conflict(&self, item_id: i64, reason: &str) -> EngineResult<()> {
        sqlx::query("UPDATE sync_queue SET status = 'failed', last_error = ? WHERE id = ?")
            .bind(reason)
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        tracing::warn!(item_id = item_id, reason = reason, "Item parked after idempotency conflict");

        Ok(())
    }

    /// Number of operations not yet acknowledged by the server
    pub async fn unsynced_count(&self) -> EngineResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM sync_queue WHERE status IN ('pending', 'in_flight')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("cnt")?)
    }

    /// Delete completed queue items older than `before`. Returns the number
    /// of rows removed.
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> EngineResult<u64> {
        let result =
            sqlx::query("DELETE FROM sync_queue WHERE status = 'completed' AND created_at < ?")
                .bind(before.to_rfc3339())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    /// Append an activity event and enqueue its ACTIVITY_LOG operation in
    /// one transaction. The entry hash chains onto the previous entry for
    /// the same attempt.
    pub async fn append_activity(
        &self,
        attempt_id: Uuid,
        session_id: Uuid,
        kind: ActivityKind,
        metadata: serde_json::Value,
    ) -> EngineResult<ActivityEvent> {
        let mut tx = self.pool.begin().await?;

        let prev_hash = sqlx::query(
            "SELECT entry_hash FROM activity_log WHERE attempt_id = ? ORDER BY rowid DESC LIMIT 1",
        )
        .bind(attempt_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get::<String, _>("entry_hash"))
        .transpose()?
        .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut event = ActivityEvent {
            id: Uuid::new_v4(),
            attempt_id,
            session_id,
            kind,
            metadata,
            occurred_at: Utc::now(),
            synced: false,
            prev_hash: prev_hash.clone(),
            entry_hash: String::new(),
        };
        event.entry_hash = event.calculate_hash(&prev_hash);

        let item_key = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO activity_log (
                id, attempt_id, session_id, kind, metadata,
                occurred_at, synced, prev_hash, entry_hash, idempotency_key
            ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.attempt_id.to_string())
        .bind(event.session_id.to_string())
        .bind(event.kind.as_str())
        .bind(event.metadata.to_string())
        .bind(event.occurred_at.to_rfc3339())
        .bind(&event.prev_hash)
        .bind(&event.entry_hash)
        .bind(item_key.to_string())
        .execute(&mut *tx)
        .await?;

        Self::enqueue_in_tx(
            &mut tx,
            SyncItemKind::ActivityLog,
            attempt_id,
            item_key,
            &event.sync_payload(),
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(
            attempt_id = %attempt_id,
            kind = kind.as_str(),
            "Activity event appended"
        );

        Ok(event)
    }

    /// All activity events for an attempt, in append order
    pub async fn events_for_attempt(&self, attempt_id: Uuid) -> EngineResult<Vec<ActivityEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, attempt_id, session_id, kind, metadata,
                   occurred_at, synced, prev_hash, entry_hash
            FROM activity_log
            WHERE attempt_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(attempt_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let attempt_id: String = row.try_get("attempt_id")?;
            let session_id: String = row.try_get("session_id")?;
            let kind: String = row.try_get("kind")?;
            let metadata: String = row.try_get("metadata")?;
            let occurred_at: String = row.try_get("occurred_at")?;
            let synced: i32 = row.try_get("synced")?;
            let prev_hash: String = row.try_get("prev_hash")?;
            let entry_hash: String = row.try_get("entry_hash")?;

            events.push(ActivityEvent {
                id: parse_uuid(&id)?,
                attempt_id: parse_uuid(&attempt_id)?,
                session_id: parse_uuid(&session_id)?,
                kind: ActivityKind::from_str(&kind)?,
                metadata: serde_json::from_str(&metadata)?,
                occurred_at: parse_timestamp(&occurred_at)?,
                synced: synced != 0,
                prev_hash,
                entry_hash,
            });
        }

        Ok(events)
    }

    /// Walk an attempt's activity chain and recompute every hash.
    ///
    /// Returns false if any entry was altered, removed, or reordered.
    pub async fn verify_activity_chain(&self, attempt_id: Uuid) -> EngineResult<bool> {
        let events = self.events_for_attempt(attempt_id).await?;

        let mut prev = GENESIS_HASH.to_string();
        for event in &events {
            if event.prev_hash != prev || event.entry_hash != event.calculate_hash(&prev) {
                return Ok(false);
            }
            prev = event.entry_hash.clone();
        }

        Ok(true)
    }

    // ------------------------------------------------------------------
    // Navigation state
    // ------------------------------------------------------------------

    /// Persist the navigation snapshot for an attempt
    pub async fn put_exam_state(&self, state: &ExamStateSnapshot) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exam_state (attempt_id, current_question_index, flags, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(attempt_id) DO UPDATE SET
                current_question_index = excluded.current_question_index,
                flags = excluded.flags,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.attempt_id.to_string())
        .bind(i64::from(state.current_question_index))
        .bind(serde_json::to_string(&state.flags)?)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch the navigation snapshot for an attempt
    pub async fn get_exam_state(
        &self,
        attempt_id: Uuid,
    ) -> EngineResult<Option<ExamStateSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT attempt_id, current_question_index, flags, updated_at
            FROM exam_state
            WHERE attempt_id = ?
            "#,
        )
        .bind(attempt_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempt_id: String = row.try_get("attempt_id")?;
        let index: i64 = row.try_get("current_question_index")?;
        let flags: String = row.try_get("flags")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Some(ExamStateSnapshot {
            attempt_id: parse_uuid(&attempt_id)?,
            current_question_index: u32::try_from(index)
                .map_err(|e| EngineError::Internal(format!("Invalid question index: {}", e)))?,
            flags: serde_json::from_str(&flags)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Identity of this installation
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Vacuum the database to reclaim space and overwrite freed pages.
    /// Should run after purging completed items so released answer payloads
    /// are actually gone from the file.
    pub async fn vacuum(&self) -> EngineResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close database connection
    pub async fn close(&self) -> EngineResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn parse_uuid(s: &str) -> EngineResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| EngineError::Internal(format!("Invalid UUID: {}", e)))
}

fn parse_timestamp(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Internal(format!("Invalid timestamp: {}", e)))
}

fn attempt_from_row(row: &sqlx::sqlite::SqliteRow) -> EngineResult<ExamAttempt> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let user_id: String = row.try_get("user_id")?;
    let idempotency_key: String = row.try_get("idempotency_key")?;
    let started_at: String = row.try_get("started_at")?;
    let submitted_at: Option<String> = row.try_get("submitted_at")?;
    let status: String = row.try_get("status")?;
    let grading_status: String = row.try_get("grading_status")?;

    Ok(ExamAttempt {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        user_id: parse_uuid(&user_id)?,
        idempotency_key: parse_uuid(&idempotency_key)?,
        started_at: parse_timestamp(&started_at)?,
        submitted_at: submitted_at.as_deref().map(parse_timestamp).transpose()?,
        status: AttemptStatus::from_str(&status)?,
        grading_status: GradingStatus::from_str(&grading_status)?,
    })
}

fn answer_from_row(row: &sqlx::sqlite::SqliteRow) -> EngineResult<LocalAnswer> {
    let attempt_id: String = row.try_get("attempt_id")?;
    let question_id: String = row.try_get("question_id")?;
    let session_id: String = row.try_get("session_id")?;
    let idempotency_key: String = row.try_get("idempotency_key")?;
    let value: String = row.try_get("value")?;
    let media_refs: String = row.try_get("media_refs")?;
    let saved_at: String = row.try_get("saved_at")?;
    let synced: i32 = row.try_get("synced")?;

    Ok(LocalAnswer {
        attempt_id: parse_uuid(&attempt_id)?,
        question_id,
        session_id: parse_uuid(&session_id)?,
        idempotency_key: parse_uuid(&idempotency_key)?,
        value: serde_json::from_str(&value)?,
        media_refs: serde_json::from_str(&media_refs)?,
        saved_at: parse_timestamp(&saved_at)?,
        synced: synced != 0,
    })
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> EngineResult<SyncQueueItem> {
    let id: i64 = row.try_get("id")?;
    let idempotency_key: String = row.try_get("idempotency_key")?;
    let attempt_id: String = row.try_get("attempt_id")?;
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(SyncQueueItem {
        id,
        idempotency_key: parse_uuid(&idempotency_key)?,
        attempt_id: parse_uuid(&attempt_id)?,
        kind: SyncItemKind::from_str(&kind)?,
        payload: serde_json::from_str(&payload)?,
        status: SyncItemStatus::from_str(&status)?,
        retry_count,
        last_error,
        created_at: parse_timestamp(&created_at)?,
    })
}
