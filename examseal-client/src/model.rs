//! Data model for exam delivery: attempts, answers, sync queue items,
//! activity events, and the decrypted question package.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Hash chain seed for the first activity event of an attempt
pub const GENESIS_HASH: &str = "0";

/// Question kind inside a decrypted package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    SingleChoice,
    MultiChoice,
    Matching,
    FreeText,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::SingleChoice => "single_choice",
            QuestionKind::MultiChoice => "multi_choice",
            QuestionKind::Matching => "matching",
            QuestionKind::FreeText => "free_text",
        }
    }
}

/// A single question from a decrypted package.
///
/// Question content exists only in memory. It is never written to the
/// durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    /// Choice options; empty for free-text questions
    #[serde(default)]
    pub options: Vec<String>,
}

/// Decrypted question package held in memory for the lifetime of a session
#[derive(Debug, Clone)]
pub struct DecryptedExamPackage {
    pub session_id: Uuid,
    pub package_hash: String,
    pub questions: Vec<Question>,
}

/// Encrypted package envelope as decoded from the download response
#[derive(Debug, Clone)]
pub struct EncryptedExamPackage {
    pub package_id: Uuid,
    pub session_id: Uuid,
    pub encrypted_data: Vec<u8>,
    pub iv: Vec<u8>,
    /// Hex SHA-256 digest of `encrypted_data`
    pub package_hash: String,
}

/// Typed answer value, tagged by question kind.
///
/// Serialized form: `{"kind": "single_choice", "value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    SingleChoice(String),
    MultiChoice(Vec<String>),
    Matching(BTreeMap<String, String>),
    FreeText(String),
}

impl AnswerValue {
    pub fn kind(&self) -> QuestionKind {
        match self {
            AnswerValue::SingleChoice(_) => QuestionKind::SingleChoice,
            AnswerValue::MultiChoice(_) => QuestionKind::MultiChoice,
            AnswerValue::Matching(_) => QuestionKind::Matching,
            AnswerValue::FreeText(_) => QuestionKind::FreeText,
        }
    }

    /// Whether this value is shaped for the given question kind
    pub fn matches_kind(&self, kind: QuestionKind) -> bool {
        self.kind() == kind
    }
}

/// Durable answer row.
///
/// One logical row per question per attempt; later edits overwrite in place
/// but keep the original idempotency key, so repeated pushes of the same
/// answer are one logical operation server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAnswer {
    pub attempt_id: Uuid,
    pub question_id: String,
    pub session_id: Uuid,
    /// Stable per answer lineage, assigned on first save
    pub idempotency_key: Uuid,
    pub value: AnswerValue,
    /// Object keys of uploaded media attached to this answer
    pub media_refs: Vec<String>,
    pub saved_at: DateTime<Utc>,
    /// Whether the server has acknowledged this answer
    pub synced: bool,
}

impl LocalAnswer {
    /// Wire payload carried by the SUBMIT_ANSWER queue item for this answer
    pub fn sync_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "questionId": self.question_id,
            "sessionId": self.session_id,
            "value": self.value,
            "mediaRefs": self.media_refs,
            "savedAt": self.saved_at.to_rfc3339(),
        })
    }
}

/// Attempt lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Submitted,
    TimedOut,
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::TimedOut => "timed_out",
            AttemptStatus::Abandoned => "abandoned",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "in_progress" => Ok(AttemptStatus::InProgress),
            "submitted" => Ok(AttemptStatus::Submitted),
            "timed_out" => Ok(AttemptStatus::TimedOut),
            "abandoned" => Ok(AttemptStatus::Abandoned),
            _ => Err(EngineError::Internal(format!(
                "Unknown attempt status: {}",
                s
            ))),
        }
    }

    /// Terminal statuses admit no further transition
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }
}

/// Grading state recorded against a submitted attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    Pending,
    Graded,
}

impl GradingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradingStatus::Pending => "pending",
            GradingStatus::Graded => "graded",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "pending" => Ok(GradingStatus::Pending),
            "graded" => Ok(GradingStatus::Graded),
            _ => Err(EngineError::Internal(format!(
                "Unknown grading status: {}",
                s
            ))),
        }
    }
}

/// A student's run at an exam session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamAttempt {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    /// Stable key for the attempt's SUBMIT_EXAM operation
    pub idempotency_key: Uuid,
    pub started_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub grading_status: GradingStatus,
}

impl ExamAttempt {
    pub fn new(session_id: Uuid, user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id,
            idempotency_key: Uuid::new_v4(),
            started_at: Utc::now(),
            submitted_at: None,
            status: AttemptStatus::InProgress,
            grading_status: GradingStatus::Pending,
        }
    }
}

/// Kind of outbound operation in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncItemKind {
    SubmitAnswer,
    SubmitExam,
    UploadMedia,
    ActivityLog,
}

impl SyncItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncItemKind::SubmitAnswer => "submit_answer",
            SyncItemKind::SubmitExam => "submit_exam",
            SyncItemKind::UploadMedia => "upload_media",
            SyncItemKind::ActivityLog => "activity_log",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "submit_answer" => Ok(SyncItemKind::SubmitAnswer),
            "submit_exam" => Ok(SyncItemKind::SubmitExam),
            "upload_media" => Ok(SyncItemKind::UploadMedia),
            "activity_log" => Ok(SyncItemKind::ActivityLog),
            _ => Err(EngineError::Internal(format!(
                "Unknown sync item kind: {}",
                s
            ))),
        }
    }
}

/// Sync queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl SyncItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncItemStatus::Pending => "pending",
            SyncItemStatus::InFlight => "in_flight",
            SyncItemStatus::Completed => "completed",
            SyncItemStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "pending" => Ok(SyncItemStatus::Pending),
            "in_flight" => Ok(SyncItemStatus::InFlight),
            "completed" => Ok(SyncItemStatus::Completed),
            "failed" => Ok(SyncItemStatus::Failed),
            _ => Err(EngineError::Internal(format!(
                "Unknown sync item status: {}",
                s
            ))),
        }
    }
}

/// Sync queue item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Monotonic queue position (sqlite rowid)
    pub id: i64,

    /// Deduplication key; stable across every retry of this operation
    pub idempotency_key: Uuid,

    /// Attempt this operation belongs to
    pub attempt_id: Uuid,

    /// Operation kind
    pub kind: SyncItemKind,

    /// Serialized wire payload
    pub payload: serde_json::Value,

    /// Current status
    pub status: SyncItemStatus,

    /// Number of failed delivery attempts so far
    pub retry_count: i32,

    /// Last delivery error message (if any)
    pub last_error: Option<String>,

    /// Timestamp when the operation was first queued
    pub created_at: DateTime<Utc>,
}

/// Kind of proctoring signal recorded in the activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    TabHidden,
    TabVisible,
    WindowBlur,
    WindowFocus,
    Paste,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::TabHidden => "tab_hidden",
            ActivityKind::TabVisible => "tab_visible",
            ActivityKind::WindowBlur => "window_blur",
            ActivityKind::WindowFocus => "window_focus",
            ActivityKind::Paste => "paste",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "tab_hidden" => Ok(ActivityKind::TabHidden),
            "tab_visible" => Ok(ActivityKind::TabVisible),
            "window_blur" => Ok(ActivityKind::WindowBlur),
            "window_focus" => Ok(ActivityKind::WindowFocus),
            "paste" => Ok(ActivityKind::Paste),
            _ => Err(EngineError::Internal(format!(
                "Unknown activity kind: {}",
                s
            ))),
        }
    }
}

/// Append-only activity log entry.
///
/// Entries form a hash chain per attempt: `entry_hash` covers the entry
/// fields plus the previous entry's hash, so reordering or deletion is
/// detectable offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub session_id: Uuid,
    pub kind: ActivityKind,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub synced: bool,
    /// Hash of the previous entry in this attempt's chain (genesis: "0")
    pub prev_hash: String,
    /// SHA-256 over this entry's fields and `prev_hash`
    pub entry_hash: String,
}

impl ActivityEvent {
    /// Compute the chain hash for this entry given the previous entry's hash
    pub fn calculate_hash(&self, prev_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.to_string().as_bytes());
        hasher.update(self.attempt_id.to_string().as_bytes());
        hasher.update(self.session_id.to_string().as_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.metadata.to_string().as_bytes());
        hasher.update(self.occurred_at.to_rfc3339().as_bytes());
        hasher.update(prev_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Wire payload carried by the ACTIVITY_LOG queue item for this event
    pub fn sync_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "eventId": self.id,
            "sessionId": self.session_id,
            "kind": self.kind,
            "metadata": self.metadata,
            "occurredAt": self.occurred_at.to_rfc3339(),
            "entryHash": self.entry_hash,
            "prevHash": self.prev_hash,
        })
    }
}

/// Per-question UI flags persisted with the navigation state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionFlags {
    pub marked_for_review: bool,
    pub visited: bool,
}

/// Durable snapshot of navigation state, restored after a crash or reload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamStateSnapshot {
    pub attempt_id: Uuid,
    pub current_question_index: u32,
    pub flags: BTreeMap<String, QuestionFlags>,
    pub updated_at: DateTime<Utc>,
}

impl ExamStateSnapshot {
    pub fn initial(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            current_question_index: 0,
            flags: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_value_tagged_serialization() {
        let value = AnswerValue::SingleChoice("a".to_string());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "single_choice", "value": "a"})
        );

        let multi = AnswerValue::MultiChoice(vec!["a".to_string(), "c".to_string()]);
        let json = serde_json::to_value(&multi).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "multi_choice", "value": ["a", "c"]})
        );
    }

    #[test]
    fn test_answer_value_roundtrip() {
        let mut pairs = BTreeMap::new();
        pairs.insert("left1".to_string(), "right2".to_string());
        pairs.insert("left2".to_string(), "right1".to_string());

        for value in [
            AnswerValue::SingleChoice("b".to_string()),
            AnswerValue::MultiChoice(vec!["a".to_string()]),
            AnswerValue::Matching(pairs),
            AnswerValue::FreeText("essay text".to_string()),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: AnswerValue = serde_json::from_str(&json).unwrap();
            assert_eq!(value, back);
        }
    }

    #[test]
    fn test_answer_value_matches_kind() {
        let value = AnswerValue::FreeText("text".to_string());
        assert!(value.matches_kind(QuestionKind::FreeText));
        assert!(!value.matches_kind(QuestionKind::SingleChoice));
    }

    #[test]
    fn test_attempt_status_codec() {
        for status in [
            AttemptStatus::InProgress,
            AttemptStatus::Submitted,
            AttemptStatus::TimedOut,
            AttemptStatus::Abandoned,
        ] {
            assert_eq!(AttemptStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(AttemptStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_attempt_status_terminal() {
        assert!(!AttemptStatus::InProgress.is_terminal());
        assert!(AttemptStatus::Submitted.is_terminal());
        assert!(AttemptStatus::TimedOut.is_terminal());
        assert!(AttemptStatus::Abandoned.is_terminal());
    }

    #[test]
    fn test_sync_item_kind_codec() {
        for kind in [
            SyncItemKind::SubmitAnswer,
            SyncItemKind::SubmitExam,
            SyncItemKind::UploadMedia,
            SyncItemKind::ActivityLog,
        ] {
            assert_eq!(SyncItemKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(SyncItemKind::from_str("bogus").is_err());
    }

    #[test]
    fn test_sync_item_kind_wire_format() {
        let json = serde_json::to_value(SyncItemKind::SubmitAnswer).unwrap();
        assert_eq!(json, serde_json::json!("SUBMIT_ANSWER"));
    }

    #[test]
    fn test_sync_item_status_codec() {
        for status in [
            SyncItemStatus::Pending,
            SyncItemStatus::InFlight,
            SyncItemStatus::Completed,
            SyncItemStatus::Failed,
        ] {
            assert_eq!(SyncItemStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_activity_hash_chain_links() {
        let attempt_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let mut first = ActivityEvent {
            id: Uuid::new_v4(),
            attempt_id,
            session_id,
            kind: ActivityKind::TabHidden,
            metadata: serde_json::json!({}),
            occurred_at: Utc::now(),
            synced: false,
            prev_hash: GENESIS_HASH.to_string(),
            entry_hash: String::new(),
        };
        first.entry_hash = first.calculate_hash(GENESIS_HASH);

        let mut second = ActivityEvent {
            id: Uuid::new_v4(),
            attempt_id,
            session_id,
            kind: ActivityKind::TabVisible,
            metadata: serde_json::json!({"elapsed_ms": 1200}),
            occurred_at: Utc::now(),
            synced: false,
            prev_hash: first.entry_hash.clone(),
            entry_hash: String::new(),
        };
        second.entry_hash = second.calculate_hash(&first.entry_hash);

        // Recomputation is stable
        assert_eq!(second.entry_hash, second.calculate_hash(&first.entry_hash));
        // Tampering with a field breaks the chain
        second.kind = ActivityKind::Paste;
        assert_ne!(second.entry_hash, second.calculate_hash(&first.entry_hash));
    }

    #[test]
    fn test_activity_kind_wire_format() {
        let json = serde_json::to_value(ActivityKind::TabHidden).unwrap();
        assert_eq!(json, serde_json::json!("TAB_HIDDEN"));
    }

    #[test]
    fn test_new_attempt_defaults() {
        let attempt = ExamAttempt::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(attempt.status, AttemptStatus::InProgress);
        assert_eq!(attempt.grading_status, GradingStatus::Pending);
        assert!(attempt.submitted_at.is_none());
        assert!(!attempt.id.is_nil());
        assert!(!attempt.idempotency_key.is_nil());
    }

    #[test]
    fn test_answer_sync_payload_shape() {
        let answer = LocalAnswer {
            attempt_id: Uuid::new_v4(),
            question_id: "q1".to_string(),
            session_id: Uuid::new_v4(),
            idempotency_key: Uuid::new_v4(),
            value: AnswerValue::SingleChoice("a".to_string()),
            media_refs: vec![],
            saved_at: Utc::now(),
            synced: false,
        };

        let payload = answer.sync_payload();
        assert_eq!(payload["questionId"], "q1");
        assert_eq!(payload["value"]["kind"], "single_choice");
        assert_eq!(payload["value"]["value"], "a");
    }
}
