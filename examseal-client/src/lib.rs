//! Offline-first exam delivery engine
//!
//! Provides:
//! - Sealed package download with integrity checked before decryption
//! - Durable local store for answers, queue, and activity on SQLite
//! - Idempotent batch sync with backoff and conflict parking
//! - Debounced answer autosave with per-question write coalescing
//! - Wall-clock-resilient countdown with exactly-once expiry
//! - Tamper-evident proctoring event chain

pub mod activity;
pub mod autosave;
pub mod error;
pub mod model;
pub mod package;
pub mod session;
pub mod store;
pub mod sync;
pub mod timer;
pub mod transport;

pub use activity::{ActivityCounts, ActivityLogger};
pub use autosave::{AnswerAutosave, AutosaveConfig};
pub use error::{EngineError, EngineResult};
pub use model::{
    ActivityEvent, ActivityKind, AnswerValue, AttemptStatus, DecryptedExamPackage,
    EncryptedExamPackage, ExamAttempt, ExamStateSnapshot, GradingStatus, LocalAnswer, Question,
    QuestionFlags, QuestionKind, SyncItemKind, SyncItemStatus, SyncQueueItem,
};
pub use package::{open_package, seal_package, PACKAGE_SCHEMA_VERSION};
pub use session::{BeginExam, ExamSession, SessionConfig};
pub use store::{LocalStore, LocalStoreConfig};
pub use sync::{BatchPusher, FlushOutcome, FlushReason, SyncConfig, SyncHealth};
pub use timer::{Clock, ExamTimer, ManualClock, SystemClock, TimerPhase, TimerSnapshot};
pub use transport::{
    BatchAck, DownloadRequest, DownloadResponse, ExamTransport, HttpTransport, ItemConflict,
    MediaChunk, MediaUploader, SyncBatch, SyncItem, TransportConfig,
};
