//! Error types for the ledgerpack library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the job cannot proceed (corrupt
//!   checkpoint, adapter unavailable, input changed since the checkpoint was
//!   written). Returned as `Err(PipelineError)` from the runner.
//!
//! * [`ToolError`]: **Per-unit**: one adapter call for one chunk failed.
//!   The retry controller classifies it; the runner decides whether the unit
//!   is retried, recorded as failed, or the job pauses.
//!
//! * [`CheckpointError`]: raised by a [`crate::checkpoint::CheckpointStore`].
//!   Converted into [`PipelineError`] at the runner boundary.

use crate::model::{JobId, StageName};
use crate::retry::FailureClass;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the ledgerpack library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// A job id contains characters that cannot appear in a file name.
    #[error("Invalid job id '{id}': use letters, digits, '-' and '_' only")]
    InvalidJobId { id: String },

    /// No checkpoint exists for the requested job.
    #[error("No checkpoint found for job '{job}'")]
    JobNotFound { job: JobId },

    /// The input bytes differ from the ones the checkpoint was built from.
    #[error(
        "Input for job '{job}' changed since it was checkpointed (expected {expected}, found {found}).\n\
Re-run with --restart to discard the old checkpoint."
    )]
    InputChanged {
        job: JobId,
        expected: String,
        found: String,
    },

    // ── Checkpoint errors ─────────────────────────────────────────────────
    /// The persisted record is truncated, tampered with or inconsistent.
    /// Never silently repaired.
    #[error("Checkpoint for job '{job}' is corrupt: {detail}\nRe-run with --restart to rebuild it.")]
    CorruptCheckpoint { job: JobId, detail: String },

    /// Reading or writing the checkpoint failed.
    #[error("Checkpoint I/O failed at '{path}': {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A save arrived with a sequence number not newer than the last one.
    #[error("Checkpoint save for job '{job}' out of order (last {last}, attempted {attempted})")]
    CheckpointOutOfOrder { job: JobId, last: u64, attempted: u64 },

    /// An extract artifact referenced by the checkpoint is missing or unreadable.
    #[error("Artifact for chunk {chunk} is unavailable at '{path}': {detail}\nRe-run with --restart.")]
    ArtifactMissing {
        chunk: usize,
        path: PathBuf,
        detail: String,
    },

    // ── Stage errors ──────────────────────────────────────────────────────
    /// An external collaborator cannot be reached at all.
    #[error("{stage} adapter unavailable: {detail}")]
    AdapterUnavailable { stage: StageName, detail: String },

    /// A job-level stage (split, write) failed permanently.
    #[error("{stage} stage failed: {detail}")]
    StageFailed { stage: StageName, detail: String },

    /// `run --step` named a stage whose predecessor has not completed.
    #[error("Cannot run {stage}: {missing} has not completed for job '{job}'")]
    StageNotReady {
        job: JobId,
        stage: StageName,
        missing: StageName,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A failed adapter call for one unit of work.
///
/// The variant is the adapter's own classification of the failure; see
/// [`ToolError::class`] for how each maps onto the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ToolError {
    /// Network hiccup, 5xx, dropped connection. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Provider asked us to slow down. Retried with backoff.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// The call did not answer within the per-call timeout.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Usage quota or credit is used up. The job pauses.
    #[error("usage quota exhausted: {0}")]
    ResourceExhausted(String),

    /// The input itself cannot be processed. The unit is recorded as failed.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The collaborator cannot be used at all (missing library, bad credentials).
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
}

impl ToolError {
    pub fn class(&self) -> FailureClass {
        match self {
            ToolError::Transient(_) | ToolError::Timeout { .. } => FailureClass::Transient,
            ToolError::RateLimited {
                retry_after_secs, ..
            } => FailureClass::RateLimited {
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            ToolError::ResourceExhausted(_) => FailureClass::ResourceExhausted,
            ToolError::Permanent(_) => FailureClass::Permanent,
            ToolError::Unavailable(_) => FailureClass::Fatal,
        }
    }
}

/// Errors raised by checkpoint storage.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint for '{job}' is corrupt: {detail}")]
    Corrupt { job: JobId, detail: String },

    #[error("save for '{job}' out of order: last sequence {last}, attempted {attempted}")]
    OutOfOrder { job: JobId, last: u64, attempted: u64 },

    #[error("checkpoint I/O at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialise checkpoint for '{job}': {detail}")]
    Serialize { job: JobId, detail: String },
}

impl From<CheckpointError> for PipelineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Corrupt { job, detail } => PipelineError::CorruptCheckpoint { job, detail },
            CheckpointError::OutOfOrder {
                job,
                last,
                attempted,
            } => PipelineError::CheckpointOutOfOrder {
                job,
                last,
                attempted,
            },
            CheckpointError::Io { path, source } => PipelineError::CheckpointIo { path, source },
            CheckpointError::Serialize { job, detail } => {
                PipelineError::Internal(format!("cannot serialise checkpoint for '{job}': {detail}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_errors_map_to_retry_classes() {
        assert_eq!(ToolError::Transient("503".into()).class(), FailureClass::Transient);
        assert_eq!(
            ToolError::RateLimited {
                message: "429".into(),
                retry_after_secs: Some(30)
            }
            .class(),
            FailureClass::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(ToolError::Timeout { secs: 120 }.class(), FailureClass::Transient);
        assert_eq!(
            ToolError::ResourceExhausted("credit".into()).class(),
            FailureClass::ResourceExhausted
        );
        assert_eq!(ToolError::Permanent("garbled".into()).class(), FailureClass::Permanent);
        assert_eq!(ToolError::Unavailable("no key".into()).class(), FailureClass::Fatal);
    }

    #[test]
    fn corrupt_checkpoint_converts_and_displays() {
        let err: PipelineError = CheckpointError::Corrupt {
            job: JobId::parse("pkg-0011").unwrap(),
            detail: "digest mismatch".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
        let msg = err.to_string();
        assert!(msg.contains("pkg-0011"), "got: {msg}");
        assert!(msg.contains("digest mismatch"), "got: {msg}");
    }

    #[test]
    fn stage_not_ready_display() {
        let e = PipelineError::StageNotReady {
            job: JobId::parse("pkg").unwrap(),
            stage: StageName::Parse,
            missing: StageName::Extract,
        };
        assert_eq!(e.to_string(), "Cannot run parse: extract has not completed for job 'pkg'");
    }
}
