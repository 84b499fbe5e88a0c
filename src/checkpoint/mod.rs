//! Checkpoint module for resumable job execution.
//!
//! Provides:
//! - [`CheckpointRecord`]: the persisted state of one job
//! - [`CheckpointStore`]: the load/save contract the runner depends on
//! - [`FileCheckpointStore`]: one JSON file per job, replaced atomically

mod file;
mod record;

pub use file::{write_atomic, FileCheckpointStore, SCHEMA_VERSION};
pub use record::CheckpointRecord;

use crate::error::CheckpointError;
use crate::model::JobId;
use async_trait::async_trait;

/// Durable storage for job records.
///
/// Implementations must make `save` atomic: after a crash at any point a
/// subsequent `load` returns either the previous record or the new one,
/// never a mixture. A record that cannot be verified is reported as
/// [`CheckpointError::Corrupt`], never repaired.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when no checkpoint exists for `job`.
    async fn load(&self, job: &JobId) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Persist `record`. Its `sequence` must exceed every sequence already
    /// saved or observed for the same job.
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;
}
