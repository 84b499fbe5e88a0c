//! Progress-callback trait for stage and unit events.
//!
//! Inject an [`Arc<dyn PipelineProgress>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the runner works through a job. The CLI drives an `indicatif`
//! bar from it; library callers can forward events anywhere.
//!
//! # Example
//!
//! ```rust
//! use ledgerpack::{PipelineConfig, PipelineProgress, StageName};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingProgress {
//!     parsed: AtomicUsize,
//! }
//!
//! impl PipelineProgress for CountingProgress {
//!     fn on_unit_complete(&self, stage: StageName, _chunk: usize, _records: usize) {
//!         if stage == StageName::Parse {
//!             self.parsed.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingProgress { parsed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::StageName;
use std::sync::Arc;

/// Called by the runner as it processes a job.
///
/// Unit events may arrive concurrently from different chunks; implementations
/// must synchronise their own state. All methods default to no-ops.
pub trait PipelineProgress: Send + Sync {
    /// A stage begins. `pending` of `total` units still need work.
    fn on_stage_start(&self, stage: StageName, pending: usize, total: usize) {
        let _ = (stage, pending, total);
    }

    /// A unit is about to call its adapter.
    fn on_unit_start(&self, stage: StageName, chunk: usize) {
        let _ = (stage, chunk);
    }

    /// A unit finished; `records` is the number of records it produced
    /// (0 for stages that do not produce records).
    fn on_unit_complete(&self, stage: StageName, chunk: usize, records: usize) {
        let _ = (stage, chunk, records);
    }

    /// A unit failed permanently.
    fn on_unit_error(&self, stage: StageName, chunk: usize, error: &str) {
        let _ = (stage, chunk, error);
    }

    /// A stage finished with every unit terminal.
    fn on_stage_complete(&self, stage: StageName, completed: usize, failed: usize) {
        let _ = (stage, completed, failed);
    }

    /// The job paused on resource exhaustion.
    fn on_paused(&self, stage: StageName, reason: &str) {
        let _ = (stage, reason);
    }
}

/// No-op implementation; the default when no callback is configured.
pub struct NoopProgress;

impl PipelineProgress for NoopProgress {}

pub type ProgressCallback = Arc<dyn PipelineProgress>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingProgress {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        pauses: AtomicUsize,
    }

    impl PipelineProgress for TrackingProgress {
        fn on_unit_start(&self, _stage: StageName, _chunk: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_complete(&self, _stage: StageName, _chunk: usize, _records: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_error(&self, _stage: StageName, _chunk: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_paused(&self, _stage: StageName, _reason: &str) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_progress_does_not_panic() {
        let cb = NoopProgress;
        cb.on_stage_start(StageName::Parse, 3, 3);
        cb.on_unit_start(StageName::Parse, 0);
        cb.on_unit_complete(StageName::Parse, 0, 12);
        cb.on_unit_error(StageName::Parse, 1, "garbled table");
        cb.on_stage_complete(StageName::Parse, 2, 1);
        cb.on_paused(StageName::Parse, "quota");
    }

    #[test]
    fn tracking_progress_receives_events() {
        let tracker = TrackingProgress::default();
        tracker.on_unit_start(StageName::Extract, 0);
        tracker.on_unit_complete(StageName::Extract, 0, 0);
        tracker.on_unit_start(StageName::Extract, 1);
        tracker.on_unit_error(StageName::Extract, 1, "unreadable page");
        tracker.on_paused(StageName::Parse, "credit balance too low");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pauses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_progress_works() {
        let cb: ProgressCallback = Arc::new(NoopProgress);
        cb.on_stage_start(StageName::Split, 1, 1);
        cb.on_stage_complete(StageName::Split, 1, 0);
    }
}
