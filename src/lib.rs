//! # ledgerpack
//!
//! Resumable conversion of monthly financial PDF packages (balance sheets,
//! income statements, check registers, scanned vendor invoices, …) into one
//! tabular workbook per package.
//!
//! ## Why checkpoints?
//!
//! A package runs to hundreds of pages and each chunk costs a model call.
//! When the provider's credit runs out halfway through, starting over wastes
//! every call already paid for. Every finished unit of work is therefore
//! recorded in a checkpoint before the next one is handed out, and a paused
//! or interrupted job continues from exactly where it stopped.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Split      count pages, plan chunks of ≤ N pages
//!  ├─ 2. Extract    per chunk: text layer + rendered scans (pdfium, spawn_blocking)
//!  ├─ 3. Parse      per chunk: model call → typed records (retry + backoff)
//!  ├─ 4. Aggregate  merge by chunk index, drop duplicate records
//!  └─ 5. Write      sectioned CSV workbook, written atomically
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledgerpack::{stage_input, Adapters, FileCheckpointStore, PipelineConfig, StageRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().concurrency(4).build()?;
//!     let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
//!     let spec = stage_input("package.pdf", &config.work_root(), config.download_timeout_secs).await?;
//!     let runner = StageRunner::new(config.clone(), store, Adapters::from_config(&config));
//!     let outcome = runner.run(&spec).await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ledgerpack` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod adapters;
pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod detect;
pub mod error;
pub mod model;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod retry;
pub mod runner;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use adapters::input::{stage_input, JobSpec};
pub use adapters::Adapters;
pub use aggregate::ReportTables;
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore};
pub use config::{LlmConfig, PdfConfig, PipelineConfig, PipelineConfigBuilder, RetryConfig};
pub use error::{CheckpointError, PipelineError, ToolError};
pub use model::{ChunkFailure, JobId, JobStatus, StageName};
pub use progress::{NoopProgress, PipelineProgress, ProgressCallback};
pub use report::ReportType;
pub use retry::{RetryController, Sleeper, TokioSleeper};
pub use runner::{JobOutcome, StageRunner};
