//! Stage runner: drives a job through split → extract → parse → aggregate →
//! write, persisting after every unit so an interrupted job loses at most the
//! units that were in flight.
//!
//! ## Execution model
//!
//! ```text
//!            ┌──────────── runner loop (single checkpoint writer) ───────────┐
//! pending ──▶│ buffer_unordered(concurrency) ──▶ unit result ──▶ save record │
//! units      └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Units of a chunk stage run concurrently up to `concurrency`. Only the
//!   loop that consumes their results touches the record, so saves are
//!   serialised and every save carries a strictly larger sequence.
//! - When a unit reports quota exhaustion the runner stops handing out new
//!   units, lets the in-flight ones finish and saves them, then pauses the job.
//! - A stage completes once every unit is Completed or Failed. Failed units
//!   are listed in the outcome; they do not block later chunks.
//! - Results are kept per chunk index, so the merged output never depends on
//!   the order in which chunks finished.

use crate::adapters::input::JobSpec;
use crate::adapters::{Adapters, ExtractedChunk};
use crate::aggregate::aggregate;
use crate::checkpoint::{write_atomic, CheckpointRecord, CheckpointStore};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ToolError};
use crate::model::{
    Chunk, ChunkFailure, Job, JobId, JobStatus, ParseResult, StageName, StageStatus, UnitState,
};
use crate::report::ReportType;
use crate::retry::{RetryController, RetryOutcome, Sleeper, TokioSleeper};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        job: JobId,
        output: PathBuf,
    },
    /// Output was written, but some units produced no data.
    CompletedWithFailures {
        job: JobId,
        output: PathBuf,
        failures: Vec<ChunkFailure>,
    },
    /// Quota or credit ran out. Running the job again continues from here.
    PausedForResource {
        job: JobId,
        stage: StageName,
        completed: Vec<usize>,
        pending: Vec<usize>,
        reason: String,
    },
    /// A single stage was run on request.
    StepCompleted {
        job: JobId,
        stage: StageName,
    },
}

impl JobOutcome {
    /// Process exit code: 0 for finished work, 2 for a pause.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::PausedForResource { .. } => 2,
            _ => 0,
        }
    }

    pub fn job(&self) -> &JobId {
        match self {
            JobOutcome::Completed { job, .. }
            | JobOutcome::CompletedWithFailures { job, .. }
            | JobOutcome::PausedForResource { job, .. }
            | JobOutcome::StepCompleted { job, .. } => job,
        }
    }
}

enum StageFlow {
    Completed,
    Paused { reason: String },
}

enum UnitResult {
    Skipped,
    Extracted { path: PathBuf },
    Parsed { results: Vec<ParseResult> },
    Failed {
        reason: String,
        attempts: u32,
        hint: ReportType,
    },
    Exhausted { reason: String },
    Aborted { reason: String },
    Fatal(PipelineError),
}

impl UnitResult {
    fn halts(&self) -> bool {
        matches!(
            self,
            UnitResult::Exhausted { .. } | UnitResult::Aborted { .. } | UnitResult::Fatal(_)
        )
    }
}

pub struct StageRunner {
    config: PipelineConfig,
    store: Arc<dyn CheckpointStore>,
    adapters: Adapters,
    retry: RetryController,
}

impl StageRunner {
    pub fn new(config: PipelineConfig, store: Arc<dyn CheckpointStore>, adapters: Adapters) -> Self {
        Self::with_sleeper(config, store, adapters, Arc::new(TokioSleeper))
    }

    /// Like [`StageRunner::new`] with a custom backoff sleeper.
    pub fn with_sleeper(
        config: PipelineConfig,
        store: Arc<dyn CheckpointStore>,
        adapters: Adapters,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let retry = RetryController::new(config.retry.clone(), sleeper);
        Self {
            config,
            store,
            adapters,
            retry,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage not yet completed. Starts the job if no checkpoint
    /// exists; otherwise continues from the checkpoint.
    pub async fn run(&self, spec: &JobSpec) -> Result<JobOutcome, PipelineError> {
        let record = self.load_or_create(spec).await?;
        self.drive(record, None).await
    }

    /// Continue a checkpointed job by id, re-reading its recorded input.
    pub async fn resume(&self, job: &JobId) -> Result<JobOutcome, PipelineError> {
        let record = self
            .store
            .load(job)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound { job: job.clone() })?;
        let spec = JobSpec::from_file(&record.job.source, &record.job.input).await?;
        let record = reconcile_input(record, &spec)?;
        self.drive(record, None).await
    }

    /// Run exactly one stage. Its predecessors must have completed.
    pub async fn run_step(&self, spec: &JobSpec, stage: StageName) -> Result<JobOutcome, PipelineError> {
        let record = self.load_or_create(spec).await?;
        self.drive(record, Some(stage)).await
    }

    async fn load_or_create(&self, spec: &JobSpec) -> Result<CheckpointRecord, PipelineError> {
        match self.store.load(&spec.id).await? {
            Some(record) => {
                info!(
                    "Resuming job {} ({}, sequence {})",
                    spec.id, record.job.status, record.sequence
                );
                reconcile_input(record, spec)
            }
            None => {
                info!("Starting job {} from {}", spec.id, spec.source);
                Ok(CheckpointRecord::new(Job::new(
                    spec.id.clone(),
                    spec.source.clone(),
                    spec.path.clone(),
                    spec.fingerprint.clone(),
                )))
            }
        }
    }

    async fn persist(&self, record: &mut CheckpointRecord) -> Result<(), PipelineError> {
        record.sequence += 1;
        record.updated_at = Utc::now();
        self.store.save(record).await?;
        Ok(())
    }

    // ── Job loop ──────────────────────────────────────────────────────────

    async fn drive(
        &self,
        mut record: CheckpointRecord,
        only: Option<StageName>,
    ) -> Result<JobOutcome, PipelineError> {
        let job = record.job.id.clone();

        if self.config.retry_failed {
            let reopened = record.reopen_failed();
            if reopened > 0 {
                info!("Reopened {reopened} failed units of job {job}");
            }
        }

        if only.is_none() && record.job.status.is_finished() {
            info!("Job {job} is already {}; nothing to do", record.job.status);
            return finished_outcome(&record);
        }

        let stages: Vec<StageName> = match only {
            Some(stage) => {
                if let Some(missing) = StageName::ALL[..stage.index()]
                    .iter()
                    .find(|s| record.stage(**s).status != StageStatus::Completed)
                {
                    return Err(PipelineError::StageNotReady {
                        job,
                        stage,
                        missing: *missing,
                    });
                }
                let state = record.stage_mut(stage);
                if !matches!(stage, StageName::Aggregate | StageName::Write)
                    && state.status == StageStatus::Completed
                {
                    info!("Stage {stage} of job {job} already completed");
                    return Ok(JobOutcome::StepCompleted { job, stage });
                }
                // Aggregate and Write are pure functions of earlier stages;
                // asking for them again recomputes them.
                if state.status == StageStatus::Completed {
                    state.status = StageStatus::Pending;
                    state.units.clear();
                }
                vec![stage]
            }
            None => StageName::ALL
                .into_iter()
                .filter(|s| record.stage(*s).status != StageStatus::Completed)
                .collect(),
        };

        record.job.status = JobStatus::Running;
        self.persist(&mut record).await?;

        for stage in stages {
            match self.run_stage(&mut record, stage).await {
                Ok(StageFlow::Completed) => {}
                Ok(StageFlow::Paused { reason }) => {
                    record.job.status = JobStatus::Paused;
                    self.persist(&mut record).await?;
                    warn!("Job {job} paused during {stage}: {reason}");
                    self.config.progress_callback.on_paused(stage, &reason);
                    let state = record.stage(stage);
                    return Ok(JobOutcome::PausedForResource {
                        job,
                        stage,
                        completed: state.completed_units(),
                        pending: state
                            .units
                            .iter()
                            .filter(|(_, s)| matches!(s, UnitState::Pending))
                            .map(|(idx, _)| *idx)
                            .collect(),
                        reason,
                    });
                }
                Err(err) => {
                    error!("Job {job} failed during {stage}: {err}");
                    record.job.status = JobStatus::Failed;
                    record.stage_mut(stage).status = StageStatus::Failed;
                    if let Err(save_err) = self.persist(&mut record).await {
                        warn!("Could not record failure of job {job}: {save_err}");
                    }
                    return Err(err);
                }
            }
        }

        record.job.status = if record.next_stage().is_some() {
            JobStatus::Pending
        } else if record.failures().is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithFailures
        };
        self.persist(&mut record).await?;

        match only {
            Some(stage) => Ok(JobOutcome::StepCompleted { job, stage }),
            None => finished_outcome(&record),
        }
    }

    async fn run_stage(
        &self,
        record: &mut CheckpointRecord,
        stage: StageName,
    ) -> Result<StageFlow, PipelineError> {
        self.probe(stage).await?;

        record.begin_stage(stage);
        let state = record.stage(stage);
        let total = state.units.len();
        let pending = state.unfinished_units().len();
        info!("Stage {stage}: {pending}/{total} units to run");
        self.config
            .progress_callback
            .on_stage_start(stage, pending, total);
        self.persist(record).await?;

        let flow = match stage {
            StageName::Split => self.run_split(record).await?,
            StageName::Extract | StageName::Parse => self.run_chunks(record, stage).await?,
            StageName::Aggregate => self.run_aggregate(record).await?,
            StageName::Write => self.run_write(record).await?,
        };

        if let StageFlow::Completed = flow {
            record.complete_stage(stage);
            let state = record.stage(stage);
            let (completed, failed) = (state.completed_units().len(), state.failed_count());
            info!("Stage {stage} completed: {completed} ok, {failed} failed");
            self.config
                .progress_callback
                .on_stage_complete(stage, completed, failed);
            self.persist(record).await?;
        }
        Ok(flow)
    }

    async fn probe(&self, stage: StageName) -> Result<(), PipelineError> {
        let result = match stage {
            StageName::Split => self.adapters.splitter.probe().await,
            StageName::Extract => self.adapters.extractor.probe().await,
            StageName::Parse => self.adapters.parser.probe().await,
            StageName::Aggregate => Ok(()),
            StageName::Write => self.adapters.writer.probe().await,
        };
        result.map_err(|e| PipelineError::AdapterUnavailable {
            stage,
            detail: e.to_string(),
        })
    }

    // ── Stages ────────────────────────────────────────────────────────────

    async fn run_split(&self, record: &mut CheckpointRecord) -> Result<StageFlow, PipelineError> {
        if unit_already_saved(record, StageName::Split, !record.chunks.is_empty()) {
            return Ok(StageFlow::Completed);
        }
        let input = record.job.input.clone();
        let max_pages = self.config.max_pages_per_chunk;
        let splitter = &self.adapters.splitter;

        self.config
            .progress_callback
            .on_unit_start(StageName::Split, 0);
        let outcome = self
            .retry
            .invoke("split", |_| splitter.split(&input, max_pages), ToolError::class)
            .await;

        match outcome {
            RetryOutcome::Success { value: chunks, .. } => {
                validate_chunks(&chunks, max_pages)?;
                info!("Split {} into {} chunks", input.display(), chunks.len());
                record.chunks = chunks;
                record.set_unit(StageName::Split, 0, UnitState::Completed);
                self.persist(record).await?;
                self.config
                    .progress_callback
                    .on_unit_complete(StageName::Split, 0, 0);
                Ok(StageFlow::Completed)
            }
            RetryOutcome::Exhausted { reason, .. } => Ok(StageFlow::Paused { reason }),
            RetryOutcome::PermanentFailure { reason, attempts } => {
                record.set_unit(
                    StageName::Split,
                    0,
                    UnitState::Failed {
                        reason: reason.clone(),
                        attempts,
                    },
                );
                Err(PipelineError::StageFailed {
                    stage: StageName::Split,
                    detail: reason,
                })
            }
            RetryOutcome::Aborted { reason, .. } => Err(PipelineError::AdapterUnavailable {
                stage: StageName::Split,
                detail: reason,
            }),
        }
    }

    async fn run_chunks(
        &self,
        record: &mut CheckpointRecord,
        stage: StageName,
    ) -> Result<StageFlow, PipelineError> {
        let pending = record.stage(stage).unfinished_units();
        if pending.is_empty() {
            return Ok(StageFlow::Completed);
        }

        let mut work: Vec<(Chunk, Option<PathBuf>)> = Vec::with_capacity(pending.len());
        for idx in &pending {
            let chunk = record.chunks.get(*idx).cloned().ok_or_else(|| {
                PipelineError::Internal(format!("{stage} unit {idx} has no chunk"))
            })?;
            work.push((chunk, record.extracted.get(idx).cloned()));
        }

        let work_dir = self.config.job_work_dir(&record.job.id);
        let halt = AtomicBool::new(false);
        let (halt, work_dir) = (&halt, work_dir.as_path());

        let mut units = stream::iter(work.into_iter().map(move |(chunk, artifact)| async move {
            if halt.load(Ordering::SeqCst) {
                return (chunk.index, UnitResult::Skipped);
            }
            self.config
                .progress_callback
                .on_unit_start(stage, chunk.index);
            let result = match stage {
                StageName::Extract => self.extract_unit(&chunk, work_dir).await,
                _ => self.parse_unit(&chunk, artifact).await,
            };
            if result.halts() {
                halt.store(true, Ordering::SeqCst);
            }
            (chunk.index, result)
        }))
        .buffer_unordered(self.config.concurrency);

        let mut pause: Option<String> = None;
        let mut fatal: Option<PipelineError> = None;

        while let Some((idx, result)) = units.next().await {
            match result {
                UnitResult::Skipped => debug!("{stage} chunk {idx} skipped"),
                UnitResult::Extracted { path } => {
                    record.extracted.insert(idx, path);
                    record.set_unit(stage, idx, UnitState::Completed);
                    self.persist(record).await?;
                    self.config.progress_callback.on_unit_complete(stage, idx, 0);
                }
                UnitResult::Parsed { results } => {
                    let count = results.iter().map(|r| r.records.len()).sum();
                    debug!("Chunk {idx}: {count} records in {} reports", results.len());
                    record.results.insert(idx, results);
                    record.set_unit(stage, idx, UnitState::Completed);
                    self.persist(record).await?;
                    self.config
                        .progress_callback
                        .on_unit_complete(stage, idx, count);
                }
                UnitResult::Failed {
                    reason,
                    attempts,
                    hint,
                } => {
                    warn!("{stage} chunk {idx} failed after {attempts} attempts: {reason}");
                    if stage == StageName::Parse {
                        record
                            .results
                            .insert(idx, vec![ParseResult::failed(idx, hint, reason.clone())]);
                    }
                    record.set_unit(
                        stage,
                        idx,
                        UnitState::Failed {
                            reason: reason.clone(),
                            attempts,
                        },
                    );
                    self.persist(record).await?;
                    self.config
                        .progress_callback
                        .on_unit_error(stage, idx, &reason);
                }
                UnitResult::Exhausted { reason } => {
                    info!("{stage} chunk {idx} hit a resource limit: {reason}");
                    pause.get_or_insert(reason);
                }
                UnitResult::Aborted { reason } => {
                    fatal.get_or_insert(PipelineError::AdapterUnavailable {
                        stage,
                        detail: reason,
                    });
                }
                UnitResult::Fatal(err) => {
                    fatal.get_or_insert(err);
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        Ok(match pause {
            Some(reason) => StageFlow::Paused { reason },
            None => StageFlow::Completed,
        })
    }

    async fn extract_unit(&self, chunk: &Chunk, work_dir: &Path) -> UnitResult {
        let extractor = &self.adapters.extractor;
        let label = format!("extract chunk {}", chunk.index);
        match self
            .retry
            .invoke(&label, |_| extractor.extract(chunk), ToolError::class)
            .await
        {
            RetryOutcome::Success { mut value, .. } => {
                value.chunk = chunk.index;
                let path = work_dir
                    .join("extract")
                    .join(format!("chunk-{:04}.json", chunk.index));
                match write_artifact(&path, &value).await {
                    Ok(()) => UnitResult::Extracted { path },
                    Err(e) => UnitResult::Fatal(e),
                }
            }
            other => unit_failure(other, ReportType::Unknown),
        }
    }

    async fn parse_unit(&self, chunk: &Chunk, artifact: Option<PathBuf>) -> UnitResult {
        let content = match read_artifact(chunk.index, artifact).await {
            Ok(content) => content,
            Err(e) => return UnitResult::Fatal(e),
        };
        let hint = content.hint;
        let parser = &self.adapters.parser;
        let label = format!("parse chunk {}", chunk.index);
        match self
            .retry
            .invoke(
                &label,
                |_| parser.parse_chunk(chunk, &content, hint),
                ToolError::class,
            )
            .await
        {
            RetryOutcome::Success { mut value, .. } => {
                for result in &mut value {
                    result.chunk = chunk.index;
                }
                UnitResult::Parsed { results: value }
            }
            other => unit_failure(other, hint),
        }
    }

    async fn run_aggregate(&self, record: &mut CheckpointRecord) -> Result<StageFlow, PipelineError> {
        if unit_already_saved(record, StageName::Aggregate, record.aggregate.is_some()) {
            return Ok(StageFlow::Completed);
        }
        self.config
            .progress_callback
            .on_unit_start(StageName::Aggregate, 0);
        let tables = aggregate(record.results.values().flatten(), record.failures());
        let count = tables.record_count();
        info!(
            "Aggregated {count} records into {} tables ({} duplicates dropped)",
            tables.tables.len(),
            tables.duplicates_dropped
        );
        record.aggregate = Some(tables);
        record.set_unit(StageName::Aggregate, 0, UnitState::Completed);
        self.persist(record).await?;
        self.config
            .progress_callback
            .on_unit_complete(StageName::Aggregate, 0, count);
        Ok(StageFlow::Completed)
    }

    async fn run_write(&self, record: &mut CheckpointRecord) -> Result<StageFlow, PipelineError> {
        if unit_already_saved(record, StageName::Write, record.output.is_some()) {
            return Ok(StageFlow::Completed);
        }
        let tables = record
            .aggregate
            .clone()
            .ok_or_else(|| PipelineError::Internal("write stage reached without aggregated tables".into()))?;
        let destination = self.config.output_path(&record.job.id);
        let writer = &self.adapters.writer;

        self.config
            .progress_callback
            .on_unit_start(StageName::Write, 0);
        let outcome = self
            .retry
            .invoke(
                "write",
                |_| writer.write_output(&tables, &destination),
                ToolError::class,
            )
            .await;

        match outcome {
            RetryOutcome::Success { value: path, .. } => {
                info!("Output written to {}", path.display());
                record.output = Some(path);
                record.set_unit(StageName::Write, 0, UnitState::Completed);
                self.persist(record).await?;
                self.config
                    .progress_callback
                    .on_unit_complete(StageName::Write, 0, tables.record_count());
                Ok(StageFlow::Completed)
            }
            RetryOutcome::Exhausted { reason, .. } => Ok(StageFlow::Paused { reason }),
            RetryOutcome::PermanentFailure { reason, attempts } => {
                record.set_unit(
                    StageName::Write,
                    0,
                    UnitState::Failed {
                        reason: reason.clone(),
                        attempts,
                    },
                );
                Err(PipelineError::StageFailed {
                    stage: StageName::Write,
                    detail: reason,
                })
            }
            RetryOutcome::Aborted { reason, .. } => Err(PipelineError::AdapterUnavailable {
                stage: StageName::Write,
                detail: reason,
            }),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn unit_failure<T>(outcome: RetryOutcome<T>, hint: ReportType) -> UnitResult {
    match outcome {
        RetryOutcome::Success { .. } => UnitResult::Skipped,
        RetryOutcome::Exhausted { reason, .. } => UnitResult::Exhausted { reason },
        RetryOutcome::PermanentFailure { reason, attempts } => UnitResult::Failed {
            reason,
            attempts,
            hint,
        },
        RetryOutcome::Aborted { reason, .. } => UnitResult::Aborted { reason },
    }
}

/// The single unit of a job-level stage finished and its result was saved
/// before the stage itself was marked Completed.
fn unit_already_saved(record: &CheckpointRecord, stage: StageName, has_result: bool) -> bool {
    let saved = has_result && record.stage(stage).units.get(&0) == Some(&UnitState::Completed);
    if saved {
        info!("Stage {stage} of job {} already produced its result", record.job.id);
    }
    saved
}

/// Accept a checkpoint for `spec` only if the input bytes are unchanged.
/// A moved file with identical content is followed to its new path.
fn reconcile_input(mut record: CheckpointRecord, spec: &JobSpec) -> Result<CheckpointRecord, PipelineError> {
    if record.job.fingerprint != spec.fingerprint {
        return Err(PipelineError::InputChanged {
            job: record.job.id.clone(),
            expected: record.job.fingerprint.clone(),
            found: spec.fingerprint.clone(),
        });
    }
    if record.job.input != spec.path {
        info!(
            "Input of job {} moved from {} to {}",
            record.job.id,
            record.job.input.display(),
            spec.path.display()
        );
        let old = std::mem::replace(&mut record.job.input, spec.path.clone());
        for chunk in record.chunks.iter_mut().filter(|c| c.source == old) {
            chunk.source = spec.path.clone();
        }
    }
    Ok(record)
}

fn finished_outcome(record: &CheckpointRecord) -> Result<JobOutcome, PipelineError> {
    let job = record.job.id.clone();
    let output = record
        .output
        .clone()
        .ok_or_else(|| PipelineError::Internal(format!("job {job} finished without an output path")))?;
    let failures = record.failures();
    Ok(if failures.is_empty() {
        JobOutcome::Completed { job, output }
    } else {
        JobOutcome::CompletedWithFailures {
            job,
            output,
            failures,
        }
    })
}

fn validate_chunks(chunks: &[Chunk], max_pages: usize) -> Result<(), PipelineError> {
    let invalid = |detail: String| PipelineError::StageFailed {
        stage: StageName::Split,
        detail,
    };
    if chunks.is_empty() {
        return Err(invalid("document produced no chunks".into()));
    }
    for (pos, chunk) in chunks.iter().enumerate() {
        if chunk.index != pos {
            return Err(invalid(format!("chunk at position {pos} has index {}", chunk.index)));
        }
        if chunk.pages.is_empty() || chunk.pages.len() > max_pages {
            return Err(invalid(format!(
                "chunk {pos} covers pages {} (limit {max_pages})",
                chunk.pages
            )));
        }
    }
    Ok(())
}

async fn write_artifact(path: &Path, content: &ExtractedChunk) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec(content)
        .map_err(|e| PipelineError::Internal(format!("cannot serialise extract artifact: {e}")))?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

async fn read_artifact(chunk: usize, path: Option<PathBuf>) -> Result<ExtractedChunk, PipelineError> {
    let path = path.ok_or_else(|| PipelineError::ArtifactMissing {
        chunk,
        path: PathBuf::new(),
        detail: "no extract artifact recorded".into(),
    })?;
    let missing = |detail: String| PipelineError::ArtifactMissing {
        chunk,
        path: path.clone(),
        detail,
    };
    let bytes = tokio::fs::read(&path).await.map_err(|e| missing(e.to_string()))?;
    let content: ExtractedChunk =
        serde_json::from_slice(&bytes).map_err(|e| missing(format!("unreadable artifact: {e}")))?;
    if content.chunk != chunk {
        return Err(missing(format!("artifact belongs to chunk {}", content.chunk)));
    }
    Ok(content)
}
