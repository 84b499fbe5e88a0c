//! In-process fakes for driving the stage runner without pdfium or a model.

#![allow(dead_code)]

use async_trait::async_trait;
use ledgerpack::adapters::csv_writer::CsvWorkbookWriter;
use ledgerpack::adapters::markdown::WithSummary;
use ledgerpack::adapters::{
    Adapters, ChunkParser, ExtractedChunk, ExtractedPage, Extractor, OutputWriter, Splitter,
};
use ledgerpack::model::{Chunk, ParseResult, Record};
use ledgerpack::checkpoint::CheckpointStore;
use ledgerpack::model::JobId;
use ledgerpack::{
    CheckpointError, CheckpointRecord, FileCheckpointStore, JobSpec, PipelineConfig, PipelineConfigBuilder, ReportTables,
    ReportType, Sleeper, StageRunner, ToolError,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Fakes ────────────────────────────────────────────────────────────────────

pub struct FakeSplitter {
    pub total_pages: usize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Splitter for FakeSplitter {
    async fn split(&self, input: &Path, max_pages_per_chunk: usize) -> Result<Vec<Chunk>, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Chunk::plan(self.total_pages, max_pages_per_chunk, input))
    }
}

/// Every page reads as a check register page.
#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, chunk: &Chunk) -> Result<ExtractedChunk, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExtractedChunk {
            chunk: chunk.index,
            pages: chunk
                .pages
                .pages()
                .map(|number| ExtractedPage {
                    number,
                    text: format!("Check Register page {number}"),
                    image: None,
                    hint: ReportType::Disbursements,
                })
                .collect(),
            hint: ReportType::Disbursements,
        })
    }
}

/// Parser whose failures are scripted per chunk. A chunk returns its queued
/// errors one call at a time, then succeeds with two check records. Every
/// chunk after the first also repeats the previous chunk's last check, the
/// way a register row straddling a chunk boundary shows up twice.
#[derive(Default)]
pub struct ScriptedParser {
    scripts: Mutex<HashMap<usize, VecDeque<ToolError>>>,
    calls: Mutex<HashMap<usize, u32>>,
    delays: Mutex<HashMap<usize, Duration>>,
    unavailable: AtomicBool,
}

impl ScriptedParser {
    pub fn fail(&self, chunk: usize, errors: impl IntoIterator<Item = ToolError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(chunk)
            .or_default()
            .extend(errors);
    }

    pub fn delay(&self, chunk: usize, delay: Duration) {
        self.delays.lock().unwrap().insert(chunk, delay);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self, chunk: usize) -> u32 {
        self.calls.lock().unwrap().get(&chunk).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn chunks_called(&self) -> HashSet<usize> {
        self.calls.lock().unwrap().keys().copied().collect()
    }
}

pub fn check(number: usize, vendor: &str, amount: f64) -> Record {
    json!({
        "check_number": number.to_string(),
        "vendor": vendor,
        "amount": amount,
    })
    .as_object()
    .cloned()
    .unwrap()
}

fn checks_for(chunk: usize) -> Vec<Record> {
    let mut records = Vec::new();
    if chunk > 0 {
        records.push(check(1000 + chunk * 10 - 9, &format!("Vendor {}", chunk - 1), 10.0));
    }
    records.push(check(1000 + chunk * 10, &format!("Vendor {chunk}"), 25.5));
    records.push(check(1000 + chunk * 10 + 1, &format!("Vendor {chunk}"), 10.0));
    records
}

#[async_trait]
impl ChunkParser for ScriptedParser {
    async fn probe(&self) -> Result<(), ToolError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ToolError::Unavailable("no API key configured".into()));
        }
        Ok(())
    }

    async fn parse_chunk(
        &self,
        chunk: &Chunk,
        content: &ExtractedChunk,
        hint: ReportType,
    ) -> Result<Vec<ParseResult>, ToolError> {
        assert_eq!(content.chunk, chunk.index, "artifact belongs to the chunk");
        *self.calls.lock().unwrap().entry(chunk.index).or_default() += 1;

        let delay = self.delays.lock().unwrap().get(&chunk.index).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&chunk.index)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        Ok(vec![ParseResult::success(chunk.index, hint, checks_for(chunk.index))])
    }
}

/// Real CSV workbook plus Markdown summary, counting calls.
#[derive(Default)]
pub struct CountingWriter {
    pub calls: AtomicUsize,
}

#[async_trait]
impl OutputWriter for CountingWriter {
    async fn write_output(&self, tables: &ReportTables, destination: &Path) -> Result<PathBuf, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        WithSummary::new(CsvWorkbookWriter)
            .write_output(tables, destination)
            .await
    }
}

/// Records requested backoff delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// File store that stops persisting after `allowed` saves, the way a
/// process killed mid-run leaves its last good checkpoint behind.
pub struct CrashingStore {
    inner: FileCheckpointStore,
    allowed: AtomicUsize,
}

impl CrashingStore {
    pub fn new(dir: &Path, allowed: usize) -> Self {
        Self {
            inner: FileCheckpointStore::new(dir),
            allowed: AtomicUsize::new(allowed),
        }
    }
}

#[async_trait]
impl CheckpointStore for CrashingStore {
    async fn load(&self, job: &JobId) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.inner.load(job).await
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let left = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_err() {
            return Err(CheckpointError::Io {
                path: self.inner.dir().to_path_buf(),
                source: std::io::Error::other("process killed"),
            });
        }
        self.inner.save(record).await
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub input: PathBuf,
    pub config: PipelineConfig,
    pub splitter: Arc<FakeSplitter>,
    pub extractor: Arc<FakeExtractor>,
    pub parser: Arc<ScriptedParser>,
    pub writer: Arc<CountingWriter>,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Harness {
    /// A package of `pages` pages, 30 pages per chunk, no call timeout.
    pub fn new(pages: usize, tweak: impl FnOnce(PipelineConfigBuilder) -> PipelineConfigBuilder) -> Self {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("Nov 2025 package.pdf");
        std::fs::write(&input, format!("%PDF-1.7\n% fake package with {pages} pages\n")).unwrap();

        let builder = PipelineConfig::builder()
            .max_pages_per_chunk(30)
            .concurrency(1)
            .call_timeout(None)
            .checkpoint_dir(dir.path().join("checkpoints"))
            .output_dir(dir.path().join("output"));
        let config = tweak(builder).build().unwrap();

        Self {
            dir,
            input,
            config,
            splitter: Arc::new(FakeSplitter {
                total_pages: pages,
                calls: AtomicUsize::new(0),
            }),
            extractor: Arc::default(),
            parser: Arc::default(),
            writer: Arc::default(),
            sleeper: Arc::default(),
        }
    }

    pub fn adapters(&self) -> Adapters {
        Adapters {
            splitter: self.splitter.clone(),
            extractor: self.extractor.clone(),
            parser: self.parser.clone(),
            writer: self.writer.clone(),
        }
    }

    /// A fresh store, as a new process would open it.
    pub fn store(&self) -> Arc<FileCheckpointStore> {
        Arc::new(FileCheckpointStore::new(&self.config.checkpoint_dir))
    }

    pub fn runner(&self) -> StageRunner {
        self.runner_with(self.config.clone())
    }

    pub fn runner_with(&self, config: PipelineConfig) -> StageRunner {
        StageRunner::with_sleeper(config, self.store(), self.adapters(), self.sleeper.clone())
    }

    /// A runner whose store dies after `allowed` saves.
    pub fn crashing_runner(&self, allowed: usize) -> StageRunner {
        StageRunner::with_sleeper(
            self.config.clone(),
            Arc::new(CrashingStore::new(&self.config.checkpoint_dir, allowed)),
            self.adapters(),
            self.sleeper.clone(),
        )
    }

    pub fn splits(&self) -> usize {
        self.splitter.calls.load(Ordering::SeqCst)
    }

    pub fn extracts(&self) -> usize {
        self.extractor.calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writer.calls.load(Ordering::SeqCst)
    }

    pub async fn spec(&self) -> JobSpec {
        JobSpec::from_file(&self.input.to_string_lossy(), &self.input)
            .await
            .unwrap()
    }

    pub fn checkpoint_path(&self, spec: &JobSpec) -> PathBuf {
        self.config.checkpoint_dir.join(format!("{}.json", spec.id))
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeper.delays.lock().unwrap().clone()
    }
}

pub fn quota_exhausted() -> ToolError {
    ToolError::ResourceExhausted("insufficient_quota: credit balance is too low".into())
}
