//! Core data model: jobs, stages, chunks and parse results.
//!
//! Everything here is plain data that round-trips through the checkpoint
//! file. Behaviour that mutates a job lives in [`crate::checkpoint`] and
//! [`crate::runner`]; this module only defines shapes and small invariants
//! (stage order, chunk planning, job identity).

use crate::error::PipelineError;
use crate::report::ReportType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One extracted record. Opaque to the pipeline apart from the identity
/// fields each [`ReportType`] declares for de-duplication.
pub type Record = serde_json::Map<String, serde_json::Value>;

// ── Job identity ─────────────────────────────────────────────────────────

/// Stable job identifier: `<file-stem>-<16 hex chars of the content SHA-256>`.
///
/// The content fingerprint makes the id independent of where the file
/// lives, so moving or re-downloading the same package resumes the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

const STEM_MAX: usize = 48;

impl JobId {
    /// Derive the id from the input's file name and its hex fingerprint.
    pub fn derive(input: &Path, fingerprint: &str) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut clean: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(STEM_MAX)
            .collect();
        if clean.is_empty() {
            clean.push_str("job");
        }
        let short = &fingerprint[..fingerprint.len().min(16)];
        Self(format!("{clean}-{short}"))
    }

    /// Validate a user-supplied id. Ids become file names, so only
    /// `[A-Za-z0-9_-]` is accepted.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(PipelineError::InvalidJobId { id: raw.to_string() })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Status enums ─────────────────────────────────────────────────────────

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// Stopped on resource exhaustion; `run` continues where it left off.
    Paused,
    Completed,
    CompletedWithFailures,
    Failed,
}

impl JobStatus {
    /// Completed jobs do no further work unless failed units are reopened.
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::CompletedWithFailures)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithFailures => "completed-with-failures",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Split,
    Extract,
    Parse,
    Aggregate,
    Write,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Split,
        StageName::Extract,
        StageName::Parse,
        StageName::Aggregate,
        StageName::Write,
    ];

    /// Position in [`StageName::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stages whose units are chunks (as opposed to a single job-level unit).
    pub fn is_per_chunk(self) -> bool {
        matches!(self, StageName::Extract | StageName::Parse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Split => "split",
            StageName::Extract => "extract",
            StageName::Parse => "parse",
            StageName::Aggregate => "aggregate",
            StageName::Write => "write",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown stage '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Status of one unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Completed,
    Failed { reason: String, attempts: u32 },
}

impl UnitState {
    pub fn is_completed(&self) -> bool {
        matches!(self, UnitState::Completed)
    }
}

/// Snapshot of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub name: StageName,
    pub status: StageStatus,
    /// Unit index → state. Chunk stages key by chunk index; job-level stages
    /// use the single key `0`.
    #[serde(default)]
    pub units: BTreeMap<usize, UnitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageState {
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            units: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Unit indices that still need work, ascending.
    pub fn unfinished_units(&self) -> Vec<usize> {
        self.units
            .iter()
            .filter(|(_, state)| !state.is_completed())
            .map(|(idx, _)| *idx)
            .collect()
    }

    pub fn completed_units(&self) -> Vec<usize> {
        self.units
            .iter()
            .filter(|(_, state)| state.is_completed())
            .map(|(idx, _)| *idx)
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.units
            .values()
            .filter(|s| matches!(s, UnitState::Failed { .. }))
            .count()
    }
}

// ── Job ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// The input as the user supplied it (local path or URL).
    pub source: String,
    /// Local file the pipeline reads.
    pub input: PathBuf,
    /// Hex SHA-256 of the input bytes.
    pub fingerprint: String,
    pub status: JobStatus,
    /// Stages in [`StageName::ALL`] order.
    pub stages: Vec<StageState>,
    /// Index of the stage currently (or last) being worked on.
    pub current_stage: usize,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, source: String, input: PathBuf, fingerprint: String) -> Self {
        Self {
            id,
            source,
            input,
            fingerprint,
            status: JobStatus::Pending,
            stages: StageName::ALL.into_iter().map(StageState::new).collect(),
            current_stage: 0,
            created_at: Utc::now(),
        }
    }
}

// ── Chunks ───────────────────────────────────────────────────────────────

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn pages(&self) -> impl Iterator<Item = usize> {
        self.start..=self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A contiguous slice of the input document; the unit of resumable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub pages: PageRange,
    /// Artifact the chunk's pages are read from.
    pub source: PathBuf,
}

impl Chunk {
    /// Deterministic chunk plan: consecutive runs of at most
    /// `max_pages_per_chunk` pages, indexed from 0.
    pub fn plan(total_pages: usize, max_pages_per_chunk: usize, source: &Path) -> Vec<Chunk> {
        let size = max_pages_per_chunk.max(1);
        (0..total_pages.div_ceil(size))
            .map(|index| Chunk {
                index,
                pages: PageRange {
                    start: index * size + 1,
                    end: ((index + 1) * size).min(total_pages),
                },
                source: source.to_path_buf(),
            })
            .collect()
    }
}

// ── Parse results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Success,
    PermanentFailure,
}

/// Records of one report type extracted from one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub chunk: usize,
    pub report_type: ReportType,
    #[serde(default)]
    pub records: Vec<Record>,
    pub status: ParseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ParseResult {
    pub fn success(chunk: usize, report_type: ReportType, records: Vec<Record>) -> Self {
        Self {
            chunk,
            report_type,
            records,
            status: ParseStatus::Success,
            error: None,
        }
    }

    pub fn failed(chunk: usize, report_type: ReportType, reason: impl Into<String>) -> Self {
        Self {
            chunk,
            report_type,
            records: Vec::new(),
            status: ParseStatus::PermanentFailure,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ParseStatus::Success
    }
}

/// A unit that did not produce data, surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk: usize,
    pub stage: StageName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_type: Option<ReportType>,
    pub reason: String,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {} ({})", self.chunk, self.stage)?;
        if let Some(rt) = self.report_type {
            write!(f, " [{}]", rt.label())?;
        }
        write!(f, ": {}", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ninety_pages_in_thirty_page_chunks() {
        let chunks = Chunk::plan(90, 30, Path::new("pkg.pdf"));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks[1].pages, PageRange { start: 31, end: 60 });
        assert_eq!(chunks[2].pages.len(), 30);
    }

    #[test]
    fn last_chunk_is_short() {
        let chunks = Chunk::plan(91, 30, Path::new("pkg.pdf"));
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].pages, PageRange { start: 91, end: 91 });
        assert_eq!(chunks[3].pages.to_string(), "91");
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(Chunk::plan(0, 30, Path::new("pkg.pdf")).is_empty());
    }

    #[test]
    fn job_id_is_file_name_safe() {
        let id = JobId::derive(Path::new("/tmp/Nov 2025 (final).pdf"), "0123456789abcdef0123");
        assert_eq!(id.as_str(), "Nov_2025__final_-0123456789abcdef");
        assert!(JobId::parse(id.as_str()).is_ok());
        assert!(JobId::parse("../etc/passwd").is_err());
        assert!(JobId::parse("").is_err());
    }

    #[test]
    fn stage_order_and_parsing() {
        assert_eq!(StageName::ALL[StageName::Write.index()], StageName::Write);
        assert!(StageName::Parse.is_per_chunk() && !StageName::Write.is_per_chunk());
        assert_eq!("PARSE".parse::<StageName>().unwrap(), StageName::Parse);
        assert!("ocr".parse::<StageName>().is_err());
    }

    #[test]
    fn unit_state_serialises_with_tag() {
        let failed = UnitState::Failed {
            reason: "bad table".into(),
            attempts: 1,
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains(r#""status":"failed""#), "got: {json}");
    }
}
