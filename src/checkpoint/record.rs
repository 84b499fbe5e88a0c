//! The persisted state of one job.
//!
//! - A record is the only thing a resumed run trusts; adapter outputs that
//!   are not referenced from it are considered never produced.
//! - `sequence` strictly increases with every save. The store refuses to go
//!   backwards.
//! - Completed units are never reset, except by an explicit
//!   [`CheckpointRecord::reopen_failed`], which only touches Failed units.

use crate::aggregate::ReportTables;
use crate::model::{
    Chunk, ChunkFailure, Job, JobStatus, ParseResult, StageName, StageState, StageStatus,
    UnitState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to resume a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub sequence: u64,
    pub job: Job,
    /// Chunk plan produced by Split. Empty until Split completes.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    /// Chunk index → extract artifact on disk.
    #[serde(default)]
    pub extracted: BTreeMap<usize, PathBuf>,
    /// Chunk index → parse results, in the order the parser returned them.
    #[serde(default)]
    pub results: BTreeMap<usize, Vec<ParseResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<ReportTables>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// A fresh, never-saved record (sequence 0).
    pub fn new(job: Job) -> Self {
        Self {
            sequence: 0,
            job,
            chunks: Vec::new(),
            extracted: BTreeMap::new(),
            results: BTreeMap::new(),
            aggregate: None,
            output: None,
            updated_at: Utc::now(),
        }
    }

    pub fn stage(&self, name: StageName) -> &StageState {
        &self.job.stages[name.index()]
    }

    pub fn stage_mut(&mut self, name: StageName) -> &mut StageState {
        &mut self.job.stages[name.index()]
    }

    /// First stage that has not completed, if any.
    pub fn next_stage(&self) -> Option<StageName> {
        StageName::ALL
            .into_iter()
            .find(|s| self.stage(*s).status != StageStatus::Completed)
    }

    /// Mark `stage` as running and make sure its unit set exists.
    pub fn begin_stage(&mut self, stage: StageName) {
        self.derive_units(stage);
        self.job.current_stage = stage.index();
        let state = self.stage_mut(stage);
        state.status = StageStatus::Running;
        state.completed_at = None;
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
    }

    pub fn complete_stage(&mut self, stage: StageName) {
        let state = self.stage_mut(stage);
        state.status = StageStatus::Completed;
        state.completed_at = Some(Utc::now());
        if let Some(next) = StageName::ALL.get(stage.index() + 1) {
            self.derive_units(*next);
        }
    }

    pub fn set_unit(&mut self, stage: StageName, unit: usize, state: UnitState) {
        self.stage_mut(stage).units.insert(unit, state);
    }

    /// Add Pending units for work the previous stage made available.
    /// Existing unit states are kept as they are.
    fn derive_units(&mut self, stage: StageName) {
        let available: Vec<usize> = match stage {
            StageName::Split | StageName::Aggregate | StageName::Write => vec![0],
            StageName::Extract => self.chunks.iter().map(|c| c.index).collect(),
            StageName::Parse => self.stage(StageName::Extract).completed_units(),
        };
        let units = &mut self.stage_mut(stage).units;
        for idx in available {
            units.entry(idx).or_insert(UnitState::Pending);
        }
    }

    /// Reset Failed units to Pending so the next run retries them.
    ///
    /// Every stage from the earliest reopened one onwards goes back to
    /// Pending; Aggregate and Write are recomputed. Returns the number of
    /// reopened units.
    pub fn reopen_failed(&mut self) -> usize {
        let mut reopened = 0;
        let mut earliest: Option<StageName> = None;
        for stage in [StageName::Extract, StageName::Parse] {
            let failed: Vec<usize> = self
                .stage(stage)
                .units
                .iter()
                .filter(|(_, s)| matches!(s, UnitState::Failed { .. }))
                .map(|(idx, _)| *idx)
                .collect();
            for idx in &failed {
                self.set_unit(stage, *idx, UnitState::Pending);
                if stage == StageName::Parse {
                    self.results.remove(idx);
                }
            }
            if !failed.is_empty() {
                earliest.get_or_insert(stage);
                reopened += failed.len();
            }
        }
        // Completed parse units whose parser reported a per-report failure
        // are left alone: the chunk itself succeeded.

        if let Some(from) = earliest {
            for stage in &StageName::ALL[from.index()..] {
                let state = self.stage_mut(*stage);
                state.status = StageStatus::Pending;
                state.completed_at = None;
                if !stage.is_per_chunk() {
                    state.units.clear();
                }
            }
            self.aggregate = None;
            self.output = None;
            self.job.status = JobStatus::Pending;
            self.job.current_stage = from.index();
        }
        reopened
    }

    /// Every unit that ended without data, ordered by chunk then stage.
    pub fn failures(&self) -> Vec<ChunkFailure> {
        let mut out: Vec<ChunkFailure> = self
            .stage(StageName::Extract)
            .units
            .iter()
            .filter_map(|(idx, state)| match state {
                UnitState::Failed { reason, .. } => Some(ChunkFailure {
                    chunk: *idx,
                    stage: StageName::Extract,
                    report_type: None,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect();
        for (idx, results) in &self.results {
            for result in results.iter().filter(|r| !r.is_success()) {
                out.push(ChunkFailure {
                    chunk: *idx,
                    stage: StageName::Parse,
                    report_type: Some(result.report_type),
                    reason: result.error.clone().unwrap_or_default(),
                });
            }
        }
        out.sort_by_key(|f| (f.chunk, f.stage));
        out
    }

    /// Structural checks run on every load. Returns a description of the
    /// first inconsistency found.
    pub fn validate(&self) -> Result<(), String> {
        if self.job.stages.len() != StageName::ALL.len() {
            return Err(format!(
                "expected {} stages, found {}",
                StageName::ALL.len(),
                self.job.stages.len()
            ));
        }
        for (state, expected) in self.job.stages.iter().zip(StageName::ALL) {
            if state.name != expected {
                return Err(format!(
                    "stage {} found where {} was expected",
                    state.name, expected
                ));
            }
        }
        if self.job.current_stage >= StageName::ALL.len() {
            return Err(format!("current stage {} out of range", self.job.current_stage));
        }
        for (pos, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != pos {
                return Err(format!("chunk at position {pos} has index {}", chunk.index));
            }
        }
        let chunk_count = self.chunks.len();
        for stage in [StageName::Extract, StageName::Parse] {
            if let Some(idx) = self.stage(stage).units.keys().find(|i| **i >= chunk_count) {
                return Err(format!("{stage} unit {idx} refers to a missing chunk"));
            }
        }
        for idx in self.stage(StageName::Extract).completed_units() {
            if !self.extracted.contains_key(&idx) {
                return Err(format!("chunk {idx} extracted without an artifact"));
            }
        }
        for idx in self.stage(StageName::Parse).completed_units() {
            if !self.results.contains_key(&idx) {
                return Err(format!("chunk {idx} parsed without results"));
            }
        }
        for (idx, results) in &self.results {
            if results.iter().any(|r| r.chunk != *idx) {
                return Err(format!("results stored under chunk {idx} belong to another chunk"));
            }
        }
        if self.job.status.is_finished() && self.next_stage().is_some() {
            return Err(format!(
                "job marked {} but {} has not completed",
                self.job.status,
                self.next_stage().map(|s| s.as_str()).unwrap_or_default()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobId, ParseResult};
    use crate::report::ReportType;
    use std::path::Path;

    fn record_with_chunks(n: usize) -> CheckpointRecord {
        let id = JobId::parse("pkg-0001").unwrap();
        let job = Job::new(id, "pkg.pdf".into(), "pkg.pdf".into(), "00".repeat(32));
        let mut record = CheckpointRecord::new(job);
        record.chunks = Chunk::plan(n * 30, 30, Path::new("pkg.pdf"));
        record.set_unit(StageName::Split, 0, UnitState::Completed);
        record.complete_stage(StageName::Split);
        record
    }

    #[test]
    fn completing_split_derives_extract_units() {
        let record = record_with_chunks(3);
        assert_eq!(record.stage(StageName::Extract).unfinished_units(), vec![0, 1, 2]);
        assert_eq!(record.next_stage(), Some(StageName::Extract));
    }

    #[test]
    fn parse_units_follow_completed_extracts() {
        let mut record = record_with_chunks(3);
        record.begin_stage(StageName::Extract);
        for idx in [0, 2] {
            record.set_unit(StageName::Extract, idx, UnitState::Completed);
            record.extracted.insert(idx, format!("chunk-{idx}.json").into());
        }
        record.set_unit(
            StageName::Extract,
            1,
            UnitState::Failed {
                reason: "unreadable".into(),
                attempts: 1,
            },
        );
        record.complete_stage(StageName::Extract);
        assert_eq!(record.stage(StageName::Parse).unfinished_units(), vec![0, 2]);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn reopen_failed_resets_only_failed_units() {
        let mut record = record_with_chunks(2);
        record.begin_stage(StageName::Extract);
        for idx in 0..2 {
            record.set_unit(StageName::Extract, idx, UnitState::Completed);
            record.extracted.insert(idx, format!("chunk-{idx}.json").into());
        }
        record.complete_stage(StageName::Extract);
        record.begin_stage(StageName::Parse);
        record.set_unit(StageName::Parse, 0, UnitState::Completed);
        record
            .results
            .insert(0, vec![ParseResult::success(0, ReportType::Invoice, vec![])]);
        record.set_unit(
            StageName::Parse,
            1,
            UnitState::Failed {
                reason: "bad json".into(),
                attempts: 1,
            },
        );
        record
            .results
            .insert(1, vec![ParseResult::failed(1, ReportType::Invoice, "bad json")]);
        assert_eq!(record.failures().len(), 1);

        assert_eq!(record.reopen_failed(), 1);
        assert_eq!(record.stage(StageName::Parse).unfinished_units(), vec![1]);
        assert_eq!(record.stage(StageName::Parse).completed_units(), vec![0]);
        assert_eq!(record.stage(StageName::Extract).status, StageStatus::Completed);
        assert_eq!(record.next_stage(), Some(StageName::Parse));
        assert!(record.failures().is_empty());
    }

    #[test]
    fn validate_flags_dangling_units() {
        let mut record = record_with_chunks(1);
        record.set_unit(StageName::Extract, 7, UnitState::Pending);
        let err = record.validate().unwrap_err();
        assert!(err.contains("missing chunk"), "got: {err}");
    }

    #[test]
    fn validate_flags_completed_parse_without_results() {
        let mut record = record_with_chunks(1);
        record.set_unit(StageName::Extract, 0, UnitState::Completed);
        record.extracted.insert(0, "chunk-0.json".into());
        record.set_unit(StageName::Parse, 0, UnitState::Completed);
        assert!(record.validate().is_err());
    }
}
