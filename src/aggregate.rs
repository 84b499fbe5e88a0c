//! Merge per-chunk parse results into one table per report type.
//!
//! The merge is a pure function of its input set:
//!
//! - records are ordered by chunk index, then by their order within the
//!   chunk, however the chunks were scheduled;
//! - a record whose identity key (see [`ReportType::identity`]) was already
//!   seen for the same report type is dropped, so the first occurrence wins;
//! - failed results contribute no records; they are listed separately.

use crate::model::{ChunkFailure, ParseResult, Record};
use crate::report::ReportType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Merged output of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportTables {
    /// Report type → records, in deterministic order.
    pub tables: BTreeMap<ReportType, Vec<Record>>,
    /// Units that produced no data.
    #[serde(default)]
    pub failures: Vec<ChunkFailure>,
    /// Records dropped as duplicates of an earlier chunk's record.
    #[serde(default)]
    pub duplicates_dropped: usize,
}

impl ReportTables {
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Combine `results` into per-type tables.
pub fn aggregate<'a>(
    results: impl IntoIterator<Item = &'a ParseResult>,
    failures: Vec<ChunkFailure>,
) -> ReportTables {
    let mut ordered: Vec<&ParseResult> = results.into_iter().collect();
    // Stable: results from the same chunk keep the parser's order.
    ordered.sort_by_key(|r| r.chunk);

    let mut tables: BTreeMap<ReportType, Vec<Record>> = BTreeMap::new();
    let mut seen: HashSet<(ReportType, String)> = HashSet::new();
    let mut duplicates_dropped = 0;

    for result in ordered.into_iter().filter(|r| r.is_success()) {
        let table = tables.entry(result.report_type).or_default();
        for record in &result.records {
            if let Some(key) = result.report_type.identity(record) {
                if !seen.insert((result.report_type, key)) {
                    duplicates_dropped += 1;
                    continue;
                }
            }
            table.push(record.clone());
        }
    }
    tables.retain(|_, records| !records.is_empty());

    debug!(
        "Aggregated {} records into {} tables ({} duplicates dropped)",
        tables.values().map(Vec::len).sum::<usize>(),
        tables.len(),
        duplicates_dropped
    );

    ReportTables {
        tables,
        failures,
        duplicates_dropped,
    }
}
