//! Sectioned CSV workbook writer.
//!
//! One file holds every table, separated into sections:
//!
//! ```text
//! # Summary
//! report_type,sheet,records
//! balance_sheet,Balance Sheet,42
//! …
//!
//! # Balance Sheet
//! account_code,account_name,…
//! 1010,Operating Cash,…
//!
//! # Failures
//! chunk,stage,report_type,reason
//! ```
//!
//! The output depends only on the [`ReportTables`] it is given (no
//! timestamps), so an interrupted and resumed job writes the same bytes as
//! an uninterrupted one.

use super::OutputWriter;
use crate::aggregate::ReportTables;
use crate::checkpoint::write_atomic;
use crate::error::ToolError;
use crate::model::Record;
use crate::report::{cell_text, ReportType};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct CsvWorkbookWriter;

#[async_trait]
impl OutputWriter for CsvWorkbookWriter {
    async fn write_output(&self, tables: &ReportTables, destination: &Path) -> Result<PathBuf, ToolError> {
        let bytes = render_workbook(tables)?;
        write_atomic(destination, &bytes)
            .await
            .map_err(|e| ToolError::Permanent(format!("cannot write workbook: {e}")))?;
        info!(
            "Wrote {} records in {} sections to {}",
            tables.record_count(),
            tables.tables.len(),
            destination.display()
        );
        Ok(destination.to_path_buf())
    }
}

/// Column order for a table: the report's preferred columns that occur in
/// any record, then the remaining keys in lexical order.
pub fn table_columns(report_type: ReportType, records: &[Record]) -> Vec<String> {
    let present: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect();
    let preferred = report_type.columns();
    let mut columns: Vec<String> = preferred
        .iter()
        .filter(|c| present.contains(*c))
        .map(|c| c.to_string())
        .collect();
    columns.extend(
        present
            .into_iter()
            .filter(|c| !preferred.contains(c))
            .map(str::to_string),
    );
    columns
}

/// Render the whole workbook to bytes.
pub fn render_workbook(tables: &ReportTables) -> Result<Vec<u8>, ToolError> {
    let mut wtr = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    let csv_err = |e: csv::Error| ToolError::Permanent(format!("cannot encode CSV: {e}"));

    wtr.write_record(["# Summary"]).map_err(csv_err)?;
    wtr.write_record(["report_type", "sheet", "records"]).map_err(csv_err)?;
    for (rt, records) in &tables.tables {
        let count = records.len().to_string();
        wtr.write_record([rt.label(), rt.sheet_name(), count.as_str()])
            .map_err(csv_err)?;
    }
    let failed = tables.failures.len().to_string();
    let duplicates = tables.duplicates_dropped.to_string();
    wtr.write_record(["failed_units", "", failed.as_str()]).map_err(csv_err)?;
    wtr.write_record(["duplicates_dropped", "", duplicates.as_str()])
        .map_err(csv_err)?;

    for (rt, records) in &tables.tables {
        wtr.write_record([""]).map_err(csv_err)?;
        let title = format!("# {}", rt.sheet_name());
        wtr.write_record([title.as_str()]).map_err(csv_err)?;
        let columns = table_columns(*rt, records);
        wtr.write_record(&columns).map_err(csv_err)?;
        for record in records {
            let row: Vec<String> = columns
                .iter()
                .map(|c| record.get(c).map(cell_text).unwrap_or_default())
                .collect();
            wtr.write_record(&row).map_err(csv_err)?;
        }
    }

    if !tables.failures.is_empty() {
        wtr.write_record([""]).map_err(csv_err)?;
        wtr.write_record(["# Failures"]).map_err(csv_err)?;
        wtr.write_record(["chunk", "stage", "report_type", "reason"])
            .map_err(csv_err)?;
        for f in &tables.failures {
            let chunk = f.chunk.to_string();
            let report_type = f.report_type.map(|r| r.label()).unwrap_or_default();
            wtr.write_record([chunk.as_str(), f.stage.as_str(), report_type, f.reason.as_str()])
                .map_err(csv_err)?;
        }
    }

    wtr.into_inner()
        .map_err(|e| ToolError::Permanent(format!("cannot flush CSV: {e}")))
}
