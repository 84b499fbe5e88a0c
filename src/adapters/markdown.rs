//! Markdown summary of a package, written next to the CSV workbook.
//!
//! The summary is meant to be read by a person or pasted into a model's
//! context, so it stays short: a handful of tables, each capped, and the
//! whole document capped at [`MAX_LINES`] lines.
//!
//! ```text
//! # Financial Package Summary
//! ## 1. Executive Summary          balance sheet totals, AR, checks
//! ## 2. Alerts & Variances         budget lines off by >20% and >$500, or >$2,000
//! ## 3. Accounts Receivable        owners 120+ days late or owing >$200
//! ## 4. Bank Reconciliation
//! ## 5. Cash Position              operating vs reserve
//! ## 6. Month-over-Month Changes   latest two months of the expense trend
//! ## 7. Notable Transactions       checks over $2,000
//! ## 8. Processing Notes           failed chunks, dropped duplicates
//! ```
//!
//! Like the workbook, the text depends only on the [`ReportTables`].

use super::OutputWriter;
use crate::aggregate::ReportTables;
use crate::checkpoint::write_atomic;
use crate::error::ToolError;
use crate::model::Record;
use crate::report::{cell_text, ReportType};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MAX_LINES: usize = 400;

const VARIANCE_PCT: f64 = 20.0;
const VARIANCE_FLOOR: f64 = 500.0;
const VARIANCE_ALWAYS: f64 = 2000.0;
const NOTABLE_AMOUNT: f64 = 2000.0;
const DELINQUENT_TOTAL: f64 = 200.0;

const MONTHS: [(&str, &str); 12] = [
    ("jan", "January"),
    ("feb", "February"),
    ("mar", "March"),
    ("apr", "April"),
    ("may", "May"),
    ("jun", "June"),
    ("jul", "July"),
    ("aug", "August"),
    ("sep", "September"),
    ("oct", "October"),
    ("nov", "November"),
    ("dec", "December"),
];

/// Writes only the Markdown summary to the destination it is given.
pub struct MarkdownSummaryWriter;

#[async_trait]
impl OutputWriter for MarkdownSummaryWriter {
    async fn write_output(&self, tables: &ReportTables, destination: &Path) -> Result<PathBuf, ToolError> {
        let text = render_summary(tables);
        write_atomic(destination, text.as_bytes())
            .await
            .map_err(|e| ToolError::Permanent(format!("cannot write summary: {e}")))?;
        info!("Wrote summary to {}", destination.display());
        Ok(destination.to_path_buf())
    }
}

/// Writes the workbook with the wrapped writer, then the Markdown summary
/// beside it (see [`summary_path`]). The returned path is the workbook's.
pub struct WithSummary<W> {
    workbook: W,
}

impl<W> WithSummary<W> {
    pub fn new(workbook: W) -> Self {
        Self { workbook }
    }
}

#[async_trait]
impl<W: OutputWriter> OutputWriter for WithSummary<W> {
    async fn probe(&self) -> Result<(), ToolError> {
        self.workbook.probe().await
    }

    async fn write_output(&self, tables: &ReportTables, destination: &Path) -> Result<PathBuf, ToolError> {
        let written = self.workbook.write_output(tables, destination).await?;
        MarkdownSummaryWriter
            .write_output(tables, &summary_path(&written))
            .await?;
        Ok(written)
    }
}

/// `<dir>/<stem>.csv` → `<dir>/<stem>_SUMMARY.md`.
pub fn summary_path(workbook: &Path) -> PathBuf {
    let stem = workbook
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    workbook.with_file_name(format!("{stem}_SUMMARY.md"))
}

// ── Rendering ────────────────────────────────────────────────────────────

pub fn render_summary(tables: &ReportTables) -> String {
    let mut doc = Doc::default();
    doc.line("# Financial Package Summary");
    doc.blank();

    executive_summary(&mut doc, tables);
    alerts(&mut doc, tables);
    delinquent_receivables(&mut doc, tables);
    bank_reconciliation(&mut doc, tables);
    cash_position(&mut doc, tables);
    month_over_month(&mut doc, tables);
    notable_transactions(&mut doc, tables);
    processing_notes(&mut doc, tables);

    doc.finish()
}

fn executive_summary(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 1. Executive Summary");
    doc.blank();

    let mut assets = 0.0;
    let mut liabilities = 0.0;
    let mut operating = 0.0;
    let mut reserve = 0.0;
    for record in rows(tables, ReportType::BalanceSheet) {
        let category = lower(record, "category");
        let balance = number(record, "current_balance");
        if category.contains("asset") {
            assets += balance;
            let (sub, name) = (lower(record, "subcategory"), lower(record, "account_name"));
            if sub.contains("operating") || name.contains("operating") {
                operating += balance;
            } else if sub.contains("reserve") || name.contains("reserve") {
                reserve += balance;
            }
        } else if category.contains("liabilit") {
            // Liabilities are often printed as negatives.
            liabilities += balance.abs();
        }
    }

    let receivable: f64 = rows(tables, ReportType::AccountsReceivable)
        .iter()
        .map(|r| number(r, "total_balance"))
        .sum();
    let disbursements = rows(tables, ReportType::Disbursements);
    let spent: f64 = disbursements.iter().map(|r| number(r, "amount")).sum();
    let mut checks: Vec<String> = disbursements
        .iter()
        .map(|r| text(r, "check_number"))
        .filter(|c| !c.is_empty())
        .collect();
    checks.sort();
    checks.dedup();

    let metrics = vec![
        row(["Total Assets", &currency(assets)]),
        row(["Total Liabilities", &currency(liabilities)]),
        row(["Net Equity", &currency(assets - liabilities)]),
        row(["Operating Funds", &currency(operating)]),
        row(["Reserve Funds", &currency(reserve)]),
        row(["Total AR", &currency(receivable)]),
        row(["Monthly Expenses", &currency(spent)]),
        row(["Checks Written", &checks.len().to_string()]),
        row(["Records Extracted", &tables.record_count().to_string()]),
    ];
    doc.table(&["Metric", "Value"], &[Align::Left, Align::Right], metrics);
    doc.blank();
}

struct Variance {
    account: String,
    actual: f64,
    budget: f64,
    variance: f64,
    pct: f64,
}

fn significant(variance: f64, pct: f64) -> bool {
    (pct.abs() > VARIANCE_PCT && variance.abs() > VARIANCE_FLOOR) || variance.abs() > VARIANCE_ALWAYS
}

fn alerts(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 2. Alerts & Variances");
    doc.blank();

    let mut found: Vec<Variance> = Vec::new();
    for record in line_items(tables, ReportType::ExpenseTrend) {
        let actual = number(record, "full_year_actual");
        let budget = number(record, "total_budget");
        if budget == 0.0 {
            continue;
        }
        let variance = budget - actual;
        let pct = variance / budget * 100.0;
        if significant(variance, pct) {
            found.push(Variance {
                account: account_label(record),
                actual,
                budget,
                variance,
                pct,
            });
        }
    }
    for record in line_items(tables, ReportType::IncomeStatement) {
        let actual = number(record, "ytd_actual");
        let budget = number(record, "ytd_budget");
        if budget == 0.0 {
            continue;
        }
        let variance = record
            .get("ytd_variance")
            .and_then(as_number)
            .unwrap_or(budget - actual);
        let pct = variance / budget * 100.0;
        let account = account_label(record);
        if significant(variance, pct) && !found.iter().any(|v| v.account == account) {
            found.push(Variance {
                account,
                actual,
                budget,
                variance,
                pct,
            });
        }
    }

    if found.is_empty() {
        doc.line("*No significant variances detected*");
    } else {
        found.sort_by(|a, b| b.variance.abs().total_cmp(&a.variance.abs()));
        let body = found
            .iter()
            .take(15)
            .map(|v| {
                row([
                    &clip(&v.account, 40),
                    &currency(v.actual),
                    &currency(v.budget),
                    &currency(v.variance),
                    &format!("{:.1}%", v.pct),
                ])
            })
            .collect();
        doc.table(
            &["Account", "YTD Actual", "Budget", "Variance $", "Variance %"],
            &[Align::Left, Align::Right, Align::Right, Align::Right, Align::Right],
            body,
        );
    }
    doc.blank();
}

fn delinquent_receivables(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 3. Accounts Receivable - Delinquent");
    doc.blank();

    let mut late: Vec<(&Record, f64, f64)> = rows(tables, ReportType::AccountsReceivable)
        .iter()
        .map(|r| (r, number(r, "total_balance"), number(r, "day_120_plus")))
        .filter(|(_, total, over_120)| *over_120 > 0.0 || *total > DELINQUENT_TOTAL)
        .collect();

    if late.is_empty() {
        doc.line("*No delinquent accounts*");
    } else {
        late.sort_by(|a, b| b.1.total_cmp(&a.1));
        let total: f64 = late.iter().map(|(_, t, _)| t).sum();
        let body = late
            .iter()
            .map(|(r, total, over_120)| {
                let name = text(r, "name");
                let name = if name.is_empty() { "Unknown".to_string() } else { name };
                row([
                    &clip(&name, 25),
                    &clip(&text(r, "address"), 30),
                    &currency(*total),
                    &currency(*over_120),
                ])
            })
            .collect();
        doc.table(
            &["Name", "Address", "Total Balance", "120+ Days"],
            &[Align::Left, Align::Left, Align::Right, Align::Right],
            body,
        );
        doc.blank();
        doc.line(format!("**Total Delinquent: {}**", currency(total)));
    }
    doc.blank();
}

fn bank_reconciliation(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 4. Bank Reconciliation");
    doc.blank();

    let accounts = rows(tables, ReportType::BankReconciliation);
    if accounts.is_empty() {
        doc.line("*No bank reconciliation data*");
    } else {
        let body = accounts
            .iter()
            .map(|r| {
                let difference = number(r, "difference");
                row([
                    &clip(&text(r, "account_name"), 30),
                    &text(r, "account_type"),
                    &currency(number(r, "ending_balance_gl")),
                    if flag(r, "is_reconciled") { "Yes" } else { "No" },
                    &if difference == 0.0 {
                        "-".to_string()
                    } else {
                        currency(difference)
                    },
                ])
            })
            .collect();
        doc.table(
            &["Account", "Type", "GL Balance", "Reconciled", "Difference"],
            &[Align::Left, Align::Left, Align::Right, Align::Center, Align::Right],
            body,
        );
    }
    doc.blank();
}

fn cash_position(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 5. Cash Position");
    doc.blank();

    let (mut operating, mut reserve) = (0.0, 0.0);
    for record in rows(tables, ReportType::BalanceSheet) {
        if !lower(record, "category").contains("asset") {
            continue;
        }
        let balance = number(record, "current_balance");
        if lower(record, "account_name").contains("reserve")
            || lower(record, "subcategory").contains("reserve")
        {
            reserve += balance;
        } else {
            operating += balance;
        }
    }

    let body = vec![
        row(["Operating Accounts", &currency(operating)]),
        row(["Reserve Accounts", &currency(reserve)]),
        row([
            "**Combined Total**",
            &format!("**{}**", currency(operating + reserve)),
        ]),
    ];
    doc.table(&["Account Type", "Balance"], &[Align::Left, Align::Right], body);
    doc.blank();
}

fn month_over_month(doc: &mut Doc, tables: &ReportTables) {
    let items: Vec<&Record> = line_items(tables, ReportType::ExpenseTrend).collect();
    // Latest month with any figure, compared with the month before it.
    let latest = (1..MONTHS.len())
        .rev()
        .find(|m| items.iter().any(|r| number(r, MONTHS[*m].0) != 0.0));

    let Some(current) = latest else {
        doc.line("## 6. Month-over-Month Changes");
        doc.blank();
        doc.line("*No month-over-month data available*");
        doc.blank();
        return;
    };
    let (prev_key, prev_name) = MONTHS[current - 1];
    let (cur_key, cur_name) = MONTHS[current];
    doc.line(format!(
        "## 6. Month-over-Month Changes ({} to {})",
        &prev_name[..3],
        &cur_name[..3]
    ));
    doc.blank();

    let mut changes: Vec<(String, f64, f64)> = items
        .iter()
        .map(|r| (account_label(r), number(r, prev_key), number(r, cur_key)))
        .filter(|(_, before, after)| after - before != 0.0)
        .collect();
    if changes.is_empty() {
        doc.line("*No month-over-month data available*");
    } else {
        changes.sort_by(|a, b| (b.2 - b.1).abs().total_cmp(&(a.2 - a.1).abs()));
        let body = changes
            .iter()
            .take(10)
            .map(|(account, before, after)| {
                row([
                    &clip(account, 40),
                    &currency(*before),
                    &currency(*after),
                    &currency(after - before),
                ])
            })
            .collect();
        doc.table(
            &["Account", prev_name, cur_name, "Change"],
            &[Align::Left, Align::Right, Align::Right, Align::Right],
            body,
        );
    }
    doc.blank();
}

fn notable_transactions(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 7. Notable Transactions (>$2,000)");
    doc.blank();

    let mut notable: Vec<(&Record, f64)> = rows(tables, ReportType::Disbursements)
        .iter()
        .map(|r| (r, number(r, "amount")))
        .filter(|(_, amount)| *amount > NOTABLE_AMOUNT)
        .collect();

    if notable.is_empty() {
        doc.line("*No transactions over $2,000*");
    } else {
        notable.sort_by(|a, b| b.1.total_cmp(&a.1));
        let body = notable
            .iter()
            .take(15)
            .map(|(r, amount)| {
                let mut description = text(r, "description");
                if description.is_empty() {
                    description = text(r, "account_name");
                }
                row([
                    &clip(&text(r, "vendor"), 30),
                    &currency(*amount),
                    &clip(&description, 35),
                    &text(r, "check_number"),
                ])
            })
            .collect();
        doc.table(
            &["Vendor", "Amount", "Description", "Check #"],
            &[Align::Left, Align::Right, Align::Left, Align::Left],
            body,
        );
    }
    doc.blank();
}

fn processing_notes(doc: &mut Doc, tables: &ReportTables) {
    doc.line("## 8. Processing Notes");
    doc.blank();
    doc.line(format!(
        "- Duplicate rows dropped at chunk boundaries: {}",
        tables.duplicates_dropped
    ));
    if tables.failures.is_empty() {
        doc.line("- Every chunk was processed");
    } else {
        for f in &tables.failures {
            let report = f.report_type.map(|r| r.sheet_name()).unwrap_or("unknown report");
            doc.line(format!(
                "- Chunk {} ({report}) failed at {}: {}",
                f.chunk,
                f.stage,
                clip(&f.reason, 120)
            ));
        }
    }
}

// ── Document builder ─────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Align {
    Left,
    Right,
    Center,
}

#[derive(Default)]
struct Doc {
    lines: Vec<String>,
}

impl Doc {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn blank(&mut self) {
        self.lines.push(String::new());
    }

    fn table(&mut self, headers: &[&str], align: &[Align], body: Vec<Vec<String>>) {
        if body.is_empty() {
            self.line("*No data*");
            return;
        }
        self.line(format!("| {} |", headers.join(" | ")));
        let separator: Vec<&str> = align
            .iter()
            .map(|a| match a {
                Align::Left => "---",
                Align::Right => "---:",
                Align::Center => ":---:",
            })
            .collect();
        self.line(format!("| {} |", separator.join(" | ")));
        for cells in body {
            self.line(format!("| {} |", cells.join(" | ")));
        }
    }

    fn finish(self) -> String {
        let mut lines = self.lines;
        while lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        if lines.len() > MAX_LINES {
            warn!("Summary has {} lines, truncating to {MAX_LINES}", lines.len());
            lines.truncate(MAX_LINES);
            lines.push(String::new());
            lines.push("*[Truncated]*".to_string());
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

fn row<const N: usize>(cells: [&str; N]) -> Vec<String> {
    cells.iter().map(|c| c.replace('|', "\\|")).collect()
}

// ── Record access ────────────────────────────────────────────────────────

fn rows(tables: &ReportTables, report_type: ReportType) -> &[Record] {
    tables
        .tables
        .get(&report_type)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Rows that are not subtotal or total lines.
fn line_items(tables: &ReportTables, report_type: ReportType) -> impl Iterator<Item = &Record> {
    rows(tables, report_type)
        .iter()
        .filter(|r| !flag(r, "is_total"))
}

fn text(record: &Record, field: &str) -> String {
    record.get(field).map(cell_text).unwrap_or_default()
}

fn lower(record: &Record, field: &str) -> String {
    text(record, field).to_lowercase()
}

fn number(record: &Record, field: &str) -> f64 {
    record.get(field).and_then(as_number).unwrap_or(0.0)
}

/// Numbers arrive as JSON numbers or as printed amounts such as
/// `"$1,234.50"`, `"-500"` or `"(500.00)"`.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            let negative = s.starts_with('-') || (s.starts_with('(') && s.ends_with(')'));
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            let n: f64 = digits.parse().ok()?;
            Some(if negative { -n } else { n })
        }
        _ => None,
    }
}

fn flag(record: &Record, field: &str) -> bool {
    match record.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

fn account_label(record: &Record) -> String {
    format!("{} - {}", text(record, "account_code"), text(record, "account_name"))
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn currency(value: f64) -> String {
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}${grouped}.{:02}", cents % 100)
}
