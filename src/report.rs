//! Report types found in a monthly financial package.
//!
//! The pipeline treats records as opaque maps. The few places that need to
//! know a report's shape (de-duplication keys, column order, sheet naming)
//! branch on [`ReportType`] here, so adding a report type touches one file.

use crate::model::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Closed set of report variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    BalanceSheet,
    IncomeStatement,
    ExpenseTrend,
    Disbursements,
    Invoice,
    AccountsReceivable,
    BankReconciliation,
    InvestmentListing,
    Unknown,
}

impl ReportType {
    pub const ALL: [ReportType; 9] = [
        ReportType::BalanceSheet,
        ReportType::IncomeStatement,
        ReportType::ExpenseTrend,
        ReportType::Disbursements,
        ReportType::Invoice,
        ReportType::AccountsReceivable,
        ReportType::BankReconciliation,
        ReportType::InvestmentListing,
        ReportType::Unknown,
    ];

    /// Machine label, as used in parser responses and checkpoints.
    pub fn label(self) -> &'static str {
        match self {
            ReportType::BalanceSheet => "balance_sheet",
            ReportType::IncomeStatement => "income_statement",
            ReportType::ExpenseTrend => "expense_trend",
            ReportType::Disbursements => "disbursements",
            ReportType::Invoice => "invoice",
            ReportType::AccountsReceivable => "accounts_receivable",
            ReportType::BankReconciliation => "bank_reconciliation",
            ReportType::InvestmentListing => "investment_listing",
            ReportType::Unknown => "unknown",
        }
    }

    /// Human-readable section title in the workbook.
    pub fn sheet_name(self) -> &'static str {
        match self {
            ReportType::BalanceSheet => "Balance Sheet",
            ReportType::IncomeStatement => "Income Statement",
            ReportType::ExpenseTrend => "Expense Trend",
            ReportType::Disbursements => "Check Disbursements",
            ReportType::Invoice => "Invoices",
            ReportType::AccountsReceivable => "Accounts Receivable",
            ReportType::BankReconciliation => "Bank Reconciliation",
            ReportType::InvestmentListing => "Investments",
            ReportType::Unknown => "Unclassified",
        }
    }

    /// Lenient parse of a label returned by a parser. Accepts spaces,
    /// dashes, any case and the common short forms.
    pub fn from_label(raw: &str) -> Option<ReportType> {
        let norm: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        let found = match norm.as_str() {
            "balance_sheet" => ReportType::BalanceSheet,
            "income_statement" | "income_and_expense" | "profit_and_loss" => {
                ReportType::IncomeStatement
            }
            "expense_trend" | "income_expense_trend" => ReportType::ExpenseTrend,
            "disbursements" | "check_disbursements" | "disbursement" => ReportType::Disbursements,
            "invoice" | "invoices" | "scanned_image" => ReportType::Invoice,
            "accounts_receivable" | "ar" | "receivables" => ReportType::AccountsReceivable,
            "bank_reconciliation" | "reconciliation" => ReportType::BankReconciliation,
            "investment_listing" | "investments" => ReportType::InvestmentListing,
            "unknown" | "other" => ReportType::Unknown,
            _ => return None,
        };
        Some(found)
    }

    /// Fields whose combined values identify a record for de-duplication.
    ///
    /// Chunks overlap when a table straddles a chunk boundary and the parser
    /// sees its header twice, so the same line item can arrive from two
    /// adjacent chunks.
    pub fn identity_fields(self) -> &'static [&'static str] {
        match self {
            ReportType::BalanceSheet => &["account_code", "account_name"],
            ReportType::IncomeStatement => &["section", "account_code", "account_name"],
            ReportType::ExpenseTrend => &["account_code", "account_name"],
            ReportType::Disbursements => &["check_number", "vendor", "amount"],
            ReportType::Invoice => &["invoice_id", "vendor", "amount"],
            ReportType::AccountsReceivable => &["account_id", "section"],
            ReportType::BankReconciliation => &["account_code", "account_name"],
            ReportType::InvestmentListing => &["bank", "account_number"],
            ReportType::Unknown => &[],
        }
    }

    /// Fields that tell apart distinct lines sharing an identity, such as
    /// one check split across several ledger accounts. A missing value
    /// counts as blank rather than disabling de-duplication.
    pub fn distinguishing_fields(self) -> &'static [&'static str] {
        match self {
            ReportType::Disbursements => &["account_code", "description"],
            ReportType::Invoice => &["account_code", "description"],
            _ => &[],
        }
    }

    /// Preferred column order. Columns a parser returns beyond these are
    /// appended in lexical order.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            ReportType::BalanceSheet => &[
                "account_code",
                "account_name",
                "category",
                "subcategory",
                "current_balance",
                "prior_balance",
                "change",
            ],
            ReportType::IncomeStatement => &[
                "account_code",
                "account_name",
                "section",
                "category",
                "is_total",
                "current_actual",
                "current_budget",
                "current_variance",
                "ytd_actual",
                "ytd_budget",
                "ytd_variance",
                "annual_budget",
                "budget_remaining",
            ],
            ReportType::ExpenseTrend => &[
                "account_code",
                "account_name",
                "category",
                "is_total",
                "jan",
                "feb",
                "mar",
                "apr",
                "may",
                "jun",
                "jul",
                "aug",
                "sep",
                "oct",
                "nov",
                "dec",
                "full_year_actual",
                "total_budget",
            ],
            ReportType::Disbursements => &[
                "check_number",
                "check_date",
                "vendor",
                "account_code",
                "account_name",
                "description",
                "amount",
                "category",
            ],
            ReportType::Invoice => &[
                "invoice_id",
                "invoice_date",
                "vendor",
                "description",
                "amount",
                "line_items",
            ],
            ReportType::AccountsReceivable => &[
                "account_id",
                "name",
                "address",
                "section",
                "total_balance",
            ],
            ReportType::BankReconciliation => &[
                "account_code",
                "account_name",
                "account_type",
                "balance_per_bank",
                "outstanding_deposits",
                "outstanding_checks",
                "adjusted_bank_balance",
                "balance_per_books",
                "difference",
                "is_reconciled",
            ],
            ReportType::InvestmentListing => &[
                "bank",
                "account_number",
                "investment_type",
                "interest_rate",
                "maturity_date",
                "balance",
            ],
            ReportType::Unknown => &[],
        }
    }

    /// Identity key of `record`, or `None` when the type has no identity
    /// fields or any of them is blank. Records without a key are never
    /// treated as duplicates.
    pub fn identity(self, record: &Record) -> Option<String> {
        let fields = self.identity_fields();
        if fields.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            let cell = record.get(*field).map(cell_text).unwrap_or_default();
            if cell.is_empty() {
                return None;
            }
            parts.push(normalise_key(&cell));
        }
        for field in self.distinguishing_fields() {
            let cell = record.get(*field).map(cell_text).unwrap_or_default();
            parts.push(normalise_key(&cell));
        }
        Some(parts.join("\u{1f}"))
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Render a JSON value as a single spreadsheet cell.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

// Amounts arrive as "1,234.50" from one chunk and 1234.5 from the next;
// compare them by value.
fn normalise_key(cell: &str) -> String {
    let stripped: String = cell
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | ' '))
        .collect();
    match stripped.parse::<f64>() {
        Ok(n) if n.is_finite() => format!("{n}"),
        _ => cell.to_lowercase(),
    }
}
