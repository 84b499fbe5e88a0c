//! Prompts for turning a chunk of a financial package into JSON records.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: the record schemas the parser is asked for
//!    live next to each other, so column names stay consistent with
//!    [`ReportType::columns`].
//!
//! 2. **Testability**: unit tests can inspect prompts directly without
//!    calling a model.
//!
//! Callers can override the system prompt via
//! [`crate::config::LlmConfig::system_prompt`]; the chunk prompt is always
//! built here.

use crate::adapters::ExtractedChunk;
use crate::model::Chunk;
use crate::report::ReportType;
use std::fmt::Write as _;

/// Default system prompt for the chunk parser.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a meticulous bookkeeping assistant. You receive consecutive pages of a monthly financial package for a community association and return every line item as structured JSON.

Follow these rules precisely:

1. FIDELITY
   - Copy account codes, names, vendors and dates exactly as printed
   - Amounts are plain numbers: no currency symbols, no thousands separators
   - Parenthesised amounts are negative: (1,250.00) becomes -1250.00
   - Never invent rows; leave a field null when it is not printed

2. CLASSIFICATION
   - Label each group of rows with exactly one report type from this list:
     balance_sheet, income_statement, expense_trend, disbursements, invoice,
     accounts_receivable, bank_reconciliation, investment_listing, unknown
   - Pages may contain more than one report; return one entry per report

3. TOTALS
   - Keep subtotal and total rows, and mark them with "is_total": true

4. OUTPUT FORMAT
   - Output ONLY a JSON object of the form
     {"reports": [{"report_type": "<type>", "records": [{...}, ...]}]}
   - Do NOT wrap in ```json fences
   - Do NOT add commentary or explanations"#;

/// Field list the parser should produce for `report_type`.
pub fn schema_hint(report_type: ReportType) -> &'static str {
    match report_type {
        ReportType::BalanceSheet => {
            "balance_sheet records: account_code, account_name, category (assets|liabilities|equity), \
subcategory, current_balance, prior_balance, change"
        }
        ReportType::IncomeStatement => {
            "income_statement records: account_code, account_name, section (income|expense), category, \
is_total, current_actual, current_budget, current_variance, ytd_actual, ytd_budget, ytd_variance, \
annual_budget, budget_remaining"
        }
        ReportType::ExpenseTrend => {
            "expense_trend records: account_code, account_name, category, is_total, jan, feb, mar, apr, \
may, jun, jul, aug, sep, oct, nov, dec, full_year_actual, total_budget"
        }
        ReportType::Disbursements => {
            "disbursements records: check_number, check_date (YYYY-MM-DD), vendor, account_code, \
account_name, description, amount, category; one record per check line"
        }
        ReportType::Invoice => {
            "invoice records: invoice_id, invoice_date (YYYY-MM-DD), vendor, description, amount, \
line_items (array of {description, amount})"
        }
        ReportType::AccountsReceivable => {
            "accounts_receivable records: account_id, name, address, section (delinquent|prepaid), \
total_balance"
        }
        ReportType::BankReconciliation => {
            "bank_reconciliation records: account_code, account_name, account_type, balance_per_bank, \
outstanding_deposits, outstanding_checks, adjusted_bank_balance, balance_per_books, difference, \
is_reconciled"
        }
        ReportType::InvestmentListing => {
            "investment_listing records: bank, account_number, investment_type, interest_rate, \
maturity_date (YYYY-MM-DD), balance"
        }
        ReportType::Unknown => "unknown records: any key/value pairs that describe each row",
    }
}

/// User message for one chunk: schemas, the detected hint, then page text.
///
/// Scanned pages carry no text; their images are attached to the same
/// message and referenced here by page number.
pub fn chunk_prompt(chunk: &Chunk, content: &ExtractedChunk, hint: ReportType) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Pages {} of the package.", chunk.pages);
    if hint != ReportType::Unknown {
        let _ = writeln!(out, "Most of these pages look like: {}.", hint.label());
    }
    out.push_str("\nRecord schemas:\n");
    for rt in ReportType::ALL {
        let _ = writeln!(out, "- {}", schema_hint(rt));
    }
    out.push_str("\nTEXT TO PARSE:\n");
    for page in &content.pages {
        let _ = writeln!(out, "\n--- page {} ---", page.number);
        if page.image.is_some() && page.text.trim().is_empty() {
            let _ = writeln!(out, "[scanned page {}: see attached image]", page.number);
        } else {
            out.push_str(page.text.trim_end());
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExtractedPage, PageImage};
    use crate::model::PageRange;

    #[test]
    fn every_report_type_has_a_schema() {
        for rt in ReportType::ALL {
            assert!(schema_hint(rt).starts_with(rt.label()), "{rt}");
        }
    }

    #[test]
    fn system_prompt_names_every_label() {
        for rt in ReportType::ALL {
            assert!(DEFAULT_SYSTEM_PROMPT.contains(rt.label()), "{rt}");
        }
    }

    #[test]
    fn chunk_prompt_lists_pages_in_order() {
        let chunk = Chunk {
            index: 1,
            pages: PageRange { start: 31, end: 32 },
            source: "pkg.pdf".into(),
        };
        let content = ExtractedChunk {
            chunk: 1,
            pages: vec![
                ExtractedPage {
                    number: 31,
                    text: "Balance Sheet\nTotal Assets 10.00".into(),
                    image: None,
                    hint: ReportType::BalanceSheet,
                },
                ExtractedPage {
                    number: 32,
                    text: String::new(),
                    image: Some(PageImage {
                        mime_type: "image/png".into(),
                        data: "AAAA".into(),
                    }),
                    hint: ReportType::Unknown,
                },
            ],
            hint: ReportType::BalanceSheet,
        };
        let prompt = chunk_prompt(&chunk, &content, ReportType::BalanceSheet);
        assert!(prompt.starts_with("Pages 31-32"));
        assert!(prompt.contains("look like: balance_sheet"));
        let p31 = prompt.find("--- page 31 ---").unwrap();
        let p32 = prompt.find("--- page 32 ---").unwrap();
        assert!(p31 < p32);
        assert!(prompt.contains("[scanned page 32: see attached image]"));
    }
}
