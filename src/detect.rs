//! Keyword-based report-type detection.
//!
//! The hint only steers the parser's prompt; the parser still labels every
//! result it returns. Scoring is a plain count of pattern hits over the first
//! part of the page, so the same text always yields the same hint.

use crate::report::ReportType;
use once_cell::sync::Lazy;
use regex::Regex;

/// Characters of page text considered; report titles sit at the top.
const SAMPLE_CHARS: usize = 2000;

static PATTERNS: Lazy<Vec<(ReportType, Regex)>> = Lazy::new(|| {
    let table: [(ReportType, &str); 8] = [
        (
            ReportType::ExpenseTrend,
            r"(?i)expense\s+trend|full\s+year\s+actual|\bjan\b[^\n]*\bfeb\b[^\n]*\bmar\b",
        ),
        (
            ReportType::IncomeStatement,
            r"(?i)income\s+statement|ytd\s+actual|ytd\s+budget|current\s+period\s+actual|budget\s+remaining",
        ),
        (
            ReportType::BalanceSheet,
            r"(?i)balance\s+sheet|total\s+assets|total\s+liabilities|members'?\s+equity|owners'?\s+equity",
        ),
        (
            ReportType::Disbursements,
            r"(?i)check\s+disbursements?|disbursement\s+report|check\s*(?:#|no\.?|number)",
        ),
        (
            ReportType::Invoice,
            r"(?i)\binvoice\b|bill\s+to|amount\s+due|remit\s+to|due\s+date",
        ),
        (
            ReportType::AccountsReceivable,
            r"(?i)accounts\s+receivable|receivable\s+aging|delinquen|prepaid\s+owners?",
        ),
        (
            ReportType::BankReconciliation,
            r"(?i)bank\s+reconciliation|outstanding\s+checks|outstanding\s+deposits|balance\s+per\s+bank",
        ),
        (
            ReportType::InvestmentListing,
            r"(?i)investment\s+(?:listing|summary|report)|certificate\s+of\s+deposit|maturity\s+date|money\s+market",
        ),
    ];
    table
        .into_iter()
        .map(|(rt, pattern)| (rt, Regex::new(pattern).unwrap()))
        .collect()
});

/// Most likely report type for one page of text. Ties go to the type listed
/// first in [`ReportType::ALL`]; no hits at all yields `Unknown`.
pub fn detect_page(text: &str) -> ReportType {
    let sample: String = text.chars().take(SAMPLE_CHARS).collect();
    let mut best = (ReportType::Unknown, 0usize);
    for (rt, re) in PATTERNS.iter() {
        let hits = re.find_iter(&sample).count();
        if hits > best.1 || (hits == best.1 && hits > 0 && *rt < best.0) {
            best = (*rt, hits);
        }
    }
    best.0
}

/// Dominant non-`Unknown` hint among a chunk's pages. Ties go to the type
/// that appears on the earliest page.
pub fn dominant(hints: &[ReportType]) -> ReportType {
    let mut counts: Vec<(ReportType, usize, usize)> = Vec::new();
    for (pos, hint) in hints.iter().enumerate() {
        if *hint == ReportType::Unknown {
            continue;
        }
        match counts.iter_mut().find(|(rt, _, _)| rt == hint) {
            Some(entry) => entry.1 += 1,
            None => counts.push((*hint, 1, pos)),
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
        .map(|(rt, _, _)| rt)
        .unwrap_or(ReportType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_titles() {
        assert_eq!(
            detect_page("SUNSET VILLAS HOA\nBalance Sheet\nTotal Assets 1,204.00"),
            ReportType::BalanceSheet
        );
        assert_eq!(
            detect_page("Check Disbursements Report\nCheck # 1042 ACME POOL"),
            ReportType::Disbursements
        );
        assert_eq!(
            detect_page("Bank Reconciliation\nBalance per bank 10.00\nOutstanding checks"),
            ReportType::BankReconciliation
        );
        assert_eq!(
            detect_page("Income and Expense Trend\nAcct Jan Feb Mar Apr"),
            ReportType::ExpenseTrend
        );
    }

    #[test]
    fn blank_page_is_unknown() {
        assert_eq!(detect_page(""), ReportType::Unknown);
        assert_eq!(detect_page("   \n  "), ReportType::Unknown);
    }

    #[test]
    fn dominant_prefers_majority_then_earliest() {
        use ReportType::*;
        assert_eq!(dominant(&[Unknown, Invoice, BalanceSheet, BalanceSheet]), BalanceSheet);
        assert_eq!(dominant(&[Invoice, BalanceSheet]), Invoice);
        assert_eq!(dominant(&[Unknown, Unknown]), Unknown);
        assert_eq!(dominant(&[]), Unknown);
    }
}
