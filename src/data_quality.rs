// ✅ Data Quality Engine - row checks plus run-level issue collection
//
// Two sources of issues end up in the same report:
// - row validations on normalized transactions
// - pipeline problems: rate gaps, failed fetches, rejected batches and
//   reconciliation discrepancies

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{AccountRef, GroupKey, NormalizedTransaction, RateGap};
use crate::reconciliation::{ReconciliationReport, ReconciliationResult};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub rule_name: String,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationResult {
    pub fn pass(rule_name: &str, field: &str, message: &str) -> Self {
        ValidationResult {
            passed: true,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            message: message.to_string(),
            severity: Severity::Info,
        }
    }

    pub fn fail(rule_name: &str, field: &str, message: &str, severity: Severity) -> Self {
        ValidationResult {
            passed: false,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            message: message.to_string(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Data is invalid or missing
    Warning,  // Data is questionable or incomplete
    Info,     // Data is valid but could be improved
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueCategory {
    MissingRate,
    FetchFailure,
    NormalizationFailure,
    BalanceMismatch,
    InvalidRow,
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueCategory::MissingRate => "missing_rate",
            IssueCategory::FetchFailure => "fetch_failure",
            IssueCategory::NormalizationFailure => "normalization_failure",
            IssueCategory::BalanceMismatch => "balance_mismatch",
            IssueCategory::InvalidRow => "invalid_row",
        };
        f.write_str(s)
    }
}

// ============================================================================
// QUALITY ISSUES & REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub category: IssueCategory,
    /// What the issue is about: an account label, "USD 2025-05-29", an entry id
    pub subject: String,
    /// None = applies to every company
    pub company: Option<String>,
    /// None = applies to every date
    pub date: Option<NaiveDate>,
    pub message: String,
    pub recommendation: String,
}

impl QualityIssue {
    pub fn applies_to(&self, company: &str, date: NaiveDate) -> bool {
        self.company.as_deref().map_or(true, |c| c == company)
            && self.date.map_or(true, |d| d == date)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> String {
        format!(
            "Issues: {} ({} critical, {} warnings)",
            self.issues.len(),
            self.count(Severity::Critical),
            self.count(Severity::Warning)
        )
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.count(Severity::Critical) > 0
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues relevant to one company's report for one date
    pub fn issues_for(&self, company: &str, date: NaiveDate) -> Vec<QualityIssue> {
        self.issues
            .iter()
            .filter(|i| i.applies_to(company, date))
            .cloned()
            .collect()
    }

    pub fn push(&mut self, issue: QualityIssue) {
        if !self.issues.contains(&issue) {
            self.issues.push(issue);
        }
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = QualityIssue>) {
        for issue in issues {
            self.push(issue);
        }
    }

    /// One issue per (currency, date), whichever stage found it
    pub fn add_rate_gap(&mut self, gap: &RateGap) {
        let subject = format!("{} {}", gap.currency, gap.date);
        if self
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::MissingRate && i.subject == subject)
        {
            return;
        }
        self.issues.push(QualityIssue {
            severity: Severity::Warning,
            category: IssueCategory::MissingRate,
            subject,
            company: None,
            date: Some(gap.date),
            message: format!("No NBG rate for {} on {}; GEL amounts left empty", gap.currency, gap.date),
            recommendation: "Re-run `rates` for this date once NBG publishes".to_string(),
        });
    }

    /// Filed under the report date, even when the missing rate is yesterday's
    pub fn add_revaluation_gap(&mut self, group: &GroupKey, missing: &RateGap) {
        self.push(QualityIssue {
            severity: Severity::Warning,
            category: IssueCategory::MissingRate,
            subject: format!("{} {} {}", group.company, group.account_number, group.currency),
            company: Some(group.company.clone()),
            date: Some(group.date),
            message: format!(
                "No revaluation row: NBG {} rate for {} is missing",
                missing.currency, missing.date
            ),
            recommendation: format!("Re-run `rates` for {}, then rebuild the report", missing.date),
        });
    }

    pub fn add_fetch_failure(&mut self, account: &AccountRef, error: &str) {
        self.push(QualityIssue {
            severity: Severity::Critical,
            category: IssueCategory::FetchFailure,
            subject: format!("{} {}", account.bank, account.label()),
            company: Some(account.company.clone()),
            date: None,
            message: error.to_string(),
            recommendation: "Check credentials and connectivity, then re-run `fetch`".to_string(),
        });
    }

    pub fn add_normalization_failure(&mut self, account: &AccountRef, date: NaiveDate, error: &str) {
        self.push(QualityIssue {
            severity: Severity::Critical,
            category: IssueCategory::NormalizationFailure,
            subject: format!("{} {}", account.bank, account.label()),
            company: Some(account.company.clone()),
            date: Some(date),
            message: error.to_string(),
            recommendation: "Account dropped from this report; inspect the raw records".to_string(),
        });
    }

    pub fn add_reconciliation(&mut self, report: &ReconciliationReport) {
        let severity = match report.result {
            ReconciliationResult::Balanced { .. } => return,
            ReconciliationResult::MinorDiscrepancy { .. } => Severity::Warning,
            ReconciliationResult::MajorDiscrepancy { .. } => Severity::Critical,
        };
        self.push(QualityIssue {
            severity,
            category: IssueCategory::BalanceMismatch,
            subject: format!(
                "{}-{}-{}",
                report.group.company, report.group.account_number, report.group.currency
            ),
            company: Some(report.group.company.clone()),
            date: Some(report.group.date),
            message: report.summary(),
            recommendation: "Compare with the bank statement; transactions may be missing"
                .to_string(),
        });
    }
}

// ============================================================================
// DATA QUALITY ENGINE
// ============================================================================

pub struct DataQualityEngine {
    /// Amounts above this are flagged for review (account currency)
    large_amount_threshold: f64,
}

impl DataQualityEngine {
    pub fn new() -> Self {
        DataQualityEngine {
            large_amount_threshold: 1_000_000.0,
        }
    }

    /// Run every row rule on one transaction
    pub fn validate(&self, tx: &NormalizedTransaction) -> Vec<ValidationResult> {
        vec![
            self.validate_amounts(tx),
            self.validate_currency(&tx.currency),
            self.validate_base_amounts(tx),
            self.validate_description(tx),
        ]
    }

    /// Validate rows and turn failures into issues
    pub fn check_rows(&self, rows: &[NormalizedTransaction]) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        for tx in rows {
            for result in self.validate(tx) {
                if result.passed || result.severity == Severity::Info {
                    continue;
                }
                issues.push(QualityIssue {
                    severity: result.severity,
                    category: IssueCategory::InvalidRow,
                    subject: format!("{} {}", tx.bank, tx.entry_id),
                    company: Some(tx.company.clone()),
                    date: Some(tx.date),
                    message: format!("{}: {}", result.field, result.message),
                    recommendation: "Check the raw record for this entry".to_string(),
                });
            }
        }
        issues
    }

    // Rule 1: exactly one side carries the amount
    fn validate_amounts(&self, tx: &NormalizedTransaction) -> ValidationResult {
        if tx.debit < 0.0 || tx.credit < 0.0 {
            return ValidationResult::fail(
                "amounts_non_negative",
                "amount",
                "Debit and credit must be non-negative",
                Severity::Critical,
            );
        }
        if tx.debit > 0.0 && tx.credit > 0.0 {
            return ValidationResult::fail(
                "single_sided",
                "amount",
                &format!("Both debit ({}) and credit ({}) set", tx.debit, tx.credit),
                Severity::Warning,
            );
        }
        if tx.debit == 0.0 && tx.credit == 0.0 {
            return ValidationResult::fail("non_zero", "amount", "Zero amount", Severity::Warning);
        }
        if tx.debit.max(tx.credit) > self.large_amount_threshold {
            return ValidationResult::fail(
                "large_amount",
                "amount",
                &format!("Unusually large amount: {:.2}", tx.debit.max(tx.credit)),
                Severity::Info,
            );
        }
        ValidationResult::pass("amounts", "amount", "Amounts valid")
    }

    // Rule 2: ISO 4217 shape
    fn validate_currency(&self, currency: &str) -> ValidationResult {
        if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
            ValidationResult::pass("currency_code", "currency", "Currency code valid")
        } else {
            ValidationResult::fail(
                "currency_code",
                "currency",
                &format!("Invalid currency code '{}'", currency),
                Severity::Critical,
            )
        }
    }

    // Rule 3: GEL amounts present (missing means a rate gap)
    fn validate_base_amounts(&self, tx: &NormalizedTransaction) -> ValidationResult {
        if tx.debit_base.is_some() && tx.credit_base.is_some() {
            ValidationResult::pass("base_amounts", "amount_base", "GEL amounts present")
        } else {
            ValidationResult::fail(
                "base_amounts",
                "amount_base",
                "GEL amounts missing",
                Severity::Info,
            )
        }
    }

    // Rule 4: something to tell the row apart by
    fn validate_description(&self, tx: &NormalizedTransaction) -> ValidationResult {
        if tx.memo.description.is_some() || tx.memo.counterparty.is_some() {
            ValidationResult::pass("description", "memo", "Description present")
        } else {
            ValidationResult::fail(
                "description",
                "memo",
                "No description or counterparty",
                Severity::Info,
            )
        }
    }
}

impl Default for DataQualityEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bank, GroupKey, Memo};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn create_test_row(debit: f64, credit: f64, currency: &str) -> NormalizedTransaction {
        NormalizedTransaction {
            bank: Bank::Bog,
            company: "MRG".to_string(),
            account_number: "GE29BG0000000000000001".to_string(),
            currency: currency.to_string(),
            date: date("2025-05-29"),
            entry_id: "E-1".to_string(),
            debit,
            credit,
            debit_base: Some(debit),
            credit_base: Some(credit),
            rate: Some(1.0),
            transaction_rate: None,
            opening_balance: 0.0,
            closing_balance: credit - debit,
            reported_closing_balance: None,
            memo: Memo {
                description: Some("Invoice".to_string()),
                ..Memo::default()
            },
        }
    }

    #[test]
    fn test_valid_row_passes_all_rules() {
        let engine = DataQualityEngine::new();
        let results = engine.validate(&create_test_row(10.0, 0.0, "GEL"));
        assert!(results.iter().all(|r| r.passed), "{:?}", results);
        assert!(engine.check_rows(&[create_test_row(10.0, 0.0, "GEL")]).is_empty());

        println!("✅ Valid row test PASSED");
    }

    #[test]
    fn test_invalid_rows_become_issues() {
        let engine = DataQualityEngine::new();
        let rows = vec![
            create_test_row(10.0, 5.0, "GEL"),
            create_test_row(0.0, 0.0, "usd"),
        ];

        let issues = engine.check_rows(&rows);
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().all(|i| i.category == IssueCategory::InvalidRow));
        assert!(issues.iter().any(|i| i.severity == Severity::Critical));

        println!("✅ Invalid row test PASSED: {} issues", issues.len());
    }

    #[test]
    fn test_rate_gaps_deduplicated() {
        let mut report = QualityReport::new();
        let gap = RateGap {
            currency: "USD".to_string(),
            date: date("2025-05-29"),
        };
        report.add_rate_gap(&gap);
        report.add_rate_gap(&gap);
        report.add_rate_gap(&RateGap {
            currency: "EUR".to_string(),
            date: date("2025-05-29"),
        });

        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.count(Severity::Warning), 2);
        assert!(!report.has_critical_issues());

        println!("✅ Rate gap dedup test PASSED: {}", report.summary());
    }

    #[test]
    fn test_revaluation_gap_lands_on_report_date() {
        let mut report = QualityReport::new();
        let group = GroupKey {
            company: "MRG".to_string(),
            account_number: "GE29BG0000000000000001".to_string(),
            currency: "USD".to_string(),
            date: date("2025-05-29"),
        };
        let yesterday = RateGap {
            currency: "USD".to_string(),
            date: date("2025-05-28"),
        };
        report.add_revaluation_gap(&group, &yesterday);
        report.add_revaluation_gap(&group, &yesterday);

        assert_eq!(report.issues.len(), 1);
        let issues = report.issues_for("MRG", date("2025-05-29"));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].category, IssueCategory::MissingRate);
        assert!(issues[0].message.contains("revaluation"));
        assert!(issues[0].message.contains("2025-05-28"));
        assert!(report.issues_for("BRG", date("2025-05-29")).is_empty());
        assert!(report.issues_for("MRG", date("2025-05-28")).is_empty());

        println!("✅ Revaluation gap routing test PASSED");
    }

    #[test]
    fn test_issues_filtered_per_company_and_date() {
        let mut report = QualityReport::new();
        report.add_rate_gap(&RateGap {
            currency: "USD".to_string(),
            date: date("2025-05-29"),
        });
        report.add_fetch_failure(
            &AccountRef::new(Bank::Tbc, "BRG", "GEL", "GE11TB0000000000000002"),
            "HTTP error: timeout",
        );

        assert_eq!(report.issues_for("BRG", date("2025-05-29")).len(), 2);
        assert_eq!(report.issues_for("MRG", date("2025-05-29")).len(), 1);
        assert_eq!(report.issues_for("MRG", date("2025-05-30")).len(), 0);
        assert!(report.has_critical_issues());
    }

    #[test]
    fn test_reconciliation_issue_severity() {
        let group = GroupKey {
            company: "MRG".to_string(),
            account_number: "GE29BG0000000000000001".to_string(),
            currency: "USD".to_string(),
            date: date("2025-05-29"),
        };
        let mut recon = ReconciliationReport {
            group,
            result: ReconciliationResult::MajorDiscrepancy {
                expected_balance: 3100.0,
                actual_balance: 3000.0,
                difference: 100.0,
            },
            transaction_count: 1,
            opening_balance: 1000.0,
            total_credits: 2000.0,
            total_debits: 0.0,
            calculated_balance: 3000.0,
            reported_balance: 3100.0,
            reconciled_at: chrono::Utc::now(),
        };

        let mut report = QualityReport::new();
        report.add_reconciliation(&recon);
        assert_eq!(report.issues[0].severity, Severity::Critical);

        recon.result = ReconciliationResult::Balanced {
            opening_balance: 1000.0,
            total_credits: 2000.0,
            total_debits: 0.0,
            closing_balance: 3000.0,
        };
        report.add_reconciliation(&recon);
        assert_eq!(report.issues.len(), 1, "balanced groups add nothing");
    }
}
