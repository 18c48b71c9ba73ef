// ⚖️ Reconciliation Engine - Validate balances match
//
// Following the formula:
//   opening_balance + total_credits - total_debits = closing_balance
//
// The computed closing of every (company, account, currency, date) group is
// checked against the closing the bank reported for that day.

use crate::model::{GroupKey, NormalizedTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// All balances match
    Balanced {
        opening_balance: f64,
        total_credits: f64,
        total_debits: f64,
        closing_balance: f64,
    },

    /// Off by less than the major threshold
    MinorDiscrepancy {
        expected_balance: f64,
        actual_balance: f64,
        difference: f64,
        tolerance: f64,
    },

    /// Off by the major threshold or more
    MajorDiscrepancy {
        expected_balance: f64,
        actual_balance: f64,
        difference: f64,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    pub fn difference(&self) -> f64 {
        match self {
            ReconciliationResult::Balanced { .. } => 0.0,
            ReconciliationResult::MinorDiscrepancy { difference, .. } => *difference,
            ReconciliationResult::MajorDiscrepancy { difference, .. } => *difference,
        }
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub group: GroupKey,
    pub result: ReconciliationResult,
    pub transaction_count: usize,
    pub opening_balance: f64,
    pub total_credits: f64,
    pub total_debits: f64,
    pub calculated_balance: f64,
    pub reported_balance: f64,
    pub reconciled_at: chrono::DateTime<chrono::Utc>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.result.is_balanced()
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation for {} {} {} ({}): {} transactions, calculated {:.2}, reported {:.2}, difference {:.2}",
            self.group.company,
            self.group.account_number,
            self.group.currency,
            self.group.date,
            self.transaction_count,
            self.calculated_balance,
            self.reported_balance,
            self.result.difference()
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Tolerance for floating-point comparisons (default: 0.01)
    pub tolerance: f64,

    /// Threshold for minor vs major discrepancy (default: 10.00)
    pub major_discrepancy_threshold: f64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            tolerance: 0.01,
            major_discrepancy_threshold: 10.0,
        }
    }

    pub fn with_thresholds(tolerance: f64, major_threshold: f64) -> Self {
        ReconciliationEngine {
            tolerance,
            major_discrepancy_threshold: major_threshold,
        }
    }

    /// Reconcile one group against the closing the bank reported
    ///
    /// None when the group is empty or the bank reported no closing.
    pub fn reconcile_group(&self, rows: &[&NormalizedTransaction]) -> Option<ReconciliationReport> {
        let first = rows.first()?;
        let reported_balance = rows.iter().find_map(|r| r.reported_closing_balance)?;

        let total_credits = self.calculate_credits(rows);
        let total_debits = self.calculate_debits(rows);

        // Formula: opening + credits - debits = closing
        let calculated_balance = first.opening_balance + total_credits - total_debits;
        let difference = (calculated_balance - reported_balance).abs();

        let result = if difference < self.tolerance {
            ReconciliationResult::Balanced {
                opening_balance: first.opening_balance,
                total_credits,
                total_debits,
                closing_balance: reported_balance,
            }
        } else if difference < self.major_discrepancy_threshold {
            ReconciliationResult::MinorDiscrepancy {
                expected_balance: reported_balance,
                actual_balance: calculated_balance,
                difference,
                tolerance: self.tolerance,
            }
        } else {
            ReconciliationResult::MajorDiscrepancy {
                expected_balance: reported_balance,
                actual_balance: calculated_balance,
                difference,
            }
        };

        Some(ReconciliationReport {
            group: first.group_key(),
            result,
            transaction_count: rows.len(),
            opening_balance: first.opening_balance,
            total_credits,
            total_debits,
            calculated_balance,
            reported_balance,
            reconciled_at: chrono::Utc::now(),
        })
    }

    /// Reconcile every group in a set of rows, in group order
    pub fn reconcile_all(&self, rows: &[NormalizedTransaction]) -> Vec<ReconciliationReport> {
        let mut groups: BTreeMap<GroupKey, Vec<&NormalizedTransaction>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.group_key()).or_default().push(row);
        }

        groups
            .values()
            .filter_map(|group| self.reconcile_group(group))
            .collect()
    }

    fn calculate_credits(&self, rows: &[&NormalizedTransaction]) -> f64 {
        rows.iter().map(|r| r.credit).sum()
    }

    fn calculate_debits(&self, rows: &[&NormalizedTransaction]) -> f64 {
        rows.iter().map(|r| r.debit).sum()
    }
}

impl Default for ReconciliationEngine {
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
    use crate::model::{Bank, Memo};
    use chrono::NaiveDate;

    fn create_test_row(debit: f64, credit: f64, opening: f64, reported: Option<f64>) -> NormalizedTransaction {
        NormalizedTransaction {
            bank: Bank::Tbc,
            company: "BRG".to_string(),
            account_number: "GE11TB0000000000000002".to_string(),
            currency: "USD".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 5, 29).unwrap(),
            entry_id: format!("M-{}-{}", debit, credit),
            debit,
            credit,
            debit_base: None,
            credit_base: None,
            rate: None,
            transaction_rate: None,
            opening_balance: opening,
            closing_balance: opening + credit - debit,
            reported_closing_balance: reported,
            memo: Memo::default(),
        }
    }

    #[test]
    fn test_reconciliation_balanced() {
        let engine = ReconciliationEngine::new();
        let rows = [
            create_test_row(0.0, 2000.0, 1000.0, Some(2200.0)),
            create_test_row(500.0, 0.0, 1000.0, Some(2200.0)),
            create_test_row(300.0, 0.0, 1000.0, Some(2200.0)),
        ];
        let refs: Vec<&NormalizedTransaction> = rows.iter().collect();

        let report = engine.reconcile_group(&refs).unwrap();

        assert_eq!(report.transaction_count, 3);
        assert_eq!(report.total_credits, 2000.0);
        assert_eq!(report.total_debits, 800.0);
        assert_eq!(report.calculated_balance, 2200.0);
        assert!(report.is_balanced());

        println!("✅ Test passed: {}", report.summary());
    }

    #[test]
    fn test_reconciliation_minor_discrepancy() {
        let engine = ReconciliationEngine::new();
        let rows = [
            create_test_row(0.0, 2000.0, 1000.0, Some(2495.0)),
            create_test_row(500.0, 0.0, 1000.0, Some(2495.0)),
        ];
        let refs: Vec<&NormalizedTransaction> = rows.iter().collect();

        let report = engine.reconcile_group(&refs).unwrap();

        assert!(report.result.has_discrepancy());
        assert!(matches!(
            report.result,
            ReconciliationResult::MinorDiscrepancy { .. }
        ));
        assert!((report.result.difference() - 5.0).abs() < 0.01);

        println!("✅ Test passed: {}", report.summary());
    }

    #[test]
    fn test_reconciliation_major_discrepancy() {
        let engine = ReconciliationEngine::new();
        let rows = [create_test_row(0.0, 2000.0, 1000.0, Some(3100.0))];
        let refs: Vec<&NormalizedTransaction> = rows.iter().collect();

        let report = engine.reconcile_group(&refs).unwrap();

        assert!(matches!(
            report.result,
            ReconciliationResult::MajorDiscrepancy { .. }
        ));
        assert!((report.result.difference() - 100.0).abs() < 0.01);

        println!("✅ Test passed: {}", report.summary());
    }

    #[test]
    fn test_no_reported_closing_is_skipped() {
        let engine = ReconciliationEngine::new();
        let rows = [create_test_row(10.0, 0.0, 100.0, None)];
        let refs: Vec<&NormalizedTransaction> = rows.iter().collect();

        assert!(engine.reconcile_group(&refs).is_none());
        assert!(engine.reconcile_group(&[]).is_none());
    }

    #[test]
    fn test_reconcile_all_groups() {
        let engine = ReconciliationEngine::new();
        let mut eur = create_test_row(10.0, 0.0, 100.0, Some(80.0));
        eur.currency = "EUR".to_string();
        let rows = vec![
            create_test_row(50.0, 0.0, 100.0, Some(130.0)),
            create_test_row(0.0, 80.0, 100.0, Some(130.0)),
            eur,
        ];

        let reports = engine.reconcile_all(&rows);
        assert_eq!(reports.len(), 2);
        // EUR sorts first
        assert_eq!(reports[0].group.currency, "EUR");
        assert!(matches!(
            reports[0].result,
            ReconciliationResult::MajorDiscrepancy { .. }
        ));
        assert!(reports[1].is_balanced());

        println!("✅ Reconcile all test passed");
    }

    #[test]
    fn test_reconciliation_result_methods() {
        let balanced = ReconciliationResult::Balanced {
            opening_balance: 1000.0,
            total_credits: 2000.0,
            total_debits: 500.0,
            closing_balance: 2500.0,
        };

        assert!(balanced.is_balanced());
        assert!(!balanced.has_discrepancy());
        assert_eq!(balanced.difference(), 0.0);

        let minor = ReconciliationResult::MinorDiscrepancy {
            expected_balance: 2500.0,
            actual_balance: 2495.0,
            difference: 5.0,
            tolerance: 0.01,
        };

        assert!(!minor.is_balanced());
        assert!(minor.has_discrepancy());
        assert_eq!(minor.difference(), 5.0);

        println!("✅ ReconciliationResult methods test passed");
    }
}
