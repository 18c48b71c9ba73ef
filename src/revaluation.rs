// 📈 Revaluation Calculator - unrealized FX gain/loss per account/day
//
// A foreign-currency balance held overnight changes its GEL value when the
// NBG rate moves. One synthetic row per (company, account, currency, date)
// books that change.
//
// Sign convention: negative = loss (debit column), positive = gain (credit).

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RateError;
use crate::model::{Bank, GroupKey, NormalizedTransaction, RateGap, RowKind};
use crate::rates::RateLookup;

/// Adjustments smaller than half a tetri are reported as zero
pub const ROUNDING_THRESHOLD: f64 = 0.005;

/// Which position gets revalued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevaluationPolicy {
    /// Opening balance only: opening * (rate_yesterday - rate_today).
    /// Turnover is booked at today's rate and carries no FX effect.
    #[default]
    OpeningPosition,
    /// Opening at yesterday's rate plus turnover at its booked GEL amounts,
    /// against the closing balance at today's rate.
    HistoricalTurnover,
}

/// Everything one group contributes to the formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevaluationInput {
    pub opening_balance: f64,
    /// Σcredit - Σdebit
    pub turnover: f64,
    /// Σcredit_base - Σdebit_base, when every row had a base amount
    pub turnover_base: Option<f64>,
    pub rate_today: f64,
    pub rate_yesterday: f64,
}

/// Unrealized gain (positive) or loss (negative) in GEL
///
/// OpeningPosition:
///   term1 = opening * rate_yesterday
///   term2 = (opening + turnover) * rate_today
///   term3 = turnover * rate_today
///   fx    = term1 - term2 + term3
pub fn fx_adjustment(input: &RevaluationInput, policy: RevaluationPolicy) -> Option<f64> {
    let raw = match policy {
        RevaluationPolicy::OpeningPosition => {
            let term1 = input.opening_balance * input.rate_yesterday;
            let term2 = (input.opening_balance + input.turnover) * input.rate_today;
            let term3 = input.turnover * input.rate_today;
            term1 - term2 + term3
        }
        RevaluationPolicy::HistoricalTurnover => {
            let turnover_base = input.turnover_base?;
            let closing = input.opening_balance + input.turnover;
            (input.opening_balance * input.rate_yesterday + turnover_base)
                - closing * input.rate_today
        }
    };
    Some(round_small(raw))
}

fn round_small(value: f64) -> f64 {
    if value.abs() < ROUNDING_THRESHOLD {
        0.0
    } else {
        value
    }
}

/// RevaluationEntry - synthetic row, never a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevaluationEntry {
    pub kind: RowKind,
    pub bank: Bank,
    pub company: String,
    pub account_number: String,
    pub currency: String,
    pub date: NaiveDate,
    pub opening_balance: f64,
    pub closing_balance: f64,
    pub turnover: f64,
    pub rate_today: f64,
    pub rate_yesterday: f64,
    pub fx_adjustment: f64,
}

impl RevaluationEntry {
    /// Loss, as a positive GEL amount
    pub fn debit_base(&self) -> f64 {
        if self.fx_adjustment < 0.0 {
            -self.fx_adjustment
        } else {
            0.0
        }
    }

    /// Gain, as a positive GEL amount
    pub fn credit_base(&self) -> f64 {
        if self.fx_adjustment > 0.0 {
            self.fx_adjustment
        } else {
            0.0
        }
    }

    pub fn is_loss(&self) -> bool {
        self.fx_adjustment < 0.0
    }

    pub fn description(&self) -> String {
        format!(
            "FX revaluation {} {:.4} → {:.4}",
            self.currency, self.rate_yesterday, self.rate_today
        )
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            company: self.company.clone(),
            account_number: self.account_number.clone(),
            currency: self.currency.clone(),
            date: self.date,
        }
    }
}

/// A group left without a revaluation row, and the rate it lacked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevaluationGap {
    pub group: GroupKey,
    /// Either today's or yesterday's rate
    pub missing: RateGap,
}

/// Result of revaluing a whole day of rows
#[derive(Debug, Clone, Default)]
pub struct RevaluationOutcome {
    pub entries: Vec<RevaluationEntry>,
    pub gaps: Vec<RevaluationGap>,
}

pub struct RevaluationCalculator {
    pub policy: RevaluationPolicy,
    local_currency: String,
}

impl RevaluationCalculator {
    pub fn new(local_currency: &str) -> Self {
        RevaluationCalculator {
            policy: RevaluationPolicy::default(),
            local_currency: local_currency.to_uppercase(),
        }
    }

    pub fn with_policy(mut self, policy: RevaluationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Revalue one group. Ok(None) for local-currency groups.
    ///
    /// Missing yesterday's or today's rate is an error; the caller reports it.
    pub fn revalue_group(
        &self,
        rows: &[&NormalizedTransaction],
        rates: &dyn RateLookup,
    ) -> Result<Option<RevaluationEntry>, RateError> {
        let Some(first) = rows.first() else {
            return Ok(None);
        };
        if first.currency.eq_ignore_ascii_case(&self.local_currency) {
            return Ok(None);
        }

        let date = first.date;
        let currency = first.currency.as_str();
        let rate_today = rates.rate(currency, date)?;
        let rate_yesterday = rates.rate(currency, date - Duration::days(1))?;

        let turnover: f64 = rows.iter().map(|r| r.amount()).sum();
        let turnover_base = rows
            .iter()
            .map(|r| r.amount_base())
            .sum::<Option<f64>>();

        let input = RevaluationInput {
            opening_balance: first.opening_balance,
            turnover,
            turnover_base,
            rate_today,
            rate_yesterday,
        };
        let fx = fx_adjustment(&input, self.policy)
            .ok_or_else(|| RateError::not_found(currency, date))?;

        Ok(Some(RevaluationEntry {
            kind: RowKind::Revaluation,
            bank: first.bank,
            company: first.company.clone(),
            account_number: first.account_number.clone(),
            currency: first.currency.clone(),
            date,
            opening_balance: first.opening_balance,
            closing_balance: first.closing_balance,
            turnover,
            rate_today,
            rate_yesterday,
            fx_adjustment: fx,
        }))
    }

    /// Revalue every foreign group present in `rows`
    pub fn revalue(&self, rows: &[NormalizedTransaction], rates: &dyn RateLookup) -> RevaluationOutcome {
        let mut groups: BTreeMap<GroupKey, Vec<&NormalizedTransaction>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.group_key()).or_default().push(row);
        }

        let mut outcome = RevaluationOutcome::default();
        for (key, group) in groups {
            match self.revalue_group(&group, rates) {
                Ok(Some(entry)) => outcome.entries.push(entry),
                Ok(None) => {}
                Err(RateError::NotFound { currency, date }) => {
                    tracing::warn!(
                        company = %key.company,
                        account = %key.account_number,
                        %currency,
                        %date,
                        "no revaluation: rate missing"
                    );
                    outcome.gaps.push(RevaluationGap {
                        group: key,
                        missing: RateGap { currency, date },
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        company = %key.company,
                        account = %key.account_number,
                        error = %e,
                        "no revaluation"
                    );
                    let missing = RateGap {
                        currency: key.currency.clone(),
                        date: key.date,
                    };
                    outcome.gaps.push(RevaluationGap { group: key, missing });
                }
            }
        }
        outcome
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Memo;
    use crate::rates::StaticRates;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn create_test_row(
        currency: &str,
        opening: f64,
        debit: f64,
        credit: f64,
        rate: Option<f64>,
    ) -> NormalizedTransaction {
        NormalizedTransaction {
            bank: Bank::Bog,
            company: "MRG".to_string(),
            account_number: "GE29BG0000000000000001".to_string(),
            currency: currency.to_string(),
            date: date("2025-05-29"),
            entry_id: format!("E-{}-{}", debit, credit),
            debit,
            credit,
            debit_base: rate.map(|r| debit * r),
            credit_base: rate.map(|r| credit * r),
            rate,
            transaction_rate: None,
            opening_balance: opening,
            closing_balance: opening + credit - debit,
            reported_closing_balance: None,
            memo: Memo::default(),
        }
    }

    fn usd_rates(yesterday: f64, today: f64) -> StaticRates {
        StaticRates::new("GEL")
            .with("USD", date("2025-05-28"), yesterday)
            .with("USD", date("2025-05-29"), today)
    }

    #[test]
    fn test_rate_rise_on_long_position_is_a_loss() {
        // 1000 USD held, rate 2.70 → 2.72
        let input = RevaluationInput {
            opening_balance: 1000.0,
            turnover: 0.0,
            turnover_base: Some(0.0),
            rate_today: 2.72,
            rate_yesterday: 2.70,
        };
        let fx = fx_adjustment(&input, RevaluationPolicy::OpeningPosition).unwrap();
        assert!((fx - (-20.0)).abs() < 1e-9, "fx was {}", fx);

        let row = create_test_row("USD", 1000.0, 0.0, 0.0, Some(2.72));
        let entry = RevaluationCalculator::new("GEL")
            .revalue_group(&[&row], &usd_rates(2.70, 2.72))
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, RowKind::Revaluation);
        assert!((entry.debit_base() - 20.0).abs() < 1e-9);
        assert_eq!(entry.credit_base(), 0.0);
        assert!(entry.is_loss());

        println!("✅ Revaluation loss test PASSED: {:.2}", entry.fx_adjustment);
    }

    #[test]
    fn test_no_movement_no_adjustment() {
        for opening in [0.0, 1.0, 1000.0, -250.0] {
            let input = RevaluationInput {
                opening_balance: opening,
                turnover: 0.0,
                turnover_base: Some(0.0),
                rate_today: 2.71,
                rate_yesterday: 2.71,
            };
            for policy in [RevaluationPolicy::OpeningPosition, RevaluationPolicy::HistoricalTurnover] {
                assert_eq!(fx_adjustment(&input, policy), Some(0.0));
            }
        }
    }

    #[test]
    fn test_turnover_does_not_change_opening_position_result() {
        let base = RevaluationInput {
            opening_balance: 500.0,
            turnover: 0.0,
            turnover_base: None,
            rate_today: 3.00,
            rate_yesterday: 3.10,
        };
        let with_turnover = RevaluationInput {
            turnover: 240.0,
            ..base
        };
        let a = fx_adjustment(&base, RevaluationPolicy::OpeningPosition).unwrap();
        let b = fx_adjustment(&with_turnover, RevaluationPolicy::OpeningPosition).unwrap();
        assert!((a - 50.0).abs() < 1e-9, "rate fall on long position is a gain");
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_historical_turnover_policy() {
        // Opening 1000 @ 2.70, +100 booked at 2.71, closing 1100 @ 2.72
        let input = RevaluationInput {
            opening_balance: 1000.0,
            turnover: 100.0,
            turnover_base: Some(271.0),
            rate_today: 2.72,
            rate_yesterday: 2.70,
        };
        let fx = fx_adjustment(&input, RevaluationPolicy::HistoricalTurnover).unwrap();
        // 2700 + 271 - 2992 = -21
        assert!((fx - (-21.0)).abs() < 1e-9);

        let no_base = RevaluationInput {
            turnover_base: None,
            ..input
        };
        assert_eq!(fx_adjustment(&no_base, RevaluationPolicy::HistoricalTurnover), None);
    }

    #[test]
    fn test_tiny_adjustment_rounds_to_zero() {
        let input = RevaluationInput {
            opening_balance: 1.0,
            turnover: 0.0,
            turnover_base: None,
            rate_today: 2.7201,
            rate_yesterday: 2.7200,
        };
        assert_eq!(fx_adjustment(&input, RevaluationPolicy::OpeningPosition), Some(0.0));
    }

    #[test]
    fn test_missing_yesterday_rate_is_an_error() {
        let row = create_test_row("USD", 1000.0, 0.0, 0.0, Some(2.72));
        let rates = StaticRates::new("GEL").with("USD", date("2025-05-29"), 2.72);

        let err = RevaluationCalculator::new("GEL")
            .revalue_group(&[&row], &rates)
            .unwrap_err();
        assert_eq!(err, RateError::not_found("USD", date("2025-05-28")));

        println!("✅ Missing yesterday rate test PASSED");
    }

    #[test]
    fn test_local_currency_gets_no_entry() {
        let row = create_test_row("GEL", 1000.0, 10.0, 0.0, Some(1.0));
        let entry = RevaluationCalculator::new("GEL")
            .revalue_group(&[&row], &StaticRates::new("GEL"))
            .unwrap();
        assert!(entry.is_none());
    }

    #[test]
    fn test_revalue_groups_and_collects_gaps() {
        let mut eur = create_test_row("EUR", 200.0, 0.0, 0.0, None);
        eur.account_number = "GE29BG0000000000000002".to_string();
        let rows = vec![
            create_test_row("USD", 1000.0, 50.0, 0.0, Some(2.72)),
            create_test_row("USD", 1000.0, 0.0, 80.0, Some(2.72)),
            create_test_row("GEL", 300.0, 10.0, 0.0, Some(1.0)),
            eur,
        ];

        let outcome = RevaluationCalculator::new("GEL").revalue(&rows, &usd_rates(2.70, 2.72));

        assert_eq!(outcome.entries.len(), 1, "one USD group; GEL skipped; EUR has no rate");
        assert_eq!(outcome.entries[0].turnover, 30.0);
        assert!((outcome.entries[0].fx_adjustment - (-20.0)).abs() < 1e-9);
        assert_eq!(outcome.gaps.len(), 1);
        assert_eq!(outcome.gaps[0].group.currency, "EUR");
        assert_eq!(outcome.gaps[0].group.account_number, "GE29BG0000000000000002");
        assert_eq!(
            outcome.gaps[0].missing,
            RateGap {
                currency: "EUR".to_string(),
                date: date("2025-05-29")
            }
        );

        println!("✅ Revaluation grouping test PASSED");
    }

    #[test]
    fn test_missing_yesterday_rate_keeps_group_date() {
        let rows = vec![create_test_row("USD", 1000.0, 0.0, 0.0, Some(2.72))];
        let today_only = StaticRates::new("GEL").with("USD", date("2025-05-29"), 2.72);

        let outcome = RevaluationCalculator::new("GEL").revalue(&rows, &today_only);

        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.gaps.len(), 1);
        assert_eq!(outcome.gaps[0].group.date, date("2025-05-29"));
        assert_eq!(outcome.gaps[0].group.company, "MRG");
        assert_eq!(outcome.gaps[0].missing.date, date("2025-05-28"));
    }

    #[test]
    fn test_idle_day_has_nothing_to_revalue() {
        let outcome = RevaluationCalculator::new("GEL").revalue(&[], &usd_rates(2.70, 2.72));
        assert!(outcome.entries.is_empty());
        assert!(outcome.gaps.is_empty());
    }
}
