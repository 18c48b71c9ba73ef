// 📊 Report Assembler - harmonized rows per company and date
//
// Normalized transactions and revaluation entries become ReportRows with one
// shared column set. Each (company, date) report has a local (GEL) and a
// foreign partition; the combined view is their union.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data_quality::QualityIssue;
use crate::model::{Bank, CurrencyClass, GroupKey, Memo, NormalizedTransaction, RowKind};
use crate::revaluation::RevaluationEntry;

/// Column headers shared by every sheet, in order
pub const HARMONIZED_COLUMNS: &[&str] = &[
    "Bank",
    "Kind",
    "Company",
    "Account Number",
    "Currency",
    "Date",
    "Entry ID",
    "Description",
    "Counterparty",
    "Counterparty Account",
    "Counterparty Tax Code",
    "Operation",
    "Operation Type",
    "Document Number",
    "Debit",
    "Credit",
    "Amount",
    "Debit (GEL)",
    "Credit (GEL)",
    "Amount (GEL)",
    "NBG Rate",
    "Previous NBG Rate",
    "Transaction Rate",
    "Opening Balance",
    "Turnover Debit",
    "Turnover Credit",
    "Closing Balance",
    "Additional Information",
];

/// One spreadsheet cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    fn text(value: &str) -> Cell {
        Cell::Text(value.to_string())
    }

    fn opt_text(value: &Option<String>) -> Cell {
        value.as_deref().map_or(Cell::Empty, Cell::text)
    }

    fn opt_number(value: Option<f64>) -> Cell {
        value.map_or(Cell::Empty, Cell::Number)
    }

    /// Plain string for CSV output
    pub fn render(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => format!("{:.4}", n)
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string(),
            Cell::Empty => String::new(),
        }
    }
}

/// ReportRow - one harmonized row, transaction or revaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub kind: RowKind,
    pub bank: Bank,
    pub company: String,
    pub account_number: String,
    pub currency: String,
    pub date: NaiveDate,
    pub entry_id: Option<String>,
    pub memo: Memo,
    pub debit: Option<f64>,
    pub credit: Option<f64>,
    pub debit_base: Option<f64>,
    pub credit_base: Option<f64>,
    pub rate: Option<f64>,
    pub previous_rate: Option<f64>,
    pub transaction_rate: Option<f64>,
    pub opening_balance: f64,
    pub turnover_debit: f64,
    pub turnover_credit: f64,
    pub closing_balance: f64,
}

impl ReportRow {
    fn from_transaction(tx: &NormalizedTransaction, turnover: &Turnover) -> Self {
        ReportRow {
            kind: RowKind::Transaction,
            bank: tx.bank,
            company: tx.company.clone(),
            account_number: tx.account_number.clone(),
            currency: tx.currency.clone(),
            date: tx.date,
            entry_id: Some(tx.entry_id.clone()),
            memo: tx.memo.clone(),
            debit: Some(tx.debit),
            credit: Some(tx.credit),
            debit_base: tx.debit_base,
            credit_base: tx.credit_base,
            rate: tx.rate,
            previous_rate: None,
            transaction_rate: tx.transaction_rate,
            opening_balance: tx.opening_balance,
            turnover_debit: turnover.debit,
            turnover_credit: turnover.credit,
            closing_balance: tx.closing_balance,
        }
    }

    fn from_revaluation(entry: &RevaluationEntry, turnover: &Turnover) -> Self {
        ReportRow {
            kind: RowKind::Revaluation,
            bank: entry.bank,
            company: entry.company.clone(),
            account_number: entry.account_number.clone(),
            currency: entry.currency.clone(),
            date: entry.date,
            entry_id: None,
            memo: Memo {
                description: Some(entry.description()),
                operation: Some("FX revaluation".to_string()),
                ..Memo::default()
            },
            debit: None,
            credit: None,
            debit_base: Some(entry.debit_base()),
            credit_base: Some(entry.credit_base()),
            rate: Some(entry.rate_today),
            previous_rate: Some(entry.rate_yesterday),
            transaction_rate: None,
            opening_balance: entry.opening_balance,
            turnover_debit: turnover.debit,
            turnover_credit: turnover.credit,
            closing_balance: entry.closing_balance,
        }
    }

    pub fn is_revaluation(&self) -> bool {
        self.kind == RowKind::Revaluation
    }

    pub fn amount(&self) -> Option<f64> {
        match (self.credit, self.debit) {
            (Some(c), Some(d)) => Some(c - d),
            _ => None,
        }
    }

    pub fn amount_base(&self) -> Option<f64> {
        match (self.credit_base, self.debit_base) {
            (Some(c), Some(d)) => Some(c - d),
            _ => None,
        }
    }

    /// (company, account, currency, date, kind, entry id)
    fn sort_key(&self) -> (&str, &str, &str, NaiveDate, RowKind, &str) {
        (
            &self.company,
            &self.account_number,
            &self.currency,
            self.date,
            self.kind,
            self.entry_id.as_deref().unwrap_or(""),
        )
    }

    /// Cells in HARMONIZED_COLUMNS order
    pub fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.bank.code()),
            Cell::text(self.kind.as_str()),
            Cell::text(&self.company),
            Cell::text(&self.account_number),
            Cell::text(&self.currency),
            Cell::Text(self.date.format("%Y-%m-%d").to_string()),
            Cell::opt_text(&self.entry_id),
            Cell::opt_text(&self.memo.description),
            Cell::opt_text(&self.memo.counterparty),
            Cell::opt_text(&self.memo.counterparty_account),
            Cell::opt_text(&self.memo.counterparty_tax_code),
            Cell::opt_text(&self.memo.operation),
            Cell::opt_text(&self.memo.operation_type),
            Cell::opt_text(&self.memo.document_number),
            Cell::opt_number(self.debit),
            Cell::opt_number(self.credit),
            Cell::opt_number(self.amount()),
            Cell::opt_number(self.debit_base),
            Cell::opt_number(self.credit_base),
            Cell::opt_number(self.amount_base()),
            Cell::opt_number(self.rate),
            Cell::opt_number(self.previous_rate),
            Cell::opt_number(self.transaction_rate),
            Cell::Number(self.opening_balance),
            Cell::Number(self.turnover_debit),
            Cell::Number(self.turnover_credit),
            Cell::Number(self.closing_balance),
            Cell::opt_text(&self.memo.additional_information),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Turnover {
    debit: f64,
    credit: f64,
}

/// Report - everything for one company on one date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub company: String,
    pub date: NaiveDate,
    pub local: Vec<ReportRow>,
    pub foreign: Vec<ReportRow>,
    pub quality: Vec<QualityIssue>,
}

impl Report {
    /// local ∪ foreign, in row order
    pub fn combined(&self) -> Vec<&ReportRow> {
        let mut rows: Vec<&ReportRow> = self.local.iter().chain(self.foreign.iter()).collect();
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        rows
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.foreign.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revaluation_count(&self) -> usize {
        self.local
            .iter()
            .chain(self.foreign.iter())
            .filter(|r| r.is_revaluation())
            .count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {}: {} local, {} foreign, {} revaluation, {} issues",
            self.company,
            self.date,
            self.local.len(),
            self.foreign.len(),
            self.revaluation_count(),
            self.quality.len()
        )
    }
}

pub struct ReportAssembler {
    local_currency: String,
}

impl ReportAssembler {
    pub fn new(local_currency: &str) -> Self {
        ReportAssembler {
            local_currency: local_currency.to_uppercase(),
        }
    }

    /// Group rows by (company, date) and split by currency class
    pub fn assemble(
        &self,
        transactions: &[NormalizedTransaction],
        revaluations: &[RevaluationEntry],
    ) -> Vec<Report> {
        let mut turnovers: BTreeMap<GroupKey, Turnover> = BTreeMap::new();
        for tx in transactions {
            let t = turnovers.entry(tx.group_key()).or_default();
            t.debit += tx.debit;
            t.credit += tx.credit;
        }

        let rows = transactions
            .iter()
            .map(|tx| {
                let turnover = turnovers.get(&tx.group_key()).copied().unwrap_or_default();
                ReportRow::from_transaction(tx, &turnover)
            })
            .chain(revaluations.iter().map(|entry| {
                let turnover = turnovers.get(&entry.group_key()).copied().unwrap_or_default();
                ReportRow::from_revaluation(entry, &turnover)
            }));

        let mut reports: BTreeMap<(String, NaiveDate), Report> = BTreeMap::new();
        for row in rows {
            let report = reports
                .entry((row.company.clone(), row.date))
                .or_insert_with(|| Report {
                    company: row.company.clone(),
                    date: row.date,
                    local: Vec::new(),
                    foreign: Vec::new(),
                    quality: Vec::new(),
                });
            match CurrencyClass::of(&row.currency, &self.local_currency) {
                CurrencyClass::Local => report.local.push(row),
                CurrencyClass::Foreign => report.foreign.push(row),
            }
        }

        let mut reports: Vec<Report> = reports.into_values().collect();
        for report in &mut reports {
            report.local.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            report.foreign.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        }
        reports
    }
}

// ============================================================================
// TESTS
// ============================================================================
