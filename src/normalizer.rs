// 🔀 Transaction Normalizer - two bank schemas into one row shape
//
// Each bank gets a strategy that validates its raw records and maps them
// into an Extracted record. Group balances and GEL amounts are computed the
// same way for both banks afterwards.

use std::collections::BTreeMap;

use crate::error::{NormalizeError, RateError};
use crate::model::{
    Bank, BogEntry, Direction, GroupKey, Memo, MemoField, NormalizedTransaction, RateGap,
    RawPayload, RawTransaction, TbcMovement,
};
use crate::rates::RateLookup;

// ============================================================================
// FIELD TABLES
// ============================================================================

/// TBC movement element → memo column
pub const TBC_MEMO_FIELDS: &[(&str, MemoField)] = &[
    ("description", MemoField::Description),
    ("partnerName", MemoField::Counterparty),
    ("taxpayerName", MemoField::Counterparty),
    ("partnerAccountNumber", MemoField::CounterpartyAccount),
    ("partnerTaxCode", MemoField::CounterpartyTaxCode),
    ("taxpayerCode", MemoField::CounterpartyTaxCode),
    ("transactionType", MemoField::Operation),
    ("operationCode", MemoField::OperationType),
    ("additionalInformation", MemoField::AdditionalInformation),
    ("documentNumber", MemoField::DocumentNumber),
];

/// BOG record field (JSON path) → memo column
pub const BOG_MEMO_FIELDS: &[(&str, MemoField)] = &[
    ("DocumentNomination", MemoField::Description),
    ("EntryComment", MemoField::Description),
    ("SenderDetails.Name", MemoField::Counterparty),
    ("BeneficiaryDetails.Name", MemoField::Counterparty),
    ("SenderDetails.AccountNumber", MemoField::CounterpartyAccount),
    ("BeneficiaryDetails.AccountNumber", MemoField::CounterpartyAccount),
    ("SenderDetails.Inn", MemoField::CounterpartyTaxCode),
    ("BeneficiaryDetails.Inn", MemoField::CounterpartyTaxCode),
    ("EntryComment", MemoField::Operation),
    ("DocumentProductGroup", MemoField::OperationType),
    ("DocumentInformation", MemoField::AdditionalInformation),
    ("EntryDocumentNumber", MemoField::DocumentNumber),
];

// ============================================================================
// STRATEGY TRAIT
// ============================================================================

/// One raw record after validation, before group balances
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub entry_id: String,
    pub date: chrono::NaiveDate,
    pub debit: f64,
    pub credit: f64,
    /// GEL amounts the bank itself reported
    pub debit_base: Option<f64>,
    pub credit_base: Option<f64>,
    pub transaction_rate: Option<f64>,
    pub reported_opening: Option<f64>,
    pub reported_closing: Option<f64>,
    pub memo: Memo,
}

/// Normalized rows plus the rates that were missing while building them
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub rows: Vec<NormalizedTransaction>,
    pub gaps: Vec<RateGap>,
}

pub trait Normalizer {
    fn bank(&self) -> Bank;

    /// Validate one raw record. Fails on the first missing required field.
    fn extract(&self, raw: &RawTransaction) -> Result<Extracted, NormalizeError>;

    /// Normalize one account's batch. Any invalid record fails the batch.
    fn normalize(
        &self,
        batch: &[RawTransaction],
        rates: &dyn RateLookup,
        local_currency: &str,
    ) -> Result<NormalizedBatch, NormalizeError> {
        let mut extracted = Vec::with_capacity(batch.len());
        for raw in batch {
            if raw.bank() != self.bank() {
                return Err(NormalizeError::WrongBank {
                    bank: self.bank(),
                    found: raw.bank(),
                });
            }
            extracted.push((raw, self.extract(raw)?));
        }
        assemble(self.bank(), extracted, rates, local_currency)
    }
}

/// Pick the strategy for a bank
pub fn get_normalizer(bank: Bank) -> Box<dyn Normalizer> {
    match bank {
        Bank::Tbc => Box::new(TbcNormalizer),
        Bank::Bog => Box::new(BogNormalizer),
    }
}

fn missing(bank: Bank, raw: &RawTransaction, field: &'static str) -> NormalizeError {
    NormalizeError::MissingField {
        bank,
        entry: raw
            .entry_id()
            .map(str::to_string)
            .unwrap_or_else(|| raw.account.label()),
        field,
    }
}

// ============================================================================
// TBC
// ============================================================================

pub struct TbcNormalizer;

impl TbcNormalizer {
    fn movement<'a>(&self, raw: &'a RawTransaction) -> Result<&'a TbcMovement, NormalizeError> {
        match &raw.payload {
            RawPayload::TbcMovement(m) => Ok(m),
            RawPayload::BogEntry(_) => Err(NormalizeError::WrongBank {
                bank: Bank::Tbc,
                found: Bank::Bog,
            }),
        }
    }
}

impl Normalizer for TbcNormalizer {
    fn bank(&self) -> Bank {
        Bank::Tbc
    }

    fn extract(&self, raw: &RawTransaction) -> Result<Extracted, NormalizeError> {
        let m = self.movement(raw)?;
        let entry_id = m
            .movement_id
            .clone()
            .ok_or_else(|| missing(Bank::Tbc, raw, "movementId"))?;
        let date = m.value_date.ok_or_else(|| missing(Bank::Tbc, raw, "valueDate"))?;
        let amount = m.amount.ok_or_else(|| missing(Bank::Tbc, raw, "amount"))?;
        let direction = m.direction.ok_or_else(|| missing(Bank::Tbc, raw, "debitCredit"))?;

        let (debit, credit) = match direction {
            Direction::Debit => (amount.abs(), 0.0),
            Direction::Credit => (0.0, amount.abs()),
        };

        let reported_opening = m.statement.opening_balance;
        let reported_closing = m.statement.closing_balance;
        if reported_opening.is_none() && reported_closing.is_none() {
            return Err(missing(Bank::Tbc, raw, "openingBalance"));
        }

        Ok(Extracted {
            entry_id,
            date,
            debit,
            credit,
            debit_base: None,
            credit_base: None,
            transaction_rate: m.exchange_rate.as_deref().and_then(parse_tbc_rate),
            reported_opening,
            reported_closing,
            memo: Memo::from_fields(&m.fields, TBC_MEMO_FIELDS),
        })
    }
}

/// "1 USD = 2.7100 GEL" → 2.71 (per unit of the left side)
pub fn parse_tbc_rate(text: &str) -> Option<f64> {
    let (left, right) = text.split_once('=')?;
    let units: f64 = left.split_whitespace().next()?.replace(',', ".").parse().ok()?;
    let value: f64 = right.split_whitespace().next()?.replace(',', ".").parse().ok()?;
    if units == 0.0 {
        return None;
    }
    Some(value / units)
}

// ============================================================================
// BOG
// ============================================================================

pub struct BogNormalizer;

impl BogNormalizer {
    fn entry<'a>(&self, raw: &'a RawTransaction) -> Result<&'a BogEntry, NormalizeError> {
        match &raw.payload {
            RawPayload::BogEntry(e) => Ok(e),
            RawPayload::TbcMovement(_) => Err(NormalizeError::WrongBank {
                bank: Bank::Bog,
                found: Bank::Tbc,
            }),
        }
    }
}

impl Normalizer for BogNormalizer {
    fn bank(&self) -> Bank {
        Bank::Bog
    }

    fn extract(&self, raw: &RawTransaction) -> Result<Extracted, NormalizeError> {
        let e = self.entry(raw)?;
        let entry_id = e
            .entry_id
            .clone()
            .ok_or_else(|| missing(Bank::Bog, raw, "EntryId"))?;
        let date = e.entry_date.ok_or_else(|| missing(Bank::Bog, raw, "EntryDate"))?;
        if e.debit.is_none() && e.credit.is_none() {
            return Err(missing(Bank::Bog, raw, "EntryAmount"));
        }

        // Opening is derived from the day's closing and turnover
        let summary = e
            .summary
            .as_ref()
            .ok_or_else(|| missing(Bank::Bog, raw, "DailySummaries"))?;
        let closing = summary
            .balance
            .ok_or_else(|| missing(Bank::Bog, raw, "Balance"))?;
        let opening = closing - summary.credit_sum + summary.debit_sum;

        Ok(Extracted {
            entry_id,
            date,
            debit: e.debit.unwrap_or(0.0).abs(),
            credit: e.credit.unwrap_or(0.0).abs(),
            debit_base: e.debit_base.map(f64::abs),
            credit_base: e.credit_base.map(f64::abs),
            transaction_rate: e.document_rate.filter(|r| *r > 0.0),
            reported_opening: Some(opening),
            reported_closing: Some(closing),
            memo: Memo::from_fields(&e.fields, BOG_MEMO_FIELDS),
        })
    }
}

// ============================================================================
// SHARED ASSEMBLY
// ============================================================================

struct GroupBalance {
    opening: f64,
    closing: f64,
    reported_closing: Option<f64>,
}

fn group_key(raw: &RawTransaction, ex: &Extracted) -> GroupKey {
    GroupKey {
        company: raw.account.company.clone(),
        account_number: raw.account.account_number.clone(),
        currency: raw.account.currency.clone(),
        date: ex.date,
    }
}

/// Balances per (company, account, currency, date)
fn group_balances(
    bank: Bank,
    extracted: &[(&RawTransaction, Extracted)],
) -> Result<BTreeMap<GroupKey, GroupBalance>, NormalizeError> {
    let mut groups: BTreeMap<GroupKey, Vec<&Extracted>> = BTreeMap::new();
    for (raw, ex) in extracted {
        groups.entry(group_key(raw, ex)).or_default().push(ex);
    }

    let mut balances = BTreeMap::new();
    for (key, rows) in groups {
        let turnover: f64 = rows.iter().map(|r| r.credit - r.debit).sum();
        let reported_closing = rows.iter().find_map(|r| r.reported_closing);
        let opening = match rows.iter().find_map(|r| r.reported_opening) {
            Some(opening) => opening,
            None => match reported_closing {
                Some(closing) => closing - turnover,
                None => {
                    return Err(NormalizeError::MissingField {
                        bank,
                        entry: key.account_number.clone(),
                        field: "openingBalance",
                    })
                }
            },
        };
        balances.insert(
            key,
            GroupBalance {
                opening,
                closing: opening + turnover,
                reported_closing,
            },
        );
    }
    Ok(balances)
}

fn assemble(
    bank: Bank,
    extracted: Vec<(&RawTransaction, Extracted)>,
    rates: &dyn RateLookup,
    local_currency: &str,
) -> Result<NormalizedBatch, NormalizeError> {
    let balances = group_balances(bank, &extracted)?;

    let mut batch = NormalizedBatch::default();
    for (raw, ex) in extracted {
        let Some(balance) = balances.get(&group_key(raw, &ex)) else {
            continue;
        };

        let rate = if raw.account.currency.eq_ignore_ascii_case(local_currency) {
            Some(1.0)
        } else {
            match rates.rate(&raw.account.currency, ex.date) {
                Ok(rate) => Some(rate),
                Err(err) => {
                    if !matches!(err, RateError::NotFound { .. }) {
                        tracing::warn!(currency = %raw.account.currency, date = %ex.date, error = %err, "rate lookup failed");
                    }
                    let gap = RateGap {
                        currency: raw.account.currency.clone(),
                        date: ex.date,
                    };
                    if !batch.gaps.contains(&gap) {
                        batch.gaps.push(gap);
                    }
                    None
                }
            }
        };

        batch.rows.push(NormalizedTransaction {
            bank,
            company: raw.account.company.clone(),
            account_number: raw.account.account_number.clone(),
            currency: raw.account.currency.clone(),
            date: ex.date,
            entry_id: ex.entry_id,
            debit: ex.debit,
            credit: ex.credit,
            debit_base: ex.debit_base.or_else(|| rate.map(|r| ex.debit * r)),
            credit_base: ex.credit_base.or_else(|| rate.map(|r| ex.credit * r)),
            rate,
            transaction_rate: ex.transaction_rate,
            opening_balance: balance.opening,
            closing_balance: balance.closing,
            reported_closing_balance: balance.reported_closing,
            memo: ex.memo,
        });
    }

    Ok(batch)
}

// ============================================================================
// TESTS
// ============================================================================
