// 🏦 Data Model - banks, accounts, raw records and normalized rows
//
// Raw records keep the bank's own shape (typed where we compute with the
// value, a flat field map for the free-text memo columns). Everything past
// the normalizer works on NormalizedTransaction only.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Reporting currency. Its rate is 1.0 on every date.
pub const LOCAL_CURRENCY: &str = "GEL";

// ============================================================================
// BANKS & ACCOUNTS
// ============================================================================

/// Bank - which API a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bank {
    /// TBC Bank - SOAP API over mutual TLS
    Tbc,
    /// Bank of Georgia - REST API with OAuth2 client credentials
    Bog,
}

impl Bank {
    pub const ALL: [Bank; 2] = [Bank::Tbc, Bank::Bog];

    /// Short code used in the account registry and in reports
    pub fn code(&self) -> &'static str {
        match self {
            Bank::Tbc => "TBC",
            Bank::Bog => "BOG",
        }
    }

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            Bank::Tbc => "TBC Bank",
            Bank::Bog => "Bank of Georgia",
        }
    }

    /// SQLite table holding this bank's raw transactions
    pub fn table_name(&self) -> &'static str {
        match self {
            Bank::Tbc => "tbc_transactions",
            Bank::Bog => "bog_transactions",
        }
    }

    pub fn from_code(code: &str) -> Option<Bank> {
        match code.trim().to_uppercase().as_str() {
            "TBC" => Some(Bank::Tbc),
            "BOG" => Some(Bank::Bog),
            _ => None,
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One row of the account registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountRef {
    pub bank: Bank,
    pub company: String,
    pub currency: String,
    pub account_number: String,
}

impl AccountRef {
    pub fn new(bank: Bank, company: &str, currency: &str, account_number: &str) -> Self {
        AccountRef {
            bank,
            company: company.to_string(),
            currency: currency.to_uppercase(),
            account_number: account_number.to_string(),
        }
    }

    /// "COMPANY-ACCOUNT-CUR", used in logs and audit events
    pub fn label(&self) -> String {
        format!("{}-{}-{}", self.company, self.account_number, self.currency)
    }
}

// ============================================================================
// RAW RECORDS (bank-specific, immutable once fetched)
// ============================================================================

/// Direction of a movement relative to the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    /// TBC sends "1" for outgoing and "0" for incoming movements
    pub fn parse(flag: &str) -> Option<Direction> {
        match flag.trim().to_uppercase().as_str() {
            "1" | "D" | "DEBIT" => Some(Direction::Debit),
            "0" | "C" | "CREDIT" => Some(Direction::Credit),
            _ => None,
        }
    }
}

/// Balances of a TBC account statement for the fetched period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementBalances {
    pub opening_date: Option<NaiveDate>,
    pub opening_balance: Option<f64>,
    pub closing_date: Option<NaiveDate>,
    pub closing_balance: Option<f64>,
    pub credit_sum: Option<f64>,
    pub debit_sum: Option<f64>,
}

/// TBC account movement (GetAccountMovements)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TbcMovement {
    pub movement_id: Option<String>,
    pub value_date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub direction: Option<Direction>,
    /// Bank's own conversion, e.g. "1 USD = 2.7100 GEL"
    pub exchange_rate: Option<String>,
    /// Remaining text fields keyed by their SOAP element name
    pub fields: BTreeMap<String, String>,
    pub statement: StatementBalances,
}

/// BOG daily balance summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub balance: Option<f64>,
    pub credit_sum: f64,
    pub debit_sum: f64,
}

/// BOG statement record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BogEntry {
    pub entry_id: Option<String>,
    pub entry_date: Option<NaiveDate>,
    pub debit: Option<f64>,
    pub debit_base: Option<f64>,
    pub credit: Option<f64>,
    pub credit_base: Option<f64>,
    pub document_rate: Option<f64>,
    /// Remaining text fields keyed by their JSON path ("SenderDetails.Name")
    pub fields: BTreeMap<String, String>,
    pub summary: Option<DailySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum RawPayload {
    TbcMovement(TbcMovement),
    BogEntry(BogEntry),
}

/// RawTransaction - one record exactly as a bank returned it
///
/// Keyed by (bank, account, entry id). Stored append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub account: AccountRef,
    pub payload: RawPayload,
    pub fetched_at: DateTime<Utc>,
}

impl RawTransaction {
    pub fn new(account: AccountRef, payload: RawPayload) -> Self {
        RawTransaction {
            account,
            payload,
            fetched_at: Utc::now(),
        }
    }

    pub fn bank(&self) -> Bank {
        self.account.bank
    }

    pub fn entry_id(&self) -> Option<&str> {
        match &self.payload {
            RawPayload::TbcMovement(m) => m.movement_id.as_deref(),
            RawPayload::BogEntry(e) => e.entry_id.as_deref(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match &self.payload {
            RawPayload::TbcMovement(m) => m.value_date,
            RawPayload::BogEntry(e) => e.entry_date,
        }
    }

    /// Compute idempotency hash for duplicate detection
    ///
    /// Entry id when the bank gave one, otherwise the whole payload.
    pub fn compute_idempotency_hash(&self) -> String {
        let identity = match self.entry_id() {
            Some(id) => id.to_string(),
            None => serde_json::to_string(&self.payload).unwrap_or_default(),
        };
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}",
            self.account.bank.code(),
            self.account.account_number,
            self.account.currency,
            identity
        ));
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// EXCHANGE RATES
// ============================================================================

/// NBG reference rate for one currency on one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub date: NaiveDate,
    pub currency: String,
    pub rate: f64,
    pub quantity: f64,
    pub rate_per_unit: f64,
}

impl ExchangeRate {
    /// None unless both rate and quantity are positive and finite
    pub fn new(date: NaiveDate, currency: &str, rate: f64, quantity: f64) -> Option<Self> {
        let usable = |v: f64| v.is_finite() && v > 0.0;
        if !usable(rate) || !usable(quantity) {
            return None;
        }
        Some(ExchangeRate {
            date,
            currency: currency.to_uppercase(),
            rate,
            quantity,
            rate_per_unit: rate / quantity,
        })
    }

    pub fn local(date: NaiveDate, local_currency: &str) -> Self {
        ExchangeRate {
            date,
            currency: local_currency.to_uppercase(),
            rate: 1.0,
            quantity: 1.0,
            rate_per_unit: 1.0,
        }
    }
}

// ============================================================================
// NORMALIZED ROWS
// ============================================================================

/// Memo columns shared by both banks. None means the bank did not send it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub description: Option<String>,
    pub counterparty: Option<String>,
    pub counterparty_account: Option<String>,
    pub counterparty_tax_code: Option<String>,
    pub operation: Option<String>,
    pub operation_type: Option<String>,
    pub additional_information: Option<String>,
    pub document_number: Option<String>,
}

/// Which memo column a raw field feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoField {
    Description,
    Counterparty,
    CounterpartyAccount,
    CounterpartyTaxCode,
    Operation,
    OperationType,
    AdditionalInformation,
    DocumentNumber,
}

impl Memo {
    /// Build memo columns from raw fields through a mapping table.
    /// When several raw fields feed one column the first non-empty wins.
    pub fn from_fields(fields: &BTreeMap<String, String>, mapping: &[(&str, MemoField)]) -> Self {
        let mut memo = Memo::default();
        for (raw_name, target) in mapping {
            let Some(value) = fields.get(*raw_name).map(|v| v.trim()) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let slot = memo.slot_mut(*target);
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        memo
    }

    fn slot_mut(&mut self, field: MemoField) -> &mut Option<String> {
        match field {
            MemoField::Description => &mut self.description,
            MemoField::Counterparty => &mut self.counterparty,
            MemoField::CounterpartyAccount => &mut self.counterparty_account,
            MemoField::CounterpartyTaxCode => &mut self.counterparty_tax_code,
            MemoField::Operation => &mut self.operation,
            MemoField::OperationType => &mut self.operation_type,
            MemoField::AdditionalInformation => &mut self.additional_information,
            MemoField::DocumentNumber => &mut self.document_number,
        }
    }
}

/// Balances are per (company, account, currency, date)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub company: String,
    pub account_number: String,
    pub currency: String,
    pub date: NaiveDate,
}

/// NormalizedTransaction - bank-agnostic transaction row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub bank: Bank,
    pub company: String,
    pub account_number: String,
    pub currency: String,
    pub date: NaiveDate,
    pub entry_id: String,

    // Amounts in account currency
    pub debit: f64,
    pub credit: f64,

    // GEL equivalents; None when no rate was available
    pub debit_base: Option<f64>,
    pub credit_base: Option<f64>,

    /// NBG rate for (currency, date)
    pub rate: Option<f64>,
    /// Rate the bank itself applied, when it tells us
    pub transaction_rate: Option<f64>,

    // Group balances in account currency
    pub opening_balance: f64,
    pub closing_balance: f64,
    /// Closing balance as the bank reported it, for reconciliation
    pub reported_closing_balance: Option<f64>,

    pub memo: Memo,
}

impl NormalizedTransaction {
    /// Net movement: credit - debit
    pub fn amount(&self) -> f64 {
        self.credit - self.debit
    }

    pub fn amount_base(&self) -> Option<f64> {
        match (self.credit_base, self.debit_base) {
            (Some(c), Some(d)) => Some(c - d),
            _ => None,
        }
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

/// Distinguishes real transactions from synthetic revaluation rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowKind {
    Transaction,
    Revaluation,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Transaction => "transaction",
            RowKind::Revaluation => "revaluation",
        }
    }
}

/// Local (GEL) vs foreign currency partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurrencyClass {
    Local,
    Foreign,
}

impl CurrencyClass {
    pub fn of(currency: &str, local_currency: &str) -> Self {
        if currency.eq_ignore_ascii_case(local_currency) {
            CurrencyClass::Local
        } else {
            CurrencyClass::Foreign
        }
    }
}

/// A (currency, date) for which no reference rate could be found
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateGap {
    pub currency: String,
    pub date: NaiveDate,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bog_raw(entry_id: Option<&str>) -> RawTransaction {
        RawTransaction::new(
            AccountRef::new(Bank::Bog, "MRG", "usd", "GE00BG0000000000000001"),
            RawPayload::BogEntry(BogEntry {
                entry_id: entry_id.map(str::to_string),
                entry_date: NaiveDate::from_ymd_opt(2025, 5, 29),
                debit: Some(10.0),
                debit_base: Some(27.0),
                credit: None,
                credit_base: None,
                document_rate: Some(2.7),
                fields: BTreeMap::new(),
                summary: None,
            }),
        )
    }

    #[test]
    fn test_bank_codes_roundtrip() {
        for bank in Bank::ALL {
            assert_eq!(Bank::from_code(bank.code()), Some(bank));
        }
        assert_eq!(Bank::from_code(" tbc "), Some(Bank::Tbc));
        assert_eq!(Bank::from_code("LIBERTY"), None);
    }

    #[test]
    fn test_account_ref_uppercases_currency() {
        let account = AccountRef::new(Bank::Tbc, "BRG", "eur", "GE11TB0000000000000002");
        assert_eq!(account.currency, "EUR");
        assert_eq!(account.label(), "BRG-GE11TB0000000000000002-EUR");
    }

    #[test]
    fn test_direction_flags() {
        assert_eq!(Direction::parse("1"), Some(Direction::Debit));
        assert_eq!(Direction::parse("0"), Some(Direction::Credit));
        assert_eq!(Direction::parse("credit"), Some(Direction::Credit));
        assert_eq!(Direction::parse("2"), None);
    }

    #[test]
    fn test_idempotency_hash_uses_entry_id() {
        let a = bog_raw(Some("E-1"));
        let mut b = bog_raw(Some("E-1"));
        if let RawPayload::BogEntry(entry) = &mut b.payload {
            entry.debit = Some(99.0);
        }

        // Same key, different content: still the same record
        assert_eq!(a.compute_idempotency_hash(), b.compute_idempotency_hash());
        assert_ne!(
            a.compute_idempotency_hash(),
            bog_raw(Some("E-2")).compute_idempotency_hash()
        );
        assert_eq!(a.compute_idempotency_hash().len(), 64);
    }

    #[test]
    fn test_idempotency_hash_without_entry_id_uses_payload() {
        let a = bog_raw(None);
        let mut b = bog_raw(None);
        if let RawPayload::BogEntry(entry) = &mut b.payload {
            entry.debit = Some(11.0);
        }
        assert_ne!(a.compute_idempotency_hash(), b.compute_idempotency_hash());
    }

    #[test]
    fn test_exchange_rate_per_unit() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 29).unwrap();
        let jpy = ExchangeRate::new(date, "jpy", 1.8921, 100.0).unwrap();
        assert_eq!(jpy.currency, "JPY");
        assert!((jpy.rate_per_unit - 0.018921).abs() < 1e-12);
        assert_eq!(ExchangeRate::local(date, LOCAL_CURRENCY).rate_per_unit, 1.0);
    }

    #[test]
    fn test_exchange_rate_rejects_unusable_quantity_and_rate() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 29).unwrap();
        assert_eq!(ExchangeRate::new(date, "USD", 2.72, 0.0), None);
        assert_eq!(ExchangeRate::new(date, "USD", 2.72, -1.0), None);
        assert_eq!(ExchangeRate::new(date, "USD", 0.0, 1.0), None);
        assert_eq!(ExchangeRate::new(date, "USD", f64::NAN, 1.0), None);
        assert_eq!(ExchangeRate::new(date, "USD", 2.72, f64::INFINITY), None);
        assert!(ExchangeRate::new(date, "USD", 2.72, 1.0).is_some());
    }

    #[test]
    fn test_memo_mapping_first_non_empty_wins() {
        let mut fields = BTreeMap::new();
        fields.insert("SenderDetails.Name".to_string(), "  ".to_string());
        fields.insert("BeneficiaryDetails.Name".to_string(), "ACME LLC".to_string());
        fields.insert("DocumentNomination".to_string(), "Invoice 12".to_string());

        let mapping = [
            ("DocumentNomination", MemoField::Description),
            ("SenderDetails.Name", MemoField::Counterparty),
            ("BeneficiaryDetails.Name", MemoField::Counterparty),
        ];
        let memo = Memo::from_fields(&fields, &mapping);

        assert_eq!(memo.description.as_deref(), Some("Invoice 12"));
        assert_eq!(memo.counterparty.as_deref(), Some("ACME LLC"));
        assert_eq!(memo.operation, None);
    }

    #[test]
    fn test_currency_class() {
        assert_eq!(CurrencyClass::of("gel", LOCAL_CURRENCY), CurrencyClass::Local);
        assert_eq!(CurrencyClass::of("USD", LOCAL_CURRENCY), CurrencyClass::Foreign);
    }
}
