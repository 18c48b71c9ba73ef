// End-to-end: registry → fetch (fake bank) → SQLite → reports on disk

use bank_harmonizer::config::{Endpoints, FetchConfig, RateConfig, ReportConfig};
use bank_harmonizer::model::{StatementBalances, TbcMovement};
use bank_harmonizer::{
    db, AccountRef, AppConfig, Bank, BankClient, ClientError, ExchangeRate, OutputFormat,
    Pipeline, RateError, RateProvider, RateSource, RawPayload, RawTransaction,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

struct NbgStub {
    calls: Arc<AtomicUsize>,
}

impl RateSource for NbgStub {
    fn fetch_day(&self, day: NaiveDate) -> Result<Vec<ExchangeRate>, RateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let usd = if day == date("2025-05-29") { 2.72 } else { 2.70 };
        Ok([
            ExchangeRate::new(day, "USD", usd, 1.0),
            ExchangeRate::new(day, "JPY", 1.9, 100.0),
        ]
        .into_iter()
        .flatten()
        .collect())
    }
}

/// TBC stub: on each day, one 50 debit and one 80 credit from an opening of 100
struct TbcStub;

impl BankClient for TbcStub {
    fn bank(&self) -> Bank {
        Bank::Tbc
    }

    fn fetch(
        &self,
        account: &AccountRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawTransaction>, ClientError> {
        let mut records = Vec::new();
        for day in start.iter_days().take_while(|d| *d <= end) {
            let statement = StatementBalances {
                opening_date: Some(day),
                opening_balance: Some(100.0),
                closing_date: Some(day),
                closing_balance: Some(130.0),
                credit_sum: Some(80.0),
                debit_sum: Some(50.0),
            };
            for (n, (amount, flag)) in [(50.0, "1"), (80.0, "0")].into_iter().enumerate() {
                let mut fields = BTreeMap::new();
                fields.insert("description".to_string(), format!("Movement {}", n));
                records.push(RawTransaction::new(
                    account.clone(),
                    RawPayload::TbcMovement(TbcMovement {
                        movement_id: Some(format!("{}-{}-{}", account.account_number, day, n)),
                        value_date: Some(day),
                        amount: Some(amount),
                        direction: bank_harmonizer::Direction::parse(flag),
                        exchange_rate: None,
                        fields,
                        statement: statement.clone(),
                    }),
                ));
            }
        }
        Ok(records)
    }
}

fn write_registry(path: &Path) {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    let rows = [
        ("ID", "Account Number"),
        ("TBC USD BRG", "GE11TB0000000000000002USD"),
        ("TBC GEL BRG", "GE11TB0000000000000001GEL"),
        ("BOG USD MRG", "GE29BG0000000000000001USD"),
    ];
    for (r, (id, account)) in rows.iter().enumerate() {
        sheet.write_string(r as u32, 0, *id).unwrap();
        sheet.write_string(r as u32, 1, *account).unwrap();
    }
    workbook.save(path).unwrap();
}

fn create_pipeline(dir: &Path, calls: Arc<AtomicUsize>) -> Pipeline {
    let config = AppConfig {
        database_path: dir.join("bank_data.db"),
        registry_path: dir.join("Banks.xlsx"),
        output_dir: dir.join("reports"),
        secrets_path: None,
        local_currency: "GEL".to_string(),
        endpoints: Endpoints::default(),
        fetch: FetchConfig {
            workers: 2,
            lookback_days: 1,
            timeout_secs: 5,
        },
        rates: RateConfig::default(),
        report: ReportConfig::default(),
    };

    let store = db::open(&config.database_path).unwrap();
    let rate_conn = Connection::open(&config.database_path).unwrap();
    let rates = RateProvider::new(rate_conn, Box::new(NbgStub { calls }), "GEL").unwrap();
    Pipeline::new(config, store, rates)
}

#[test]
fn test_fetch_and_report_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_registry(&dir.path().join("Banks.xlsx"));
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = create_pipeline(dir.path(), calls.clone());

    // Only the two TBC accounts are fetched; 2 days x 2 movements each
    let summary = pipeline.fetch_bank(&TbcStub, date("2025-05-29")).unwrap();
    assert_eq!(summary.accounts, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.stored.inserted, 8);

    let daily = pipeline.build_reports(date("2025-05-29")).unwrap();
    assert_eq!(daily.reports.len(), 1);
    let report = &daily.reports[0];
    assert_eq!(report.company, "BRG");
    assert_eq!(report.local.len(), 2);
    assert_eq!(report.foreign.len(), 3);
    assert_eq!(report.combined().len(), report.local.len() + report.foreign.len());

    // closing = 100 + 80 - 50 for every row of every group
    for row in report.combined() {
        assert!((row.closing_balance - 130.0).abs() < 1e-9);
    }

    // opening 100 USD: 100 * (2.70 - 2.72) = -2 GEL
    let reval = report.foreign.iter().find(|r| r.is_revaluation()).unwrap();
    assert!((reval.amount_base().unwrap() + 2.0).abs() < 1e-6);
    assert!(daily.quality.is_empty(), "{:?}", daily.quality);

    let written = pipeline.write_reports(&daily, OutputFormat::Csv).unwrap();
    assert_eq!(written.len(), 1);
    let combined = std::fs::read_to_string(&written[0]).unwrap();
    assert!(combined.lines().next().unwrap().starts_with("Bank,Kind,Company"));
    assert_eq!(combined.lines().count(), 1 + 5);

    // Rates came from the source once per day, then from the cache
    let source_calls = calls.load(Ordering::SeqCst);
    let again = pipeline.build_reports(date("2025-05-29")).unwrap();
    assert_eq!(again.reports[0].len(), report.len());
    assert_eq!(calls.load(Ordering::SeqCst), source_calls);

    println!("✅ End-to-end test PASSED");
}

#[test]
fn test_refetch_is_idempotent_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    write_registry(&dir.path().join("Banks.xlsx"));

    {
        let pipeline = create_pipeline(dir.path(), Arc::new(AtomicUsize::new(0)));
        pipeline.fetch_bank(&TbcStub, date("2025-05-29")).unwrap();
    }

    let pipeline = create_pipeline(dir.path(), Arc::new(AtomicUsize::new(0)));
    let account = AccountRef::new(Bank::Tbc, "BRG", "USD", "GE11TB0000000000000002");

    // Forcing an overlapping window stores nothing new
    let raw = TbcStub
        .fetch(&account, date("2025-05-28"), date("2025-05-29"))
        .unwrap();
    let stats = db::insert_raw_transactions(pipeline.store(), &raw).unwrap();
    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.duplicates, 4);
    assert_eq!(db::verify_count(pipeline.store(), Bank::Tbc).unwrap(), 8);

    let next = pipeline.fetch_bank(&TbcStub, date("2025-05-30")).unwrap();
    assert_eq!(next.stored.inserted, 4);
}
