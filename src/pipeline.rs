// 🔄 Pipeline - fetch → store → normalize → revalue → report
//
// One parameterized pipeline for both banks; the bank-specific parts are
// the client and the normalizer strategy.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::clients::BankClient;
use crate::config::AppConfig;
use crate::data_quality::{DataQualityEngine, QualityReport};
use crate::db::{self, Event, InsertStats};
use crate::error::ClientError;
use crate::export::{get_writer, OutputFormat};
use crate::model::{AccountRef, Bank, NormalizedTransaction, RawTransaction};
use crate::normalizer::get_normalizer;
use crate::rates::{BackfillStats, NbgRateSource, RateProvider};
use crate::reconciliation::ReconciliationEngine;
use crate::registry;
use crate::report::{Report, ReportAssembler};
use crate::revaluation::RevaluationCalculator;

const ACTOR: &str = "pipeline";

/// One account to fetch over [start, end]
#[derive(Debug, Clone, PartialEq)]
pub struct FetchJob {
    pub account: AccountRef,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Outcome of fetching one bank
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stored: InsertStats,
    pub quality: QualityReport,
}

impl FetchSummary {
    pub fn summary(&self) -> String {
        format!(
            "{} accounts ({} ok, {} failed), {} new records, {} duplicates skipped",
            self.accounts,
            self.succeeded,
            self.failed,
            self.stored.inserted,
            self.stored.duplicates
        )
    }
}

/// Reports for one date plus every issue found while building them
#[derive(Debug)]
pub struct DailyReports {
    pub date: NaiveDate,
    pub reports: Vec<Report>,
    pub quality: QualityReport,
}

pub struct Pipeline {
    config: AppConfig,
    store: Connection,
    rates: RateProvider,
}

impl Pipeline {
    /// Open the store and a rate provider backed by NBG
    pub fn open(config: AppConfig) -> Result<Self> {
        let store = db::open(&config.database_path)?;

        // The rate cache gets its own connection; it is shared across threads
        let rate_conn = Connection::open(&config.database_path).with_context(|| {
            format!("Failed to open rate cache {}", config.database_path.display())
        })?;
        let source = NbgRateSource::new(&config.endpoints.nbg_url, config.timeout())?;
        let rates = RateProvider::new(rate_conn, Box::new(source), &config.local_currency)?
            .with_fallback(config.rates.fallback);

        Ok(Pipeline::new(config, store, rates))
    }

    pub fn new(config: AppConfig, store: Connection, rates: RateProvider) -> Self {
        Pipeline {
            config,
            store,
            rates,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Connection {
        &self.store
    }

    pub fn rates(&self) -> &RateProvider {
        &self.rates
    }

    // ========================================================================
    // FETCH
    // ========================================================================

    /// Resume each account the day after its last run, or look back
    /// `fetch.lookback_days` on the first run. Up-to-date accounts are skipped.
    pub fn plan(&self, accounts: &[AccountRef], end: NaiveDate) -> Result<Vec<FetchJob>> {
        let mut jobs = Vec::new();
        for account in accounts {
            let start = match db::last_run_date(&self.store, account)? {
                Some(last) => last + Duration::days(1),
                None => end - Duration::days(self.config.fetch.lookback_days),
            };
            if start > end {
                tracing::debug!(account = %account.label(), "already up to date");
                continue;
            }
            jobs.push(FetchJob {
                account: account.clone(),
                start,
                end,
            });
        }
        Ok(jobs)
    }

    /// Fetch every registry account of the client's bank
    ///
    /// An unreadable registry yields an empty result for the bank.
    pub fn fetch_bank(&self, client: &dyn BankClient, end: NaiveDate) -> Result<FetchSummary> {
        let accounts = match registry::read_accounts(&self.config.registry_path) {
            Ok(all) => registry::accounts_for_bank(&all, client.bank()),
            Err(e) => {
                tracing::error!(bank = %client.bank(), error = %e, "account registry unusable");
                return Ok(FetchSummary::default());
            }
        };
        self.fetch_accounts(client, &accounts, end)
    }

    pub fn fetch_accounts(
        &self,
        client: &dyn BankClient,
        accounts: &[AccountRef],
        end: NaiveDate,
    ) -> Result<FetchSummary> {
        let bank = client.bank();
        let jobs = self.plan(accounts, end)?;
        tracing::info!(bank = %bank, accounts = accounts.len(), jobs = jobs.len(), "fetch started");

        let results = run_bounded(&jobs, self.config.fetch.workers, |job| {
            client.fetch(&job.account, job.start, job.end)
        });

        let mut summary = FetchSummary {
            accounts: jobs.len(),
            ..FetchSummary::default()
        };
        let mut fetched: Vec<RawTransaction> = Vec::new();
        let mut done: Vec<&FetchJob> = Vec::new();

        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(records) => {
                    tracing::info!(account = %job.account.label(), records = records.len(), "account fetched");
                    summary.succeeded += 1;
                    fetched.extend(records);
                    done.push(job);
                }
                Err(e) => {
                    tracing::warn!(account = %job.account.label(), error = %e, "account fetch failed, skipped");
                    summary.failed += 1;
                    summary.quality.add_fetch_failure(&job.account, &e.to_string());
                    self.record_failure(job, &e)?;
                }
            }
        }

        sort_for_storage(&mut fetched);
        summary.stored = db::insert_raw_transactions(&self.store, &fetched)?;

        for job in done {
            db::update_last_run_date(&self.store, &job.account, job.end)?;
        }

        db::insert_event(
            &self.store,
            &Event::new(
                "FetchCompleted",
                "bank",
                bank.code(),
                serde_json::json!({
                    "end": end.to_string(),
                    "accounts": summary.accounts,
                    "failed": summary.failed,
                    "inserted": summary.stored.inserted,
                    "duplicates": summary.stored.duplicates,
                }),
                ACTOR,
            ),
        )?;

        tracing::info!(bank = %bank, "{}", summary.summary());
        Ok(summary)
    }

    fn record_failure(&self, job: &FetchJob, error: &ClientError) -> Result<()> {
        db::insert_event(
            &self.store,
            &Event::new(
                "FetchFailed",
                "account",
                &job.account.label(),
                serde_json::json!({
                    "bank": job.account.bank.code(),
                    "start": job.start.to_string(),
                    "end": job.end.to_string(),
                    "error": error.to_string(),
                }),
                ACTOR,
            ),
        )
    }

    // ========================================================================
    // RATES
    // ========================================================================

    pub fn backfill_rates(&self, start: Option<NaiveDate>, end: NaiveDate) -> Result<BackfillStats> {
        Ok(self.rates.backfill(start, end)?)
    }

    // ========================================================================
    // REPORTS
    // ========================================================================

    /// Dates with at least one stored record
    pub fn report_dates(&self) -> Result<Vec<NaiveDate>> {
        db::raw_dates(&self.store)
    }

    /// Normalize, reconcile and revalue everything stored for `date`
    pub fn build_reports(&self, date: NaiveDate) -> Result<DailyReports> {
        let local = self.config.local_currency.as_str();
        let mut quality = QualityReport::new();
        let mut rows: Vec<NormalizedTransaction> = Vec::new();

        for bank in Bank::ALL {
            let raw = db::load_raw_transactions(&self.store, bank, date, date)?;
            let normalizer = get_normalizer(bank);

            for (account, batch) in group_by_account(raw) {
                match normalizer.normalize(&batch, &self.rates, local) {
                    Ok(normalized) => {
                        for gap in &normalized.gaps {
                            quality.add_rate_gap(gap);
                        }
                        rows.extend(normalized.rows);
                    }
                    Err(e) => {
                        tracing::warn!(account = %account.label(), %date, error = %e, "account dropped from report");
                        quality.add_normalization_failure(&account, date, &e.to_string());
                    }
                }
            }
        }

        for reconciliation in ReconciliationEngine::new().reconcile_all(&rows) {
            quality.add_reconciliation(&reconciliation);
        }
        quality.extend(DataQualityEngine::new().check_rows(&rows));

        let outcome = RevaluationCalculator::new(local)
            .with_policy(self.config.report.revaluation)
            .revalue(&rows, &self.rates);
        for gap in &outcome.gaps {
            quality.add_revaluation_gap(&gap.group, &gap.missing);
        }

        let mut reports = ReportAssembler::new(local).assemble(&rows, &outcome.entries);
        for report in &mut reports {
            report.quality = quality.issues_for(&report.company, date);
        }

        if !quality.is_empty() {
            tracing::warn!(%date, "{}", quality.summary());
            for issue in &quality.issues {
                tracing::debug!(
                    severity = %issue.severity,
                    category = %issue.category,
                    subject = %issue.subject,
                    "{}",
                    issue.message
                );
            }
        }
        tracing::info!(
            %date,
            reports = reports.len(),
            rows = rows.len(),
            revaluations = outcome.entries.len(),
            "reports built"
        );

        Ok(DailyReports {
            date,
            reports,
            quality,
        })
    }

    /// Write every report with the given format; returns the files written
    pub fn write_reports(&self, daily: &DailyReports, format: OutputFormat) -> Result<Vec<PathBuf>> {
        let writer = get_writer(format);
        let mut written = Vec::with_capacity(daily.reports.len());

        for report in &daily.reports {
            let path = writer.write(report, &self.config.output_dir)?;
            tracing::debug!(company = %report.company, "{}", report.summary());
            db::insert_event(
                &self.store,
                &Event::new(
                    "ReportWritten",
                    "report",
                    &format!("{}-{}", report.company, report.date),
                    serde_json::json!({
                        "path": path.display().to_string(),
                        "rows": report.len(),
                        "revaluations": report.revaluation_count(),
                        "issues": report.quality.len(),
                    }),
                    ACTOR,
                ),
            )?;
            written.push(path);
        }

        Ok(written)
    }
}

/// One batch per account, in account order
fn group_by_account(raw: Vec<RawTransaction>) -> BTreeMap<AccountRef, Vec<RawTransaction>> {
    let mut batches: BTreeMap<AccountRef, Vec<RawTransaction>> = BTreeMap::new();
    for tx in raw {
        batches.entry(tx.account.clone()).or_default().push(tx);
    }
    batches
}

/// (bank, company, account, currency, date, entry id) so stored order never
/// depends on which worker finished first
fn sort_for_storage(records: &mut [RawTransaction]) {
    records.sort_by(|a, b| {
        (&a.account, a.date(), a.entry_id()).cmp(&(&b.account, b.date(), b.entry_id()))
    });
}

/// Run `f` over `items` on at most `workers` scoped threads
///
/// Results come back in item order.
pub fn run_bounded<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = workers.clamp(1, items.len().max(1));
    if workers == 1 {
        return items.iter().map(&f).collect();
    }

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(items.len()));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(idx) else {
                    break;
                };
                let result = f(item);
                if let Ok(mut results) = results.lock() {
                    results.push((idx, result));
                }
            });
        }
    });

    let mut results = match results.into_inner() {
        Ok(results) => results,
        Err(poisoned) => poisoned.into_inner(),
    };
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, r)| r).collect()
}
