// 💱 Rate Provider - NBG reference rates, memoized and cached in SQLite
//
// Lookup order: in-memory memo → SQLite cache → NBG endpoint. A cache miss
// persists the whole day the source returned, so one fetch serves every
// currency for that date.

use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::db;
use crate::error::RateError;
use crate::model::ExchangeRate;

/// Days fetched by `backfill` when the cache is empty
pub const DEFAULT_BACKFILL_DAYS: i64 = 30;

// ============================================================================
// TRAITS
// ============================================================================

/// Where rates come from when the cache misses
pub trait RateSource: Send + Sync {
    /// All published rates for one day. An empty vec means nothing published.
    fn fetch_day(&self, date: NaiveDate) -> Result<Vec<ExchangeRate>, RateError>;
}

/// What the normalizer and revaluation calculator need: one rate per
/// (currency, date), or NotFound.
pub trait RateLookup {
    fn rate(&self, currency: &str, date: NaiveDate) -> Result<f64, RateError>;
}

/// What to do when a date has no rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RateFallback {
    /// Missing is missing
    #[default]
    Strict,
    /// Walk back up to `days` earlier dates
    PriorDays { days: u32 },
}

/// A rate together with the date it was actually taken from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRate {
    pub rate: f64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub fetched_days: usize,
    pub cached_days: usize,
    pub missing_days: Vec<NaiveDate>,
}

// ============================================================================
// NBG SOURCE
// ============================================================================

pub const NBG_RATES_URL: &str =
    "https://nbg.gov.ge/gw/api/ct/monetarypolicy/currencies/en/json/";

#[derive(Debug, Deserialize)]
struct NbgDay {
    #[serde(default)]
    currencies: Vec<NbgCurrency>,
}

#[derive(Debug, Deserialize)]
struct NbgCurrency {
    code: String,
    quantity: f64,
    rate: f64,
}

/// National Bank of Georgia JSON endpoint (no authentication)
pub struct NbgRateSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl NbgRateSource {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, RateError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RateError::Source(e.to_string()))?;
        Ok(NbgRateSource {
            client,
            base_url: base_url.to_string(),
        })
    }
}

impl RateSource for NbgRateSource {
    fn fetch_day(&self, date: NaiveDate) -> Result<Vec<ExchangeRate>, RateError> {
        let day = date.format("%Y-%m-%d").to_string();
        let body = self
            .client
            .get(&self.base_url)
            .query(&[("date", day.as_str())])
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| RateError::Source(e.to_string()))?;

        parse_nbg_response(date, &body)
    }
}

/// Parse the NBG response body: `[{"date": ..., "currencies": [...]}]`
pub fn parse_nbg_response(date: NaiveDate, body: &str) -> Result<Vec<ExchangeRate>, RateError> {
    let days: Vec<NbgDay> =
        serde_json::from_str(body).map_err(|e| RateError::Source(format!("bad NBG JSON: {}", e)))?;

    Ok(days
        .into_iter()
        .flat_map(|day| day.currencies)
        .filter_map(|c| {
            let rate = ExchangeRate::new(date, &c.code, c.rate, c.quantity);
            if rate.is_none() {
                tracing::warn!(
                    %date,
                    currency = %c.code,
                    rate = c.rate,
                    quantity = c.quantity,
                    "unusable NBG rate skipped"
                );
            }
            rate
        })
        .collect())
}

// ============================================================================
// PROVIDER
// ============================================================================

/// RateProvider - memoized, cached rate lookups shared across workers
pub struct RateProvider {
    local_currency: String,
    source: Box<dyn RateSource>,
    fallback: RateFallback,
    cache: Mutex<Connection>,
    memo: RwLock<HashMap<NaiveDate, HashMap<String, f64>>>,
    /// Dates the source had nothing for during this run
    misses: RwLock<HashSet<NaiveDate>>,
}

impl RateProvider {
    pub fn new(
        conn: Connection,
        source: Box<dyn RateSource>,
        local_currency: &str,
    ) -> Result<Self, RateError> {
        db::setup_rate_cache(&conn)?;
        Ok(RateProvider {
            local_currency: local_currency.to_uppercase(),
            source,
            fallback: RateFallback::Strict,
            cache: Mutex::new(conn),
            memo: RwLock::new(HashMap::new()),
            misses: RwLock::new(HashSet::new()),
        })
    }

    pub fn with_fallback(mut self, fallback: RateFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn local_currency(&self) -> &str {
        &self.local_currency
    }

    /// Rate per unit of `currency` in local currency on `date`
    pub fn get_rate(&self, currency: &str, date: NaiveDate) -> Result<f64, RateError> {
        let currency = currency.to_uppercase();
        if currency == self.local_currency {
            return Ok(1.0);
        }

        let day = match self.rates_for_date(date) {
            Ok(day) => day,
            Err(RateError::NotFound { .. }) => return Err(RateError::not_found(&currency, date)),
            Err(e) => return Err(e),
        };
        day.get(&currency)
            .copied()
            .ok_or_else(|| RateError::not_found(&currency, date))
    }

    /// Like `get_rate`, walking back per the fallback policy
    pub fn get_rate_with_fallback(
        &self,
        currency: &str,
        date: NaiveDate,
    ) -> Result<ResolvedRate, RateError> {
        let max_back = match self.fallback {
            RateFallback::Strict => 0,
            RateFallback::PriorDays { days } => days,
        };

        for back in 0..=i64::from(max_back) {
            let candidate = date - Duration::days(back);
            match self.get_rate(currency, candidate) {
                Ok(rate) => {
                    if back > 0 {
                        tracing::debug!(%currency, %date, used = %candidate, "rate fallback");
                    }
                    return Ok(ResolvedRate { rate, date: candidate });
                }
                Err(RateError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(RateError::not_found(&currency.to_uppercase(), date))
    }

    /// All rates of one day, loading the day if needed
    pub fn rates_for_date(&self, date: NaiveDate) -> Result<HashMap<String, f64>, RateError> {
        if let Some(day) = self.memoized(date) {
            return Ok(day);
        }
        if self.missed(date) {
            return Err(RateError::not_found("*", date));
        }

        // Single writer: re-check under the cache lock so concurrent
        // lookups for the same day hit the source once
        let cache = self
            .cache
            .lock()
            .map_err(|_| RateError::Cache("rate cache lock poisoned".to_string()))?;
        if let Some(day) = self.memoized(date) {
            return Ok(day);
        }

        let mut rates = db::load_rates_for_date(&cache, date)?;
        if rates.is_empty() {
            rates = match self.source.fetch_day(date) {
                Ok(rates) => rates,
                Err(e) => {
                    tracing::warn!(%date, error = %e, "rate source unavailable");
                    self.remember_miss(date);
                    return Err(RateError::not_found("*", date));
                }
            };
            if rates.is_empty() {
                tracing::warn!(%date, "rate source published nothing");
                self.remember_miss(date);
                return Err(RateError::not_found("*", date));
            }
            rates.push(ExchangeRate::local(date, &self.local_currency));
            let stored = db::store_rates(&cache, &rates)?;
            tracing::info!(%date, stored, "cached NBG rates");
        }
        drop(cache);

        let day: HashMap<String, f64> = rates
            .into_iter()
            .map(|r| (r.currency, r.rate_per_unit))
            .collect();
        if let Ok(mut memo) = self.memo.write() {
            memo.insert(date, day.clone());
        }
        Ok(day)
    }

    /// Make sure every day in [start, end] is cached
    ///
    /// `start` defaults to the day after the latest cached date, or
    /// DEFAULT_BACKFILL_DAYS before `end` on an empty cache.
    pub fn backfill(&self, start: Option<NaiveDate>, end: NaiveDate) -> Result<BackfillStats, RateError> {
        let start = match start {
            Some(start) => start,
            None => {
                let latest = {
                    let cache = self
                        .cache
                        .lock()
                        .map_err(|_| RateError::Cache("rate cache lock poisoned".to_string()))?;
                    db::latest_rate_date(&cache)?
                };
                match latest {
                    Some(latest) => latest + Duration::days(1),
                    None => end - Duration::days(DEFAULT_BACKFILL_DAYS),
                }
            }
        };

        let mut stats = BackfillStats::default();
        let mut day = start;
        while day <= end {
            let was_cached = self.is_cached(day)?;
            match self.rates_for_date(day) {
                Ok(_) if was_cached => stats.cached_days += 1,
                Ok(_) => stats.fetched_days += 1,
                Err(RateError::NotFound { .. }) => stats.missing_days.push(day),
                Err(e) => return Err(e),
            }
            day += Duration::days(1);
        }

        tracing::info!(
            %start,
            %end,
            fetched = stats.fetched_days,
            cached = stats.cached_days,
            missing = stats.missing_days.len(),
            "rate backfill finished"
        );
        Ok(stats)
    }

    fn is_cached(&self, date: NaiveDate) -> Result<bool, RateError> {
        if self.memoized(date).is_some() {
            return Ok(true);
        }
        let cache = self
            .cache
            .lock()
            .map_err(|_| RateError::Cache("rate cache lock poisoned".to_string()))?;
        Ok(!db::load_rates_for_date(&cache, date)?.is_empty())
    }

    fn memoized(&self, date: NaiveDate) -> Option<HashMap<String, f64>> {
        self.memo.read().ok().and_then(|memo| memo.get(&date).cloned())
    }

    fn missed(&self, date: NaiveDate) -> bool {
        self.misses
            .read()
            .map(|misses| misses.contains(&date))
            .unwrap_or(false)
    }

    fn remember_miss(&self, date: NaiveDate) {
        if let Ok(mut misses) = self.misses.write() {
            misses.insert(date);
        }
    }
}

impl RateLookup for RateProvider {
    fn rate(&self, currency: &str, date: NaiveDate) -> Result<f64, RateError> {
        self.get_rate_with_fallback(currency, date).map(|r| r.rate)
    }
}

/// Fixed rate table, for offline runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticRates {
    local_currency: String,
    rates: HashMap<(String, NaiveDate), f64>,
}

impl StaticRates {
    pub fn new(local_currency: &str) -> Self {
        StaticRates {
            local_currency: local_currency.to_uppercase(),
            rates: HashMap::new(),
        }
    }

    pub fn with(mut self, currency: &str, date: NaiveDate, rate: f64) -> Self {
        self.rates.insert((currency.to_uppercase(), date), rate);
        self
    }
}

impl RateLookup for StaticRates {
    fn rate(&self, currency: &str, date: NaiveDate) -> Result<f64, RateError> {
        let currency = currency.to_uppercase();
        if currency == self.local_currency {
            return Ok(1.0);
        }
        self.rates
            .get(&(currency.clone(), date))
            .copied()
            .ok_or_else(|| RateError::not_found(&currency, date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Source serving a fixed table and counting calls
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        days: HashMap<NaiveDate, Vec<ExchangeRate>>,
    }

    impl RateSource for CountingSource {
        fn fetch_day(&self, date: NaiveDate) -> Result<Vec<ExchangeRate>, RateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.days.get(&date).cloned().unwrap_or_default())
        }
    }

    struct DownSource;

    impl RateSource for DownSource {
        fn fetch_day(&self, _date: NaiveDate) -> Result<Vec<ExchangeRate>, RateError> {
            Err(RateError::Source("connection refused".to_string()))
        }
    }

    fn provider_with(days: &[(&str, &str, f64, f64)]) -> (RateProvider, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table: HashMap<NaiveDate, Vec<ExchangeRate>> = HashMap::new();
        for (day, code, rate, quantity) in days {
            table
                .entry(date(day))
                .or_default()
                .extend(ExchangeRate::new(date(day), code, *rate, *quantity));
        }
        let source = CountingSource {
            calls: calls.clone(),
            days: table,
        };
        let conn = Connection::open_in_memory().unwrap();
        let provider = RateProvider::new(conn, Box::new(source), "GEL").unwrap();
        (provider, calls)
    }

    #[test]
    fn test_local_currency_is_always_one() {
        let provider = RateProvider::new(
            Connection::open_in_memory().unwrap(),
            Box::new(DownSource),
            "GEL",
        )
        .unwrap();

        for day in ["2020-01-01", "2025-05-29", "2031-12-31"] {
            assert_eq!(provider.get_rate("GEL", date(day)).unwrap(), 1.0);
            assert_eq!(provider.get_rate("gel", date(day)).unwrap(), 1.0);
        }

        println!("✅ Local currency rate test PASSED");
    }

    #[test]
    fn test_cache_miss_persists_whole_day() {
        let (provider, calls) = provider_with(&[
            ("2025-05-29", "USD", 2.72, 1.0),
            ("2025-05-29", "EUR", 3.05, 1.0),
            ("2025-05-29", "JPY", 1.89, 100.0),
        ]);
        let day = date("2025-05-29");

        assert_eq!(provider.get_rate("USD", day).unwrap(), 2.72);
        assert_eq!(provider.get_rate("EUR", day).unwrap(), 3.05);
        assert!((provider.get_rate("JPY", day).unwrap() - 0.0189).abs() < 1e-12);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "One source call per day");

        // Whole day landed in SQLite, local currency included
        let cache = provider.cache.lock().unwrap();
        let cached = db::load_rates_for_date(&cache, day).unwrap();
        assert_eq!(cached.len(), 4);
        assert!(cached.iter().any(|r| r.currency == "GEL" && r.rate_per_unit == 1.0));

        println!("✅ Rate cache miss test PASSED");
    }

    #[test]
    fn test_cached_day_served_without_source() {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_rate_cache(&conn).unwrap();
        let day = date("2025-05-29");
        db::store_rates(&conn, &[ExchangeRate::new(day, "USD", 2.70, 1.0).unwrap()]).unwrap();

        let provider = RateProvider::new(conn, Box::new(DownSource), "GEL").unwrap();
        assert_eq!(provider.get_rate("USD", day).unwrap(), 2.70);

        println!("✅ Cached rate test PASSED");
    }

    #[test]
    fn test_missing_rate_is_not_found() {
        let (provider, calls) = provider_with(&[("2025-05-29", "USD", 2.72, 1.0)]);

        let err = provider.get_rate("CHF", date("2025-05-29")).unwrap_err();
        assert_eq!(err, RateError::not_found("CHF", date("2025-05-29")));

        // Empty day: NotFound, and not asked twice in the same run
        assert!(matches!(
            provider.get_rate("USD", date("2025-06-01")),
            Err(RateError::NotFound { .. })
        ));
        assert!(provider.get_rate("USD", date("2025-06-01")).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        println!("✅ Missing rate test PASSED");
    }

    #[test]
    fn test_unreachable_source_is_not_found() {
        let provider = RateProvider::new(
            Connection::open_in_memory().unwrap(),
            Box::new(DownSource),
            "GEL",
        )
        .unwrap();

        assert!(matches!(
            provider.get_rate("USD", date("2025-05-29")),
            Err(RateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_fallback_policy() {
        let (provider, _) = provider_with(&[("2025-05-29", "USD", 2.72, 1.0)]);
        let sunday = date("2025-05-31");

        // Strict: no walking back
        assert!(provider.get_rate_with_fallback("USD", sunday).is_err());

        let provider = provider.with_fallback(RateFallback::PriorDays { days: 3 });
        let resolved = provider.get_rate_with_fallback("USD", sunday).unwrap();
        assert_eq!(resolved.rate, 2.72);
        assert_eq!(resolved.date, date("2025-05-29"));
        assert_eq!(provider.rate("USD", sunday).unwrap(), 2.72);

        println!("✅ Rate fallback test PASSED");
    }

    #[test]
    fn test_backfill_counts_days() {
        let (provider, calls) = provider_with(&[
            ("2025-05-27", "USD", 2.70, 1.0),
            ("2025-05-28", "USD", 2.71, 1.0),
            ("2025-05-29", "USD", 2.72, 1.0),
        ]);

        let stats = provider
            .backfill(Some(date("2025-05-27")), date("2025-05-30"))
            .unwrap();
        assert_eq!(stats.fetched_days, 3);
        assert_eq!(stats.missing_days, vec![date("2025-05-30")]);

        // Second pass: nothing new to fetch for the cached days
        let stats = provider
            .backfill(Some(date("2025-05-27")), date("2025-05-29"))
            .unwrap();
        assert_eq!(stats.cached_days, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        println!("✅ Rate backfill test PASSED");
    }

    #[test]
    fn test_parse_nbg_response() {
        let body = r#"[{
            "date": "2025-05-29T00:00:00.000Z",
            "currencies": [
                {"code": "USD", "quantity": 1, "rateFormated": "2.7200", "rate": 2.72, "name": "US Dollar"},
                {"code": "JPY", "quantity": 100, "rate": 1.8921, "name": "Japanese Yen"},
                {"code": "XDR", "quantity": 0, "rate": 3.71, "name": "Withdrawn"}
            ]
        }]"#;

        // Zero quantity would otherwise become a zero rate
        let rates = parse_nbg_response(date("2025-05-29"), body).unwrap();
        assert_eq!(rates.len(), 2);
        assert!(rates.iter().all(|r| r.currency != "XDR"));
        assert_eq!(rates[0].currency, "USD");
        assert_eq!(rates[0].rate_per_unit, 2.72);
        assert!((rates[1].rate_per_unit - 0.018921).abs() < 1e-12);

        assert!(parse_nbg_response(date("2025-05-29"), "<html>").is_err());
        assert!(parse_nbg_response(date("2025-05-29"), "[]").unwrap().is_empty());

        println!("✅ NBG parsing test PASSED");
    }

    #[test]
    fn test_static_rates() {
        let rates = StaticRates::new("GEL").with("usd", date("2025-05-29"), 2.72);
        assert_eq!(rates.rate("USD", date("2025-05-29")).unwrap(), 2.72);
        assert_eq!(rates.rate("GEL", date("2025-05-29")).unwrap(), 1.0);
        assert!(rates.rate("USD", date("2025-05-28")).is_err());
    }
}
