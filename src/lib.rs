// Bank Harmonizer - Core Library
// Exposes all modules for use in the CLI and tests

pub mod model;
pub mod error;
pub mod config;
pub mod db;
pub mod rates;          // NBG reference rates, memo + SQLite cache
pub mod normalizer;     // TBC / BOG → one record shape
pub mod revaluation;    // Unrealized FX gain/loss per account-day
pub mod reconciliation;
pub mod data_quality;
pub mod report;
pub mod export;
pub mod registry;
pub mod clients;
pub mod pipeline;

// Re-export commonly used types
pub use model::{
    AccountRef, Bank, CurrencyClass, Direction, ExchangeRate, GroupKey, Memo,
    NormalizedTransaction, RateGap, RawPayload, RawTransaction, RowKind,
    LOCAL_CURRENCY,
};
pub use error::{ClientError, NormalizeError, RateError, RegistryError};
pub use config::{AppConfig, Credentials};
pub use db::{
    Event, InsertStats, AccountStat,
    setup_database, insert_raw_transactions, load_raw_transactions,
    verify_count, insert_event, get_events_for_entity, get_account_stats,
};
pub use rates::{
    RateFallback, RateLookup, RateProvider, RateSource, NbgRateSource, StaticRates,
};
pub use normalizer::{get_normalizer, Normalizer, BogNormalizer, TbcNormalizer};
pub use revaluation::{
    fx_adjustment, RevaluationCalculator, RevaluationEntry, RevaluationGap, RevaluationPolicy,
};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationReport, ReconciliationResult,
};
pub use data_quality::{
    DataQualityEngine, QualityReport, QualityIssue, Severity, IssueCategory,
};
pub use report::{Report, ReportAssembler, ReportRow, HARMONIZED_COLUMNS};
pub use export::{get_writer, OutputFormat, ReportWriter};
pub use clients::{get_client, BankClient};
pub use pipeline::{DailyReports, FetchSummary, Pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
