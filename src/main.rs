use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use bank_harmonizer::{get_account_stats, get_client, AppConfig, Bank, OutputFormat, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "bank-harmonizer", version, about = "Harmonize TBC and BOG statements into GEL reports")]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new transactions from the bank APIs
    Fetch {
        /// Last day to fetch (default: yesterday)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Only this bank
        #[arg(long, value_enum)]
        bank: Option<BankArg>,
    },
    /// Fill the NBG rate cache
    Rates {
        /// First day (default: day after the latest cached rate)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day (default: yesterday)
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Build and write reports
    Report {
        /// Report date (default: yesterday)
        #[arg(long, conflicts_with = "all")]
        date: Option<NaiveDate>,

        /// Every date with stored transactions
        #[arg(long)]
        all: bool,

        /// xlsx or csv (default: from config)
        #[arg(long)]
        format: Option<OutputFormat>,
    },
    /// Show what the store holds
    Summary,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BankArg {
    Tbc,
    Bog,
}

impl From<BankArg> for Bank {
    fn from(arg: BankArg) -> Self {
        match arg {
            BankArg::Tbc => Bank::Tbc,
            BankArg::Bog => Bank::Bog,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bank_harmonizer=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    tracing::debug!(?config, "config loaded");

    match cli.command {
        Command::Fetch { end, bank } => run_fetch(config, end.unwrap_or_else(yesterday), bank),
        Command::Rates { start, end } => run_rates(config, start, end.unwrap_or_else(yesterday)),
        Command::Report { date, all, format } => run_report(config, date, all, format),
        Command::Summary => run_summary(config),
    }
}

fn yesterday() -> NaiveDate {
    Local::now().date_naive() - Duration::days(1)
}

fn run_fetch(config: AppConfig, end: NaiveDate, only: Option<BankArg>) -> Result<()> {
    println!("🏦 Fetching transactions up to {}", end);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let credentials = config.credentials()?;
    let pipeline = Pipeline::open(config)?;

    let banks: Vec<Bank> = match only {
        Some(bank) => vec![bank.into()],
        None => Bank::ALL.to_vec(),
    };

    let mut failed = 0;
    for bank in banks {
        let client = match get_client(bank, pipeline.config(), &credentials) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(bank = %bank, error = %e, "cannot build client, bank skipped");
                failed += 1;
                continue;
            }
        };

        let summary = pipeline.fetch_bank(client.as_ref(), end)?;
        println!("✓ {}: {}", bank.name(), summary.summary());
        for issue in &summary.quality.issues {
            println!("  ⚠️  {}: {}", issue.subject, issue.message);
        }
        failed += summary.failed;
    }

    if failed == 0 {
        println!("\n✅ Fetch complete");
    } else {
        println!("\n⚠️  Fetch complete with {} failures (they retry next run)", failed);
    }
    Ok(())
}

fn run_rates(config: AppConfig, start: Option<NaiveDate>, end: NaiveDate) -> Result<()> {
    println!("💱 Updating NBG rates up to {}", end);

    let pipeline = Pipeline::open(config)?;
    let stats = pipeline.backfill_rates(start, end)?;

    println!(
        "✓ {} days fetched, {} already cached, {} without rates",
        stats.fetched_days,
        stats.cached_days,
        stats.missing_days.len()
    );
    for day in &stats.missing_days {
        println!("  ⚠️  no rates published for {}", day);
    }
    Ok(())
}

fn run_report(
    config: AppConfig,
    date: Option<NaiveDate>,
    all: bool,
    format: Option<OutputFormat>,
) -> Result<()> {
    let format = format.unwrap_or(config.report.format);
    let pipeline = Pipeline::open(config)?;

    let dates = if all {
        pipeline.report_dates()?
    } else {
        vec![date.unwrap_or_else(yesterday)]
    };

    println!("📊 Building reports for {} date(s)", dates.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut written = 0;
    for date in dates {
        let daily = pipeline
            .build_reports(date)
            .with_context(|| format!("Failed to build reports for {}", date))?;

        if daily.reports.is_empty() {
            println!("{}: no transactions", date);
            continue;
        }

        for path in pipeline.write_reports(&daily, format)? {
            println!("✓ {}", path.display());
            written += 1;
        }
        if !daily.quality.is_empty() {
            println!("  ⚠️  {}", daily.quality.summary());
        }
    }

    println!("\n✅ {} report(s) written", written);
    Ok(())
}

fn run_summary(config: AppConfig) -> Result<()> {
    let pipeline = Pipeline::open(config)?;
    let stats = get_account_stats(pipeline.store())?;

    println!("📒 Stored accounts");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if stats.is_empty() {
        println!("(empty - run `fetch` first)");
    }
    for stat in &stats {
        println!(
            "{} {:<6} {:<26} {} {:>6} tx  {}  last run: {}",
            stat.bank,
            stat.company,
            stat.account_number,
            stat.currency,
            stat.transaction_count,
            stat.date_range,
            stat.last_run_date.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
