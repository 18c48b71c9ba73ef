// 🗄️ SQLite Store - raw bank records, rate cache, fetch log, audit trail
//
// Raw transactions are append-only: each bank has its own table, rows are
// keyed by an idempotency hash and re-imports are skipped, never updated.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::{AccountRef, Bank, ExchangeRate, RawPayload, RawTransaction};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Event for audit trail (every fetch and report leaves one)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Outcome of one raw import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: usize,
    pub duplicates: usize,
}

pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Raw transaction tables (one per bank, same shape)
    // ==========================================================================
    for bank in Bank::ALL {
        let table = bank.table_name();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    idempotency_hash TEXT UNIQUE NOT NULL,
                    company TEXT NOT NULL,
                    account_number TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    entry_id TEXT,
                    entry_date TEXT,
                    payload TEXT NOT NULL,
                    fetched_at TEXT NOT NULL,
                    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
                )"
            ),
            [],
        )?;
        conn.execute(
            &format!("CREATE INDEX IF NOT EXISTS idx_{table}_date ON {table}(entry_date)"),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_account ON {table}(company, account_number, currency)"
            ),
            [],
        )?;
    }

    setup_rate_cache(conn)?;

    // ==========================================================================
    // Fetch log (last successful run per account)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fetch_log (
            bank TEXT NOT NULL,
            company TEXT NOT NULL,
            account_number TEXT NOT NULL,
            currency TEXT NOT NULL,
            last_run_date TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (bank, company, account_number, currency)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

/// Rate cache table. Also created on its own by the rate provider.
pub fn setup_rate_cache(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS nbg_fx_rates (
            date TEXT NOT NULL,
            currency TEXT NOT NULL,
            rate REAL NOT NULL,
            quantity REAL NOT NULL,
            rate_per_unit REAL NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (date, currency)
        )",
        [],
    )?;
    Ok(())
}

// ============================================================================
// RAW TRANSACTIONS
// ============================================================================

pub fn insert_raw_transactions(
    conn: &Connection,
    transactions: &[RawTransaction],
) -> Result<InsertStats> {
    let mut stats = InsertStats::default();

    for tx in transactions {
        let hash = tx.compute_idempotency_hash();
        let payload_json = serde_json::to_string(&tx.payload)?;
        let entry_date = tx.date().map(|d| d.format(DATE_FORMAT).to_string());

        let result = conn.execute(
            &format!(
                "INSERT INTO {} (
                    idempotency_hash, company, account_number, currency,
                    entry_id, entry_date, payload, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                tx.bank().table_name()
            ),
            params![
                hash,
                tx.account.company,
                tx.account.account_number,
                tx.account.currency,
                tx.entry_id(),
                entry_date,
                payload_json,
                tx.fetched_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => stats.inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                stats.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::debug!(
        inserted = stats.inserted,
        duplicates = stats.duplicates,
        "raw import"
    );

    Ok(stats)
}

/// Load raw records of one bank whose entry date falls in [start, end]
pub fn load_raw_transactions(
    conn: &Connection,
    bank: Bank,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RawTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT company, account_number, currency, payload, fetched_at
         FROM {}
         WHERE entry_date >= ?1 AND entry_date <= ?2
         ORDER BY company, account_number, currency, entry_date, entry_id",
        bank.table_name()
    ))?;

    let rows = stmt
        .query_map(
            params![
                start.format(DATE_FORMAT).to_string(),
                end.format(DATE_FORMAT).to_string()
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut transactions = Vec::with_capacity(rows.len());
    for (company, account_number, currency, payload_json, fetched_at) in rows {
        let payload: RawPayload = serde_json::from_str(&payload_json)
            .with_context(|| format!("Corrupt {} payload for {}", bank, account_number))?;
        let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        transactions.push(RawTransaction {
            account: AccountRef::new(bank, &company, &currency, &account_number),
            payload,
            fetched_at,
        });
    }

    Ok(transactions)
}

/// Distinct entry dates across both banks, oldest first
pub fn raw_dates(conn: &Connection) -> Result<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT entry_date FROM tbc_transactions WHERE entry_date IS NOT NULL
         UNION
         SELECT entry_date FROM bog_transactions WHERE entry_date IS NOT NULL
         ORDER BY 1",
    )?;

    let dates = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(dates
        .iter()
        .filter_map(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok())
        .collect())
}

pub fn verify_count(conn: &Connection, bank: Bank) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", bank.table_name()),
        [],
        |row| row.get(0),
    )?;

    Ok(count)
}

// ============================================================================
// FETCH LOG
// ============================================================================

pub fn last_run_date(conn: &Connection, account: &AccountRef) -> Result<Option<NaiveDate>> {
    let date: Option<String> = conn
        .query_row(
            "SELECT last_run_date FROM fetch_log
             WHERE bank = ?1 AND company = ?2 AND account_number = ?3 AND currency = ?4",
            params![
                account.bank.code(),
                account.company,
                account.account_number,
                account.currency
            ],
            |row| row.get(0),
        )
        .optional()?;

    Ok(date.and_then(|d| NaiveDate::parse_from_str(&d, DATE_FORMAT).ok()))
}

pub fn update_last_run_date(conn: &Connection, account: &AccountRef, date: NaiveDate) -> Result<()> {
    conn.execute(
        "INSERT INTO fetch_log (bank, company, account_number, currency, last_run_date)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(bank, company, account_number, currency)
         DO UPDATE SET last_run_date = excluded.last_run_date, updated_at = CURRENT_TIMESTAMP",
        params![
            account.bank.code(),
            account.company,
            account.account_number,
            account.currency,
            date.format(DATE_FORMAT).to_string()
        ],
    )?;
    Ok(())
}

// ============================================================================
// RATE CACHE
// ============================================================================

/// Append a day of rates. Existing (date, currency) rows are left alone.
pub fn store_rates(conn: &Connection, rates: &[ExchangeRate]) -> rusqlite::Result<usize> {
    let mut stored = 0;
    for rate in rates {
        stored += conn.execute(
            "INSERT OR IGNORE INTO nbg_fx_rates (date, currency, rate, quantity, rate_per_unit)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rate.date.format(DATE_FORMAT).to_string(),
                rate.currency,
                rate.rate,
                rate.quantity,
                rate.rate_per_unit
            ],
        )?;
    }
    Ok(stored)
}

pub fn load_rates_for_date(conn: &Connection, date: NaiveDate) -> rusqlite::Result<Vec<ExchangeRate>> {
    let mut stmt = conn.prepare(
        "SELECT currency, rate, quantity, rate_per_unit
         FROM nbg_fx_rates
         WHERE date = ?1
         ORDER BY currency",
    )?;

    let rates = stmt
        .query_map([date.format(DATE_FORMAT).to_string()], |row| {
            Ok(ExchangeRate {
                date,
                currency: row.get(0)?,
                rate: row.get(1)?,
                quantity: row.get(2)?,
                rate_per_unit: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rates)
}

pub fn latest_rate_date(conn: &Connection) -> rusqlite::Result<Option<NaiveDate>> {
    let date: Option<String> =
        conn.query_row("SELECT MAX(date) FROM nbg_fx_rates", [], |row| row.get(0))?;
    Ok(date.and_then(|d| NaiveDate::parse_from_str(&d, DATE_FORMAT).ok()))
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// SUMMARY
// ============================================================================

/// Per-account statistics of the raw store
#[derive(Debug, Clone)]
pub struct AccountStat {
    pub bank: Bank,
    pub company: String,
    pub account_number: String,
    pub currency: String,
    pub transaction_count: i64,
    pub date_range: String,
    pub last_run_date: Option<String>,
}

/// Get statistics grouped by account, both banks
pub fn get_account_stats(conn: &Connection) -> Result<Vec<AccountStat>> {
    let mut stats = Vec::new();

    for bank in Bank::ALL {
        let mut stmt = conn.prepare(&format!(
            "SELECT
                t.company,
                t.account_number,
                t.currency,
                COUNT(*) as count,
                COALESCE(MIN(t.entry_date), '?') || ' - ' || COALESCE(MAX(t.entry_date), '?') as date_range,
                f.last_run_date
             FROM {} t
             LEFT JOIN fetch_log f
               ON f.bank = ?1 AND f.company = t.company
              AND f.account_number = t.account_number AND f.currency = t.currency
             GROUP BY t.company, t.account_number, t.currency
             ORDER BY t.company, t.account_number, t.currency",
            bank.table_name()
        ))?;

        let rows = stmt
            .query_map([bank.code()], |row| {
                Ok(AccountStat {
                    bank,
                    company: row.get(0)?,
                    account_number: row.get(1)?,
                    currency: row.get(2)?,
                    transaction_count: row.get(3)?,
                    date_range: row.get(4)?,
                    last_run_date: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        stats.extend(rows);
    }

    Ok(stats)
}
