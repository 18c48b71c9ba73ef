// 🏦 BOG Client - OAuth2 client credentials + JSON statements
//
// token → statement (records + statement id) → daily summaries.
// Each record is paired with the summary of its own entry date.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{http_client, parse_date, BankClient};
use crate::config::BogCredentials;
use crate::error::ClientError;
use crate::model::{AccountRef, Bank, BogEntry, DailySummary, RawPayload, RawTransaction};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// One statement call's result
#[derive(Debug, Clone, PartialEq)]
pub struct BogStatement {
    pub id: Option<String>,
    pub records: Vec<Value>,
}

pub struct BogClient {
    http: reqwest::blocking::Client,
    auth_url: String,
    api_url: String,
    credentials: HashMap<String, BogCredentials>,
}

impl BogClient {
    pub fn new(
        auth_url: &str,
        api_url: &str,
        credentials: &HashMap<String, BogCredentials>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        Ok(BogClient {
            http: http_client(timeout, None)?,
            auth_url: auth_url.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials: credentials.clone(),
        })
    }

    fn token(&self, company: &str) -> Result<String, ClientError> {
        let creds = self
            .credentials
            .get(company)
            .ok_or_else(|| ClientError::MissingCredentials(company.to_string()))?;

        let response = self
            .http
            .post(&self.auth_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()?;

        if !response.status().is_success() {
            return Err(ClientError::Auth(format!(
                "HTTP {} for company {}",
                response.status(),
                company
            )));
        }

        let token: TokenResponse = response.json()?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::Auth(format!("no access token for company {}", company)))
    }

    fn get_json(&self, token: &str, url: &str) -> Result<Value, ClientError> {
        let body = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()?
            .error_for_status()?
            .text()?;
        Ok(serde_json::from_str(&body)?)
    }

    pub fn fetch_statement(
        &self,
        token: &str,
        account: &AccountRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BogStatement, ClientError> {
        let url = format!(
            "{}/statement/{}/{}/{}/{}",
            self.api_url,
            account.account_number,
            account.currency,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        parse_statement(self.get_json(token, &url)?)
    }

    pub fn fetch_summaries(
        &self,
        token: &str,
        account: &AccountRef,
        statement_id: &str,
    ) -> Result<Vec<DailySummary>, ClientError> {
        let url = format!(
            "{}/statement/summary/{}/{}/{}",
            self.api_url, account.account_number, account.currency, statement_id
        );
        Ok(parse_summaries(&self.get_json(token, &url)?))
    }
}

impl BankClient for BogClient {
    fn bank(&self) -> Bank {
        Bank::Bog
    }

    fn fetch(
        &self,
        account: &AccountRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawTransaction>, ClientError> {
        let token = self.token(&account.company)?;
        let statement = self.fetch_statement(&token, account, start, end)?;
        tracing::info!(
            account = %account.label(),
            statement_id = ?statement.id,
            records = statement.records.len(),
            "BOG statement retrieved"
        );

        if statement.records.is_empty() {
            return Ok(Vec::new());
        }

        // No summaries means no balances; fail so the account is retried
        let summaries = self.fetch_summaries(&token, account, statement_id(&statement)?)?;
        Ok(attach_summaries(&statement.records, &summaries)?
            .into_iter()
            .map(|entry| RawTransaction::new(account.clone(), RawPayload::BogEntry(entry)))
            .collect())
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

pub fn parse_statement(body: Value) -> Result<BogStatement, ClientError> {
    let Value::Object(mut map) = body else {
        return Err(ClientError::Decode("BOG statement is not a JSON object".to_string()));
    };

    let id = map.get("Id").and_then(scalar_text);
    let records = match map.remove("Records") {
        Some(Value::Array(records)) => records,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(ClientError::Decode("BOG statement Records is not a list".to_string()))
        }
    };

    Ok(BogStatement { id, records })
}

/// Summaries without a usable date are dropped
pub fn parse_summaries(body: &Value) -> Vec<DailySummary> {
    let Some(list) = body.get("DailySummaries").and_then(Value::as_array) else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|s| {
            let date = s.get("Date").and_then(Value::as_str).and_then(parse_date);
            if date.is_none() {
                tracing::warn!("BOG daily summary without a date, skipped");
            }
            Some(DailySummary {
                date: date?,
                balance: number(s, "Balance"),
                credit_sum: number(s, "CreditSum").unwrap_or(0.0),
                debit_sum: number(s, "DebitSum").unwrap_or(0.0),
            })
        })
        .collect()
}

/// Summaries are keyed by statement id, so records without one are unusable
pub fn statement_id(statement: &BogStatement) -> Result<&str, ClientError> {
    statement.id.as_deref().filter(|id| !id.is_empty()).ok_or_else(|| {
        ClientError::Decode(format!(
            "BOG statement with {} records has no Id",
            statement.records.len()
        ))
    })
}

/// Every record must find its day's summary; one miss rejects the batch
pub fn attach_summaries(
    records: &[Value],
    summaries: &[DailySummary],
) -> Result<Vec<BogEntry>, ClientError> {
    records
        .iter()
        .map(|record| {
            let entry = entry_from_record(record, summaries);
            if entry.summary.is_some() {
                return Ok(entry);
            }
            let entry_id = entry.entry_id.as_deref().unwrap_or("?");
            Err(ClientError::Decode(match entry.entry_date {
                Some(day) => format!("BOG entry {} has no daily summary for {}", entry_id, day),
                None => format!("BOG entry {} has no EntryDate", entry_id),
            }))
        })
        .collect()
}

/// Typed view of a record with its day's summary attached
pub fn entry_from_record(record: &Value, summaries: &[DailySummary]) -> BogEntry {
    let mut fields = BTreeMap::new();
    flatten("", record, &mut fields);

    let entry_date = fields.get("EntryDate").and_then(|d| parse_date(d));
    let summary = entry_date.and_then(|d| summaries.iter().find(|s| s.date == d).cloned());

    BogEntry {
        entry_id: fields
            .get("EntryID")
            .or_else(|| fields.get("EntryId"))
            .filter(|s| !s.is_empty())
            .cloned(),
        entry_date,
        debit: number(record, "EntryAmountDebit"),
        debit_base: number(record, "EntryAmountDebitBase"),
        credit: number(record, "EntryAmountCredit"),
        credit_base: number(record, "EntryAmountCreditBase"),
        document_rate: number(record, "DocumentRate"),
        fields,
        summary,
    }
}

/// Nested objects become "Parent.Child" keys; arrays and nulls are skipped
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        Value::Array(_) | Value::Null => {}
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                out.insert(prefix.to_string(), text);
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numbers may arrive as JSON numbers or numeric strings
fn number(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
