// 🏦 Bank Clients - fetch raw records from each bank's API
//
// One client per bank, one trait for all of them. The pipeline only ever
// sees `dyn BankClient`, so tests swap in fakes without a network.

pub mod bog;
pub mod tbc;

use chrono::NaiveDate;
use std::time::Duration;

use crate::config::{AppConfig, Credentials};
use crate::error::ClientError;
use crate::model::{AccountRef, Bank, RawTransaction};

pub use bog::BogClient;
pub use tbc::TbcClient;

/// Bank API client
///
/// `fetch` returns every record for `account` between `start` and `end`
/// (inclusive), already carrying the balances the normalizer needs.
pub trait BankClient: Send + Sync {
    fn bank(&self) -> Bank;

    fn fetch(
        &self,
        account: &AccountRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawTransaction>, ClientError>;
}

/// Build the live client for a bank from config and secrets
pub fn get_client(
    bank: Bank,
    config: &AppConfig,
    credentials: &Credentials,
) -> Result<Box<dyn BankClient>, ClientError> {
    let timeout = config.timeout();
    match bank {
        Bank::Tbc => Ok(Box::new(TbcClient::new(
            &config.endpoints.tbc_url,
            &credentials.tbc,
            timeout,
        ))),
        Bank::Bog => Ok(Box::new(BogClient::new(
            &config.endpoints.bog_auth_url,
            &config.endpoints.bog_api_url,
            &credentials.bog,
            timeout,
        )?)),
    }
}

pub(crate) fn http_client(
    timeout: Duration,
    identity: Option<reqwest::Identity>,
) -> Result<reqwest::blocking::Client, ClientError> {
    let mut builder = reqwest::blocking::Client::builder().timeout(timeout);
    if let Some(identity) = identity {
        builder = builder.identity(identity);
    }
    Ok(builder.build()?)
}

/// Every date from `start` to `end`, inclusive
pub(crate) fn days(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

/// Dates arrive as "2025-05-29" or "2025-05-29T00:00:00"
pub(crate) fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}
