// ❗ Typed errors for the engine seams
//
// Plumbing and the binary use anyhow; these enums are what callers match on.

use crate::model::Bank;
use chrono::NaiveDate;
use thiserror::Error;

/// Rate lookups
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateError {
    #[error("no {currency} rate for {date}")]
    NotFound { currency: String, date: NaiveDate },

    #[error("rate source error: {0}")]
    Source(String),

    #[error("rate cache error: {0}")]
    Cache(String),
}

impl RateError {
    pub fn not_found(currency: &str, date: NaiveDate) -> Self {
        RateError::NotFound {
            currency: currency.to_string(),
            date,
        }
    }
}

impl From<rusqlite::Error> for RateError {
    fn from(err: rusqlite::Error) -> Self {
        RateError::Cache(err.to_string())
    }
}

/// Raw → normalized validation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("{bank} record {entry}: missing required field '{field}'")]
    MissingField {
        bank: Bank,
        entry: String,
        field: &'static str,
    },

    #[error("{bank} normalizer cannot handle a {found} record")]
    WrongBank { bank: Bank, found: Bank },
}

/// Account registry workbook
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read account registry: {0}")]
    Open(String),

    #[error("account registry has no sheets")]
    NoSheet,

    #[error("account registry is missing the '{0}' column")]
    MissingColumn(&'static str),
}

/// Bank API clients
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no credentials configured for company {0}")]
    MissingCredentials(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("SOAP fault: {0}")]
    SoapFault(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<quick_xml::Error> for ClientError {
    fn from(err: quick_xml::Error) -> Self {
        ClientError::Xml(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}
