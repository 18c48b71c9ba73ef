// ⚙️ Configuration - one JSON file, loaded once at start
//
// Secrets live in a separate file (`secrets_path`) and are handed to the
// clients explicitly. Nothing here is global.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::export::OutputFormat;
use crate::model::LOCAL_CURRENCY;
use crate::rates::{RateFallback, NBG_RATES_URL};
use crate::revaluation::RevaluationPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    pub registry_path: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub secrets_path: Option<PathBuf>,
    #[serde(default = "default_local_currency")]
    pub local_currency: String,
    #[serde(default)]
    pub endpoints: Endpoints,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub rates: RateConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub tbc_url: String,
    pub bog_auth_url: String,
    pub bog_api_url: String,
    pub nbg_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            tbc_url: "https://secdbi.tbconline.ge/dbi/dbiService".to_string(),
            bog_auth_url: "https://account.bog.ge/auth/realms/bog/protocol/openid-connect/token"
                .to_string(),
            bog_api_url: "https://api.businessonline.ge/api".to_string(),
            nbg_url: NBG_RATES_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Parallel account fetches; 1 = sequential
    pub workers: usize,
    /// First run for an account starts this many days back
    pub lookback_days: i64,
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            workers: 1,
            lookback_days: 7,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub fallback: RateFallback,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: OutputFormat,
    pub revaluation: RevaluationPolicy,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("bank_data.db")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_local_currency() -> String {
    LOCAL_CURRENCY.to_string()
}

impl AppConfig {
    /// Load config; relative paths resolve against the config file's directory
    pub fn load(path: &Path) -> Result<AppConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        let mut config: AppConfig = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.database_path = resolve(base, &config.database_path);
        config.registry_path = resolve(base, &config.registry_path);
        config.output_dir = resolve(base, &config.output_dir);
        config.secrets_path = config.secrets_path.as_deref().map(|p| resolve(base, p));
        config.local_currency = config.local_currency.to_uppercase();
        if config.fetch.workers == 0 {
            config.fetch.workers = 1;
        }

        Ok(config)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch.timeout_secs)
    }

    /// Credentials from `secrets_path`, or none when it is not set
    pub fn credentials(&self) -> Result<Credentials> {
        match &self.secrets_path {
            Some(path) => Credentials::load(path),
            None => {
                tracing::warn!("no secrets_path configured; bank fetches will be skipped");
                Ok(Credentials::default())
            }
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Per-company bank credentials, keyed by company code
#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub tbc: HashMap<String, TbcCredentials>,
    #[serde(default)]
    pub bog: HashMap<String, BogCredentials>,
}

#[derive(Clone, Deserialize)]
pub struct TbcCredentials {
    pub username: String,
    pub password: String,
    /// One-time code sent as the WS-Security nonce
    pub digipass: String,
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Deserialize)]
pub struct BogCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Credentials> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read secrets file {}", path.display()))?;
        let mut creds: Credentials = serde_json::from_str(&text)
            .with_context(|| format!("Invalid secrets file {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for tbc in creds.tbc.values_mut() {
            tbc.certificate_path = resolve(base, &tbc.certificate_path);
            tbc.key_path = resolve(base, &tbc.key_path);
        }
        Ok(creds)
    }
}

// Secrets never reach logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tbc: Vec<&String> = self.tbc.keys().collect();
        let mut bog: Vec<&String> = self.bog.keys().collect();
        tbc.sort();
        bog.sort();
        f.debug_struct("Credentials")
            .field("tbc_companies", &tbc)
            .field("bog_companies", &bog)
            .finish()
    }
}

impl fmt::Debug for TbcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TbcCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("digipass", &"***")
            .field("certificate_path", &self.certificate_path)
            .field("key_path", &self.key_path)
            .finish()
    }
}

impl fmt::Debug for BogCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BogCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}
