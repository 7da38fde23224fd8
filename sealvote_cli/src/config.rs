use std::env::var;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("sealvote: invalid value {value:?} for {name}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub keystore_path: String,
    pub storage_path: String,
    pub state_path: String,

    /// REST gateway of the commitment ledger. Without one, a local journal file is used.
    pub ledger_url: Option<String>,
    pub ledger_journal: String,
    pub ledger_max_attempts: u32,
    pub ledger_backoff: Duration,
    pub ledger_timeout: Duration,

    pub cleanup_enabled: bool,
    pub retention_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let keystore_path = path_or("SEALVOTE_KEYSTORE_PATH", "./keystore.json");
        let storage_path = path_or("SEALVOTE_STORAGE_PATH", "./storage");
        let state_path = path_or("SEALVOTE_STATE_PATH", "./sealvote-state.json");

        let ledger_url = match var("SEALVOTE_LEDGER_URL") {
            Ok(val) if !val.trim().is_empty() => Some(val),
            _ => None,
        };
        let ledger_journal = path_or("SEALVOTE_LEDGER_JOURNAL", "./ledger-journal.json");

        let ledger_max_attempts: u32 = parsed_or("SEALVOTE_LEDGER_MAX_ATTEMPTS", 3)?;
        if ledger_max_attempts == 0 {
            return Err(ConfigError {
                name: "SEALVOTE_LEDGER_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        let ledger_backoff = Duration::from_millis(parsed_or("SEALVOTE_LEDGER_BACKOFF_MS", 1000)?);
        let ledger_timeout = Duration::from_secs(parsed_or("SEALVOTE_LEDGER_TIMEOUT_SECS", 10)?);

        let cleanup_enabled = parsed_or("SEALVOTE_CLEANUP_ENABLED", true)?;
        let retention_days = retention_days("SEALVOTE_RETENTION_DAYS")?;

        Ok(Config {
            keystore_path,
            storage_path,
            state_path,
            ledger_url,
            ledger_journal,
            ledger_max_attempts,
            ledger_backoff,
            ledger_timeout,
            cleanup_enabled,
            retention_days,
        })
    }
}

fn path_or(name: &str, default: &str) -> String {
    match var(name) {
        Ok(val) => crate::expand(&val),
        Err(_e) => default.to_owned(),
    }
}

fn parsed_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Ok(val) => val.trim().parse().map_err(|_| ConfigError { name, value: val }),
        Err(_e) => Ok(default),
    }
}

fn retention_days(name: &'static str) -> Result<i64, ConfigError> {
    let days: i64 = parsed_or(name, sealvote::DEFAULT_RETENTION_DAYS)?;
    if !(0..=sealvote::MAX_RETENTION_DAYS).contains(&days) {
        return Err(ConfigError {
            name,
            value: days.to_string(),
        });
    }
    Ok(days)
}
