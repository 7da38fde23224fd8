use crate::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Sealvote(#[from] sealvote::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid argument {name}: {reason}")]
    Argument { name: &'static str, reason: String },

    #[error("cannot use {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot read state from {path}: {source}")]
    State {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    JSON(#[from] serde_json::Error),

    #[error("receipt {0} does not match the ledger")]
    ReceiptMismatch(uuid::Uuid),
}

impl CliError {
    pub fn argument<S: Into<String>>(name: &'static str, reason: S) -> Self {
        CliError::Argument {
            name,
            reason: reason.into(),
        }
    }

    pub fn file(path: &str, source: std::io::Error) -> Self {
        CliError::File {
            path: path.to_owned(),
            source,
        }
    }
}
