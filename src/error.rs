use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("permission error: role '{role}' is not permitted to {action} (allowed: {allowed:?})")]
    Permission {
        role: String,
        action: &'static str,
        allowed: Vec<String>,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("data corruption: {0}")]
    DataCorruption(String),
    #[error("data format error: {0}")]
    DataFormat(String),
    #[error("file read error: {0}")]
    FileRead(String),
    #[error("file write error: {0}")]
    FileWrite(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("backup error: {0}")]
    Backup(String),
    #[error("restore error: {0}")]
    Restore(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DbError {
    /// Short machine-readable code for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation-error",
            Self::Permission { .. } => "permission-error",
            Self::Config(_) => "config-error",
            Self::Encryption(_) => "encryption-error",
            Self::Decryption(_) => "decryption-error",
            Self::DataCorruption(_) => "data-corruption-error",
            Self::DataFormat(_) => "data-format-error",
            Self::FileRead(_) => "file-read-error",
            Self::FileWrite(_) => "file-write-error",
            Self::Transaction(_) => "transaction-error",
            Self::Backup(_) => "backup-error",
            Self::Restore(_) => "restore-error",
            Self::Serialization(_) => "serialization-error",
            Self::Io(_) => "io-error",
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
