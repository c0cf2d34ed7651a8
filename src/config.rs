use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::error::{DbError, Result};

pub const DEFAULT_MAX_CACHE_SIZE: usize = 100;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;

const MIN_PASSPHRASE_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Plain,
    Encrypted,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Encrypted => "encrypted",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "plain" => Some(Self::Plain),
            "encrypted" => Some(Self::Encrypted),
            _ => None,
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database: PathBuf,
    pub encryption_key: String,
    pub mode: StorageMode,
    pub role: String,
    pub max_cache_size: usize,
    pub max_connections: usize,
    /// Advisory; the engine records it but does not enforce it.
    pub query_timeout_ms: u64,
}

impl DbConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DbError::Config(format!(
                "cannot read configuration file {}: {err}",
                path.display()
            ))
        })?;
        if contents.trim().is_empty() {
            return Err(DbError::Config(format!(
                "configuration file {} is empty",
                path.display()
            )));
        }
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut database: Option<PathBuf> = None;
        let mut encryption_key: Option<String> = None;
        let mut mode: Option<StorageMode> = None;
        let mut role: Option<String> = None;
        let mut max_cache_size = DEFAULT_MAX_CACHE_SIZE;
        let mut max_connections = DEFAULT_MAX_CONNECTIONS;
        let mut query_timeout_ms = DEFAULT_QUERY_TIMEOUT_MS;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Values may themselves contain '='; only the first one splits.
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "database" => database = Some(PathBuf::from(value)),
                "encryptionKey" => encryption_key = Some(value.to_string()),
                "mode" => {
                    mode = Some(StorageMode::parse(value).ok_or_else(|| {
                        DbError::Validation(format!(
                            "mode must be 'encrypted' or 'plain', got '{value}'"
                        ))
                    })?);
                }
                "role" => role = Some(value.to_string()),
                "maxCacheSize" => max_cache_size = parse_positive(key, value)?,
                "maxConnections" => max_connections = parse_positive(key, value)?,
                "queryTimeout" => {
                    query_timeout_ms = value.parse().map_err(|_| {
                        DbError::Validation(format!("queryTimeout must be an integer, got '{value}'"))
                    })?;
                }
                _ => {}
            }
        }

        let config = Self {
            database: database.ok_or_else(|| missing("database"))?,
            encryption_key: encryption_key.ok_or_else(|| missing("encryptionKey"))?,
            mode: mode.ok_or_else(|| missing("mode"))?,
            role: role.ok_or_else(|| missing("role"))?,
            max_cache_size,
            max_connections,
            query_timeout_ms,
        };

        if config.encryption_key.chars().count() < MIN_PASSPHRASE_CHARS {
            warn!(
                "encryptionKey is shorter than {} characters; consider a longer passphrase",
                MIN_PASSPHRASE_CHARS
            );
        }

        Ok(config)
    }

    pub fn ensure_database_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.database)?;
        Ok(())
    }

    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.database.join(format!("{name}.tdbx"))
    }

    pub fn auth_path(&self) -> PathBuf {
        self.database.join(".auth")
    }

    pub fn users_path(&self) -> PathBuf {
        self.database.join(".users")
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(DbError::Validation(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

fn missing(key: &str) -> DbError {
    DbError::Validation(format!("required configuration field '{key}' is missing"))
}
