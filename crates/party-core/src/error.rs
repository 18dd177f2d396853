//! Shared error types. Typed domain errors (thiserror) convert into the one
//! tagged error the Task Manager actually threads through the pipeline.

use thiserror::Error;

/// Carries the fields needed for status projection: the affected analyses,
/// an HTTP-shaped code, and a human message.
#[derive(Debug, Clone, Error)]
#[error("process exception for {analysis_ids:?}: {code} {message}")]
pub struct ProcessException {
    pub analysis_ids: Vec<String>,
    pub code: u16,
    pub message: String,
}

impl ProcessException {
    pub fn new(analysis_ids: impl Into<Vec<String>>, code: u16, message: impl Into<String>) -> Self {
        Self {
            analysis_ids: analysis_ids.into(),
            code,
            message: message.into(),
        }
    }

    /// Renders the `ERROR:<code>:<msg>` status-column encoding.
    pub fn status_value(&self) -> String {
        format!("ERROR:{}:{}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("integrity check of key share decryption failed")]
    Tag,
    #[error("streaming window check failed: now is outside [begin, end)")]
    Time,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("shares file is shorter than the requested {0} shares")]
    Truncated(usize),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache entry for user {0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no analysis record for {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl From<&DecryptError> for u16 {
    fn from(_: &DecryptError) -> u16 {
        500
    }
}

impl From<&CodecError> for u16 {
    fn from(_: &CodecError) -> u16 {
        500
    }
}

impl From<&CacheError> for u16 {
    fn from(_: &CacheError) -> u16 {
        500
    }
}

impl From<&StoreError> for u16 {
    fn from(_: &StoreError) -> u16 {
        500
    }
}
