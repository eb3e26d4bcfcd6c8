use std::path::PathBuf;

use thiserror::Error;

/// Outbound request failures. Every variant except `InvalidRequest` is worth retrying.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to '{url}' failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{url}' answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("io error while writing '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("response body does not match the expected shape: {0}")]
    Shape(String),
    #[error("platform reported failure (code {code}): {message}")]
    Business { code: i64, message: String },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{what} not found in response")]
    Missing { what: &'static str },
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record for table '{table}' has {got} values, expected {expected}")]
    Arity {
        table: String,
        got: usize,
        expected: usize,
    },
    #[error("table '{table}' declares column '{column}', which the store reserves")]
    ReservedColumn { table: String, column: &'static str },
    #[error("cannot create database directory '{path}': {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signer '{program}' could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("signer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("signer produced invalid output: {0}")]
    Output(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("{0} is required for this spider")]
    Missing(&'static str),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("media command '{program}' failed: {reason}")]
    Command { program: String, reason: String },
    #[error("io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that can stop a fetch cycle.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<CrawlError>,
    },
    #[error("unknown spider '{platform}/{name}'")]
    UnknownSpider { platform: String, name: String },
    #[error("no {platform} spider writes table '{table}'")]
    UnknownTable { platform: String, table: String },
    #[error("table '{table}' is keyed by '{key}', which identifies no downloadable media")]
    NotDownloadable { table: String, key: &'static str },
}

impl CrawlError {
    /// Transport and business-validation failures share the retry budget;
    /// everything else aborts the run immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Http(err) => err.is_retryable(),
            CrawlError::Validation(_) => true,
            _ => false,
        }
    }
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HttpError::InvalidRequest(_))
    }
}
