use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Kind tag recorded in per-item outcomes and parse attempts. Serialized
/// into task rows, so the wire names are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Portal,
    Http,
    Network,
    Timeout,
    Format,
    Parse,
    DbTransport,
    DbConstraint,
    Io,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Portal => "PORTAL",
            ErrorKind::Http => "HTTP",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Format => "FORMAT",
            ErrorKind::Parse => "PARSE",
            ErrorKind::DbTransport => "DB_TRANSPORT",
            ErrorKind::DbConstraint => "DB_CONSTRAINT",
            ErrorKind::Io => "IO",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bad user input. Surfaced before anything is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a report year is required unless the report type is FUND_PROFILE")]
    MissingYear,
    #[error("fund code must be exactly six digits, got {0:?}")]
    BadFundCode(String),
    #[error("upload date range start {start} is after end {end}")]
    BadDateRange { start: NaiveDate, end: NaiveDate },
    #[error("page must be >= 1")]
    BadPage,
    #[error("page size {0} is outside 1..=100")]
    BadPageSize(u32),
    #[error("batch of {got} reports exceeds the configured cap of {cap}")]
    BatchTooLarge { got: usize, cap: usize },
    #[error("batch contains no report refs")]
    EmptyBatch,
}

/// Failures talking to the disclosure portal's list endpoint.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal returned HTTP {status}: {snippet}")]
    Http { status: u16, snippet: String },
    #[error("portal response was not the expected JSON envelope: {0}")]
    Malformed(String),
    #[error("portal transport error: {0}")]
    Network(#[from] reqwest::Error),
}

impl PortalError {
    pub fn retryable(&self) -> bool {
        match self {
            PortalError::Http { status, .. } => *status >= 500,
            PortalError::Malformed(_) => false,
            PortalError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        }
    }
}

/// Failures fetching a report artifact to disk.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed with HTTP {status}")]
    Http { status: u16 },
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    #[error("download transport error: {0}")]
    Network(String),
    #[error("failed writing artifact to disk: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Http { .. } => ErrorKind::Http,
            DownloadError::Timeout(_) => ErrorKind::Timeout,
            DownloadError::Network(_) => ErrorKind::Network,
            DownloadError::Io(_) => ErrorKind::Io,
        }
    }

    /// 5xx, timeouts and transport hiccups are worth another attempt;
    /// 4xx and disk errors are terminal.
    pub fn retryable(&self) -> bool {
        match self {
            DownloadError::Http { status } => *status >= 500,
            DownloadError::Timeout(_) | DownloadError::Network(_) => true,
            DownloadError::Io(_) => false,
        }
    }
}

/// Extractor and mapper failures. All terminal per item.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("could not classify artifact format")]
    UnknownFormat,
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("{0}")]
    Extraction(String),
    #[error("mapping config error: {0}")]
    Config(String),
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::UnknownFormat => ErrorKind::Format,
            _ => ErrorKind::Parse,
        }
    }
}

/// Database failures, split by retry policy: transport is retryable,
/// constraint violations are terminal.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database constraint violation: {0}")]
    Constraint(String),
    #[error("database transport error: {0}")]
    Transport(String),
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Constraint(_) => ErrorKind::DbConstraint,
            DbError::Transport(_) => ErrorKind::DbTransport,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, DbError::Transport(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                // Class 23 = integrity constraint violation.
                let constraint = db.code().map(|c| c.starts_with("23")).unwrap_or(false);
                if constraint {
                    DbError::Constraint(db.to_string())
                } else {
                    DbError::Transport(db.to_string())
                }
            }
            _ => DbError::Transport(e.to_string()),
        }
    }
}

/// Serializable error recorded in an `ItemOutcome`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ItemError {
            kind,
            message: message.into(),
        }
    }
}

/// Umbrella error for the service surface.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Db(#[from] DbError),
}
