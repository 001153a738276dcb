//! Error types for database connectivity.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! The variants follow the failure classes callers act on: unreachable hosts, rejected
//! credentials, deadlines, malformed details, and driver-specific user-facing text.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connect { message: String, suggestion: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid connection details: {message}")]
    Config { message: String },

    /// Driver-specific user-facing text wrapping the original failure.
    #[error("{message}")]
    Humanized {
        message: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connect(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a configuration error for malformed or missing connection details.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap this error with user-facing text produced from its raw message.
    ///
    /// Already-humanized errors are returned unchanged.
    pub fn humanize(self, humanize: impl FnOnce(&str) -> String) -> Self {
        if matches!(self, Self::Humanized { .. }) {
            return self;
        }
        let message = humanize(&self.raw_message());
        Self::Humanized {
            message,
            source: Box::new(self),
        }
    }

    /// The message as reported by the failing component, without the category prefix.
    pub fn raw_message(&self) -> String {
        match self {
            Self::Connect { message, .. }
            | Self::Auth { message }
            | Self::Config { message }
            | Self::Humanized { message, .. }
            | Self::Internal { message } => message.clone(),
            Self::Timeout { .. } => self.to_string(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connect { suggestion, .. } => Some(suggestion),
            Self::Humanized { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } => true,
            Self::Humanized { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// SQLSTATE / vendor codes that mean the credentials were rejected.
const AUTH_FAILURE_CODES: &[&str] = &[
    // PostgreSQL: invalid_password, invalid_authorization_specification
    "28P01", "28000",
    // MySQL: ER_ACCESS_DENIED_ERROR, ER_DBACCESS_DENIED_ERROR
    "1045", "1044",
];

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                match code {
                    Some(code) if AUTH_FAILURE_CODES.contains(&code.as_str()) => {
                        DbError::auth(db_err.message())
                    }
                    _ => DbError::connect(
                        db_err.message(),
                        "Check the database name and the account's privileges",
                    ),
                }
            }
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => {
                DbError::connect("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connect(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connect(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connect(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for connectivity operations.
pub type DbResult<T> = Result<T, DbError>;
