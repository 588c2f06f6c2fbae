//! Error types for pgkit.
//!
//! One crate-wide error enum; infrastructure failures keep their `sqlx`
//! source, caller-supplied work failures pass through unchanged.

use thiserror::Error;

/// Result type for pgkit operations.
pub type Result<T> = std::result::Result<T, PgKitError>;

#[derive(Error, Debug)]
pub enum PgKitError {
    /// Pool exhaustion or connect failure while leasing a connection.
    /// Never retried automatically.
    #[error("pool error: {0}")]
    Pool(#[source] sqlx::Error),

    /// A begin/commit/rollback/savepoint or other statement failed.
    #[error("statement error: {0}")]
    Statement(#[source] sqlx::Error),

    /// A deferred transaction outcome expired before it was resolved.
    /// The transaction was rolled back and its connection released.
    #[error("transaction timed out before commit or rollback")]
    TransactionTimeout,

    /// Lock acquisition or channel subscription failed while starting a
    /// listener.
    #[error("listener error on channel {channel}: {source}")]
    Listener {
        channel: String,
        #[source]
        source: sqlx::Error,
    },

    /// The caller passed an unusable channel name.
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    /// Invalid configuration (bad option combination, missing settings).
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure raised by caller-supplied work inside a transaction.
    #[error("{0}")]
    Work(Box<dyn std::error::Error + Send + Sync>),
}

impl PgKitError {
    /// Wrap a caller-side failure so it propagates unchanged through
    /// transaction cleanup.
    pub fn work(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        PgKitError::Work(err.into())
    }
}

impl From<sqlx::Error> for PgKitError {
    fn from(err: sqlx::Error) -> Self {
        PgKitError::Statement(err)
    }
}
