//! Transaction lifecycle and LISTEN/NOTIFY listener management for
//! PostgreSQL, on top of an `sqlx` connection pool.
//!
//! Architecture:
//! - `database`: the runtime context holding the pool and listener registry
//! - `transaction`: ambient-transaction detection, savepoint nesting, and
//!   commit/rollback/deferred finalization
//! - `listener`: channel subscription with optional cluster-wide advisory
//!   locking and an idempotent stop handle
//! - `registry`: process-wide set of active listeners for bulk shutdown
//! - `error`: crate-wide error enum

mod database;
mod error;
mod listener;
mod registry;
mod transaction;


pub use database::{Database, DatabaseConfig};
pub use error::{PgKitError, Result};
pub use listener::{advisory_lock_key, ListenOptions, ListenerHandle, Payload};
pub use registry::ListenerRegistry;
pub use transaction::{with_transaction_on, DeferredTx, TxBoundary, TxOptions, TxOutcome};

// Re-exported so callers can write `work` signatures without importing sqlx.
pub use sqlx::{PgConnection, PgPool};
