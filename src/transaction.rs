//! Transaction lifecycle management.
//!
//! `with_transaction` leases a connection, opens the right transaction
//! boundary for it (a root `BEGIN`, or a savepoint when the connection
//! already has an open transaction), runs caller-supplied work, and
//! finalizes according to [`TxOptions`]. The lease is scoped: every exit
//! path returns the connection to the pool exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{PgKitError, Result};

/// Probe that forces the server to materialize the ambient transaction
/// (assign a transaction id) before we ask about it. Without it, a
/// read-only open transaction reports no assigned id and would be
/// mistaken for autocommit mode.
const TX_PROBE_SQL: &str =
    "CREATE TEMPORARY TABLE IF NOT EXISTS pgkit_tx_probe (x int) ON COMMIT DROP";

const TX_STATUS_SQL: &str = "SELECT pg_current_xact_id_if_assigned() IS NOT NULL";

// ============================================================================
// Options and outcomes
// ============================================================================

/// Finalization behavior for [`Database::with_transaction`].
///
/// [`Database::with_transaction`]: crate::Database::with_transaction
#[derive(Debug, Clone)]
pub struct TxOptions {
    /// Commit after `work` succeeds. Ignored when `auto_rollback` is set.
    pub auto_commit: bool,
    /// Roll back after `work` succeeds (dry-run mode).
    pub auto_rollback: bool,
    /// Deadline for resolving a deferred outcome. Only consulted when
    /// neither auto flag is set; `None` disarms the timer.
    pub timeout: Option<Duration>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_rollback: false,
            timeout: Some(Duration::from_millis(2000)),
        }
    }
}

impl TxOptions {
    /// Roll back on success regardless of what `work` did.
    pub fn rollback_only() -> Self {
        Self {
            auto_commit: false,
            auto_rollback: true,
            ..Self::default()
        }
    }

    /// Defer the commit/rollback decision to the returned handle.
    pub fn deferred() -> Self {
        Self {
            auto_commit: false,
            auto_rollback: false,
            ..Self::default()
        }
    }

    /// Set the deferred-outcome deadline.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a transaction ended.
///
/// Callers must pattern-match: a `Finalized` value is done, a `Deferred`
/// value still owns its connection and must be resolved via
/// [`DeferredTx::commit`] or [`DeferredTx::rollback`].
pub enum TxOutcome<T> {
    /// The transaction was committed or rolled back and the lease released.
    Finalized(T),
    /// The commit/rollback decision is deferred to the handle.
    Deferred(DeferredTx<T>),
}

impl<T> TxOutcome<T> {
    /// The value produced by `work`, whichever way the transaction ended.
    pub fn value(&self) -> &T {
        match self {
            TxOutcome::Finalized(value) => value,
            TxOutcome::Deferred(deferred) => deferred.value(),
        }
    }

    /// Unwrap a finalized outcome; `None` when the decision was deferred.
    pub fn finalized(self) -> Option<T> {
        match self {
            TxOutcome::Finalized(value) => Some(value),
            TxOutcome::Deferred(_) => None,
        }
    }
}

// ============================================================================
// Transaction boundary
// ============================================================================

/// The transaction boundary a call opened on its connection.
///
/// Detected once per lease and immutable afterwards: `Root` means this
/// call issued the outermost `BEGIN`; `Savepoint` means an enclosing
/// transaction was already open and this call nested inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxBoundary {
    Root,
    Savepoint(String),
}

impl TxBoundary {
    /// Detect whether `conn` already has an open transaction and pick the
    /// matching boundary. The temp-table probe is required, not an
    /// optimization: it forces a transaction id to be assigned so the
    /// status query is accurate.
    pub async fn detect(conn: &mut PgConnection) -> Result<Self> {
        sqlx::raw_sql(TX_PROBE_SQL)
            .execute(&mut *conn)
            .await
            .map_err(PgKitError::Statement)?;

        let in_transaction: bool = sqlx::query_scalar(TX_STATUS_SQL)
            .fetch_one(&mut *conn)
            .await
            .map_err(PgKitError::Statement)?;

        if in_transaction {
            Ok(TxBoundary::Savepoint(fresh_savepoint_name()))
        } else {
            Ok(TxBoundary::Root)
        }
    }

    fn begin_sql(&self) -> String {
        match self {
            TxBoundary::Root => "BEGIN".to_string(),
            TxBoundary::Savepoint(name) => format!("SAVEPOINT {}", name),
        }
    }

    fn commit_sql(&self) -> String {
        match self {
            TxBoundary::Root => "COMMIT".to_string(),
            TxBoundary::Savepoint(name) => format!("RELEASE SAVEPOINT {}", name),
        }
    }

    fn rollback_sql(&self) -> String {
        match self {
            TxBoundary::Root => "ROLLBACK".to_string(),
            TxBoundary::Savepoint(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
        }
    }
}

/// Savepoint names must be unique within the enclosing transaction; a v4
/// uuid gives that without any coordination.
fn fresh_savepoint_name() -> String {
    format!("trx_{}", Uuid::new_v4().simple())
}

async fn execute(conn: &mut PgConnection, sql: &str) -> Result<()> {
    sqlx::raw_sql(sql)
        .execute(&mut *conn)
        .await
        .map_err(PgKitError::Statement)?;
    Ok(())
}

/// Roll back `deferred`'s boundary and release its lease, from a spawned
/// background task. Runs the statement through the `&str` executor path
/// (`conn.execute(sql)`) rather than `raw_sql`: both use the simple query
/// protocol for a single no-argument statement, but only the former has a
/// `Send` future that can cross a `tokio::spawn` boundary — `raw_sql`'s
/// stream future trips rustc's "Executor is not general enough" check.
async fn rollback_deferred(deferred: DeferredConn) -> Result<()> {
    use sqlx::Executor;
    let DeferredConn { mut conn, boundary } = deferred;
    let sql = boundary.rollback_sql();
    (*conn)
        .execute(sql.as_str())
        .await
        .map_err(PgKitError::Statement)?;
    Ok(())
}

// ============================================================================
// Core algorithm
// ============================================================================

/// Detect the boundary, begin it, and run `work`. On work failure the
/// boundary is rolled back (best effort) and the original error is
/// returned untouched.
async fn begin_and_run<T, F>(conn: &mut PgConnection, work: F) -> Result<(T, TxBoundary)>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
{
    let boundary = TxBoundary::detect(conn).await?;
    execute(conn, &boundary.begin_sql()).await?;

    match work(conn).await {
        Ok(value) => Ok((value, boundary)),
        Err(err) => {
            if let Err(rollback_err) = execute(conn, &boundary.rollback_sql()).await {
                tracing::warn!(error = %rollback_err, "rollback after failed work did not complete");
            }
            Err(err)
        }
    }
}

/// Finalize a successful transaction in one of the two automatic modes.
/// A failed commit triggers a rollback attempt before the commit error is
/// surfaced; a failed rollback during that cleanup is logged, not raised.
async fn finalize_auto(conn: &mut PgConnection, boundary: &TxBoundary, options: &TxOptions) -> Result<()> {
    if options.auto_rollback {
        return execute(conn, &boundary.rollback_sql()).await;
    }

    if let Err(commit_err) = execute(conn, &boundary.commit_sql()).await {
        if let Err(rollback_err) = execute(conn, &boundary.rollback_sql()).await {
            tracing::warn!(error = %rollback_err, "rollback after failed commit did not complete");
        }
        return Err(commit_err);
    }
    Ok(())
}

pub(crate) async fn with_transaction<T, F>(
    pool: &PgPool,
    options: TxOptions,
    work: F,
) -> Result<TxOutcome<T>>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
{
    let mut conn = pool.acquire().await.map_err(PgKitError::Pool)?;

    // Any early return from here on drops `conn`, which returns the lease
    // to the pool. Release is scoped, not best-effort cleanup.
    let (value, boundary) = begin_and_run(&mut conn, work).await?;

    if options.auto_commit || options.auto_rollback {
        finalize_auto(&mut conn, &boundary, &options).await?;
        Ok(TxOutcome::Finalized(value))
    } else {
        Ok(TxOutcome::Deferred(DeferredTx::new(
            conn,
            boundary,
            value,
            options.timeout,
        )))
    }
}

/// Run `work` under a transaction on a connection the caller already
/// holds, nesting via a savepoint when that connection has an open
/// transaction. The lease stays with the caller.
///
/// Only the automatic modes are supported here: a deferred outcome has to
/// own its connection, so it is rejected with a configuration error.
pub async fn with_transaction_on<T, F>(
    conn: &mut PgConnection,
    options: TxOptions,
    work: F,
) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
{
    if !options.auto_commit && !options.auto_rollback {
        return Err(PgKitError::Config(
            "deferred outcomes require an owned lease; use with_transaction".to_string(),
        ));
    }

    let (value, boundary) = begin_and_run(conn, work).await?;
    finalize_auto(conn, &boundary, &options).await?;
    Ok(value)
}

// ============================================================================
// Deferred outcome
// ============================================================================

struct DeferredConn {
    conn: PoolConnection<Postgres>,
    boundary: TxBoundary,
}

type DeferredSlot = Arc<Mutex<Option<DeferredConn>>>;

/// A transaction whose commit/rollback decision was deferred to the
/// caller.
///
/// The handle owns the leased connection. [`commit`] and [`rollback`]
/// consume the handle, so each decision is made at most once; a call that
/// lost the race against the timeout finds the connection already
/// released and reports [`PgKitError::TransactionTimeout`] instead of
/// releasing twice.
///
/// [`commit`]: DeferredTx::commit
/// [`rollback`]: DeferredTx::rollback
pub struct DeferredTx<T> {
    value: T,
    guard: DeferredGuard,
}

impl<T> DeferredTx<T> {
    fn new(
        conn: PoolConnection<Postgres>,
        boundary: TxBoundary,
        value: T,
        timeout: Option<Duration>,
    ) -> Self {
        let slot: DeferredSlot = Arc::new(Mutex::new(Some(DeferredConn { conn, boundary })));
        let timer = timeout.map(|timeout| arm_timeout(Arc::clone(&slot), timeout));
        Self {
            value,
            guard: DeferredGuard { slot, timer },
        }
    }

    /// The value produced by `work`.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Commit and release the connection, returning the work's value.
    /// A commit failure triggers a rollback attempt before the commit
    /// error is surfaced.
    pub async fn commit(self) -> Result<T> {
        let DeferredTx { value, guard } = self;
        let Some(mut deferred) = guard.take() else {
            return Err(PgKitError::TransactionTimeout);
        };

        match execute(&mut deferred.conn, &deferred.boundary.commit_sql()).await {
            Ok(()) => Ok(value),
            Err(commit_err) => {
                if let Err(rollback_err) =
                    execute(&mut deferred.conn, &deferred.boundary.rollback_sql()).await
                {
                    tracing::warn!(error = %rollback_err, "rollback after failed commit did not complete");
                }
                Err(commit_err)
            }
        }
    }

    /// Roll back and release the connection, returning the work's value.
    pub async fn rollback(self) -> Result<T> {
        let DeferredTx { value, guard } = self;
        let Some(mut deferred) = guard.take() else {
            return Err(PgKitError::TransactionTimeout);
        };

        execute(&mut deferred.conn, &deferred.boundary.rollback_sql()).await?;
        Ok(value)
    }
}

/// Shared ownership of the still-open connection, plus the timeout timer.
/// Dropping the guard with the slot still occupied (handle dropped without
/// a decision and before any timeout) rolls back in a background task so
/// the lease cannot leak.
struct DeferredGuard {
    slot: DeferredSlot,
    timer: Option<JoinHandle<()>>,
}

impl DeferredGuard {
    fn take(&self) -> Option<DeferredConn> {
        self.slot.lock().take()
    }
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let Some(mut deferred) = self.slot.lock().take() else {
            return;
        };
        tracing::warn!("deferred transaction dropped unresolved; rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = rollback_deferred(deferred).await {
                        tracing::warn!(error = %err, "rollback of dropped deferred transaction failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!("no runtime available; connection dropped with an open transaction");
            }
        }
    }
}

/// After `timeout`, force rollback and release if the caller has not
/// resolved the outcome. Takes the slot first, so it can never race a
/// concurrent commit/rollback into a double release.
fn arm_timeout(slot: DeferredSlot, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(run_timeout(slot, timeout))
}

async fn run_timeout(slot: DeferredSlot, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(deferred) = slot.lock().take() else {
        return;
    };
    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "deferred transaction timed out; forcing rollback");
    if let Err(err) = rollback_deferred(deferred).await {
        tracing::warn!(error = %err, "rollback of timed-out transaction failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_boundary_sql() {
        let boundary = TxBoundary::Root;
        assert_eq!(boundary.begin_sql(), "BEGIN");
        assert_eq!(boundary.commit_sql(), "COMMIT");
        assert_eq!(boundary.rollback_sql(), "ROLLBACK");
    }

    #[test]
    fn test_savepoint_boundary_sql() {
        let boundary = TxBoundary::Savepoint("trx_abc".to_string());
        assert_eq!(boundary.begin_sql(), "SAVEPOINT trx_abc");
        assert_eq!(boundary.commit_sql(), "RELEASE SAVEPOINT trx_abc");
        assert_eq!(boundary.rollback_sql(), "ROLLBACK TO SAVEPOINT trx_abc");
    }

    #[test]
    fn test_savepoint_names_are_fresh_and_quotable() {
        let a = fresh_savepoint_name();
        let b = fresh_savepoint_name();
        assert_ne!(a, b);
        assert!(a.starts_with("trx_"));
        // Names are spliced into SQL unquoted, so they must stay plain
        // identifiers.
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_default_options_auto_commit() {
        let options = TxOptions::default();
        assert!(options.auto_commit);
        assert!(!options.auto_rollback);
        assert_eq!(options.timeout, Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_rollback_only_options() {
        let options = TxOptions::rollback_only();
        assert!(!options.auto_commit);
        assert!(options.auto_rollback);
    }

    #[test]
    fn test_deferred_options() {
        let options = TxOptions::deferred().timeout(Some(Duration::from_millis(500)));
        assert!(!options.auto_commit);
        assert!(!options.auto_rollback);
        assert_eq!(options.timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_outcome_value_access() {
        let outcome = TxOutcome::Finalized(42);
        assert_eq!(*outcome.value(), 42);
        assert_eq!(outcome.finalized(), Some(42));
    }
}
