//! Runtime context: one pool, one listener registry.
//!
//! All shared mutable state lives in a [`Database`] constructed once at
//! process start; there is no module-level global to leak or to fight
//! over in tests.

use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use crate::error::{PgKitError, Result};
use crate::listener::{self, ListenOptions, ListenerHandle, Payload};
use crate::registry::ListenerRegistry;
use crate::transaction::{self, TxOptions, TxOutcome};

// ============================================================================
// Configuration
// ============================================================================

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,
    /// Minimum number of pooled connections
    pub min_connections: u32,
    /// Maximum number of pooled connections
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Create a new configuration.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            min_connections: 1,
            max_connections: 10,
        }
    }

    /// Read the connection URL from `DATABASE_URL`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| PgKitError::Config("DATABASE_URL is not set".to_string()))?;
        Ok(Self::new(&url))
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    ///
    /// Each active listener holds one connection for its whole lifetime;
    /// size the pool with that in mind.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// ============================================================================
// Database
// ============================================================================

/// The runtime context for transactions and listeners.
///
/// Cheap to clone; clones share the pool and the listener registry.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    registry: ListenerRegistry,
}

impl Database {
    /// Connect a new pool.
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(PgKitError::Pool)?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool, e.g. one shared with other parts of the
    /// application.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            registry: ListenerRegistry::new(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The registry of active listeners.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Lease a connection, run `work` on it, and release the lease on
    /// every exit path.
    pub async fn with_client<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.pool.acquire().await.map_err(PgKitError::Pool)?;
        work(&mut *conn).await
    }

    /// Run `work` inside a transaction on a freshly leased connection.
    ///
    /// The boundary nests as a savepoint when the connection already has
    /// an open transaction. Finalization follows `options`: commit or
    /// roll back automatically, or return a [`TxOutcome::Deferred`]
    /// handle that owns the lease until the caller decides (or the
    /// timeout forces a rollback).
    ///
    /// Failures from `work` roll the transaction back and propagate
    /// unchanged.
    pub async fn with_transaction<T, F>(&self, options: TxOptions, work: F) -> Result<TxOutcome<T>>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        transaction::with_transaction(&self.pool, options, work).await
    }

    /// Subscribe `on_message` to a notification channel.
    ///
    /// Holds a dedicated pool connection until the returned handle is
    /// stopped. With `options.exclusive` the call blocks until the
    /// channel's advisory lock is free, so at most one listener per
    /// channel is active across all processes sharing the database.
    pub async fn listen<F, Fut>(
        &self,
        channel: &str,
        options: ListenOptions,
        on_message: F,
    ) -> Result<ListenerHandle>
    where
        F: Fn(Payload) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        listener::listen(&self.pool, &self.registry, channel, options, on_message).await
    }

    /// Publish a JSON payload on a channel via `pg_notify`.
    pub async fn notify(&self, channel: &str, payload: &serde_json::Value) -> Result<()> {
        self.notify_text(channel, &payload.to_string()).await
    }

    /// Publish a raw text payload on a channel via `pg_notify`.
    pub async fn notify_text(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(PgKitError::Statement)?;
        Ok(())
    }

    /// Stop every listener, then close the pool.
    ///
    /// This is the hook a host process calls from its own termination
    /// signal handling; the crate installs no signal handler itself.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
        self.pool.close().await;
    }
}
