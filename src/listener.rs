//! Notification listeners.
//!
//! `listen` takes a dedicated connection out of the pool, optionally
//! serializes on a cluster-wide advisory lock derived from the channel
//! name, subscribes via LISTEN, and dispatches decoded payloads to a
//! handler from a background task. The returned [`ListenerHandle`] stops
//! the listener; stopping twice is a silent no-op.

use std::future::Future;

use parking_lot::Mutex;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{PgKitError, Result};
use crate::registry::ListenerRegistry;

// ============================================================================
// Options and payloads
// ============================================================================

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Hold an advisory lock so at most one listener per channel is active
    /// across every process sharing the database.
    pub exclusive: bool,
    /// Decode payloads as JSON before dispatch; raw text otherwise.
    pub parse_json: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            exclusive: true,
            parse_json: true,
        }
    }
}

impl ListenOptions {
    /// Disable single-listener enforcement.
    pub fn shared() -> Self {
        Self {
            exclusive: false,
            ..Self::default()
        }
    }

    /// Deliver payloads as raw text.
    pub fn raw() -> Self {
        Self {
            parse_json: false,
            ..Self::default()
        }
    }
}

/// A notification payload as delivered to the handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

impl Payload {
    fn decode(raw: &str, parse_json: bool) -> serde_json::Result<Self> {
        if parse_json {
            Ok(Payload::Json(serde_json::from_str(raw)?))
        } else {
            Ok(Payload::Text(raw.to_string()))
        }
    }
}

/// Derive the 64-bit advisory lock key for a channel.
///
/// First eight bytes of `md5("listen-<channel>")`, big-endian. The
/// derivation is deterministic, so independent processes contend on the
/// same key; distinct channels colliding is accepted risk, not a
/// guarantee.
pub fn advisory_lock_key(channel: &str) -> i64 {
    let digest = md5::compute(format!("listen-{}", channel));
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest.0[..8]);
    i64::from_be_bytes(key)
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(PgKitError::InvalidChannel(
            "channel name must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Listener handle
// ============================================================================

struct ListenerInner {
    id: u64,
    channel: String,
    /// Present until the first stop; taking it is what makes stop
    /// idempotent.
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// The registry this handle removes itself from. The registry also
    /// holds a clone of the handle; the cycle is broken by `unregister`
    /// on every stop path.
    registry: ListenerRegistry,
}

/// Stop handle for an active listener.
///
/// Cloneable; all clones refer to the same listener. Held by the caller
/// and by the [`ListenerRegistry`] until stopped.
#[derive(Clone)]
pub struct ListenerHandle {
    inner: std::sync::Arc<ListenerInner>,
}

impl ListenerHandle {
    pub(crate) fn new(
        id: u64,
        channel: String,
        stop: oneshot::Sender<()>,
        registry: ListenerRegistry,
    ) -> Self {
        Self {
            inner: std::sync::Arc::new(ListenerInner {
                id,
                channel,
                stop: Mutex::new(Some(stop)),
                task: Mutex::new(None),
                registry,
            }),
        }
    }

    pub(crate) fn attach_task(&self, task: JoinHandle<()>) {
        *self.inner.task.lock() = Some(task);
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The channel this listener is subscribed to.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Stop the listener: UNLISTEN, release the advisory lock when held,
    /// release the connection, and remove the handle from the registry.
    ///
    /// Safe to call any number of times, from the caller, a shutdown
    /// hook, or both concurrently; only the first call does the work.
    pub async fn stop(&self) {
        let stop = self.inner.stop.lock().take();
        let Some(stop) = stop else {
            return;
        };
        // The task may already be gone (connection failure); a dead
        // receiver is fine.
        let _ = stop.send(());

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(channel = %self.inner.channel, error = %err, "listener task ended abnormally");
            }
        }
        self.inner.registry.unregister(self.inner.id);
    }
}

// ============================================================================
// Subscription
// ============================================================================

pub(crate) async fn listen<F, Fut>(
    pool: &PgPool,
    registry: &ListenerRegistry,
    channel: &str,
    options: ListenOptions,
    on_message: F,
) -> Result<ListenerHandle>
where
    F: Fn(Payload) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    validate_channel(channel)?;

    let mut listener = PgListener::connect_with(pool)
        .await
        .map_err(PgKitError::Pool)?;

    // The lock lives on the listener's own connection, so it is held for
    // exactly as long as the subscription and dies with the session if
    // the process does.
    let lock_key = if options.exclusive {
        let key = advisory_lock_key(channel);
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut listener)
            .await
            .map_err(|source| PgKitError::Listener {
                channel: channel.to_string(),
                source,
            })?;
        Some(key)
    } else {
        None
    };

    listener
        .listen(channel)
        .await
        .map_err(|source| PgKitError::Listener {
            channel: channel.to_string(),
            source,
        })?;
    tracing::info!(channel, exclusive = options.exclusive, "listening");

    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = ListenerHandle::new(
        registry.next_id(),
        channel.to_string(),
        stop_tx,
        registry.clone(),
    );
    registry.register(handle.clone());

    let task = tokio::spawn(run_listener(
        listener,
        channel.to_string(),
        options.parse_json,
        lock_key,
        on_message,
        stop_rx,
        registry.clone(),
        handle.id(),
    ));
    handle.attach_task(task);

    Ok(handle)
}

#[allow(clippy::too_many_arguments)]
async fn run_listener<F, Fut>(
    mut listener: PgListener,
    channel: String,
    parse_json: bool,
    lock_key: Option<i64>,
    on_message: F,
    mut stop_rx: oneshot::Receiver<()>,
    registry: ListenerRegistry,
    id: u64,
) where
    F: Fn(Payload) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                teardown(&mut listener, &channel, lock_key).await;
                registry.unregister(id);
                return;
            }
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => {
                    if notification.channel() != channel {
                        continue;
                    }
                    match Payload::decode(notification.payload(), parse_json) {
                        // Handlers are awaited in place: the next
                        // notification is not picked up until this one is
                        // fully dispatched, preserving per-channel order.
                        Ok(payload) => on_message(payload).await,
                        Err(err) => {
                            tracing::warn!(channel = %channel, error = %err, "dropping undecodable notification payload");
                        }
                    }
                }
                Ok(None) => {
                    fatal(listener, &channel, lock_key, registry, id, None).await;
                    return;
                }
                Err(err) => {
                    fatal(listener, &channel, lock_key, registry, id, Some(err)).await;
                    return;
                }
            }
        }
    }
}

/// Unsubscribe and unlock, each step best-effort independent of the
/// previous one. Dropping the listener afterwards releases the
/// connection.
async fn teardown(listener: &mut PgListener, channel: &str, lock_key: Option<i64>) {
    if let Err(err) = listener.unlisten(channel).await {
        tracing::warn!(channel, error = %err, "UNLISTEN failed during stop");
    }
    if let Some(key) = lock_key {
        if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut *listener)
            .await
        {
            tracing::warn!(channel, error = %err, "advisory unlock failed during stop");
        }
    }
}

/// A broken long-lived notification connection cannot be healed here;
/// clean up what we can and terminate so the supervising process
/// restarts us.
async fn fatal(
    mut listener: PgListener,
    channel: &str,
    lock_key: Option<i64>,
    registry: ListenerRegistry,
    id: u64,
    err: Option<sqlx::Error>,
) {
    match err {
        Some(err) => tracing::error!(channel, error = %err, "listener connection failed"),
        None => tracing::error!(channel, "listener connection closed unexpectedly"),
    }
    teardown(&mut listener, channel, lock_key).await;
    drop(listener);
    registry.unregister(id);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lock_key_is_deterministic() {
        assert_eq!(advisory_lock_key("orders"), advisory_lock_key("orders"));
    }

    #[test]
    fn test_lock_key_differs_by_channel() {
        assert_ne!(advisory_lock_key("orders"), advisory_lock_key("invoices"));
    }

    #[test]
    fn test_lock_key_prefix_separates_namespaces() {
        // The "listen-" prefix is part of the hashed input, so a channel
        // literally named with the prefix does not alias a plain one.
        assert_ne!(
            advisory_lock_key("listen-orders"),
            advisory_lock_key("orders")
        );
    }

    #[test]
    fn test_decode_json_payload() {
        let payload = Payload::decode(r#"{"id":42}"#, true).unwrap();
        assert_eq!(payload, Payload::Json(json!({"id": 42})));
    }

    #[test]
    fn test_decode_raw_payload() {
        let payload = Payload::decode(r#"{"id":42}"#, false).unwrap();
        assert_eq!(payload, Payload::Text(r#"{"id":42}"#.to_string()));
    }

    #[test]
    fn test_decode_invalid_json_is_an_error() {
        assert!(Payload::decode("not json", true).is_err());
    }

    #[test]
    fn test_empty_channel_rejected() {
        assert!(matches!(
            validate_channel(""),
            Err(PgKitError::InvalidChannel(_))
        ));
        assert!(validate_channel("orders").is_ok());
    }

    #[test]
    fn test_default_listen_options() {
        let options = ListenOptions::default();
        assert!(options.exclusive);
        assert!(options.parse_json);
        assert!(!ListenOptions::shared().exclusive);
        assert!(!ListenOptions::raw().parse_json);
    }
}
