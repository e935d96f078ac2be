//! Connection lifecycle manager.
//!
//! ```text
//!             connect() ── fail-fast ──► Err
//!                 │ ok
//!                 ▼
//!   ┌──────► Connected ── generation.lost fires ──► Reconnecting
//!   │            │                                   │  establish()
//!   │            │ close()                           │  fail: sleep(reconnect_delay), retry
//!   │            ▼                                   │
//!   │         Closed ◄───────── close() ─────────────┤
//!   └──────────── install new generation ◄── ok ─────┘
//! ```
//!
//! The reconnection actor is the only writer of connection generations. All
//! state goes through one `watch` cell, so readers always see a connection
//! paired with the channel opened on it, and never hold a lock across I/O.

use crate::config::ConnectionConfig;
use crate::error::AmqpError;
use crate::metrics;
use crate::transport::{BrokerChannel, BrokerConnection, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One connection/channel pair and its loss notification
#[derive(Clone)]
pub struct Generation {
    /// 1 for the initial connection, +1 per successful reconnect
    pub id: u64,
    pub connection: Arc<dyn BrokerConnection>,
    pub channel: Arc<dyn BrokerChannel>,
    /// Cancelled once when either the connection or the channel closes
    pub lost: CancellationToken,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("lost", &self.lost.is_cancelled())
            .finish()
    }
}

/// Snapshot of the shared connection state
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub generation: Option<Generation>,
    /// Generation present and not reported lost
    pub ready: bool,
    /// Set once by `close()`, never cleared
    pub closed: bool,
}

impl ConnectionState {
    /// The live generation, or the sentinel explaining why there is none.
    ///
    /// A generation whose loss token already fired is not live, even before
    /// the reconnection actor has flipped `ready`.
    pub fn current(&self) -> Result<&Generation, AmqpError> {
        if self.closed {
            return Err(AmqpError::Shutdown);
        }
        match &self.generation {
            Some(generation) if self.ready && !generation.lost.is_cancelled() => Ok(generation),
            _ => Err(AmqpError::NotConnected),
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one broker connection alive for the lifetime of the client.
///
/// Cheap to clone; clones share the same connection and actor.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Connect once and start the reconnection actor.
    ///
    /// The first attempt is not retried: an unreachable broker or bad
    /// credentials fail construction and no background task is left behind.
    pub async fn connect(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AmqpError> {
        info!(url = %config.redacted_url(), app_name = ?config.app_name, "Connecting to AMQP broker");

        let (state, _) = watch::channel(ConnectionState::default());
        let inner = Arc::new(Inner {
            config,
            transport,
            state,
            shutdown: CancellationToken::new(),
            actor: Mutex::new(None),
        });

        let generation = establish(&inner, 1).await.inspect_err(|e| {
            error!(error = %e, "Initial AMQP connection failed");
        })?;
        let lost = generation.lost.clone();
        inner.state.send_modify(|state| {
            state.generation = Some(generation);
            state.ready = true;
        });
        metrics::connection_ready(true);
        info!(generation = 1, "Connected to AMQP broker");

        let handle = tokio::spawn(reconnect_loop(inner.clone(), lost));
        *inner.actor.lock().await = Some(handle);

        Ok(Self { inner })
    }

    /// Consistent copy of the current state
    pub fn snapshot(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.borrow().current().is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// Id of the installed generation, if any
    pub fn generation_id(&self) -> Option<u64> {
        self.inner.state.borrow().generation.as_ref().map(|g| g.id)
    }

    /// The live generation, or `NotConnected` / `Shutdown`
    pub fn current(&self) -> Result<Generation, AmqpError> {
        self.inner.state.borrow().current().cloned()
    }

    /// The live channel, or `NotConnected` / `Shutdown`
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.current().map(|generation| generation.channel)
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until ready, closed, or `timeout` elapses. Returns readiness.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.closed || s.current().is_ok()),
        )
        .await;
        matches!(waited, Ok(Ok(state)) if state.current().is_ok())
    }

    /// Stop reconnecting and close the current channel and connection.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    /// When both closes fail, the connection error is returned.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut first = false;
        self.inner.state.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.closed = true;
            state.ready = false;
            first = true;
            true
        });
        if !first {
            debug!("AMQP client already closed");
            return Ok(());
        }

        info!("Closing AMQP client");
        metrics::connection_ready(false);
        self.inner.shutdown.cancel();

        let actor = self.inner.actor.lock().await.take();
        if let Some(handle) = actor {
            if let Err(e) = handle.await {
                error!(error = %e, "Reconnection task panicked");
            }
        }

        let mut taken = None;
        self.inner.state.send_modify(|state| taken = state.generation.take());
        let Some(generation) = taken else {
            return Ok(());
        };

        let channel_result = generation.channel.close().await;
        let connection_result = generation.connection.close().await;

        if generation.lost.is_cancelled() {
            // Closing dead handles is expected to fail.
            debug!(generation = generation.id, "Skipped close errors of a lost generation");
            return Ok(());
        }
        if let (Err(channel_err), Err(_)) = (&channel_result, &connection_result) {
            warn!(error = %channel_err, "Channel close failed");
        }
        connection_result.and(channel_result)
    }
}

/// Dial, open a channel and wire the loss token to both handles.
async fn establish(inner: &Inner, id: u64) -> Result<Generation, AmqpError> {
    let connection = inner
        .transport
        .dial(&inner.config.url, inner.config.app_name.clone())
        .await?;

    let channel = match connection.open_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                warn!(error = %close_err, "Failed to close connection after channel error");
            }
            return Err(e);
        }
    };

    let lost = CancellationToken::new();
    connection.on_close(lost.clone());
    channel.on_close(lost.clone());

    Ok(Generation {
        id,
        connection,
        channel,
        lost,
    })
}

/// Install a fresh generation unless the client was closed meanwhile.
///
/// The closed check and the swap happen in one state update, so `close()`
/// either sees the new generation and tears it down, or this returns it.
fn install(inner: &Inner, generation: Generation) -> Result<(), Generation> {
    let mut slot = Some(generation);
    inner.state.send_if_modified(|state| {
        if state.closed {
            return false;
        }
        state.generation = slot.take();
        state.ready = true;
        true
    });
    match slot {
        Some(rejected) => Err(rejected),
        None => Ok(()),
    }
}

fn mark_lost(inner: &Inner) {
    inner.state.send_if_modified(|state| {
        let was_ready = state.ready;
        state.ready = false;
        was_ready
    });
    metrics::connection_ready(false);
    metrics::connection_lost();
}

async fn reconnect_loop(inner: Arc<Inner>, mut lost: CancellationToken) {
    let delay = inner.config.reconnect_delay;
    let mut next_id = 2;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = lost.cancelled() => {}
        }

        mark_lost(&inner);
        warn!(delay_ms = delay.as_millis() as u64, "AMQP connection lost, reconnecting");

        loop {
            if inner.shutdown.is_cancelled() {
                debug!("Reconnection task stopped");
                return;
            }

            let attempt = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                attempt = establish(&inner, next_id) => attempt,
            };

            match attempt {
                Ok(generation) => {
                    metrics::reconnect_attempt(true);
                    let id = generation.id;
                    let next_lost = generation.lost.clone();
                    match install(&inner, generation) {
                        Ok(()) => {
                            metrics::connection_ready(true);
                            info!(generation = id, "Reconnected to AMQP broker");
                            lost = next_lost;
                            next_id += 1;
                            break;
                        }
                        Err(rejected) => {
                            debug!(generation = id, "Client closed during reconnect, discarding connection");
                            let _ = rejected.channel.close().await;
                            let _ = rejected.connection.close().await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    metrics::reconnect_attempt(false);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Reconnect attempt failed");
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    debug!("Reconnection task stopped");
}
