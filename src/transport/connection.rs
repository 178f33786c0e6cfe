//! Broker connection with automatic reconnect
//!
//! A background watcher owns the reconnect logic. It is the only writer of
//! the current underlying connection; everyone else reads it through
//! [`Connection::current`]. Every successful redial bumps a generation
//! counter so channels know when to reopen.

use crate::config::AmqpConfig;
use crate::transport::{
    Broker, BrokerConnection, Channel, ConnectionEvent, Queue, TransportError, TransportResult,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// How a lost connection is redialed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Pause before every redial attempt
    pub wait: Duration,
    /// Failed redials tolerated per outage before giving up
    pub max_attempts: u32,
}

impl ReconnectSettings {
    pub fn from_config(config: &AmqpConfig) -> Self {
        Self {
            wait: config.reconnect_interval(),
            max_attempts: config.max_reconnect,
        }
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    current: RwLock<(u64, Arc<dyn BrokerConnection>)>,
    generation: AtomicU64,
    settings: ReconnectSettings,
    lost: CancellationToken,
    shutdown: CancellationToken,
}

/// A self-healing broker connection
///
/// Cloning is cheap; all clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Dials the broker and starts the watcher
    ///
    /// The first dial is not retried: a broker that is unreachable at start-up
    /// is reported straight away.
    pub async fn dial(
        broker: Arc<dyn Broker>,
        settings: ReconnectSettings,
    ) -> TransportResult<Self> {
        let connection = broker.dial().await?;
        let events = connection.take_events();

        tracing::info!("Connected to broker at {}", broker.describe());

        let inner = Arc::new(Inner {
            broker,
            current: RwLock::new((0, connection)),
            generation: AtomicU64::new(0),
            settings,
            lost: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(watch(Arc::clone(&inner), events));

        Ok(Self { inner })
    }

    /// Returns the live connection and its generation
    ///
    /// # Errors
    ///
    /// `ConnectionLost` once the reconnect ceiling has been hit, `Closed`
    /// after [`Connection::close`].
    pub async fn current(&self) -> TransportResult<(u64, Arc<dyn BrokerConnection>)> {
        if self.inner.lost.is_cancelled() {
            return Err(TransportError::ConnectionLost {
                attempts: self.inner.settings.max_attempts,
            });
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Closed("connection closed by owner".to_string()));
        }

        let current = self.inner.current.read().await;
        Ok((current.0, Arc::clone(&current.1)))
    }

    /// Creates a flow-controlled channel on this connection
    pub fn channel(&self) -> Channel {
        Channel::new(self.clone())
    }

    /// Opens a new channel and declares `name` on it
    pub async fn open_queue(&self, name: &str) -> TransportResult<Queue> {
        Arc::new(self.channel()).queue(name).await
    }

    /// Number of successful redials so far
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Fires once the connection can no longer be restored
    pub fn lost(&self) -> CancellationToken {
        self.inner.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.is_cancelled()
    }

    /// Address of the broker for log lines
    pub fn describe(&self) -> String {
        self.inner.broker.describe()
    }

    /// Stops the watcher and closes the underlying connection
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let current = Arc::clone(&self.inner.current.read().await.1);
        if let Err(e) = current.close().await {
            tracing::debug!("Error closing broker connection: {}", e);
        }
    }
}

/// Watches connection events and redials after a close
async fn watch(inner: Arc<Inner>, mut events: Option<UnboundedReceiver<ConnectionEvent>>) {
    loop {
        let Some(rx) = events.as_mut() else {
            // Broker reports nothing; nothing to react to
            inner.shutdown.cancelled().await;
            return;
        };

        let reason = loop {
            let event = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => return,
                event = rx.recv() => event,
            };

            match event {
                Some(ConnectionEvent::Blocked { reason }) => {
                    tracing::warn!("Broker connection blocked: {}", reason);
                }
                Some(ConnectionEvent::Unblocked) => {
                    tracing::info!("Broker connection unblocked");
                }
                Some(ConnectionEvent::Closed { reason }) => break reason,
                None => break "event stream ended".to_string(),
            }
        };

        match reconnect(&inner, &reason).await {
            Some(next) => events = next,
            None => return,
        }
    }
}

/// Redials until it succeeds, the ceiling is hit or the owner shuts down
///
/// Returns the new connection's event receiver, or `None` when the watcher
/// should stop.
async fn reconnect(
    inner: &Inner,
    reason: &str,
) -> Option<Option<UnboundedReceiver<ConnectionEvent>>> {
    let settings = inner.settings;
    tracing::warn!(
        "Broker connection lost ({}), reconnecting in {:?}",
        reason,
        settings.wait
    );

    let mut attempts: u32 = 0;
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(settings.wait) => {}
        }

        match inner.broker.dial().await {
            Ok(connection) => {
                if inner.shutdown.is_cancelled() {
                    let _ = connection.close().await;
                    return None;
                }

                let events = connection.take_events();
                let generation = {
                    let mut current = inner.current.write().await;
                    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    *current = (generation, connection);
                    generation
                };

                tracing::info!(
                    "Reconnected to broker at {} (generation {}, {} failed attempts)",
                    inner.broker.describe(),
                    generation,
                    attempts
                );
                return Some(events);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= settings.max_attempts {
                    tracing::error!(
                        "Giving up on broker at {} after {} reconnect attempts: {}",
                        inner.broker.describe(),
                        attempts,
                        e
                    );
                    inner.lost.cancel();
                    return None;
                }
                tracing::warn!(
                    "Reconnect attempt {}/{} failed: {}",
                    attempts,
                    settings.max_attempts,
                    e
                );
            }
        }
    }
}
