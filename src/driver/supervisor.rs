//! # Connection Supervisor
//!
//! Owns the broker connection and the channel pool, and keeps both alive:
//!
//! - **Redial trigger**: every close notification (connection, publish, state and consume
//!   channels) is forwarded by its own watcher task into one bounded redial queue.
//! - **Redial executor**: a single task drains the queue. Messages stamped with an older
//!   connection generation are discarded, so a connection failure that also kills every
//!   channel produces exactly one reconnect sequence.
//! - **Redial**: invalidate the pool, drop the stale connection, then dial, re-declare the
//!   topology and reinstall publish/state channels. Attempts repeat forever with exponential
//!   backoff capped at `redial_timeout`, until shutdown.
//!
//! Work that depends on the consumer's lifecycle (resubscribing an active listener) is
//! delegated to a [`ReconnectHandler`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::ChannelPool;
use super::topology::TopologyManager;
use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, CloseSignal};
use crate::constants::{REDIAL_INITIAL_BACKOFF, REDIAL_QUEUE_CAPACITY};
use crate::error::{DriverError, DriverResult};

/// Which close notification fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedialSource {
    Connection,
    PublishChannel,
    StateChannel,
    ConsumeChannel,
}

impl std::fmt::Display for RedialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RedialSource::Connection => "connection",
            RedialSource::PublishChannel => "publish_channel",
            RedialSource::StateChannel => "state_channel",
            RedialSource::ConsumeChannel => "consume_channel",
        };
        write!(f, "{name}")
    }
}

/// Request to reconnect, tagged with its source and the connection generation it observed
#[derive(Debug, Clone, PartialEq)]
pub struct RedialMessage {
    pub source: RedialSource,
    pub generation: u64,
    pub error: BrokerError,
}

/// Lifecycle-aware reaction to a connection loss
#[async_trait]
pub trait ReconnectHandler: Send + Sync {
    /// Called by the redial executor for every current-generation redial message. Expected to
    /// call [`ConnectionSupervisor::redial`] and restore whatever depended on the connection.
    async fn reconnect(&self, message: RedialMessage);
}

/// Pause before the attempt following `previous`
pub fn next_backoff(previous: Duration, ceiling: Duration) -> Duration {
    previous.saturating_mul(2).min(ceiling.max(REDIAL_INITIAL_BACKOFF))
}

pub struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    addr: String,
    redial_timeout: Duration,
    topology: Arc<TopologyManager>,
    pool: ChannelPool,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    generation: AtomicU64,
    redials: AtomicU64,
    redial_tx: mpsc::Sender<RedialMessage>,
    redial_rx: Mutex<Option<mpsc::Receiver<RedialMessage>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Dial the broker, declare the topology, open the publish and state channels and watch
    /// all of them. The redial executor starts with [`ConnectionSupervisor::start`].
    pub async fn connect(
        broker: Arc<dyn Broker>,
        addr: impl Into<String>,
        redial_timeout: Duration,
        topology: Arc<TopologyManager>,
    ) -> DriverResult<Arc<Self>> {
        let (redial_tx, redial_rx) = mpsc::channel(REDIAL_QUEUE_CAPACITY);
        let supervisor = Arc::new(Self {
            broker,
            addr: addr.into(),
            redial_timeout,
            topology,
            pool: ChannelPool::new(),
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
            redials: AtomicU64::new(0),
            redial_tx,
            redial_rx: Mutex::new(Some(redial_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        supervisor.establish(0).await?;
        info!(
            provider = supervisor.broker.provider_name(),
            exchange = %supervisor.topology.exchange_name(),
            queue = %supervisor.topology.queue_name(),
            "✅ Connected to broker"
        );
        Ok(supervisor)
    }

    /// Start the redial executor
    pub fn start(self: &Arc<Self>, handler: Option<Weak<dyn ReconnectHandler>>) {
        let Some(mut redial_rx) = self.redial_rx.lock().take() else {
            warn!("Redial executor already started");
            return;
        };

        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            debug!("🚀 Redial executor started");
            loop {
                let message = tokio::select! {
                    biased;
                    _ = supervisor.shutdown.cancelled() => break,
                    message = redial_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let current = supervisor.generation();
                if message.generation != current {
                    debug!(
                        source = %message.source,
                        stale_generation = message.generation,
                        current_generation = current,
                        "Ignoring redial message from a replaced connection"
                    );
                    continue;
                }

                warn!(
                    source = %message.source,
                    error = %message.error,
                    "Broker connection lost, redialing"
                );
                match handler.as_ref().and_then(|handler| handler.upgrade()) {
                    Some(handler) => handler.reconnect(message).await,
                    None => {
                        if let Err(e) = supervisor.redial().await {
                            error!(error = %e, "Redial aborted");
                        }
                    }
                }
            }
            debug!("Redial executor stopped");
        });
        self.tasks.lock().push(handle);
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// Generation of the current connection; bumped when a redial starts
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Completed reconnect sequences
    pub fn redial_count(&self) -> u64 {
        self.redials.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The current connection
    pub fn connection(&self) -> DriverResult<Arc<dyn BrokerConnection>> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| DriverError::connection("no broker connection"))
    }

    /// Open a channel on the current connection
    pub async fn open_channel(&self) -> DriverResult<Arc<dyn BrokerChannel>> {
        let connection = self.connection()?;
        Ok(connection.open_channel().await?)
    }

    /// Forward `signal` into the redial queue when it fires
    pub fn watch(&self, signal: CloseSignal, source: RedialSource, generation: u64) {
        let redial_tx = self.redial_tx.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                closed = signal => {
                    if let Ok(error) = closed {
                        debug!(source = %source, error = %error, "Close notification received");
                        let message = RedialMessage { source, generation, error };
                        if redial_tx.send(message).await.is_err() {
                            debug!(source = %source, "Redial queue closed");
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Replace the connection and pooled channels, retrying until success or shutdown
    pub async fn redial(&self) -> DriverResult<()> {
        let started = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let stale_channels = self.pool.invalidate();
        let stale_connection = self.connection.write().take();
        for channel in stale_channels {
            let _ = channel.close().await;
        }
        if let Some(connection) = stale_connection {
            let _ = connection.close().await;
        }

        let mut backoff = REDIAL_INITIAL_BACKOFF;
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(DriverError::Stopped);
            }

            attempt += 1;
            match self.establish(generation).await {
                Ok(()) => {
                    self.redials.fetch_add(1, Ordering::SeqCst);
                    info!(
                        attempt = attempt,
                        generation = generation,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "✅ Redial succeeded"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Redial attempt failed"
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(DriverError::Stopped),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.redial_timeout);
        }
    }

    async fn establish(&self, generation: u64) -> DriverResult<()> {
        let connection = self
            .broker
            .dial(&self.addr)
            .await
            .map_err(|e| DriverError::connection(format!("dial failed: {e}")))?;

        match self.open_pooled_channels(connection.as_ref()).await {
            Ok((publish, state)) => {
                if !self.pool.install(Arc::clone(&publish), Arc::clone(&state)) {
                    let _ = connection.close().await;
                    return Err(DriverError::Stopped);
                }
                self.watch(connection.notify_close(), RedialSource::Connection, generation);
                self.watch(publish.notify_close(), RedialSource::PublishChannel, generation);
                self.watch(state.notify_close(), RedialSource::StateChannel, generation);

                *self.connection.write() = Some(connection);
                Ok(())
            }
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    async fn open_pooled_channels(
        &self,
        connection: &dyn BrokerConnection,
    ) -> DriverResult<(Arc<dyn BrokerChannel>, Arc<dyn BrokerChannel>)> {
        self.topology.declare_on(connection).await?;
        let publish = connection.open_channel().await?;
        let state = connection.open_channel().await?;
        Ok((publish, state))
    }

    /// Stop the redial executor and every watcher; an in-progress redial gives up
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shut down, close the pooled channels and the connection, and join background tasks
    ///
    /// Callers still waiting for a pooled channel fail with [`DriverError::Stopped`].
    pub async fn close(&self) {
        self.shutdown();

        for channel in self.pool.close() {
            let _ = channel.close().await;
        }
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Closing broker connection failed");
            }
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("Connection supervisor closed");
    }
}
