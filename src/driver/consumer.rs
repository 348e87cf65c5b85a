//! # AMQP Consumer
//!
//! The driver facade the job pipeline talks to. A [`Consumer`] owns:
//!
//! - the [`ConnectionSupervisor`] (connection, pooled publish/state channels, redial),
//! - the [`Publisher`] for `push`,
//! - at most one [`Subscription`] feeding the priority queue,
//! - the registered pipeline identity and the reporting counters.
//!
//! Lifecycle transitions (run, pause, resume, stop and the resubscription after a redial) are
//! serialized by one async mutex. `push`, `state` and `status` never take it: they only contend
//! for their own pooled channel.
//!
//! ```text
//!            run             pause
//!   Idle ----------> Running -------> Paused
//!     |                ^  |  <-------   |
//!     |                |  |   resume    |
//!     +------ stop ----+--+-------------+---> Stopped (terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{close_channel, AckPolicy, ListenerContext, Subscription};
use super::pool::ChannelRole;
use super::publisher::Publisher;
use super::state::{JobsState, Status};
use super::supervisor::{next_backoff, ConnectionSupervisor, ReconnectHandler, RedialMessage};
use super::topology::TopologyManager;
use crate::broker::{Broker, BrokerChannel};
use crate::config::{load_driver_config, load_pipeline_config, ConfigSource, DriverConfig};
use crate::constants::{DRIVER_NAME, REDIAL_INITIAL_BACKOFF};
use crate::error::{DriverError, DriverResult};
use crate::logging::{log_driver_operation, log_error};
use crate::messaging::{codec_for, Item, Job};
use crate::pipeline::{Pipeline, PipelineSlot};
use crate::priority_queue::PriorityQueue;

/// Lifecycle of the delivery side of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Connected, never subscribed
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Paused => write!(f, "paused"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

struct Lifecycle {
    state: LifecycleState,
    subscription: Option<Subscription>,
    /// Consume channel of a paused subscription, kept open for outstanding acknowledgers
    parked: Option<Arc<dyn BrokerChannel>>,
}

impl Lifecycle {
    async fn close_parked(&mut self) {
        if let Some(channel) = self.parked.take() {
            close_channel(channel.as_ref()).await;
        }
    }
}

struct ConsumerShared {
    config: DriverConfig,
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Publisher,
    queue: Arc<dyn PriorityQueue>,
    pipeline: Arc<PipelineSlot>,
    lifecycle: Mutex<Lifecycle>,
    listeners: AtomicU32,
    stopped: AtomicBool,
    delayed: Arc<AtomicI64>,
    stop: CancellationToken,
}

impl ConsumerShared {
    fn listener_context(&self) -> ListenerContext {
        ListenerContext {
            queue: Arc::clone(&self.queue),
            pipeline: Arc::clone(&self.pipeline),
            default_priority: self.config.priority,
            policy: AckPolicy {
                multiple: self.config.multiple_ack,
                requeue_on_fail: self.config.requeue_on_fail,
            },
        }
    }

    async fn subscribe(&self) -> DriverResult<Subscription> {
        Subscription::start(
            &self.supervisor,
            &self.config,
            self.listener_context(),
            self.stop.child_token(),
        )
        .await
    }

    fn pipeline_name(&self) -> Option<String> {
        self.pipeline.load().map(|pipeline| pipeline.name().to_string())
    }

    fn ensure_not_stopped(&self) -> DriverResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        Ok(())
    }
}

impl Drop for ConsumerShared {
    fn drop(&mut self) {
        self.stop.cancel();
        self.supervisor.shutdown();
    }
}

#[async_trait]
impl ReconnectHandler for ConsumerShared {
    async fn reconnect(&self, message: RedialMessage) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut lifecycle = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return,
            lifecycle = self.lifecycle.lock() => lifecycle,
        };

        if let Some(subscription) = lifecycle.subscription.take() {
            subscription.abandon().await;
        }
        lifecycle.parked = None;
        self.listeners.store(0, Ordering::SeqCst);

        if let Err(e) = self.supervisor.redial().await {
            debug!(error = %e, "Redial abandoned");
            return;
        }

        if lifecycle.state != LifecycleState::Running {
            return;
        }

        let mut backoff = REDIAL_INITIAL_BACKOFF;
        loop {
            match self.subscribe().await {
                Ok(subscription) => {
                    lifecycle.subscription = Some(subscription);
                    self.listeners.store(1, Ordering::SeqCst);
                    info!(
                        source = %message.source,
                        queue = %self.config.queue,
                        prefetch = self.config.prefetch,
                        "✅ Listener restored after redial"
                    );
                    return;
                }
                Err(e) => {
                    log_error(
                        "consumer",
                        "resubscribe",
                        &e.to_string(),
                        Some(&format!("source={} queue={}", message.source, self.config.queue)),
                    );
                }
            }

            // A lost connection queues its own redial message
            let connected = self
                .supervisor
                .connection()
                .map(|connection| connection.is_open())
                .unwrap_or(false);
            if !connected {
                warn!(queue = %self.config.queue, "Connection lost while resubscribing");
                return;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.config.redial_timeout());
        }
    }
}

/// AMQP-backed job queue driver for one pipeline
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerShared>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.inner.config.queue)
            .field("exchange", &self.inner.config.exchange)
            .field("listeners", &self.listeners())
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Consumer {
    /// Construct from the configuration section `config_key` merged with the global `amqp`
    /// section
    pub async fn new(
        config_key: &str,
        broker: Arc<dyn Broker>,
        source: &dyn ConfigSource,
        queue: Arc<dyn PriorityQueue>,
    ) -> DriverResult<Self> {
        let config = load_driver_config(config_key, source)?;
        Self::with_config(config, broker, queue).await
    }

    /// Construct from a pipeline's options and register that pipeline
    pub async fn from_pipeline(
        pipeline: Pipeline,
        broker: Arc<dyn Broker>,
        source: &dyn ConfigSource,
        queue: Arc<dyn PriorityQueue>,
    ) -> DriverResult<Self> {
        let config = load_pipeline_config(&pipeline, source)?;
        let consumer = Self::with_config(config, broker, queue).await?;
        consumer.register(pipeline);
        Ok(consumer)
    }

    /// Connect with an already resolved configuration
    ///
    /// Dials the broker, declares the topology, opens the publish and state channels and starts
    /// the redial executor.
    pub async fn with_config(
        config: DriverConfig,
        broker: Arc<dyn Broker>,
        queue: Arc<dyn PriorityQueue>,
    ) -> DriverResult<Self> {
        config.validate()?;
        let started = Instant::now();

        let topology = Arc::new(TopologyManager::from_config(&config));
        let supervisor = ConnectionSupervisor::connect(
            broker,
            config.addr.clone(),
            config.redial_timeout(),
            topology,
        )
        .await?;

        let delayed = Arc::new(AtomicI64::new(0));
        let publisher = Publisher::new(
            Arc::clone(&supervisor),
            codec_for(config.publish_plain),
            Arc::clone(&delayed),
        );

        let inner = Arc::new(ConsumerShared {
            config,
            supervisor: Arc::clone(&supervisor),
            publisher,
            queue,
            pipeline: Arc::new(PipelineSlot::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Idle,
                subscription: None,
                parked: None,
            }),
            listeners: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            delayed,
            stop: CancellationToken::new(),
        });

        let weak: Weak<ConsumerShared> = Arc::downgrade(&inner);
        let handler: Weak<dyn ReconnectHandler> = weak;
        supervisor.start(Some(handler));

        debug!(
            queue = %inner.config.queue,
            exchange = %inner.config.exchange,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🔧 AMQP consumer initialized"
        );
        Ok(Self { inner })
    }

    /// Replace the registered pipeline identity
    pub fn register(&self, pipeline: Pipeline) {
        debug!(pipeline = %pipeline.name(), driver = %pipeline.driver(), "Pipeline registered");
        self.inner.pipeline.store(pipeline);
    }

    /// Publish a job of the registered pipeline
    ///
    /// `cancel` bounds the wait for the publish channel; a cancelled token fails with the
    /// timeout kind before any broker I/O.
    pub async fn push(&self, job: Job, cancel: &CancellationToken) -> DriverResult<()> {
        self.inner.ensure_not_stopped()?;
        self.inner.pipeline.expect_named(&job.options.pipeline)?;

        let started = Instant::now();
        let item = Item::from_job(job);
        self.inner.publisher.publish(&item, cancel).await?;

        debug!(
            job_id = %item.id(),
            pipeline = %item.pipeline(),
            delay_ms = item.delay().as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job pushed"
        );
        Ok(())
    }

    /// Subscribe to the queue and start feeding the priority queue
    pub async fn run(&self, pipeline: &Pipeline) -> DriverResult<()> {
        let started = Instant::now();
        self.inner.ensure_not_stopped()?;
        self.inner.pipeline.expect_named(pipeline.name())?;

        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.ensure_not_stopped()?;
        if lifecycle.subscription.is_some() {
            warn!(pipeline = %pipeline.name(), "Listener is already running");
            return Ok(());
        }

        lifecycle.close_parked().await;
        let subscription = self.inner.subscribe().await?;
        lifecycle.subscription = Some(subscription);
        lifecycle.state = LifecycleState::Running;
        self.inner.listeners.store(1, Ordering::SeqCst);

        log_driver_operation(
            "run",
            Some(pipeline.name()),
            Some(&self.inner.config.queue),
            "started",
            None,
        );
        info!(
            pipeline = %pipeline.name(),
            driver = %pipeline.driver(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🚀 Pipeline was started"
        );
        Ok(())
    }

    /// Cancel the subscription; deliveries stay in the broker until `resume`
    pub async fn pause(&self, pipeline: &str) -> DriverResult<()> {
        let started = Instant::now();
        self.inner.pipeline.expect_named(pipeline)?;

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.listeners.load(Ordering::SeqCst) == 0 {
            warn!(pipeline = %pipeline, "No active listeners, nothing to pause");
            return Ok(());
        }

        self.inner.listeners.store(0, Ordering::SeqCst);
        if let Some(subscription) = lifecycle.subscription.take() {
            lifecycle.parked = subscription.cancel().await;
        }
        lifecycle.state = LifecycleState::Paused;

        log_driver_operation(
            "pause",
            Some(pipeline),
            Some(&self.inner.config.queue),
            "paused",
            None,
        );
        info!(
            pipeline = %pipeline,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline was paused"
        );
        Ok(())
    }

    /// Resubscribe with the configured QoS
    pub async fn resume(&self, pipeline: &str) -> DriverResult<()> {
        let started = Instant::now();
        self.inner.ensure_not_stopped()?;
        self.inner.pipeline.expect_named(pipeline)?;

        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.ensure_not_stopped()?;
        if self.inner.listeners.load(Ordering::SeqCst) == 1 {
            warn!(pipeline = %pipeline, "Listener is already in the active state");
            return Ok(());
        }

        lifecycle.close_parked().await;
        let subscription = self.inner.subscribe().await?;
        lifecycle.subscription = Some(subscription);
        lifecycle.state = LifecycleState::Running;
        self.inner.listeners.store(1, Ordering::SeqCst);

        log_driver_operation(
            "resume",
            Some(pipeline),
            Some(&self.inner.config.queue),
            "resumed",
            None,
        );
        info!(
            pipeline = %pipeline,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline was resumed"
        );
        Ok(())
    }

    /// Terminal shutdown; repeated calls are no-ops
    pub async fn stop(&self) -> DriverResult<()> {
        let started = Instant::now();
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("Consumer already stopped");
            return Ok(());
        }

        self.inner.stop.cancel();
        self.inner.supervisor.shutdown();

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(subscription) = lifecycle.subscription.take() {
            subscription.close().await;
        }
        lifecycle.close_parked().await;
        self.inner.listeners.store(0, Ordering::SeqCst);
        lifecycle.state = LifecycleState::Stopped;

        if self.inner.config.delete_queue_on_stop {
            self.delete_queue().await;
        }
        drop(lifecycle);

        self.inner.supervisor.close().await;

        let pipeline = self.inner.pipeline_name();
        log_driver_operation(
            "stop",
            pipeline.as_deref(),
            Some(&self.inner.config.queue),
            "stopped",
            None,
        );
        info!(
            pipeline = pipeline.as_deref().unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline was stopped"
        );
        Ok(())
    }

    async fn delete_queue(&self) {
        let queue = &self.inner.config.queue;
        let channel = match self.inner.supervisor.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Cannot delete queue on stop");
                return;
            }
        };
        match channel.queue_delete(queue).await {
            Ok(purged) => debug!(queue = %queue, purged = purged, "Queue deleted on stop"),
            Err(e) => warn!(queue = %queue, error = %e, "Queue delete on stop failed"),
        }
        let _ = channel.close().await;
    }

    /// Broker-side view of the pipeline's queue
    ///
    /// `cancel` bounds the wait for the state channel; a cancelled token fails with the timeout
    /// kind before any broker I/O.
    pub async fn state(&self, cancel: &CancellationToken) -> DriverResult<JobsState> {
        self.inner.ensure_not_stopped()?;
        let channel = self
            .inner
            .supervisor
            .pool()
            .acquire(ChannelRole::State, cancel)
            .await?;

        let queue = &self.inner.config.queue;
        let info = channel
            .queue_inspect(queue)
            .await
            .map_err(|e| DriverError::inspection(queue.clone(), e))?;

        let pipeline = self.inner.pipeline.load();
        Ok(JobsState {
            priority: pipeline
                .as_ref()
                .map(|pipeline| pipeline.priority())
                .unwrap_or(self.inner.config.priority),
            pipeline: pipeline
                .as_ref()
                .map(|pipeline| pipeline.name().to_string())
                .unwrap_or_default(),
            driver: pipeline
                .as_ref()
                .map(|pipeline| pipeline.driver().to_string())
                .unwrap_or_else(|| DRIVER_NAME.to_string()),
            queue: info.name,
            active: i64::from(info.messages),
            delayed: self.inner.delayed.load(Ordering::SeqCst),
            ready: self.inner.listeners.load(Ordering::SeqCst) > 0,
        })
    }

    /// Liveness check: inspect the queue over a throwaway channel
    pub async fn status(&self) -> Status {
        let queue = &self.inner.config.queue;
        let channel = match self.inner.supervisor.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Status channel unavailable");
                return Status::unhealthy();
            }
        };

        let status = match channel.queue_inspect(queue).await {
            Ok(_) => Status::healthy(),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Status inspection failed");
                Status::unhealthy()
            }
        };
        let _ = channel.close().await;
        status
    }

    /// Active subscriptions (0 or 1)
    pub fn listeners(&self) -> u32 {
        self.inner.listeners.load(Ordering::SeqCst)
    }

    /// Messages published with a delay so far
    pub fn delayed(&self) -> i64 {
        self.inner.delayed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The registered pipeline, if any
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.inner.pipeline.load()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Completed reconnect sequences
    pub fn redial_count(&self) -> u64 {
        self.inner.supervisor.redial_count()
    }

    pub async fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lifecycle.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::priority_queue::BoundedPriorityQueue;

    fn config() -> DriverConfig {
        DriverConfig::new()
            .with_exchange("ex")
            .with_queue("q")
            .with_routing_key("rk")
            .with_consumer_id("consumer-test")
    }

    async fn consumer(broker: &InMemoryBroker) -> Consumer {
        let consumer = Consumer::with_config(
            config(),
            Arc::new(broker.clone()),
            Arc::new(BoundedPriorityQueue::new(16)),
        )
        .await
        .unwrap();
        consumer.register(Pipeline::new("emails", "amqp"));
        consumer
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker).await;
        let pipeline = consumer.pipeline().unwrap();
        assert_eq!(consumer.lifecycle_state().await, LifecycleState::Idle);

        consumer.run(&pipeline).await.unwrap();
        assert_eq!(consumer.lifecycle_state().await, LifecycleState::Running);
        assert_eq!(consumer.listeners(), 1);

        consumer.run(&pipeline).await.unwrap();
        assert_eq!(broker.consumer_count("q"), 1);

        consumer.pause("emails").await.unwrap();
        assert_eq!(consumer.lifecycle_state().await, LifecycleState::Paused);
        assert_eq!(consumer.listeners(), 0);

        consumer.stop().await.unwrap();
        assert_eq!(consumer.lifecycle_state().await, LifecycleState::Stopped);
        assert_eq!(consumer.run(&pipeline).await, Err(DriverError::Stopped));
        assert_eq!(consumer.resume("emails").await, Err(DriverError::Stopped));
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_after_stop_is_rejected() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker).await;
        consumer.stop().await.unwrap();

        let job = Job::new("send", Vec::new()).with_pipeline("emails");
        let error = consumer
            .push(job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error, DriverError::Stopped);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_delete_queue_on_stop() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::with_config(
            config().with_delete_queue_on_stop(true),
            Arc::new(broker.clone()),
            Arc::new(BoundedPriorityQueue::new(16)),
        )
        .await
        .unwrap();
        assert!(broker.has_queue("q"));

        consumer.stop().await.unwrap();
        assert!(!broker.has_queue("q"));
    }

    #[tokio::test]
    async fn test_state_without_registered_pipeline_uses_config() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::with_config(
            config().with_priority(3),
            Arc::new(broker.clone()),
            Arc::new(BoundedPriorityQueue::new(16)),
        )
        .await
        .unwrap();

        let state = consumer.state(&CancellationToken::new()).await.unwrap();
        assert_eq!(state.priority, 3);
        assert_eq!(state.driver, DRIVER_NAME);
        assert_eq!(state.pipeline, "");
        assert!(!state.ready);
        consumer.stop().await.unwrap();
    }
}
