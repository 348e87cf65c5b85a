//! Test harness builders: an in-memory broker, a bounded priority queue and a consumer wired
//! to both.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tasker_amqp::broker::memory::InMemoryBroker;
use tasker_amqp::{BoundedPriorityQueue, Consumer, DriverConfig, Item, Job, Pipeline};

pub const PIPELINE: &str = "emails";
pub const EXCHANGE: &str = "ex";
pub const QUEUE: &str = "q";
pub const ROUTING_KEY: &str = "rk";

/// Consumer-tag unique per test so parallel tests never collide in logs
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Configuration bound to exchange `ex`, queue `q`, routing key `rk`
pub fn test_config() -> DriverConfig {
    DriverConfig::new()
        .with_exchange(EXCHANGE)
        .with_queue(QUEUE)
        .with_routing_key(ROUTING_KEY)
        .with_prefetch(5)
        .with_redial_timeout(1)
        .with_consumer_id(unique_name("consumer"))
}

pub fn job(id: &str) -> Job {
    Job::new("send_email", format!("payload-{id}").into_bytes())
        .with_id(id)
        .with_pipeline(PIPELINE)
}

pub struct TestHarness {
    pub broker: InMemoryBroker,
    pub queue: Arc<BoundedPriorityQueue>,
    pub consumer: Consumer,
    pub pipeline: Pipeline,
}

impl TestHarness {
    /// Start the listener of the registered pipeline
    pub async fn run(&self) {
        self.consumer.run(&self.pipeline).await.unwrap();
    }

    /// Next item from the priority queue, if one arrives within `timeout`
    pub async fn extract_within(&self, timeout: Duration) -> Option<Item> {
        tokio::time::timeout(timeout, self.queue.extract())
            .await
            .ok()
            .and_then(Result::ok)
    }
}

pub struct HarnessBuilder {
    config: DriverConfig,
    capacity: usize,
    pipeline: Pipeline,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            capacity: 64,
            pipeline: Pipeline::new(PIPELINE, "amqp").with_priority(5),
        }
    }

    pub fn with_config(mut self, configure: impl FnOnce(DriverConfig) -> DriverConfig) -> Self {
        self.config = configure(self.config);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub async fn build(self) -> TestHarness {
        tasker_amqp::logging::init_structured_logging();
        let broker = InMemoryBroker::new();
        let queue = Arc::new(BoundedPriorityQueue::new(self.capacity));
        let consumer = Consumer::with_config(self.config, Arc::new(broker.clone()), queue.clone())
            .await
            .unwrap();
        consumer.register(self.pipeline.clone());

        TestHarness {
            broker,
            queue,
            consumer,
            pipeline: self.pipeline,
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
