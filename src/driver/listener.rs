//! # Delivery Loop
//!
//! Consumes the main queue on a dedicated channel and feeds the priority queue. For every
//! delivery the loop:
//!
//! 1. decodes the job (structured envelope or plain body),
//! 2. binds an acknowledger to the delivery tag with the configured ack policy,
//! 3. acknowledges `auto_ack` jobs straight away,
//! 4. inserts the item, racing the insertion against the stop signal.
//!
//! Undecodable deliveries are rejected without requeue. An item that cannot be inserted before
//! stop is rejected with requeue so the broker hands it to another consumer.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::supervisor::{ConnectionSupervisor, RedialSource};
use crate::broker::{BrokerChannel, ConsumeSpec, Delivery, DeliveryStream};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::messaging::{decode, Acknowledger, DecodeDefaults, Item};
use crate::pipeline::PipelineSlot;
use crate::priority_queue::PriorityQueue;

/// Ack policy applied to every delivery of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub multiple: bool,
    pub requeue_on_fail: bool,
}

/// Everything a delivery task needs besides the channel
#[derive(Clone)]
pub struct ListenerContext {
    pub queue: Arc<dyn PriorityQueue>,
    pub pipeline: Arc<PipelineSlot>,
    pub default_priority: i64,
    pub policy: AckPolicy,
}

impl ListenerContext {
    fn decode_defaults(&self) -> DecodeDefaults {
        match self.pipeline.load() {
            Some(pipeline) => DecodeDefaults {
                pipeline: pipeline.name().to_string(),
                priority: pipeline.priority(),
                requeue_on_fail: self.policy.requeue_on_fail,
            },
            None => DecodeDefaults {
                pipeline: String::new(),
                priority: self.default_priority,
                requeue_on_fail: self.policy.requeue_on_fail,
            },
        }
    }
}

/// An active consume subscription and its delivery task
pub struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Open the consume channel, apply QoS, start consuming and spawn the delivery task
    ///
    /// The topology is declared first; the consume channel's close notification is watched by
    /// the supervisor.
    pub async fn start(
        supervisor: &ConnectionSupervisor,
        config: &DriverConfig,
        context: ListenerContext,
        stop: CancellationToken,
    ) -> DriverResult<Self> {
        let generation = supervisor.generation();
        let connection = supervisor.connection()?;
        supervisor.topology().declare_on(connection.as_ref()).await?;

        let channel = connection
            .open_channel()
            .await
            .map_err(DriverError::subscription)?;

        let subscribed = async {
            channel.qos(config.prefetch).await?;
            channel
                .consume(&ConsumeSpec {
                    queue: config.queue.clone(),
                    consumer_tag: config.consumer_id.clone(),
                    exclusive: config.exclusive,
                })
                .await
        }
        .await;

        let deliveries = match subscribed {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = channel.close().await;
                return Err(DriverError::subscription(e));
            }
        };

        supervisor.watch(channel.notify_close(), RedialSource::ConsumeChannel, generation);

        let task = tokio::spawn(delivery_loop(
            Arc::clone(&channel),
            deliveries,
            context,
            stop.clone(),
        ));

        debug!(
            queue = %config.queue,
            consumer_tag = %config.consumer_id,
            prefetch = config.prefetch,
            "Subscription started"
        );
        Ok(Self {
            channel,
            consumer_tag: config.consumer_id.clone(),
            stop,
            task,
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Cancel the consumer and stop the delivery task
    ///
    /// The channel stays open so acknowledgers of items already in the priority queue can
    /// still settle; it is handed back for the caller to close later. A failed cancel forces
    /// the channel closed and yields `None`.
    pub async fn cancel(self) -> Option<Arc<dyn BrokerChannel>> {
        let cancelled = self.channel.cancel(&self.consumer_tag).await;
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "delivery task ended abnormally");
        }

        match cancelled {
            Ok(()) => Some(self.channel),
            Err(e) => {
                error!(error = %e, "cancel consume channel, forcing close");
                close_channel(self.channel.as_ref()).await;
                None
            }
        }
    }

    /// Cancel the consumer and close the channel; unsettled deliveries return to the queue
    pub async fn close(self) {
        if let Some(channel) = self.cancel().await {
            close_channel(channel.as_ref()).await;
        }
    }

    /// Drop a subscription whose channel is already gone
    pub async fn abandon(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "delivery task ended abnormally");
        }
    }
}

/// Close a consume channel, logging a failure
pub async fn close_channel(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        error!(channel = channel.id(), error = %e, "closing consume channel failed");
    }
}

async fn delivery_loop(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    context: ListenerContext,
    stop: CancellationToken,
) {
    debug!(channel = channel.id(), "🚀 Delivery loop started");
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if !handle_delivery(&channel, delivery, &context, &stop).await {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Delivery stream failed");
                break;
            }
            None => {
                info!("Delivery stream closed by the broker");
                break;
            }
        }
    }
    debug!(channel = channel.id(), "Delivery loop stopped");
}

/// Returns false once the stop signal won the race against insertion
async fn handle_delivery(
    channel: &Arc<dyn BrokerChannel>,
    delivery: Delivery,
    context: &ListenerContext,
    stop: &CancellationToken,
) -> bool {
    let delivery_tag = delivery.delivery_tag;
    let item = match decode(&delivery, &context.decode_defaults()) {
        Ok(item) => item.with_acknowledger(Acknowledger::new(
            Arc::clone(channel),
            delivery_tag,
            context.policy.multiple,
            context.policy.requeue_on_fail,
        )),
        Err(e) => {
            warn!(delivery_tag = delivery_tag, error = %e, "Rejecting undecodable delivery");
            if let Err(e) = channel.nack(delivery_tag, false, false).await {
                warn!(delivery_tag = delivery_tag, error = %e, "Reject failed");
            }
            return true;
        }
    };

    if item.auto_ack() {
        if let Err(e) = item.ack().await {
            warn!(job_id = %item.id(), error = %e, "Auto-ack failed, skipping job");
            return true;
        }
    }

    let pending = item.clone();
    tokio::select! {
        biased;
        _ = stop.cancelled() => {
            debug!(job_id = %pending.id(), "Stopped before insertion, requeueing");
            requeue(&pending).await;
            false
        }
        inserted = context.queue.insert(item) => {
            if let Err(e) = inserted {
                warn!(job_id = %pending.id(), error = %e, "Insert failed, requeueing");
                requeue(&pending).await;
            }
            true
        }
    }
}

async fn requeue(item: &Item) {
    if let Err(e) = item.nack_with_options(true).await {
        warn!(job_id = %item.id(), error = %e, "Requeue failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::driver::topology::TopologyManager;
    use crate::pipeline::Pipeline;
    use crate::priority_queue::BoundedPriorityQueue;
    use lapin::types::FieldTable;
    use std::time::Duration;

    async fn setup(
        broker: &InMemoryBroker,
        queue: Arc<BoundedPriorityQueue>,
        auto_ack_config: DriverConfig,
    ) -> (Arc<ConnectionSupervisor>, Subscription) {
        let supervisor = ConnectionSupervisor::connect(
            Arc::new(broker.clone()),
            "memory://",
            auto_ack_config.redial_timeout(),
            Arc::new(TopologyManager::from_config(&auto_ack_config)),
        )
        .await
        .unwrap();

        let pipeline = Arc::new(PipelineSlot::new());
        pipeline.store(Pipeline::new("emails", "amqp").with_priority(7));
        let context = ListenerContext {
            queue,
            pipeline,
            default_priority: auto_ack_config.priority,
            policy: AckPolicy {
                multiple: false,
                requeue_on_fail: false,
            },
        };
        let subscription = Subscription::start(
            &supervisor,
            &auto_ack_config,
            context,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (supervisor, subscription)
    }

    fn config() -> DriverConfig {
        DriverConfig::new()
            .with_exchange("ex")
            .with_queue("q")
            .with_routing_key("rk")
            .with_prefetch(2)
            .with_consumer_id("listener-test")
    }

    #[tokio::test]
    async fn test_plain_deliveries_reach_priority_queue() {
        let broker = InMemoryBroker::new();
        let queue = Arc::new(BoundedPriorityQueue::new(10));
        let (supervisor, subscription) = setup(&broker, Arc::clone(&queue), config()).await;

        broker
            .inject_message("ex", "rk", FieldTable::default(), b"raw".to_vec())
            .unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), queue.extract())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.pipeline(), "emails");
        assert_eq!(item.priority(), 7);
        item.ack().await.unwrap();
        assert!(item.ack().await.is_err());

        subscription.cancel().await;
        assert_eq!(broker.consumer_count("q"), 0);
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let queue = Arc::new(BoundedPriorityQueue::new(10));
        let (supervisor, subscription) = setup(&broker, Arc::clone(&queue), config()).await;

        for _ in 0..5 {
            broker
                .inject_message("ex", "rk", FieldTable::default(), b"raw".to_vec())
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(broker.queue_depth("q"), Some(3));

        queue.extract().await.unwrap().ack().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 2);

        subscription.cancel().await;
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let queue = Arc::new(BoundedPriorityQueue::new(10));
        let (supervisor, subscription) = setup(&broker, Arc::clone(&queue), config()).await;

        broker
            .inject_message("ex", "rk", FieldTable::default(), b"raw".to_vec())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);

        subscription.close().await;
        assert_eq!(broker.queue_depth("q"), Some(1));
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_cancel_keeps_channel_for_outstanding_acks() {
        let broker = InMemoryBroker::new();
        let queue = Arc::new(BoundedPriorityQueue::new(10));
        let (supervisor, subscription) = setup(&broker, Arc::clone(&queue), config()).await;

        broker
            .inject_message("ex", "rk", FieldTable::default(), b"raw".to_vec())
            .unwrap();
        let item = tokio::time::timeout(Duration::from_secs(1), queue.extract())
            .await
            .unwrap()
            .unwrap();

        let channel = subscription.cancel().await.expect("cancel leaves the channel open");
        assert_eq!(broker.consumer_count("q"), 0);

        item.ack().await.unwrap();
        close_channel(channel.as_ref()).await;
        assert_eq!(broker.queue_depth("q"), Some(0));
        supervisor.close().await;
    }
}
