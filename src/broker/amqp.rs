//! # Lapin Broker
//!
//! Production [`Broker`] backed by the `lapin` AMQP 0-9-1 client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, CloseSignal,
    CloseWatchers, ConsumeSpec, Delivery, DeliveryStream, ExchangeSpec, Publishing, QueueInfo,
    QueueSpec,
};

/// Broker dialing through `lapin`
#[derive(Clone, Default)]
pub struct LapinBroker {
    properties: ConnectionProperties,
}

impl LapinBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (executor, reactor, client name)
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn dial(&self, addr: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        debug!("Dialing AMQP broker");
        let connection = Connection::connect(addr, self.properties.clone()).await?;

        let watchers = Arc::new(CloseWatchers::default());
        let on_error = Arc::clone(&watchers);
        connection.on_error(move |error| on_error.fire(BrokerError::from(error)));

        info!("✅ Connected to AMQP broker");
        Ok(Arc::new(LapinConnection {
            connection,
            watchers,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "lapin"
    }
}

struct LapinConnection {
    connection: Connection,
    watchers: Arc<CloseWatchers>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;

        let watchers = Arc::new(CloseWatchers::default());
        let on_error = Arc::clone(&watchers);
        channel.on_error(move |error| on_error.fire(BrokerError::from(error)));

        Ok(Arc::new(LapinChannel {
            channel,
            watchers,
            closed: AtomicBool::new(false),
        }))
    }

    fn notify_close(&self) -> CloseSignal {
        let signal = self.watchers.register();
        if !self.connection.status().connected() {
            self.watchers
                .fire(BrokerError::connection_closed("connection is not connected"));
        }
        signal
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.watchers.release();
        if self.connection.status().connected() {
            self.connection.close(200, "closed by driver").await?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    watchers: Arc<CloseWatchers>,
    closed: AtomicBool,
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn queue_info(queue: &lapin::Queue) -> QueueInfo {
    QueueInfo {
        name: queue.name().as_str().to_string(),
        messages: queue.message_count(),
        consumers: queue.consumer_count(),
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        headers: delivery.properties.headers().clone().unwrap_or_default(),
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueSpec) -> BrokerResult<QueueInfo> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    auto_delete: queue.auto_delete,
                    exclusive: queue.exclusive,
                    ..QueueDeclareOptions::default()
                },
                queue.arguments.clone(),
            )
            .await?;
        Ok(queue_info(&declared))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_inspect(&self, queue: &str) -> BrokerResult<QueueInfo> {
        let inspected = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue_info(&inspected))
    }

    async fn queue_delete(&self, queue: &str) -> BrokerResult<u32> {
        let purged = self
            .channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(purged)
    }

    async fn qos(&self, prefetch: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn consume(&self, spec: &ConsumeSpec) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                &spec.queue,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: spec.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(convert_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> BrokerResult<()> {
        let mut properties = BasicProperties::default()
            .with_headers(publishing.headers)
            .with_content_type(publishing.content_type.into())
            .with_timestamp(publishing.timestamp);
        if publishing.persistent {
            properties = properties.with_delivery_mode(crate::constants::PERSISTENT_DELIVERY_MODE);
        }

        let confirm = self
            .channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions::default(),
                &publishing.body,
                properties,
            )
            .await?;
        confirm.await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    fn notify_close(&self) -> CloseSignal {
        let signal = self.watchers.register();
        if !self.closed.load(Ordering::Acquire) && !self.channel.status().connected() {
            self.watchers
                .fire(BrokerError::channel_closed("channel is not connected"));
        }
        signal
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::Release);
        self.watchers.release();
        if self.channel.status().connected() {
            self.channel.close(200, "closed by driver").await?;
        }
        Ok(())
    }
}
