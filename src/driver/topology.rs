//! # Topology Manager
//!
//! Declares the exchange, the main queue and its bindings, and the transient per-delay queues
//! of the dead-letter delay pattern. Every declare is idempotent on the broker side, so the
//! manager keeps no record of what it already declared: delayed queues are re-declared on each
//! delayed publish, which stays correct across reconnects and broker restarts.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use tracing::debug;

use crate::broker::{
    field_table_from_json, BrokerChannel, BrokerConnection, ExchangeSpec, QueueSpec,
};
use crate::config::DriverConfig;
use crate::constants::{queue_arguments, CATCH_ALL_ROUTING_KEY, DELAYED_QUEUE_PREFIX};
use crate::error::{DriverError, DriverResult};

/// Name of the transient queue holding messages delayed by `delay_ms`
pub fn delayed_queue_name(delay_ms: i64, exchange: &str, queue: &str) -> String {
    format!("{DELAYED_QUEUE_PREFIX}-{delay_ms}.{exchange}.{queue}")
}

#[derive(Debug, Clone)]
pub struct TopologyManager {
    exchange: ExchangeSpec,
    queue: QueueSpec,
    routing_key: String,
    consume_all: bool,
}

impl TopologyManager {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            exchange: ExchangeSpec {
                name: config.exchange.clone(),
                kind: config.exchange_type.clone(),
                durable: config.exchange_durable,
                auto_delete: config.exchange_auto_delete,
            },
            queue: QueueSpec {
                name: config.queue.clone(),
                durable: config.durable,
                auto_delete: config.queue_auto_delete,
                exclusive: config.exclusive,
                arguments: field_table_from_json(&config.queue_headers),
            },
            routing_key: config.routing_key.clone(),
            consume_all: config.consume_all,
        }
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Declare exchange and main queue, then bind them (plus the catch-all binding when
    /// `consume_all` is set)
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> DriverResult<()> {
        channel
            .exchange_declare(&self.exchange)
            .await
            .map_err(|e| DriverError::topology("exchange_declare", e))?;

        channel
            .queue_declare(&self.queue)
            .await
            .map_err(|e| DriverError::topology("queue_declare", e))?;

        channel
            .queue_bind(&self.queue.name, &self.routing_key, &self.exchange.name)
            .await
            .map_err(|e| DriverError::topology("queue_bind", e))?;

        if self.consume_all {
            channel
                .queue_bind(&self.queue.name, CATCH_ALL_ROUTING_KEY, &self.exchange.name)
                .await
                .map_err(|e| DriverError::topology("queue_bind", e))?;
        }

        debug!(
            exchange = %self.exchange.name,
            queue = %self.queue.name,
            routing_key = %self.routing_key,
            consume_all = self.consume_all,
            "Topology declared"
        );
        Ok(())
    }

    /// Declare the topology over a throwaway channel
    pub async fn declare_on(&self, connection: &dyn BrokerConnection) -> DriverResult<()> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| DriverError::topology("open_channel", e))?;

        let declared = self.declare(channel.as_ref()).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Closing topology channel failed");
        }
        declared
    }

    /// Parameters of the delayed queue for `delay_ms`: dead-letters into the real exchange and
    /// routing key once the per-message TTL expires, and removes itself after twice the delay
    pub fn delayed_queue_spec(&self, delay_ms: i64) -> QueueSpec {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from(queue_arguments::DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.exchange.name.clone())),
        );
        arguments.insert(
            ShortString::from(queue_arguments::DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.routing_key.clone())),
        );
        arguments.insert(
            ShortString::from(queue_arguments::MESSAGE_TTL),
            AMQPValue::LongLongInt(delay_ms),
        );
        arguments.insert(
            ShortString::from(queue_arguments::EXPIRES),
            AMQPValue::LongLongInt(delay_ms.saturating_mul(2)),
        );

        QueueSpec {
            name: delayed_queue_name(delay_ms, &self.exchange.name, &self.queue.name),
            durable: true,
            auto_delete: false,
            exclusive: false,
            arguments,
        }
    }

    /// Declare and bind the delayed queue for `delay_ms`, returning its name
    pub async fn declare_delayed(
        &self,
        channel: &dyn BrokerChannel,
        delay_ms: i64,
    ) -> DriverResult<String> {
        let spec = self.delayed_queue_spec(delay_ms);

        channel
            .queue_declare(&spec)
            .await
            .map_err(|e| DriverError::topology("delayed_queue_declare", e))?;

        channel
            .queue_bind(&spec.name, &spec.name, &self.exchange.name)
            .await
            .map_err(|e| DriverError::topology("delayed_queue_bind", e))?;

        Ok(spec.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::{amqp_value_to_i64, amqp_value_to_string, Broker};

    fn config() -> DriverConfig {
        DriverConfig::new()
            .with_exchange("ex")
            .with_queue("q")
            .with_routing_key("rk")
    }

    #[test]
    fn test_delayed_queue_name() {
        assert_eq!(delayed_queue_name(5000, "ex", "q"), "delayed-5000.ex.q");
    }

    #[test]
    fn test_delayed_queue_arguments() {
        let spec = TopologyManager::from_config(&config()).delayed_queue_spec(5000);

        assert_eq!(spec.name, "delayed-5000.ex.q");
        assert!(spec.durable);
        assert_eq!(
            spec.argument(queue_arguments::MESSAGE_TTL)
                .and_then(amqp_value_to_i64),
            Some(5000)
        );
        assert_eq!(
            spec.argument(queue_arguments::EXPIRES).and_then(amqp_value_to_i64),
            Some(10000)
        );
        assert_eq!(
            spec.argument(queue_arguments::DEAD_LETTER_EXCHANGE)
                .and_then(amqp_value_to_string),
            Some("ex".to_string())
        );
        assert_eq!(
            spec.argument(queue_arguments::DEAD_LETTER_ROUTING_KEY)
                .and_then(amqp_value_to_string),
            Some("rk".to_string())
        );
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        let connection = broker.dial("memory://").await.unwrap();
        let topology = TopologyManager::from_config(&config().with_consume_all(true));

        topology.declare_on(connection.as_ref()).await.unwrap();
        topology.declare_on(connection.as_ref()).await.unwrap();

        assert!(broker.has_queue("q"));
        assert!(broker.has_binding("q", "ex", "rk"));
        assert!(broker.has_binding("q", "ex", "#"));
    }

    #[tokio::test]
    async fn test_conflicting_declare_surfaces_topology_error() {
        let broker = InMemoryBroker::new();
        let connection = broker.dial("memory://").await.unwrap();

        TopologyManager::from_config(&config())
            .declare_on(connection.as_ref())
            .await
            .unwrap();

        let conflicting = TopologyManager::from_config(&config().with_durable(true));
        let error = conflicting
            .declare_on(connection.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            DriverError::Topology { ref operation, .. } if operation == "queue_declare"
        ));
    }
}
