//! # Broker Abstraction
//!
//! Provider-agnostic view of an AMQP 0-9-1 broker, shaped around exactly what the driver
//! needs: one shared connection, cheap single-purpose channels, idempotent declares,
//! publish/consume, acknowledgements and close notifications.
//!
//! ## Implementations
//!
//! - [`amqp::LapinBroker`] - production implementation on top of the `lapin` client
//! - [`memory::InMemoryBroker`] - in-process broker with TTL dead-lettering, an operation
//!   journal and fault injection, used by the test suite
//!
//! ## Close notifications
//!
//! `notify_close()` hands out a one-shot [`CloseSignal`]. It resolves with the close error
//! when the handle fails and is dropped unresolved when the handle is closed gracefully, so a
//! receiver only ever observes real failures.

pub mod amqp;
pub mod errors;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub use errors::{BrokerError, BrokerResult};

/// One-shot signal resolved with the error that closed a connection or channel
pub type CloseSignal = oneshot::Receiver<BrokerError>;

/// Stream of deliveries produced by a consume subscription
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Entry point: dials connections to a broker address
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new connection to `addr`
    async fn dial(&self, addr: &str) -> BrokerResult<Arc<dyn BrokerConnection>>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// A single physical connection multiplexing many channels
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Register for the connection's close notification
    fn notify_close(&self) -> CloseSignal;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Gracefully close the connection
    async fn close(&self) -> BrokerResult<()>;
}

/// A logical channel; every declare/publish/consume goes through one
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Identifier of the channel, unique per connection
    fn id(&self) -> u64;

    /// Idempotently declare an exchange
    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> BrokerResult<()>;

    /// Idempotently declare a queue; an existing queue with other arguments is refused
    async fn queue_declare(&self, queue: &QueueSpec) -> BrokerResult<QueueInfo>;

    /// Bind `queue` to `exchange` under `routing_key`
    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str)
        -> BrokerResult<()>;

    /// Passive declare: report the queue without creating it
    async fn queue_inspect(&self, queue: &str) -> BrokerResult<QueueInfo>;

    /// Delete a queue, returning the number of messages it held
    async fn queue_delete(&self, queue: &str) -> BrokerResult<u32>;

    /// Set the prefetch count (per consumer, not global)
    async fn qos(&self, prefetch: u16) -> BrokerResult<()>;

    /// Start a manual-ack subscription
    async fn consume(&self, spec: &ConsumeSpec) -> BrokerResult<DeliveryStream>;

    /// Cancel a subscription, waiting for the broker to confirm
    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    /// Publish one message
    async fn publish(&self, publishing: Publishing) -> BrokerResult<()>;

    /// Acknowledge a delivery
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> BrokerResult<()>;

    /// Reject a delivery
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()>;

    /// Register for the channel's close notification
    fn notify_close(&self) -> CloseSignal;

    /// Gracefully close the channel
    async fn close(&self) -> BrokerResult<()>;
}

/// Exchange declaration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

impl QueueSpec {
    /// Look up a declare argument
    pub fn argument(&self, key: &str) -> Option<&AMQPValue> {
        self.arguments.inner().get(key)
    }
}

/// Consume subscription parameters; ack is always manual
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeSpec {
    pub queue: String,
    pub consumer_tag: String,
    pub exclusive: bool,
}

/// Outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub headers: FieldTable,
    pub content_type: String,
    pub persistent: bool,
    /// Seconds since the unix epoch
    pub timestamp: u64,
    pub body: Vec<u8>,
}

/// Inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: FieldTable,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }
}

/// Result of a queue declare or inspect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u32,
    pub consumers: u32,
}

/// Pending close notifications for one handle; drained on the first failure
#[derive(Default)]
pub(crate) struct CloseWatchers {
    state: Mutex<WatcherState>,
}

#[derive(Default)]
struct WatcherState {
    failed: Option<BrokerError>,
    waiters: Vec<oneshot::Sender<BrokerError>>,
}

impl CloseWatchers {
    pub(crate) fn register(&self) -> CloseSignal {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        match &state.failed {
            Some(error) => {
                let _ = tx.send(error.clone());
            }
            None => state.waiters.push(tx),
        }
        rx
    }

    pub(crate) fn fire(&self, error: BrokerError) {
        let mut state = self.state.lock();
        state.failed = Some(error.clone());
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(error.clone());
        }
    }

    pub(crate) fn release(&self) {
        self.state.lock().waiters.clear();
    }
}

/// Convert a JSON object into an AMQP field table (used for static `queue_headers`)
pub fn field_table_from_json(values: &HashMap<String, serde_json::Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(ShortString::from(key.clone()), amqp_value_from_json(value));
    }
    table
}

fn amqp_value_from_json(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        serde_json::Value::Array(values) => AMQPValue::FieldArray(
            values
                .iter()
                .map(amqp_value_from_json)
                .collect::<Vec<_>>()
                .into(),
        ),
        serde_json::Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value_from_json(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

/// Render an AMQP value as text; `None` for tables and void
pub fn amqp_value_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        AMQPValue::ByteArray(bytes) => {
            Some(String::from_utf8_lossy(bytes.as_slice()).into_owned())
        }
        _ => None,
    }
}

/// Read an AMQP integer of any width as i64
pub fn amqp_value_to_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).parse().ok(),
        AMQPValue::ShortString(s) => s.as_str().parse().ok(),
        _ => None,
    }
}

impl fmt::Display for QueueInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (messages: {}, consumers: {})",
            self.name, self.messages, self.consumers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_table_from_json() {
        let mut values = HashMap::new();
        values.insert("x-max-priority".to_string(), json!(10));
        values.insert("x-queue-mode".to_string(), json!("lazy"));
        values.insert("x-single-active-consumer".to_string(), json!(true));

        let table = field_table_from_json(&values);
        let inner = table.inner();

        assert_eq!(
            inner.get("x-max-priority"),
            Some(&AMQPValue::LongLongInt(10))
        );
        assert_eq!(
            inner.get("x-queue-mode").and_then(amqp_value_to_string),
            Some("lazy".to_string())
        );
        assert_eq!(
            inner.get("x-single-active-consumer"),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn test_amqp_integer_widths() {
        assert_eq!(amqp_value_to_i64(&AMQPValue::ShortInt(-3)), Some(-3));
        assert_eq!(amqp_value_to_i64(&AMQPValue::LongUInt(5000)), Some(5000));
        assert_eq!(
            amqp_value_to_i64(&AMQPValue::LongString("42".into())),
            Some(42)
        );
        assert_eq!(amqp_value_to_i64(&AMQPValue::Boolean(true)), None);
    }
}
