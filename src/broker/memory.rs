//! # In-Memory Broker
//!
//! In-process broker implementing the [`Broker`] traits for tests and local development.
//!
//! ## Key Features
//!
//! - **Routing**: default, direct, fanout and topic exchanges with bindings
//! - **Declare equivalence**: redeclaring an entity with different arguments is refused (406)
//! - **Dead-lettering**: `x-message-ttl` plus `x-dead-letter-exchange` expire messages into
//!   their dead-letter destination, which is what the delayed-job pattern relies on
//! - **Consumers**: manual ack, prefetch, nack/requeue, redelivery on channel loss
//! - **Journal**: every successful operation is recorded as a [`BrokerOp`]
//! - **Fault injection**: failing dials, failing the next operation of a kind, severing
//!   every live connection
//! - **Exclusive-use detection**: overlapping operations on one channel are counted

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use lapin::types::FieldTable;
use parking_lot::Mutex;
use tracing::debug;

use super::errors::{NOT_FOUND, PRECONDITION_FAILED};
use super::{
    amqp_value_to_i64, amqp_value_to_string, Broker, BrokerChannel, BrokerConnection,
    BrokerError, BrokerResult, CloseSignal, CloseWatchers, ConsumeSpec, Delivery, DeliveryStream,
    ExchangeSpec, Publishing, QueueInfo, QueueSpec,
};
use crate::constants::queue_arguments;

/// AMQP reply code for an exclusive-consumer conflict
const ACCESS_REFUSED: u16 = 403;

/// AMQP reply code used for injected failures
const INTERNAL_ERROR: u16 = 541;

/// Operation kinds that can be targeted by [`InMemoryBroker::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    OpenChannel,
    ExchangeDeclare,
    QueueDeclare,
    QueueBind,
    QueueInspect,
    QueueDelete,
    Qos,
    Consume,
    Cancel,
    Publish,
    Ack,
    Nack,
}

/// A successful broker operation, as recorded in the journal
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    Dial,
    OpenChannel { channel_id: u64 },
    ExchangeDeclare(ExchangeSpec),
    QueueDeclare(QueueSpec),
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    QueueInspect { queue: String },
    QueueDelete { queue: String },
    Qos { channel_id: u64, prefetch: u16 },
    Consume(ConsumeSpec),
    Cancel { consumer_tag: String },
    Publish(Publishing),
    Ack { delivery_tag: u64, multiple: bool },
    Nack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    headers: FieldTable,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerHandle {
    tag: String,
    exclusive: bool,
    channel: Arc<ChannelCore>,
    tx: UnboundedSender<BrokerResult<Delivery>>,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerHandle>,
    next_consumer: usize,
}

struct MemoryQueue {
    spec: QueueSpec,
    inner: Mutex<QueueInner>,
}

struct ChannelCore {
    id: u64,
    open: AtomicBool,
    busy: AtomicBool,
    prefetch: AtomicU16,
    next_tag: AtomicU64,
    unacked: Mutex<BTreeMap<u64, (String, StoredMessage)>>,
    watchers: CloseWatchers,
}

struct ConnectionCore {
    open: AtomicBool,
    watchers: CloseWatchers,
    channels: Mutex<Vec<Arc<ChannelCore>>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: DashMap<String, ExchangeSpec>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    bindings: Mutex<Vec<Binding>>,
    journal: Mutex<Vec<BrokerOp>>,
    connections: Mutex<Vec<Arc<ConnectionCore>>>,
    injected: Mutex<Vec<Operation>>,
    failing_dials: AtomicU32,
    dials: AtomicU64,
    next_channel_id: AtomicU64,
    next_message_id: AtomicU64,
    concurrent_use: AtomicU64,
}

/// In-process broker shared by every connection dialed from it
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful operation so far
    pub fn journal(&self) -> Vec<BrokerOp> {
        self.state.journal.lock().clone()
    }

    /// Forget recorded operations
    pub fn clear_journal(&self) {
        self.state.journal.lock().clear();
    }

    /// Publishings recorded in the journal
    pub fn publishes(&self) -> Vec<Publishing> {
        self.journal()
            .into_iter()
            .filter_map(|op| match op {
                BrokerOp::Publish(publishing) => Some(publishing),
                _ => None,
            })
            .collect()
    }

    /// Queue declarations recorded in the journal
    pub fn queue_declares(&self) -> Vec<QueueSpec> {
        self.journal()
            .into_iter()
            .filter_map(|op| match op {
                BrokerOp::QueueDeclare(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    /// Number of dial attempts, failed ones included
    pub fn dial_count(&self) -> u64 {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Number of connections currently open
    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|conn| conn.open.load(Ordering::SeqCst))
            .count()
    }

    /// Number of times two operations overlapped on the same channel
    pub fn concurrent_use_violations(&self) -> u64 {
        self.state.concurrent_use.load(Ordering::SeqCst)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Declared parameters of a queue
    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.state.queues.get(name).map(|queue| queue.spec.clone())
    }

    /// Messages ready for delivery in a queue
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        let queue = self.state.queue(name)?;
        let depth = queue.inner.lock().ready.len();
        Some(depth)
    }

    /// Active consumers of a queue
    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .queue(name)
            .map(|queue| queue.inner.lock().consumers.len())
            .unwrap_or_default()
    }

    /// Whether `queue` is bound to `exchange` under `routing_key`
    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.bindings.lock().iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key
        })
    }

    /// Make the next `count` dials fail
    pub fn fail_next_dials(&self, count: u32) {
        self.state.failing_dials.store(count, Ordering::SeqCst);
    }

    /// Make the next operation of `operation` kind fail with a protocol error
    pub fn fail_next(&self, operation: Operation) {
        self.state.injected.lock().push(operation);
    }

    /// Kill every live connection as a network failure would: close notifications fire on
    /// connections and channels, subscriptions end with an error, unacked messages are requeued
    pub fn sever_connections(&self) {
        let connections: Vec<_> = self.state.connections.lock().drain(..).collect();
        for connection in connections {
            if !connection.open.swap(false, Ordering::SeqCst) {
                continue;
            }
            let error = BrokerError::connection_closed("connection reset by peer");
            let channels: Vec<_> = connection.channels.lock().drain(..).collect();
            for channel in channels {
                self.state.shutdown_channel(&channel, Some(error.clone()));
            }
            connection.watchers.fire(error);
        }
        debug!("In-memory broker severed every connection");
    }

    /// Publish as an external producer would, bypassing any connection
    pub fn inject_message(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: FieldTable,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        self.state.route_and_enqueue(exchange, routing_key, headers, body)
    }
}

impl BrokerState {
    fn record(&self, op: BrokerOp) {
        self.journal.lock().push(op);
    }

    fn take_injected(&self, operation: Operation) -> BrokerResult<()> {
        let mut injected = self.injected.lock();
        if let Some(position) = injected.iter().position(|op| *op == operation) {
            injected.remove(position);
            return Err(BrokerError::protocol(
                INTERNAL_ERROR,
                format!("injected failure for {operation:?}"),
            ));
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.get(name).map(|queue| Arc::clone(queue.value()))
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|spec| spec.kind.clone())
            .ok_or_else(|| BrokerError::not_found(format!("exchange '{exchange}'")))?;

        let mut seen = HashSet::new();
        let routes = self
            .bindings
            .lock()
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind.as_str() {
                "fanout" => true,
                "topic" => topic_matches(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            })
            .filter(|binding| seen.insert(binding.queue.clone()))
            .map(|binding| binding.queue.clone())
            .collect();
        Ok(routes)
    }

    fn route_and_enqueue(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        headers: FieldTable,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        for queue_name in self.routes(exchange, routing_key)? {
            let message = StoredMessage {
                id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                headers: headers.clone(),
                body: body.clone(),
                redelivered: false,
            };
            self.enqueue(&queue_name, message);
        }
        Ok(())
    }

    fn enqueue(self: &Arc<Self>, queue_name: &str, message: StoredMessage) {
        let Some(queue) = self.queue(queue_name) else {
            return;
        };

        if let Some(ttl) = queue
            .spec
            .argument(queue_arguments::MESSAGE_TTL)
            .and_then(amqp_value_to_i64)
        {
            self.schedule_expiry(Arc::clone(&queue), message.id, ttl);
        }

        queue.inner.lock().ready.push_back(message);
        self.dispatch(&queue);
    }

    fn schedule_expiry(self: &Arc<Self>, queue: Arc<MemoryQueue>, message_id: u64, ttl_ms: i64) {
        let state = Arc::downgrade(self);
        let ttl = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or_default());
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let expired = {
                let mut inner = queue.inner.lock();
                let position = inner.ready.iter().position(|m| m.id == message_id);
                position.and_then(|position| inner.ready.remove(position))
            };
            if let Some(message) = expired {
                state.dead_letter(&queue.spec, message);
            }
        });
    }

    fn dead_letter(self: &Arc<Self>, spec: &QueueSpec, message: StoredMessage) {
        let Some(exchange) = spec
            .argument(queue_arguments::DEAD_LETTER_EXCHANGE)
            .and_then(amqp_value_to_string)
        else {
            return;
        };
        let routing_key = spec
            .argument(queue_arguments::DEAD_LETTER_ROUTING_KEY)
            .and_then(amqp_value_to_string)
            .unwrap_or_else(|| message.routing_key.clone());

        debug!(
            queue = %spec.name,
            exchange = %exchange,
            routing_key = %routing_key,
            "Dead-lettering message"
        );
        let _ = self.route_and_enqueue(&exchange, &routing_key, message.headers, message.body);
    }

    fn dispatch(&self, queue: &MemoryQueue) {
        let mut inner = queue.inner.lock();
        inner
            .consumers
            .retain(|consumer| consumer.channel.open.load(Ordering::SeqCst) && !consumer.tx.is_closed());

        while !inner.ready.is_empty() && !inner.consumers.is_empty() {
            let count = inner.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (inner.next_consumer + offset) % count;
                let channel = &inner.consumers[index].channel;
                let prefetch = usize::from(channel.prefetch.load(Ordering::SeqCst));
                if prefetch == 0 || channel.unacked.lock().len() < prefetch {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                break;
            };
            inner.next_consumer = (index + 1) % count;

            let Some(message) = inner.ready.pop_front() else {
                break;
            };
            let consumer = &inner.consumers[index];
            let delivery_tag = consumer.channel.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            consumer
                .channel
                .unacked
                .lock()
                .insert(delivery_tag, (queue.spec.name.clone(), message.clone()));

            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange,
                routing_key: message.routing_key,
                redelivered: message.redelivered,
                headers: message.headers,
                body: message.body,
            };
            if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
                consumer.channel.unacked.lock().remove(&delivery_tag);
                inner.consumers.remove(index);
            }
        }
    }

    fn requeue(&self, queue_name: &str, mut message: StoredMessage) {
        if let Some(queue) = self.queue(queue_name) {
            message.redelivered = true;
            queue.inner.lock().ready.push_front(message);
            self.dispatch(&queue);
        }
    }

    fn shutdown_channel(&self, channel: &Arc<ChannelCore>, error: Option<BrokerError>) {
        if !channel.open.swap(false, Ordering::SeqCst) {
            return;
        }

        for entry in self.queues.iter() {
            let mut inner = entry.value().inner.lock();
            inner.consumers.retain(|consumer| {
                if consumer.channel.id != channel.id {
                    return true;
                }
                if let Some(error) = &error {
                    let _ = consumer.tx.unbounded_send(Err(error.clone()));
                }
                false
            });
        }

        let unacked: Vec<_> = std::mem::take(&mut *channel.unacked.lock())
            .into_values()
            .collect();
        for (queue_name, message) in unacked.into_iter().rev() {
            self.requeue(&queue_name, message);
        }

        match error {
            Some(error) => channel
                .watchers
                .fire(BrokerError::channel_closed(error.to_string())),
            None => channel.watchers.release(),
        }
    }
}

/// Topic matching supporting `#` (zero or more words) and `*` (exactly one word)
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn dial(&self, _addr: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);

        let failing = self.state.failing_dials.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_dials.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::io("connection refused"));
        }

        let core = Arc::new(ConnectionCore {
            open: AtomicBool::new(true),
            watchers: CloseWatchers::default(),
            channels: Mutex::new(Vec::new()),
        });
        self.state.connections.lock().push(Arc::clone(&core));
        self.state.record(BrokerOp::Dial);

        Ok(Arc::new(MemoryConnection {
            core,
            state: Arc::clone(&self.state),
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

struct MemoryConnection {
    core: Arc<ConnectionCore>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.core.open.load(Ordering::SeqCst) {
            return Err(BrokerError::connection_closed("connection is closed"));
        }
        self.state.take_injected(Operation::OpenChannel)?;

        let channel = Arc::new(ChannelCore {
            id: self.state.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1,
            open: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
            next_tag: AtomicU64::new(0),
            unacked: Mutex::new(BTreeMap::new()),
            watchers: CloseWatchers::default(),
        });
        self.core.channels.lock().push(Arc::clone(&channel));
        self.state.record(BrokerOp::OpenChannel {
            channel_id: channel.id,
        });

        Ok(Arc::new(MemoryChannel {
            core: channel,
            connection: Arc::downgrade(&self.core),
            state: Arc::clone(&self.state),
        }))
    }

    fn notify_close(&self) -> CloseSignal {
        let signal = self.core.watchers.register();
        if !self.core.open.load(Ordering::SeqCst) {
            self.core
                .watchers
                .fire(BrokerError::connection_closed("connection is closed"));
        }
        signal
    }

    fn is_open(&self) -> bool {
        self.core.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.core.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.watchers.release();
        let channels: Vec<_> = self.core.channels.lock().drain(..).collect();
        for channel in channels {
            self.state.shutdown_channel(&channel, None);
        }
        self.state
            .connections
            .lock()
            .retain(|conn| !Arc::ptr_eq(conn, &self.core));
        Ok(())
    }
}

struct MemoryChannel {
    core: Arc<ChannelCore>,
    connection: Weak<ConnectionCore>,
    state: Arc<BrokerState>,
}

/// Marks a channel busy for the duration of one operation
struct BusyGuard<'a> {
    core: &'a ChannelCore,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.core.busy.store(false, Ordering::SeqCst);
    }
}

impl MemoryChannel {
    fn ensure_open(&self, operation: Operation) -> BrokerResult<()> {
        let connection_open = self
            .connection
            .upgrade()
            .map(|conn| conn.open.load(Ordering::SeqCst))
            .unwrap_or(false);
        if !connection_open {
            return Err(BrokerError::connection_closed("connection is closed"));
        }
        if !self.core.open.load(Ordering::SeqCst) {
            return Err(BrokerError::channel_closed("channel is closed"));
        }
        self.state.take_injected(operation)
    }

    async fn enter(&self) -> BusyGuard<'_> {
        if self.core.busy.swap(true, Ordering::SeqCst) {
            self.state.concurrent_use.fetch_add(1, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        BusyGuard { core: &self.core }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.core.id
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> BrokerResult<()> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::ExchangeDeclare)?;

        if let Some(existing) = self.state.exchanges.get(&exchange.name) {
            if existing.kind != exchange.kind || existing.durable != exchange.durable {
                return Err(BrokerError::protocol(
                    PRECONDITION_FAILED,
                    format!("inequivalent arg for exchange '{}'", exchange.name),
                ));
            }
        } else {
            self.state
                .exchanges
                .insert(exchange.name.clone(), exchange.clone());
        }

        self.state.record(BrokerOp::ExchangeDeclare(exchange.clone()));
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueSpec) -> BrokerResult<QueueInfo> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::QueueDeclare)?;

        let declared = match self.state.queue(&queue.name) {
            Some(existing) => {
                if existing.spec.durable != queue.durable
                    || existing.spec.exclusive != queue.exclusive
                    || existing.spec.auto_delete != queue.auto_delete
                    || existing.spec.arguments != queue.arguments
                {
                    return Err(BrokerError::protocol(
                        PRECONDITION_FAILED,
                        format!("inequivalent arg for queue '{}'", queue.name),
                    ));
                }
                existing
            }
            None => {
                let created = Arc::new(MemoryQueue {
                    spec: queue.clone(),
                    inner: Mutex::new(QueueInner::default()),
                });
                self.state
                    .queues
                    .insert(queue.name.clone(), Arc::clone(&created));
                created
            }
        };

        self.state.record(BrokerOp::QueueDeclare(queue.clone()));
        let inner = declared.inner.lock();
        Ok(QueueInfo {
            name: queue.name.clone(),
            messages: u32::try_from(inner.ready.len()).unwrap_or(u32::MAX),
            consumers: u32::try_from(inner.consumers.len()).unwrap_or(u32::MAX),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> BrokerResult<()> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::QueueBind)?;

        if !self.state.queues.contains_key(queue) {
            return Err(BrokerError::protocol(NOT_FOUND, format!("no queue '{queue}'")));
        }
        if !self.state.exchanges.contains_key(exchange) {
            return Err(BrokerError::protocol(
                NOT_FOUND,
                format!("no exchange '{exchange}'"),
            ));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        {
            let mut bindings = self.state.bindings.lock();
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }

        self.state.record(BrokerOp::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn queue_inspect(&self, queue: &str) -> BrokerResult<QueueInfo> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::QueueInspect)?;

        let existing = self
            .state
            .queue(queue)
            .ok_or_else(|| BrokerError::protocol(NOT_FOUND, format!("no queue '{queue}'")))?;

        self.state.record(BrokerOp::QueueInspect {
            queue: queue.to_string(),
        });
        let inner = existing.inner.lock();
        Ok(QueueInfo {
            name: queue.to_string(),
            messages: u32::try_from(inner.ready.len()).unwrap_or(u32::MAX),
            consumers: u32::try_from(inner.consumers.len()).unwrap_or(u32::MAX),
        })
    }

    async fn queue_delete(&self, queue: &str) -> BrokerResult<u32> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::QueueDelete)?;

        let removed = self.state.queues.remove(queue).map(|(_, queue)| queue);
        self.state
            .bindings
            .lock()
            .retain(|binding| binding.queue != queue);
        self.state.record(BrokerOp::QueueDelete {
            queue: queue.to_string(),
        });

        let purged = removed
            .map(|queue| {
                let mut inner = queue.inner.lock();
                inner.consumers.clear();
                inner.ready.drain(..).count()
            })
            .unwrap_or_default();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn qos(&self, prefetch: u16) -> BrokerResult<()> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::Qos)?;

        self.core.prefetch.store(prefetch, Ordering::SeqCst);
        self.state.record(BrokerOp::Qos {
            channel_id: self.core.id,
            prefetch,
        });
        Ok(())
    }

    async fn consume(&self, spec: &ConsumeSpec) -> BrokerResult<DeliveryStream> {
        self.ensure_open(Operation::Consume)?;

        let queue = self.state.queue(&spec.queue).ok_or_else(|| {
            BrokerError::protocol(NOT_FOUND, format!("no queue '{}'", spec.queue))
        })?;

        let (tx, rx) = unbounded();
        {
            let mut inner = queue.inner.lock();
            let conflict = inner.consumers.iter().any(|consumer| {
                consumer.exclusive || spec.exclusive || consumer.tag == spec.consumer_tag
            });
            if conflict {
                return Err(BrokerError::protocol(
                    ACCESS_REFUSED,
                    format!("queue '{}' is in exclusive use", spec.queue),
                ));
            }
            inner.consumers.push(ConsumerHandle {
                tag: spec.consumer_tag.clone(),
                exclusive: spec.exclusive,
                channel: Arc::clone(&self.core),
                tx,
            });
        }

        self.state.record(BrokerOp::Consume(spec.clone()));
        self.state.dispatch(&queue);
        Ok(rx.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open(Operation::Cancel)?;

        for entry in self.state.queues.iter() {
            entry.value().inner.lock().consumers.retain(|consumer| {
                !(consumer.channel.id == self.core.id && consumer.tag == consumer_tag)
            });
        }

        self.state.record(BrokerOp::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> BrokerResult<()> {
        let _busy = self.enter().await;
        self.ensure_open(Operation::Publish)?;

        self.state.route_and_enqueue(
            &publishing.exchange,
            &publishing.routing_key,
            publishing.headers.clone(),
            publishing.body.clone(),
        )?;
        self.state.record(BrokerOp::Publish(publishing));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> BrokerResult<()> {
        self.ensure_open(Operation::Ack)?;

        let settled: Vec<String> = {
            let mut unacked = self.core.unacked.lock();
            if !unacked.contains_key(&delivery_tag) {
                return Err(BrokerError::protocol(
                    PRECONDITION_FAILED,
                    format!("unknown delivery tag {delivery_tag}"),
                ));
            }
            let tags: Vec<u64> = if multiple {
                unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
            } else {
                vec![delivery_tag]
            };
            tags.into_iter()
                .filter_map(|tag| unacked.remove(&tag).map(|(queue, _)| queue))
                .collect()
        };

        self.state.record(BrokerOp::Ack {
            delivery_tag,
            multiple,
        });
        for queue_name in settled {
            if let Some(queue) = self.state.queue(&queue_name) {
                self.state.dispatch(&queue);
            }
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()> {
        self.ensure_open(Operation::Nack)?;

        let rejected: Vec<(String, StoredMessage)> = {
            let mut unacked = self.core.unacked.lock();
            if !unacked.contains_key(&delivery_tag) {
                return Err(BrokerError::protocol(
                    PRECONDITION_FAILED,
                    format!("unknown delivery tag {delivery_tag}"),
                ));
            }
            let tags: Vec<u64> = if multiple {
                unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
            } else {
                vec![delivery_tag]
            };
            tags.into_iter()
                .filter_map(|tag| unacked.remove(&tag))
                .collect()
        };

        self.state.record(BrokerOp::Nack {
            delivery_tag,
            multiple,
            requeue,
        });
        for (queue_name, message) in rejected.into_iter().rev() {
            if requeue {
                self.state.requeue(&queue_name, message);
            } else if let Some(queue) = self.state.queue(&queue_name) {
                self.state.dead_letter(&queue.spec, message);
                self.state.dispatch(&queue);
            }
        }
        Ok(())
    }

    fn notify_close(&self) -> CloseSignal {
        let signal = self.core.watchers.register();
        if !self.core.open.load(Ordering::SeqCst) {
            self.core
                .watchers
                .fire(BrokerError::channel_closed("channel is closed"));
        }
        signal
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Some(connection) = self.connection.upgrade() {
            connection
                .channels
                .lock()
                .retain(|channel| !Arc::ptr_eq(channel, &self.core));
        }
        self.state.shutdown_channel(&self.core, None);
        Ok(())
    }
}
