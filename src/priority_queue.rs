//! # Priority Queue
//!
//! The container the delivery loop feeds. The driver only needs [`PriorityQueue::insert`];
//! [`BoundedPriorityQueue`] is the in-process implementation: lower priority values are served
//! first, FIFO among equal priorities, and a full queue makes `insert` wait (semaphore-based
//! backpressure).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{DriverError, DriverResult};
use crate::messaging::Item;

/// Destination of decoded deliveries
#[async_trait]
pub trait PriorityQueue: Send + Sync {
    /// Insert an item, waiting while the queue is at capacity
    async fn insert(&self, item: Item) -> DriverResult<()>;
}

struct Entry {
    priority: i64,
    sequence: u64,
    item: Item,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap pops the greatest entry: invert so the lowest (priority, sequence) wins
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Entry>,
    next_sequence: u64,
}

/// Capacity-bounded min-priority queue
pub struct BoundedPriorityQueue {
    heap: Mutex<Heap>,
    free: Semaphore,
    ready: Semaphore,
    capacity: usize,
}

impl BoundedPriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(Heap::default()),
            free: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the highest-priority item, waiting until one is available
    pub async fn extract(&self) -> DriverResult<Item> {
        let permit = self
            .ready
            .acquire()
            .await
            .map_err(|e| DriverError::subscription(format!("priority queue closed: {e}")))?;
        permit.forget();
        self.pop()
            .ok_or_else(|| DriverError::subscription("priority queue lost an item"))
    }

    /// Remove the highest-priority item if one is ready
    pub fn try_extract(&self) -> Option<Item> {
        let permit = self.ready.try_acquire().ok()?;
        permit.forget();
        self.pop()
    }

    /// Wake every waiter with an error; the queue accepts nothing afterwards
    pub fn close(&self) {
        self.free.close();
        self.ready.close();
    }

    fn pop(&self) -> Option<Item> {
        let entry = self.heap.lock().entries.pop()?;
        self.free.add_permits(1);
        Some(entry.item)
    }
}

#[async_trait]
impl PriorityQueue for BoundedPriorityQueue {
    async fn insert(&self, item: Item) -> DriverResult<()> {
        let permit = self
            .free
            .acquire()
            .await
            .map_err(|e| DriverError::subscription(format!("priority queue closed: {e}")))?;
        permit.forget();

        {
            let mut heap = self.heap.lock();
            let sequence = heap.next_sequence;
            heap.next_sequence += 1;
            heap.entries.push(Entry {
                priority: item.priority(),
                sequence,
                item,
            });
        }
        self.ready.add_permits(1);
        Ok(())
    }
}
