//! # Channel Pool
//!
//! Single-owner tokens for the publish and state channels. Each role has a capacity-1 slot:
//! acquiring takes the channel out of the slot, and the returned [`ChannelLease`] puts it back
//! when dropped, so "channel checked out" is exactly "slot empty".
//!
//! During a redial the supervisor invalidates both slots. Acquirers then wait until the new
//! channel is installed, and leases still holding a channel of the previous connection drop it
//! instead of returning it. Closing a slot is terminal: waiters wake up and every later
//! acquire fails with [`DriverError::Stopped`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerChannel;
use crate::error::{DriverError, DriverResult};

/// Purpose a channel is dedicated to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Publish,
    State,
    Consume,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Publish => write!(f, "publish"),
            ChannelRole::State => write!(f, "state"),
            ChannelRole::Consume => write!(f, "consume"),
        }
    }
}

#[derive(Default)]
struct SlotState {
    token: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
    closed: bool,
}

struct SlotInner {
    role: ChannelRole,
    state: Mutex<SlotState>,
    available: Notify,
}

impl SlotInner {
    fn release(&self, channel: Arc<dyn BrokerChannel>, generation: u64) {
        let mut state = self.state.lock();
        if !state.closed && state.generation == generation && state.token.is_none() {
            state.token = Some(channel);
            drop(state);
            self.available.notify_one();
        }
    }
}

/// Capacity-1 token slot for one channel role
#[derive(Clone)]
pub struct ChannelSlot {
    inner: Arc<SlotInner>,
}

impl ChannelSlot {
    /// Create an empty slot
    pub fn new(role: ChannelRole) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                role,
                state: Mutex::new(SlotState::default()),
                available: Notify::new(),
            }),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.inner.role
    }

    /// Whether the token is in the slot (nobody holds the channel)
    pub fn is_available(&self) -> bool {
        self.inner.state.lock().token.is_some()
    }

    /// Take the channel, waiting until it is returned or installed
    ///
    /// Fails with the timeout kind when `cancel` fires first, and without waiting at all when
    /// it is already cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> DriverResult<ChannelLease> {
        loop {
            if cancel.is_cancelled() {
                return Err(DriverError::acquisition_timeout(self.inner.role.to_string()));
            }

            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(DriverError::Stopped);
                }
                if let Some(channel) = state.token.take() {
                    return Ok(ChannelLease {
                        channel,
                        generation: state.generation,
                        slot: Arc::clone(&self.inner),
                    });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DriverError::acquisition_timeout(self.inner.role.to_string()));
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Put a fresh channel into the slot; a closed slot refuses it
    pub fn install(&self, channel: Arc<dyn BrokerChannel>) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return false;
        }
        state.token = Some(channel);
        drop(state);
        self.inner.available.notify_one();
        true
    }

    /// Empty the slot and disown every outstanding lease, returning the idle channel if any
    pub fn invalidate(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.token.take()
    }

    /// Invalidate for good and wake every waiter
    pub fn close(&self) -> Option<Arc<dyn BrokerChannel>> {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.generation += 1;
            state.token.take()
        };
        self.inner.available.notify_waiters();
        idle
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

/// Exclusive use of a pooled channel; returned to its slot on drop
pub struct ChannelLease {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
    slot: Arc<SlotInner>,
}

impl ChannelLease {
    pub fn role(&self) -> ChannelRole {
        self.slot.role
    }
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.slot.release(Arc::clone(&self.channel), self.generation);
    }
}

/// The publish and state slots
#[derive(Clone)]
pub struct ChannelPool {
    publish: ChannelSlot,
    state: ChannelSlot,
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPool {
    pub fn new() -> Self {
        Self {
            publish: ChannelSlot::new(ChannelRole::Publish),
            state: ChannelSlot::new(ChannelRole::State),
        }
    }

    /// Slot of a pooled role; the consume channel is owned by the delivery loop instead
    pub fn slot(&self, role: ChannelRole) -> DriverResult<&ChannelSlot> {
        match role {
            ChannelRole::Publish => Ok(&self.publish),
            ChannelRole::State => Ok(&self.state),
            ChannelRole::Consume => Err(DriverError::configuration(
                "the consume channel is not pooled",
            )),
        }
    }

    pub async fn acquire(
        &self,
        role: ChannelRole,
        cancel: &CancellationToken,
    ) -> DriverResult<ChannelLease> {
        self.slot(role)?.acquire(cancel).await
    }

    /// Install fresh publish and state channels; false once the pool is closed
    pub fn install(&self, publish: Arc<dyn BrokerChannel>, state: Arc<dyn BrokerChannel>) -> bool {
        self.publish.install(publish) & self.state.install(state)
    }

    /// Invalidate both slots, returning the idle channels
    pub fn invalidate(&self) -> Vec<Arc<dyn BrokerChannel>> {
        [self.publish.invalidate(), self.state.invalidate()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Close both slots, returning the idle channels
    pub fn close(&self) -> Vec<Arc<dyn BrokerChannel>> {
        [self.publish.close(), self.state.close()]
            .into_iter()
            .flatten()
            .collect()
    }
}
