//! # Driver
//!
//! The AMQP job queue driver, leaf-first:
//!
//! - [`topology`] - exchange, main queue and per-delay queue declarations
//! - [`pool`] - single-owner publish/state channel tokens
//! - [`supervisor`] - connection ownership, close notifications and redial
//! - [`publisher`] - immediate and delayed publishing
//! - [`listener`] - consume subscription and delivery loop
//! - [`consumer`] - lifecycle state machine and the public driver API

pub mod consumer;
pub mod listener;
pub mod pool;
pub mod publisher;
pub mod state;
pub mod supervisor;
pub mod topology;

pub use consumer::{Consumer, LifecycleState};
pub use listener::{AckPolicy, ListenerContext, Subscription};
pub use pool::{ChannelLease, ChannelPool, ChannelRole, ChannelSlot};
pub use publisher::Publisher;
pub use state::{JobsState, Status};
pub use supervisor::{
    next_backoff, ConnectionSupervisor, ReconnectHandler, RedialMessage, RedialSource,
};
pub use topology::{delayed_queue_name, TopologyManager};
