#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker AMQP
//!
//! AMQP job-queue driver for Tasker pipelines.
//!
//! ## Overview
//!
//! The driver moves job items between an application and an AMQP 0-9-1 broker (RabbitMQ and
//! compatible servers) with the semantics a job pipeline needs: priority delivery into a local
//! queue, at-least-once acknowledgement, delayed execution through the broker's dead-letter
//! mechanism, pause/resume and automatic reconnection.
//!
//! ## Architecture
//!
//! - **Connection Supervisor** owns the single broker connection, watches close notifications
//!   of the connection and every channel, and redials with capped exponential backoff.
//! - **Channel Pool** hands out the publish and state channels as single-owner tokens.
//! - **Topology Manager** declares the exchange, the main queue and the per-delay queues.
//! - **Publisher** routes immediate jobs to the exchange and delayed jobs through a TTL queue.
//! - **Delivery Loop** decodes deliveries, binds acknowledgers and feeds the priority queue.
//! - **Consumer** is the lifecycle state machine (run, pause, resume, stop) on top of them.
//!
//! ## Module Organization
//!
//! - [`broker`] - broker traits, the `lapin` implementation and an in-memory broker
//! - [`config`] - driver settings, defaults and configuration loading
//! - [`driver`] - supervisor, pool, topology, publisher, listener and consumer
//! - [`messaging`] - job model, acknowledgers and wire codecs
//! - [`priority_queue`] - the priority queue collaborator
//! - [`pipeline`] - pipeline identity
//! - [`error`] - structured error handling
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_amqp::broker::amqp::LapinBroker;
//! use tasker_amqp::{BoundedPriorityQueue, Consumer, DriverConfig, Job, Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), tasker_amqp::DriverError> {
//! let queue = Arc::new(BoundedPriorityQueue::new(1_000));
//! let config = DriverConfig::new()
//!     .with_exchange("jobs")
//!     .with_queue("emails")
//!     .with_routing_key("emails");
//!
//! let consumer = Consumer::with_config(config, Arc::new(LapinBroker::new()), queue.clone()).await?;
//! let pipeline = Pipeline::new("emails", "amqp");
//! consumer.register(pipeline.clone());
//! consumer.run(&pipeline).await?;
//!
//! let job = Job::new("send_welcome", b"{}".to_vec()).with_pipeline("emails");
//! consumer.push(job, &CancellationToken::new()).await?;
//!
//! let item = queue.extract().await?;
//! item.ack().await?;
//! consumer.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Every component is exercised against [`broker::memory::InMemoryBroker`]:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod broker;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod pipeline;
pub mod priority_queue;

pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};
pub use config::{apply_defaults, ConfigSource, DriverConfig};
pub use driver::{Consumer, JobsState, LifecycleState, Status};
pub use error::{DriverError, DriverResult};
pub use messaging::{Item, Job, JobOptions};
pub use pipeline::Pipeline;
pub use priority_queue::{BoundedPriorityQueue, PriorityQueue};
