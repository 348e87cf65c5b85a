//! # Publisher
//!
//! Publishes items over the pooled publish channel. Immediate jobs go straight to the
//! configured exchange and routing key. Delayed jobs go through a per-delay queue whose TTL
//! dead-letters them back into the real exchange once the delay has elapsed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::types::FieldTable;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pool::ChannelRole;
use super::supervisor::ConnectionSupervisor;
use crate::broker::Publishing;
use crate::constants::CONTENT_TYPE;
use crate::error::{DriverError, DriverResult};
use crate::messaging::{Item, JobCodec};

pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
    codec: Box<dyn JobCodec>,
    delayed: Arc<AtomicI64>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("codec", &self.codec.name())
            .field("delayed", &self.delayed.load(Ordering::SeqCst))
            .finish()
    }
}

fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

fn unix_timestamp() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

impl Publisher {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        codec: Box<dyn JobCodec>,
        delayed: Arc<AtomicI64>,
    ) -> Self {
        Self {
            supervisor,
            codec,
            delayed,
        }
    }

    /// Messages published with a delay so far
    pub fn delayed(&self) -> i64 {
        self.delayed.load(Ordering::SeqCst)
    }

    /// Publish one item
    ///
    /// Waits for the publish channel until `cancel` fires. The delayed counter is incremented
    /// before a delayed publish and rolled back when any step of it fails.
    pub async fn publish(&self, item: &Item, cancel: &CancellationToken) -> DriverResult<()> {
        let channel = self
            .supervisor
            .pool()
            .acquire(ChannelRole::Publish, cancel)
            .await?;
        let headers = self.codec.encode(item)?;
        let topology = self.supervisor.topology();

        let delay_ms = delay_millis(item.delay());
        if delay_ms == 0 {
            channel
                .publish(self.publishing(
                    topology.exchange_name(),
                    topology.routing_key(),
                    headers,
                    item,
                ))
                .await
                .map_err(|e| {
                    DriverError::publish(topology.exchange_name(), topology.routing_key(), e)
                })?;

            debug!(
                job_id = %item.id(),
                exchange = %topology.exchange_name(),
                routing_key = %topology.routing_key(),
                codec = self.codec.name(),
                "Job published"
            );
            return Ok(());
        }

        self.delayed.fetch_add(1, Ordering::SeqCst);
        let published = async {
            let delayed_queue = topology.declare_delayed(&*channel, delay_ms).await?;
            channel
                .publish(self.publishing(
                    topology.exchange_name(),
                    &delayed_queue,
                    headers,
                    item,
                ))
                .await
                .map_err(|e| DriverError::publish(topology.exchange_name(), &delayed_queue, e))?;
            Ok::<_, DriverError>(delayed_queue)
        }
        .await;

        match published {
            Ok(delayed_queue) => {
                debug!(
                    job_id = %item.id(),
                    delayed_queue = %delayed_queue,
                    delay_ms = delay_ms,
                    "Delayed job published"
                );
                Ok(())
            }
            Err(e) => {
                self.delayed.fetch_sub(1, Ordering::SeqCst);
                warn!(
                    job_id = %item.id(),
                    delay_ms = delay_ms,
                    error = %e,
                    "Delayed publish failed"
                );
                Err(e)
            }
        }
    }

    fn publishing(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: FieldTable,
        item: &Item,
    ) -> Publishing {
        Publishing {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            headers,
            content_type: CONTENT_TYPE.to_string(),
            persistent: true,
            timestamp: unix_timestamp(),
            body: item.body().to_vec(),
        }
    }
}
