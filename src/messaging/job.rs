//! # Job Structures
//!
//! [`Job`] is what the application pushes. [`Item`] is the in-flight form the driver publishes
//! and hands to the priority queue; items reconstructed from a delivery carry an
//! [`Acknowledger`] bound to the consume channel and delivery tag.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::BrokerChannel;
use crate::error::{DriverError, DriverResult};

/// Per-job delivery options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower values are served first
    pub priority: i64,
    /// Name of the pipeline the job belongs to
    pub pipeline: String,
    /// Zero means publish immediately
    pub delay: Duration,
    /// Acknowledge on receipt instead of after processing
    pub auto_ack: bool,
}

/// Job submitted by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, Vec<String>>,
    pub options: JobOptions,
}

impl Job {
    /// Create a job with a generated id
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            options: JobOptions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.options.pipeline = pipeline.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.options.delay = delay;
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.options.auto_ack = auto_ack;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }
}

/// Settles one delivery on the channel it arrived on
pub struct Acknowledger {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    multiple: bool,
    requeue_on_fail: bool,
    settled: AtomicBool,
}

impl Acknowledger {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        delivery_tag: u64,
        multiple: bool,
        requeue_on_fail: bool,
    ) -> Self {
        Self {
            channel,
            delivery_tag,
            multiple,
            requeue_on_fail,
            settled: AtomicBool::new(false),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn settle(&self) -> DriverResult<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(DriverError::acknowledgement(format!(
                "delivery {} was already acknowledged",
                self.delivery_tag
            )));
        }
        Ok(())
    }

    pub async fn ack(&self) -> DriverResult<()> {
        self.settle()?;
        self.channel
            .ack(self.delivery_tag, self.multiple)
            .await
            .map_err(DriverError::acknowledgement)
    }

    /// Reject, requeueing according to the configured policy
    pub async fn nack(&self) -> DriverResult<()> {
        self.nack_with_options(self.requeue_on_fail).await
    }

    pub async fn nack_with_options(&self, requeue: bool) -> DriverResult<()> {
        self.settle()?;
        self.channel
            .nack(self.delivery_tag, false, requeue)
            .await
            .map_err(DriverError::acknowledgement)
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("channel", &self.channel.id())
            .field("delivery_tag", &self.delivery_tag)
            .field("multiple", &self.multiple)
            .field("requeue_on_fail", &self.requeue_on_fail)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// In-flight job
#[derive(Debug, Clone)]
pub struct Item {
    pub job: Job,
    pub requeue_on_fail: bool,
    acknowledger: Option<Arc<Acknowledger>>,
}

impl Item {
    /// Wrap a job pushed by the application; such items carry no acknowledger
    pub fn from_job(job: Job) -> Self {
        Self {
            job,
            requeue_on_fail: false,
            acknowledger: None,
        }
    }

    /// Bind the item to the delivery it was decoded from
    pub fn with_acknowledger(mut self, acknowledger: Acknowledger) -> Self {
        self.acknowledger = Some(Arc::new(acknowledger));
        self
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn body(&self) -> &[u8] {
        &self.job.payload
    }

    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.job.headers
    }

    pub fn priority(&self) -> i64 {
        self.job.options.priority
    }

    pub fn pipeline(&self) -> &str {
        &self.job.options.pipeline
    }

    pub fn delay(&self) -> Duration {
        self.job.options.delay
    }

    pub fn auto_ack(&self) -> bool {
        self.job.options.auto_ack
    }

    pub fn acknowledger(&self) -> Option<&Acknowledger> {
        self.acknowledger.as_deref()
    }

    /// Acknowledge the delivery; a no-op for items that never came from the broker
    pub async fn ack(&self) -> DriverResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, requeueing when `requeue_on_fail` is set
    pub async fn nack(&self) -> DriverResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.nack().await,
            None => Ok(()),
        }
    }

    pub async fn nack_with_options(&self, requeue: bool) -> DriverResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.nack_with_options(requeue).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let job = Job::new("send_email", b"{}".to_vec())
            .with_id("a")
            .with_pipeline("emails")
            .with_priority(3)
            .with_delay(Duration::from_secs(5))
            .with_header("tenant", "acme")
            .with_header("tenant", "globex");

        assert_eq!(job.id, "a");
        assert_eq!(job.options.pipeline, "emails");
        assert_eq!(job.options.delay, Duration::from_millis(5000));
        assert_eq!(job.headers["tenant"], vec!["acme", "globex"]);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let first = Job::new("a", Vec::new());
        let second = Job::new("a", Vec::new());
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_pushed_items_ack_as_noop() {
        let item = Item::from_job(Job::new("noop", Vec::new()));
        assert!(item.acknowledger().is_none());
        assert!(item.ack().await.is_ok());
        assert!(item.nack().await.is_ok());
    }
}
