//! # Job Codecs
//!
//! Converts items to and from AMQP header tables. Two encodings are supported:
//!
//! - **Structured**: the job envelope travels in `job_*` headers next to the raw payload.
//! - **Plain**: only the user headers are sent, so non-driver consumers see an ordinary
//!   message.
//!
//! Decoding is shared: a delivery carrying `job_id` is read as structured, anything else as a
//! plain body owned by the registered pipeline.

use std::collections::HashMap;
use std::time::Duration;

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use uuid::Uuid;

use super::job::{Item, Job, JobOptions};
use crate::broker::{amqp_value_to_i64, amqp_value_to_string, Delivery};
use crate::constants::{headers, PLAIN_JOB_NAME};
use crate::error::{DriverError, DriverResult};

/// Encoding applied on the publish path
pub trait JobCodec: Send + Sync {
    /// Header table for the item; the body is always the raw payload
    fn encode(&self, item: &Item) -> DriverResult<FieldTable>;

    fn name(&self) -> &'static str;
}

/// Values filled in for deliveries that carry no envelope
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeDefaults {
    pub pipeline: String,
    pub priority: i64,
    pub requeue_on_fail: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredCodec;

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

/// Pick the codec selected by `publish_plain`
pub fn codec_for(publish_plain: bool) -> Box<dyn JobCodec> {
    if publish_plain {
        Box::new(PlainCodec)
    } else {
        Box::new(StructuredCodec)
    }
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.to_string()))
}

fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

impl JobCodec for StructuredCodec {
    fn encode(&self, item: &Item) -> DriverResult<FieldTable> {
        let mut table = FieldTable::default();
        table.insert(ShortString::from(headers::JOB_ID), long_string(item.id()));
        table.insert(ShortString::from(headers::JOB_NAME), long_string(item.name()));
        table.insert(
            ShortString::from(headers::JOB_PIPELINE),
            long_string(item.pipeline()),
        );
        table.insert(
            ShortString::from(headers::JOB_PRIORITY),
            AMQPValue::LongLongInt(item.priority()),
        );
        table.insert(
            ShortString::from(headers::JOB_DELAY),
            AMQPValue::LongLongInt(delay_millis(item.delay())),
        );
        table.insert(
            ShortString::from(headers::JOB_AUTO_ACK),
            AMQPValue::Boolean(item.auto_ack()),
        );

        let user_headers = serde_json::to_string(item.headers())?;
        table.insert(
            ShortString::from(headers::JOB_HEADERS),
            long_string(&user_headers),
        );
        Ok(table)
    }

    fn name(&self) -> &'static str {
        "structured"
    }
}

impl JobCodec for PlainCodec {
    fn encode(&self, item: &Item) -> DriverResult<FieldTable> {
        let mut table = FieldTable::default();
        for (key, values) in item.headers() {
            let array: Vec<AMQPValue> = values.iter().map(|value| long_string(value)).collect();
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::FieldArray(FieldArray::from(array)),
            );
        }
        Ok(table)
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Rebuild an item from a delivery (without acknowledger)
pub fn decode(delivery: &Delivery, defaults: &DecodeDefaults) -> DriverResult<Item> {
    let job = match delivery.header(headers::JOB_ID) {
        Some(id) => decode_structured(id, delivery, defaults)?,
        None => decode_plain(delivery, defaults),
    };

    let mut item = Item::from_job(job);
    item.requeue_on_fail = defaults.requeue_on_fail;
    Ok(item)
}

fn decode_structured(
    id: &AMQPValue,
    delivery: &Delivery,
    defaults: &DecodeDefaults,
) -> DriverResult<Job> {
    let id = amqp_value_to_string(id)
        .ok_or_else(|| DriverError::codec(format!("unsupported {} header", headers::JOB_ID)))?;

    let text = |key: &str| delivery.header(key).and_then(amqp_value_to_string);
    let integer = |key: &str| delivery.header(key).and_then(amqp_value_to_i64);

    let delay_ms = integer(headers::JOB_DELAY).unwrap_or_default();
    let auto_ack = match delivery.header(headers::JOB_AUTO_ACK) {
        Some(AMQPValue::Boolean(flag)) => *flag,
        Some(other) => amqp_value_to_string(other).is_some_and(|flag| flag == "true"),
        None => false,
    };

    let user_headers = match text(headers::JOB_HEADERS) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).map_err(|e| {
            DriverError::codec(format!("invalid {} header: {e}", headers::JOB_HEADERS))
        })?,
        _ => HashMap::new(),
    };

    Ok(Job {
        id,
        name: text(headers::JOB_NAME).unwrap_or_else(|| PLAIN_JOB_NAME.to_string()),
        payload: delivery.body.clone(),
        headers: user_headers,
        options: JobOptions {
            priority: integer(headers::JOB_PRIORITY).unwrap_or(defaults.priority),
            pipeline: text(headers::JOB_PIPELINE).unwrap_or_else(|| defaults.pipeline.clone()),
            delay: Duration::from_millis(u64::try_from(delay_ms).unwrap_or_default()),
            auto_ack,
        },
    })
}

fn decode_plain(delivery: &Delivery, defaults: &DecodeDefaults) -> Job {
    let mut user_headers = HashMap::new();
    for (key, value) in delivery.headers.inner() {
        let values: Vec<String> = match value {
            AMQPValue::FieldArray(array) => array
                .as_slice()
                .iter()
                .filter_map(amqp_value_to_string)
                .collect(),
            other => amqp_value_to_string(other).into_iter().collect(),
        };
        if !values.is_empty() {
            user_headers.insert(key.as_str().to_string(), values);
        }
    }

    Job {
        id: Uuid::new_v4().to_string(),
        name: PLAIN_JOB_NAME.to_string(),
        payload: delivery.body.clone(),
        headers: user_headers,
        options: JobOptions {
            priority: defaults.priority,
            pipeline: defaults.pipeline.clone(),
            delay: Duration::ZERO,
            auto_ack: false,
        },
    }
}
