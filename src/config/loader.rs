//! Configuration Loader
//!
//! Reads driver settings out of an opaque [`ConfigSource`] and merges the pipeline section
//! with the global `amqp` section. Any layered `config::Config` (files plus environment)
//! is a source; so is a plain JSON document, which the tests use.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, error, warn};

use super::{apply_defaults, DriverConfig};
use crate::constants::{defaults, options, GLOBAL_SECTION};
use crate::error::{DriverError, DriverResult};
use crate::pipeline::Pipeline;

/// Opaque source of typed configuration sections
pub trait ConfigSource: Send + Sync {
    /// Whether the section `key` exists
    fn has(&self, key: &str) -> bool;

    /// The section `key` as a JSON document
    fn section(&self, key: &str) -> DriverResult<serde_json::Value>;
}

impl ConfigSource for config::Config {
    fn has(&self, key: &str) -> bool {
        self.get::<config::Value>(key).is_ok()
    }

    fn section(&self, key: &str) -> DriverResult<serde_json::Value> {
        Ok(self.get::<serde_json::Value>(key)?)
    }
}

impl ConfigSource for serde_json::Value {
    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn section(&self, key: &str) -> DriverResult<serde_json::Value> {
        self.get(key)
            .cloned()
            .ok_or_else(|| DriverError::configuration(format!("no configuration section '{key}'")))
    }
}

/// Load a layered configuration: the file at `path`, then `TASKER_*` environment variables
/// (`TASKER_AMQP__ADDR` overrides `amqp.addr`)
pub fn load_config_file(path: &Path) -> DriverResult<config::Config> {
    debug!(path = %path.display(), "Loading driver configuration file");

    let built = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix("TASKER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(built)
}

/// Settings for a consumer constructed from a pipeline configuration section
///
/// Both `config_key` and the global `amqp` section must exist. Global keys override local ones.
pub fn load_driver_config(config_key: &str, source: &dyn ConfigSource) -> DriverResult<DriverConfig> {
    if !source.has(config_key) {
        return Err(DriverError::configuration(format!(
            "no configuration by provided key: {config_key}"
        )));
    }
    if !source.has(GLOBAL_SECTION) {
        return Err(DriverError::configuration(
            "no global amqp configuration, global configuration should contain amqp addrs",
        ));
    }

    let mut merged = as_object(source.section(config_key)?, config_key)?;
    for (key, value) in as_object(source.section(GLOBAL_SECTION)?, GLOBAL_SECTION)? {
        merged.insert(key, value);
    }

    let config: DriverConfig = serde_json::from_value(serde_json::Value::Object(merged))
        .map_err(|e| DriverError::configuration(format!("invalid '{config_key}' section: {e}")))?;
    let config = apply_defaults(config);
    config.validate()?;

    debug!(
        config_key = %config_key,
        addr = %sanitize_addr(&config.addr),
        queue = %config.queue,
        exchange = %config.exchange,
        "Driver configuration loaded"
    );
    Ok(config)
}

/// Settings for a consumer constructed from a registered pipeline
///
/// Only the global `amqp` section is required; topology comes from the pipeline's options
/// with the same defaults. An unparsable `prefetch` falls back to the default; unparsable
/// `queue_headers` is fatal.
pub fn load_pipeline_config(
    pipeline: &Pipeline,
    source: &dyn ConfigSource,
) -> DriverResult<DriverConfig> {
    if !source.has(GLOBAL_SECTION) {
        return Err(DriverError::configuration(
            "no global amqp configuration, global configuration should contain amqp addrs",
        ));
    }

    let global: DriverConfig = serde_json::from_value(source.section(GLOBAL_SECTION)?)
        .map_err(|e| DriverError::configuration(format!("invalid global amqp section: {e}")))?;
    let global = apply_defaults(global);

    let raw_prefetch = pipeline.string(options::PREFETCH, &defaults::PREFETCH.to_string());
    let prefetch = raw_prefetch.trim().parse::<u16>().unwrap_or_else(|_| {
        error!(
            prefetch = %raw_prefetch,
            "prefetch parse, driver will use default ({}) prefetch",
            defaults::PREFETCH
        );
        defaults::PREFETCH
    });

    let queue_headers = match pipeline.string(options::QUEUE_HEADERS, "") {
        raw if raw.is_empty() => HashMap::new(),
        raw => serde_json::from_str(&raw).map_err(|e| {
            warn!(value = %raw, "failed to unmarshal queue headers");
            DriverError::configuration(format!("invalid queue_headers: {e}"))
        })?,
    };

    let redial_timeout = u64::try_from(pipeline.int(
        options::REDIAL_TIMEOUT,
        i64::try_from(defaults::REDIAL_TIMEOUT_SECONDS).unwrap_or(60),
    ))
    .unwrap_or(defaults::REDIAL_TIMEOUT_SECONDS);

    let config = apply_defaults(DriverConfig {
        addr: global.addr,
        prefetch,
        queue: pipeline.string(options::QUEUE, defaults::QUEUE),
        priority: pipeline.int(options::PRIORITY, defaults::PRIORITY),
        exchange: pipeline.string(options::EXCHANGE, defaults::EXCHANGE),
        exchange_type: pipeline.string(options::EXCHANGE_TYPE, defaults::EXCHANGE_TYPE),
        routing_key: pipeline.string(options::ROUTING_KEY, ""),
        consume_all: pipeline.bool(options::CONSUME_ALL, false),
        publish_plain: pipeline.bool(options::PUBLISH_PLAIN, false),
        exclusive: pipeline.bool(options::EXCLUSIVE, false),
        durable: pipeline.bool(options::DURABLE, false),
        delete_queue_on_stop: pipeline.bool(options::DELETE_QUEUE_ON_STOP, false),
        multiple_ack: pipeline.bool(options::MULTIPLE_ACK, false),
        requeue_on_fail: pipeline.bool(options::REQUEUE_ON_FAIL, false),
        exchange_durable: pipeline.bool(options::EXCHANGE_DURABLE, false),
        exchange_auto_delete: pipeline.bool(options::EXCHANGE_AUTO_DELETE, false),
        queue_auto_delete: pipeline.bool(options::QUEUE_AUTO_DELETE, false),
        redial_timeout,
        queue_headers,
        consumer_id: pipeline.string(options::CONSUMER_ID, &global.consumer_id),
    });
    config.validate()?;

    debug!(
        pipeline = %pipeline.name(),
        addr = %sanitize_addr(&config.addr),
        queue = %config.queue,
        exchange = %config.exchange,
        "Pipeline configuration loaded"
    );
    Ok(config)
}

fn as_object(
    value: serde_json::Value,
    key: &str,
) -> DriverResult<serde_json::Map<String, serde_json::Value>> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(serde_json::Map::new()),
        _ => Err(DriverError::configuration(format!(
            "configuration section '{key}' must be a table"
        ))),
    }
}

/// Mask the password of a broker URI for logging
pub fn sanitize_addr(addr: &str) -> String {
    let Some((scheme, rest)) = addr.split_once("://") else {
        return addr.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return addr.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => addr.to_string(),
    }
}
