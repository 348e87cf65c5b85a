//! # Pipeline Identity
//!
//! A pipeline is the unit the owning process registers with a driver: a name, the driver tag,
//! a declared priority and free-form string options. The consumer keeps the registered identity
//! in a [`PipelineSlot`] so `register` can swap it while `push`/`run` read a consistent
//! snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

/// Registered pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    name: String,
    driver: String,
    priority: i64,
    #[serde(default)]
    options: HashMap<String, String>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            priority: crate::constants::defaults::PRIORITY,
            options: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// String option, or `default` when absent
    pub fn string(&self, key: &str, default: &str) -> String {
        self.options
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Boolean option; absent or unparsable values yield `default`
    pub fn bool(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Integer option; absent or unparsable values yield `default`
    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.options
            .get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// Read-mostly holder of the registered pipeline
///
/// Readers clone an `Arc` snapshot and never observe a half-updated identity.
#[derive(Debug, Default)]
pub struct PipelineSlot {
    current: RwLock<Option<Arc<Pipeline>>>,
}

impl PipelineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered pipeline
    pub fn store(&self, pipeline: Pipeline) {
        *self.current.write() = Some(Arc::new(pipeline));
    }

    /// Current snapshot, if any pipeline was registered
    pub fn load(&self) -> Option<Arc<Pipeline>> {
        self.current.read().clone()
    }

    /// Snapshot of the registered pipeline, checked against the caller's pipeline name
    pub fn expect_named(&self, requested: &str) -> DriverResult<Arc<Pipeline>> {
        match self.load() {
            Some(pipeline) if pipeline.name() == requested => Ok(pipeline),
            Some(pipeline) => Err(DriverError::pipeline_mismatch(requested, pipeline.name())),
            None => Err(DriverError::pipeline_mismatch(requested, "")),
        }
    }
}
