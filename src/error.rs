//! # Driver Error Types
//!
//! Structured errors surfaced to callers of the consumer API. Broker-level failures arrive as
//! [`BrokerError`] and are wrapped with the operation that failed.

use thiserror::Error;

use crate::broker::BrokerError;

/// Errors returned by the AMQP driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Timed out acquiring the {role} channel")]
    ChannelAcquisitionTimeout { role: String },

    #[error("Topology error: {operation}: {message}")]
    Topology { operation: String, message: String },

    #[error("Publish to exchange '{exchange}' with routing key '{routing_key}' failed: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Pipeline mismatch: requested '{requested}', registered '{registered}'")]
    PipelineMismatch {
        requested: String,
        registered: String,
    },

    #[error("Inspection of queue '{queue}' failed: {message}")]
    Inspection { queue: String, message: String },

    #[error("Subscription error: {message}")]
    Subscription { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Acknowledgement error: {message}")]
    Acknowledgement { message: String },

    #[error("Consumer is stopped")]
    Stopped,
}

impl DriverError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel acquisition timeout for a channel role
    pub fn acquisition_timeout(role: impl Into<String>) -> Self {
        Self::ChannelAcquisitionTimeout { role: role.into() }
    }

    /// Create a topology error
    pub fn topology(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Topology {
            operation: operation.into(),
            message: error.to_string(),
        }
    }

    /// Create a publish error
    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message: error.to_string(),
        }
    }

    /// Create a pipeline mismatch error
    pub fn pipeline_mismatch(requested: impl Into<String>, registered: impl Into<String>) -> Self {
        Self::PipelineMismatch {
            requested: requested.into(),
            registered: registered.into(),
        }
    }

    /// Create an inspection error
    pub fn inspection(queue: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Inspection {
            queue: queue.into(),
            message: error.to_string(),
        }
    }

    /// Create a subscription error
    pub fn subscription(error: impl std::fmt::Display) -> Self {
        Self::Subscription {
            message: error.to_string(),
        }
    }

    /// Create a codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Create an acknowledgement error
    pub fn acknowledgement(error: impl std::fmt::Display) -> Self {
        Self::Acknowledgement {
            message: error.to_string(),
        }
    }

    /// Whether this error is the timeout kind (caller deadline expired before any broker I/O)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ChannelAcquisitionTimeout { .. })
    }
}

impl From<BrokerError> for DriverError {
    fn from(error: BrokerError) -> Self {
        Self::Connection {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec {
            message: error.to_string(),
        }
    }
}

impl From<config::ConfigError> for DriverError {
    fn from(error: config::ConfigError) -> Self {
        Self::Configuration {
            message: error.to_string(),
        }
    }
}

/// Result type for driver operations
pub type DriverResult<T> = anyhow::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kind() {
        assert!(DriverError::acquisition_timeout("publish").is_timeout());
        assert!(!DriverError::Stopped.is_timeout());
        assert!(!DriverError::connection("refused").is_timeout());
    }

    #[test]
    fn test_error_messages() {
        let error = DriverError::publish("ex", "rk", "channel closed");
        assert_eq!(
            error.to_string(),
            "Publish to exchange 'ex' with routing key 'rk' failed: channel closed"
        );

        let error = DriverError::pipeline_mismatch("reports", "emails");
        assert_eq!(
            error.to_string(),
            "Pipeline mismatch: requested 'reports', registered 'emails'"
        );
    }

    #[test]
    fn test_broker_error_conversion() {
        let error: DriverError = BrokerError::io("connection reset").into();
        assert!(matches!(error, DriverError::Connection { .. }));
    }
}
