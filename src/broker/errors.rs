//! # Broker Error Types
//!
//! Errors raised by broker handles. These stay close to the wire: the driver maps them into
//! [`DriverError`](crate::error::DriverError) with the operation that failed.

use thiserror::Error;

/// AMQP reply code for a refused declare (argument mismatch on an existing entity)
pub const PRECONDITION_FAILED: u16 = 406;

/// AMQP reply code for a missing queue or exchange
pub const NOT_FOUND: u16 = 404;

/// Errors surfaced by `Broker`, `BrokerConnection` and `BrokerChannel` implementations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Channel closed: {reason}")]
    ChannelClosed { reason: String },

    #[error("Broker protocol error {code}: {text}")]
    Protocol { code: u16, text: String },

    #[error("Broker I/O error: {message}")]
    Io { message: String },

    #[error("Not found: {entity}")]
    NotFound { entity: String },
}

impl BrokerError {
    /// Create a connection closed error
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(code: u16, text: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            text: text.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    /// Whether the handle that produced this error can no longer be used
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed { .. } | Self::ChannelClosed { .. } | Self::Io { .. }
        )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(error: lapin::Error) -> Self {
        match error {
            lapin::Error::ProtocolError(amqp_error) => Self::Protocol {
                code: amqp_error.get_id(),
                text: amqp_error.get_message().as_str().to_string(),
            },
            lapin::Error::InvalidChannelState(state) => Self::ChannelClosed {
                reason: format!("{state:?}"),
            },
            lapin::Error::InvalidConnectionState(state) => Self::ConnectionClosed {
                reason: format!("{state:?}"),
            },
            lapin::Error::IOError(io) => Self::Io {
                message: io.to_string(),
            },
            other => Self::Io {
                message: other.to_string(),
            },
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
