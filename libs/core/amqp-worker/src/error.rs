//! AMQP client error types
//!
//! Two families of errors live here:
//! - [`AmqpError`]: failures of the client itself (connectivity, lifecycle,
//!   publish, serialization). `NotConnected` and `Shutdown` are the sentinels
//!   callers match on.
//! - [`HandlerError`]: what a message handler returns. The consumer pipeline
//!   uses its category to decide between retrying and dead-lettering.

use thiserror::Error;

/// Errors raised by the connection manager, consumer and publisher
#[derive(Error, Debug)]
pub enum AmqpError {
    /// No usable connection right now (reconnect in progress)
    #[error("amqp: client not connected")]
    NotConnected,

    /// The client was closed; no further operations are possible
    #[error("amqp: client is shutting down")]
    Shutdown,

    /// Dial, handshake or connection close failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel could not be opened, used or closed
    #[error("Channel error: {0}")]
    Channel(String),

    /// basic.qos, basic.consume or the delivery stream failed
    #[error("Consume error: {0}")]
    Consume(String),

    /// Publish was refused
    #[error("Publish error: {0}")]
    Publish(String),

    /// Ack or reject could not be delivered to the broker
    #[error("Acknowledge error: {0}")]
    Acknowledge(String),

    /// Payload could not be encoded as JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AmqpError {
    /// True when the error means the broker link is down or unusable.
    ///
    /// Connectivity errors after construction are healed by the
    /// reconnection actor; callers usually only need to retry later.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AmqpError::NotConnected
                | AmqpError::Connection(_)
                | AmqpError::Channel(_)
        )
    }

    /// True for the terminal shutdown sentinel
    pub fn is_shutdown(&self) -> bool {
        matches!(self, AmqpError::Shutdown)
    }
}

#[cfg(feature = "config")]
impl From<core_config::ConfigError> for AmqpError {
    fn from(err: core_config::ConfigError) -> Self {
        AmqpError::Config(err.to_string())
    }
}

/// Outcome of a failed handler invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Temporary failure; the delivery is retried with backoff
    #[error("{0}")]
    Retryable(String),

    /// Unrecoverable failure; the delivery is dead-lettered immediately
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    /// Label used in logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            HandlerError::Retryable(_) => "retryable",
            HandlerError::Permanent(_) => "permanent",
        }
    }
}

// A body that does not decode will never decode.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(format!("invalid payload: {}", err))
    }
}
