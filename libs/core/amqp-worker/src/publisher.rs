//! Guarded publisher
//!
//! Publishing never waits for a reconnect and never retries: if the client is
//! not ready the call fails with `NotConnected` before any I/O, and the
//! caller decides what to do.

use crate::connection::ConnectionManager;
use crate::error::AmqpError;
use crate::metrics;
use crate::transport::OutboundMessage;
use serde::Serialize;
use tracing::{debug, warn};

/// Publishes messages through the manager's current channel
#[derive(Clone)]
pub struct Publisher {
    manager: ConnectionManager,
}

impl Publisher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Serialize `payload` as JSON and publish it as a persistent message.
    ///
    /// # Errors
    ///
    /// - `Shutdown` after the client was closed
    /// - `NotConnected` while no connection is ready
    /// - `Serialization` if the payload cannot be encoded
    /// - the channel's publish error, unchanged
    pub async fn publish<T>(
        &self,
        payload: &T,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let channel = self.manager.channel().inspect_err(|e| {
            metrics::publish_result(exchange, "not_ready");
            debug!(exchange, routing_key, error = %e, "Publish refused");
        })?;

        let body = serde_json::to_vec(payload)?;
        let message = OutboundMessage::json(body);

        match channel.publish(exchange, routing_key, mandatory, message).await {
            Ok(()) => {
                metrics::publish_result(exchange, "success");
                debug!(exchange, routing_key, "Message published");
                Ok(())
            }
            Err(e) => {
                metrics::publish_result(exchange, "failed");
                warn!(exchange, routing_key, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Publish an already encoded body with an explicit content type
    pub async fn publish_bytes(
        &self,
        body: Vec<u8>,
        content_type: &str,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
    ) -> Result<(), AmqpError> {
        let channel = self.manager.channel()?;
        let message = OutboundMessage::new(body, content_type);
        let result = channel.publish(exchange, routing_key, mandatory, message).await;
        metrics::publish_result(exchange, if result.is_ok() { "success" } else { "failed" });
        result
    }
}
