//! Broker transport abstraction
//!
//! The connection manager, consumer and publisher talk to the broker only
//! through these traits. [`crate::LapinTransport`] is the production
//! implementation; tests plug in an in-memory broker.
//!
//! ```text
//! Transport::dial ──► BrokerConnection ──open_channel──► BrokerChannel
//!                         │ on_close(lost)                 │ on_close(lost)
//!                         ▼                                ▼
//!                     lost.cancel()  ◄───── either one fires the generation token
//! ```

use crate::error::AmqpError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stream of deliveries for one basic.consume
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to a broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial the broker. `connection_name` is reported as a client property.
    async fn dial(
        &self,
        url: &str,
        connection_name: Option<String>,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new operational channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Cancel `lost` when the connection closes unexpectedly
    fn on_close(&self, lost: CancellationToken);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A live channel on a broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// basic.qos
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// basic.consume with manual acknowledgment
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// basic.publish
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: OutboundMessage,
    ) -> Result<(), AmqpError>;

    /// Cancel `lost` when the channel closes unexpectedly
    fn on_close(&self, lost: CancellationToken);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery with the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message taken from the broker.
///
/// Disposition consumes the delivery, so it can be settled at most once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Reject the delivery. Without requeue the broker dead-letters it.
    pub async fn reject(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Delivery mode for messages that survive a broker restart
pub const PERSISTENT: u8 = 2;

/// A message ready for basic.publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub delivery_mode: u8,
    /// Creation time, seconds since the Unix epoch (UTC)
    pub timestamp: u64,
}

impl OutboundMessage {
    /// Persistent message stamped with the current time
    pub fn new(body: Vec<u8>, content_type: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            body,
            content_type: content_type.into(),
            delivery_mode: PERSISTENT,
            timestamp: u64::try_from(now).unwrap_or_default(),
        }
    }

    /// Persistent `application/json` message
    pub fn json(body: Vec<u8>) -> Self {
        Self::new(body, "application/json")
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == PERSISTENT
    }
}
