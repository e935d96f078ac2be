//! AMQP Worker Framework
//!
//! A resilient AMQP 0-9-1 (RabbitMQ) client for background workers.
//!
//! ## Features
//!
//! - **Fail-fast connect, endless reconnect**: the first connection must
//!   succeed; afterwards a background actor reconnects with a fixed delay
//! - **Worker pool**: N workers share one delivery stream with manual acks
//! - **Bounded retry**: exponential backoff per delivery, then dead-letter
//!   (reject without requeue)
//! - **Guarded publisher**: JSON, persistent, timestamped; refuses with
//!   `NotConnected` instead of blocking
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────┐
//!                     │  ConnectionManager   │── reconnect actor
//!                     │  watch<ConnState>    │
//!                     └──────────┬───────────┘
//!             current() ┌────────┴────────┐ channel()
//!                       ▼                 ▼
//!                   Consumer           Publisher
//!                 (worker pool)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use amqp_worker::{handler_fn, Client, ConnectionConfig, ConsumerConfig, HandlerError};
//!
//! let client = Client::connect(ConnectionConfig::new("amqp://localhost:5672")).await?;
//! let handler = Arc::new(handler_fn("log", |_ctx, body| async move {
//!     tracing::info!(len = body.len(), "received");
//!     Ok::<_, HandlerError>(())
//! }));
//!
//! let cancel = CancellationToken::new();
//! client
//!     .start_consuming(cancel, ConsumerConfig::new("jobs").with_workers(4), handler)
//!     .await?;
//! ```

mod client;
mod config;
mod connection;
mod consumer;
mod error;
mod handler;
mod health;
mod lapin_transport;
pub mod metrics;
mod publisher;
mod retry;
mod transport;

// Re-export main types
pub use client::Client;
pub use config::{ConnectionConfig, ConsumerConfig, DEFAULT_RECONNECT_DELAY, DEFAULT_RETRY_START};
pub use connection::{ConnectionManager, ConnectionState, Generation};
pub use consumer::Consumer;
pub use error::{AmqpError, HandlerError};
pub use handler::{handler_fn, HandlerContext, HandlerFn, MessageHandler};
pub use health::{health_router, HealthResponse, HealthState};
pub use lapin_transport::LapinTransport;
pub use metrics::{init_metrics, ConsumerMetrics};
pub use publisher::Publisher;
pub use retry::{run_with_backoff, RetryOutcome, RetryPolicy};
pub use transport::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, OutboundMessage,
    Transport, PERSISTENT,
};

pub use tokio_util::sync::CancellationToken;
