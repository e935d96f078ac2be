//! Client facade bundling the connection manager, consumers and publisher.

use crate::config::{ConnectionConfig, ConsumerConfig};
use crate::connection::ConnectionManager;
use crate::consumer::Consumer;
use crate::error::AmqpError;
use crate::handler::MessageHandler;
use crate::lapin_transport::LapinTransport;
use crate::publisher::Publisher;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A resilient AMQP client.
///
/// ```rust,ignore
/// let client = Client::connect(ConnectionConfig::from_env()?).await?;
///
/// let cancel = CancellationToken::new();
/// let consumer = client.start_consuming(cancel.clone(), ConsumerConfig::new("jobs"), handler);
///
/// client.publish(&event, "events", "jobs.completed", false).await?;
///
/// cancel.cancel();
/// consumer.await?;
/// client.close().await?;
/// ```
#[derive(Clone)]
pub struct Client {
    manager: ConnectionManager,
    publisher: Publisher,
}

impl Client {
    /// Connect with the `lapin` transport. Fails fast if the broker is
    /// unreachable.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, AmqpError> {
        Self::connect_with(config, Arc::new(LapinTransport::new())).await
    }

    /// Connect through a custom transport
    pub async fn connect_with(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AmqpError> {
        let manager = ConnectionManager::connect(config, transport).await?;
        Ok(Self {
            publisher: Publisher::new(manager.clone()),
            manager,
        })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    /// Consume `config.queue` until `cancel` fires. See [`Consumer::run`].
    pub async fn start_consuming(
        &self,
        cancel: CancellationToken,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        Consumer::new(self.manager.clone(), config)
            .run(handler, cancel)
            .await
    }

    /// Publish a JSON payload. See [`Publisher::publish`].
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
        self.publisher
            .publish(payload, exchange, routing_key, mandatory)
            .await
    }

    /// Close the client. Safe to call more than once.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.manager.close().await
    }
}
