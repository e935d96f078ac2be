//! `lapin` implementation of the broker transport

use crate::error::AmqpError;
use crate::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, OutboundMessage,
    Transport,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const REPLY_SUCCESS: u16 = 200;

/// Tag a `lapin` error with the operation that failed
fn mapped(kind: fn(String) -> AmqpError) -> impl Fn(lapin::Error) -> AmqpError {
    move |err| kind(err.to_string())
}

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(
        &self,
        url: &str,
        connection_name: Option<String>,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = connection_name {
            properties = properties.with_connection_name(name.into());
        }

        let connection = Connection::connect(url, properties)
            .await
            .map_err(mapped(AmqpError::Connection))?;
        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(mapped(AmqpError::Channel))?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_close(&self, lost: CancellationToken) {
        self.connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection closed");
            lost.cancel();
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(mapped(AmqpError::Connection))?;
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(mapped(AmqpError::Consume))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(mapped(AmqpError::Consume))?;

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(mapped(AmqpError::Consume)))
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(message.delivery_mode)
            .with_timestamp(message.timestamp);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                &message.body,
                properties,
            )
            .await
            .map_err(mapped(AmqpError::Publish))?;
        Ok(())
    }

    fn on_close(&self, lost: CancellationToken) {
        self.channel.on_error(move |err| {
            warn!(error = %err, "AMQP channel closed");
            lost.cancel();
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(mapped(AmqpError::Channel))?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        delivery.redelivered,
        Box::new(LapinAcker(delivery.acker)),
    )
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(mapped(AmqpError::Acknowledge))?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(mapped(AmqpError::Acknowledge))?;
        Ok(())
    }
}
