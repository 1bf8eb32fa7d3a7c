//! AMQP 0-9-1 broker over lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info};

use super::broker::{Broker, BrokerError, Delivery};
use crate::repository::redact_url_password;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

fn channel_error(e: lapin::Error) -> BrokerError {
    BrokerError::Channel(e.to_string())
}

/// One connection and channel to a durable queue.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    queue: String,
    consumer: Option<Consumer>,
    cancelled: bool,
}

impl AmqpBroker {
    /// Connect, set the prefetch credit and declare `queue` durable.
    pub async fn connect(url: &str, queue: &str, prefetch: u16) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                BrokerError::Connection(format!("{}: {}", redact_url_password(url), e))
            })?;
        let channel = connection.create_channel().await.map_err(channel_error)?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(channel_error)?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        info!(broker = %redact_url_password(url), queue, prefetch, "Connected to broker");
        Ok(Self {
            connection,
            channel,
            queue: queue.to_string(),
            consumer: None,
            cancelled: false,
        })
    }

    /// Publish a persistent message to the queue.
    pub async fn publish(&self, body: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;
        debug!(queue = %self.queue, "Published message");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn start_consuming(&mut self) -> Result<(), BrokerError> {
        if self.consumer.is_some() {
            return Ok(());
        }
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                "citycatpg",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        self.consumer = Some(consumer);
        self.cancelled = false;
        Ok(())
    }

    /// After a cancel, lapin still yields what the server pushed before
    /// `basic.cancel-ok`, then ends the stream.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let consumer = self.consumer.as_mut()?;
        match consumer.next().await {
            Some(Ok(delivery)) => Some(Ok(Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
            })),
            Some(Err(e)) => Some(Err(channel_error(e))),
            None => {
                self.consumer = None;
                None
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn requeue(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(channel_error)
    }

    async fn message_count(&mut self) -> Result<u32, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(queue.message_count())
    }

    async fn stop_consuming(&mut self) -> Result<(), BrokerError> {
        if self.cancelled {
            return Ok(());
        }
        let Some(tag) = self.consumer.as_ref().map(|c| c.tag()) else {
            return Ok(());
        };
        self.cancelled = true;
        if let Err(e) = self
            .channel
            .basic_cancel(tag.as_str(), BasicCancelOptions::default())
            .await
        {
            self.consumer = None;
            return Err(channel_error(e));
        }
        debug!(queue = %self.queue, "Consumer cancelled, flushing pushed deliveries");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.consumer = None;
        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}
