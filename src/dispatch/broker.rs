//! Message broker abstraction.
//!
//! A broker connection is single-owner: only the dispatcher task holds it,
//! so every method takes `&mut self`.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("broker is closed")]
    Closed,
}

/// A message received from the queue, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Broker: Send {
    /// Begin receiving deliveries, subject to the prefetch credit.
    async fn start_consuming(&mut self) -> Result<(), BrokerError>;

    /// Next delivery, or `None` once the consumer is cancelled and every
    /// delivery already pushed to this connection has been handed out.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError>;

    /// Release a delivery back to the queue for redelivery.
    async fn requeue(&mut self, tag: u64) -> Result<(), BrokerError>;

    /// Messages ready in the queue, excluding unacknowledged deliveries.
    async fn message_count(&mut self) -> Result<u32, BrokerError>;

    /// Cancel the consumer. Deliveries the broker already pushed are still
    /// yielded by [`Broker::next_delivery`]; pending acknowledgments still work.
    async fn stop_consuming(&mut self) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}
