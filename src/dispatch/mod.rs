//! Queue consumption and job dispatch.

#[cfg(feature = "amqp-broker")]
mod amqp;
mod broker;
mod dispatcher;
mod memory;

#[cfg(feature = "amqp-broker")]
pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerError, Delivery};
pub use dispatcher::{DispatchOptions, DispatchSummary, Dispatcher};
pub use memory::{MemoryBroker, MemoryQueue};

#[cfg(feature = "amqp-broker")]
use std::sync::Arc;

#[cfg(feature = "amqp-broker")]
use tokio_util::sync::CancellationToken;

#[cfg(feature = "amqp-broker")]
use crate::pipeline::JobRunner;

/// Connect to the broker and dispatch jobs until drained or cancelled.
#[cfg(feature = "amqp-broker")]
pub async fn start<R: JobRunner>(
    runner: Arc<R>,
    broker_url: &str,
    options: DispatchOptions,
    shutdown: CancellationToken,
) -> Result<DispatchSummary, BrokerError> {
    let broker = AmqpBroker::connect(broker_url, &options.queue, options.concurrency).await?;
    Dispatcher::new(broker, runner, options).run(shutdown).await
}

/// Publish a job id to the queue.
#[cfg(feature = "amqp-broker")]
pub async fn submit(broker_url: &str, queue: &str, job_id: &str) -> Result<(), BrokerError> {
    let mut broker = AmqpBroker::connect(broker_url, queue, 1).await?;
    let published = broker.publish(job_id.as_bytes()).await;
    broker.close().await?;
    published
}
