//! The dispatch loop.
//!
//! One task owns the broker. It receives deliveries, resolves job
//! configurations, spawns one worker per job and is the only place that
//! acknowledges. Workers report back over an mpsc channel.
//!
//! Per delivery: `Fetching → Dispatched → {Succeeded, Failed} → acked`.
//! A delivery whose configuration cannot be resolved is acked without a
//! worker. Concurrency is bounded by the broker's prefetch credit.
//!
//! Stopping cancels the consumer and then reads the delivery stream to its
//! end, because the broker may already have pushed messages to us. When the
//! queue drained those are still run; on shutdown they are released.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerError, Delivery};
use crate::models::JobConfig;
use crate::pipeline::{JobOutcome, JobRunner, PipelineError, RetryPolicy};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub queue: String,
    /// Jobs processed at once; also the broker prefetch.
    pub concurrency: u16,
    /// Return once the queue is empty and in-flight jobs are done.
    pub drain_on_empty: bool,
    pub retry: RetryPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            queue: "runs".to_string(),
            concurrency: 1,
            drain_on_empty: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counts of what happened to each delivery.
///
/// `delivered == succeeded + failed + unresolved + duplicates + released`
/// once the dispatcher returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Acked without a worker: unreadable body or configuration not found.
    pub unresolved: usize,
    /// Acked without a worker: same job id already in flight.
    pub duplicates: usize,
    /// Returned to the queue at shutdown before any work started.
    pub released: usize,
    pub peak_dispatched: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intake {
    Open,
    /// Consumer cancelled because the queue emptied; buffered deliveries run.
    Draining,
    /// Shutdown requested; buffered deliveries go back to the queue.
    Releasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Fetching,
    Dispatched,
}

struct InFlight {
    job_id: String,
    state: JobState,
}

struct Completion {
    tag: u64,
    job_id: String,
    result: Result<JobOutcome, PipelineError>,
}

type FetchFuture = BoxFuture<'static, (u64, String, Result<JobConfig, PipelineError>)>;

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Consumes one queue and runs jobs with a [`JobRunner`].
pub struct Dispatcher<B: Broker, R: JobRunner> {
    broker: B,
    runner: Arc<R>,
    options: DispatchOptions,
    in_flight: HashMap<u64, InFlight>,
    fetching: FuturesUnordered<FetchFuture>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    intake: Intake,
    /// The delivery stream has not ended yet.
    receiving: bool,
    summary: DispatchSummary,
}

impl<B: Broker, R: JobRunner> Dispatcher<B, R> {
    pub fn new(broker: B, runner: Arc<R>, options: DispatchOptions) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            runner,
            options,
            in_flight: HashMap::new(),
            fetching: FuturesUnordered::new(),
            completions_tx,
            completions_rx,
            intake: Intake::Open,
            receiving: false,
            summary: DispatchSummary::default(),
        }
    }

    /// Run until drained, cancelled, or the broker stops delivering.
    ///
    /// Always waits for dispatched workers before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<DispatchSummary, BrokerError> {
        if self.options.drain_on_empty && self.broker.message_count().await? == 0 {
            info!(queue = %self.options.queue, "Queue is empty, nothing to do");
            self.broker.close().await?;
            return Ok(self.summary);
        }

        self.broker.start_consuming().await?;
        self.receiving = true;
        info!(
            queue = %self.options.queue,
            concurrency = self.options.concurrency,
            drain = self.options.drain_on_empty,
            "Consuming"
        );

        let mut broker_error = None;
        while self.receiving || !self.in_flight.is_empty() {
            tokio::select! {
                biased;

                _ = shutdown.cancelled(), if self.intake != Intake::Releasing => {
                    self.begin_shutdown().await;
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.on_completion(completion).await;
                }
                Some((tag, job_id, result)) = self.fetching.next(), if !self.fetching.is_empty() => {
                    self.on_fetched(tag, job_id, result).await;
                }
                delivery = self.broker.next_delivery(), if self.receiving => match delivery {
                    Some(Ok(delivery)) => self.on_delivery(delivery).await,
                    Some(Err(e)) => {
                        error!("Broker error, no longer accepting deliveries: {}", e);
                        self.receiving = false;
                        broker_error = Some(e);
                    }
                    None if self.intake == Intake::Open => {
                        warn!("Consumer cancelled by broker");
                        self.receiving = false;
                    }
                    None => {
                        debug!("Delivery stream ended");
                        self.receiving = false;
                    }
                },
            }
        }

        if let Err(e) = self.broker.close().await {
            warn!("Failed to close broker connection: {}", e);
        }
        info!(
            delivered = self.summary.delivered,
            succeeded = self.summary.succeeded,
            failed = self.summary.failed,
            "Dispatcher stopped"
        );

        match broker_error {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }

    async fn acknowledge(&mut self, tag: u64) {
        match self.broker.ack(tag).await {
            Ok(()) => debug!(delivery_tag = tag, "Acknowledged"),
            Err(e) => error!(delivery_tag = tag, "Failed to acknowledge: {}", e),
        }
    }

    /// Cancel the consumer once the queue reports nothing ready.
    ///
    /// The count excludes deliveries already pushed to us, so those are
    /// picked up from the stream after the cancel.
    async fn check_drained(&mut self) {
        if !self.options.drain_on_empty || self.intake != Intake::Open || !self.receiving {
            return;
        }
        match self.broker.message_count().await {
            Ok(0) => {
                info!(
                    in_flight = self.in_flight.len(),
                    "Queue drained, waiting for in-flight jobs"
                );
                self.stop_accepting(Intake::Draining).await;
            }
            Ok(count) => debug!(remaining = count, "Queue not yet drained"),
            Err(e) => warn!("Could not read queue depth: {}", e),
        }
    }

    async fn stop_accepting(&mut self, intake: Intake) {
        let cancel = self.intake == Intake::Open;
        self.intake = intake;
        if cancel && self.receiving {
            if let Err(e) = self.broker.stop_consuming().await {
                warn!("Failed to stop consuming: {}", e);
                self.receiving = false;
            }
        }
    }

    /// Stop consuming and release deliveries no worker has started on.
    async fn begin_shutdown(&mut self) {
        info!(in_flight = self.in_flight.len(), "Shutdown requested, finishing in-flight jobs");
        self.stop_accepting(Intake::Releasing).await;

        self.fetching.clear();
        let pending: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, job)| job.state == JobState::Fetching)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in pending {
            if let Some(job) = self.in_flight.remove(&tag) {
                self.release(tag, &job.job_id).await;
            }
        }
    }

    async fn release(&mut self, tag: u64, job_id: &str) {
        match self.broker.requeue(tag).await {
            Ok(()) => info!(job_id = %job_id, delivery_tag = tag, "Released unstarted job"),
            Err(e) => warn!(job_id = %job_id, delivery_tag = tag, "Failed to release: {}", e),
        }
        self.summary.released += 1;
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        let tag = delivery.tag;
        self.summary.delivered += 1;

        if self.intake == Intake::Releasing {
            let body = String::from_utf8_lossy(&delivery.body).trim().to_string();
            self.release(tag, &body).await;
            return;
        }

        let job_id = match std::str::from_utf8(&delivery.body).map(str::trim) {
            Ok(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!(delivery_tag = tag, "Dropping message without a readable job id");
                self.summary.unresolved += 1;
                self.acknowledge(tag).await;
                self.check_drained().await;
                return;
            }
        };

        if self.in_flight.values().any(|job| job.job_id == job_id) {
            warn!(job_id = %job_id, delivery_tag = tag, "Job already in flight, rejecting duplicate");
            self.summary.duplicates += 1;
            self.acknowledge(tag).await;
            self.check_drained().await;
            return;
        }

        info!(job_id = %job_id, delivery_tag = tag, "Fetching job configuration");
        self.in_flight.insert(
            tag,
            InFlight {
                job_id: job_id.clone(),
                state: JobState::Fetching,
            },
        );

        let runner = Arc::clone(&self.runner);
        let retry = self.options.retry.clone();
        self.fetching.push(
            async move {
                let fetch = async {
                    let runner = &*runner;
                    let id = job_id.as_str();
                    retry.run("fetch", move || runner.fetch(id)).await
                };
                let result = AssertUnwindSafe(fetch)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(&*panic))));
                (tag, job_id, result)
            }
            .boxed(),
        );
    }

    async fn on_fetched(
        &mut self,
        tag: u64,
        job_id: String,
        result: Result<JobConfig, PipelineError>,
    ) {
        let config = match result {
            Ok(config) => config,
            Err(e) => {
                error!(job_id = %job_id, delivery_tag = tag, kind = e.kind(), "Cannot resolve job: {}", e);
                self.in_flight.remove(&tag);
                self.summary.unresolved += 1;
                self.acknowledge(tag).await;
                self.check_drained().await;
                return;
            }
        };

        if let Some(job) = self.in_flight.get_mut(&tag) {
            job.state = JobState::Dispatched;
        }
        let dispatched = self
            .in_flight
            .values()
            .filter(|job| job.state == JobState::Dispatched)
            .count();
        self.summary.peak_dispatched = self.summary.peak_dispatched.max(dispatched);
        info!(job_id = %job_id, delivery_tag = tag, dispatched, "Dispatching job");

        let runner = Arc::clone(&self.runner);
        let retry = self.options.retry.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let work = async {
                let runner = &*runner;
                retry.run("run", move || runner.run(config.clone())).await
            };
            let result = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(&*panic))));
            // The receiver lives as long as the dispatcher.
            let _ = tx.send(Completion {
                tag,
                job_id,
                result,
            });
        });
    }

    async fn on_completion(&mut self, completion: Completion) {
        let Completion {
            tag,
            job_id,
            result,
        } = completion;

        match &result {
            Ok(JobOutcome::Completed(artifacts)) => {
                self.summary.succeeded += 1;
                info!(
                    job_id = %job_id,
                    delivery_tag = tag,
                    archive = %artifacts.archive.display(),
                    "Job completed"
                );
            }
            Ok(JobOutcome::SolverUnavailable { run_dir }) => {
                self.summary.succeeded += 1;
                warn!(
                    job_id = %job_id,
                    delivery_tag = tag,
                    run_dir = %run_dir.display(),
                    "Job inputs prepared, solver unavailable"
                );
            }
            Err(e) => {
                self.summary.failed += 1;
                error!(job_id = %job_id, delivery_tag = tag, kind = e.kind(), "Job failed: {}", e);
            }
        }

        self.in_flight.remove(&tag);
        self.acknowledge(tag).await;
        self.check_drained().await;
    }
}
