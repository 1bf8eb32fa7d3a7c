//! In-process broker with prefetch credit and acknowledgment bookkeeping.
//!
//! [`MemoryQueue`] is the shared queue; [`MemoryQueue::connect`] hands out a
//! [`MemoryBroker`] connection that behaves like an AMQP channel with manual
//! acknowledgment. Like a real broker it pushes: whenever prefetch credit
//! frees up, ready messages move into the connection's local buffer and stop
//! counting as ready.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::broker::{Broker, BrokerError, Delivery};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
    acked: Vec<Vec<u8>>,
    requeued: usize,
    peak_unacked: usize,
}

/// A durable queue living in memory.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        self.lock().ready.push_back(body.into());
        self.notify.notify_one();
    }

    /// Open a connection with `prefetch` unacknowledged deliveries at most.
    /// A prefetch of zero means unlimited.
    pub fn connect(&self, prefetch: u16) -> MemoryBroker {
        MemoryBroker {
            queue: self.clone(),
            prefetch: usize::from(prefetch),
            consuming: false,
            closed: false,
            held: HashSet::new(),
            pushed: VecDeque::new(),
        }
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Bodies acknowledged so far, in acknowledgment order.
    pub fn acked(&self) -> Vec<String> {
        self.lock()
            .acked
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub fn requeued(&self) -> usize {
        self.lock().requeued
    }

    pub fn peak_unacked(&self) -> usize {
        self.lock().peak_unacked
    }
}

/// One connection to a [`MemoryQueue`].
pub struct MemoryBroker {
    queue: MemoryQueue,
    prefetch: usize,
    consuming: bool,
    closed: bool,
    held: HashSet<u64>,
    /// Pushed to this connection but not yet handed out.
    pushed: VecDeque<Delivery>,
}

impl MemoryBroker {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn try_take(&mut self) -> Option<Delivery> {
        if self.prefetch > 0 && self.held.len() >= self.prefetch {
            return None;
        }
        let mut state = self.queue.lock();
        let body = state.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, body.clone());
        state.peak_unacked = state.peak_unacked.max(state.unacked.len());
        self.held.insert(tag);
        Some(Delivery { tag, body })
    }

    /// Move ready messages into the local buffer while credit allows.
    fn push_available(&mut self) {
        if !self.consuming || self.closed {
            return;
        }
        while let Some(delivery) = self.try_take() {
            self.pushed.push_back(delivery);
        }
    }

    fn settle(&mut self, tag: u64) -> Result<Vec<u8>, BrokerError> {
        self.ensure_open()?;
        if !self.held.remove(&tag) {
            return Err(BrokerError::UnknownDeliveryTag(tag));
        }
        self.queue
            .lock()
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn start_consuming(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.consuming = true;
        self.push_available();
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(delivery) = self.pushed.pop_front() {
                return Some(Ok(delivery));
            }
            if !self.consuming {
                return None;
            }
            self.push_available();
            if self.pushed.is_empty() {
                self.queue.notify.notified().await;
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        let body = self.settle(tag)?;
        self.queue.lock().acked.push(body);
        self.push_available();
        Ok(())
    }

    async fn requeue(&mut self, tag: u64) -> Result<(), BrokerError> {
        let body = self.settle(tag)?;
        {
            let mut state = self.queue.lock();
            state.ready.push_front(body);
            state.requeued += 1;
        }
        self.push_available();
        self.queue.notify.notify_one();
        Ok(())
    }

    async fn message_count(&mut self) -> Result<u32, BrokerError> {
        self.ensure_open()?;
        Ok(self.queue.lock().ready.len() as u32)
    }

    async fn stop_consuming(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.consuming = false;
        Ok(())
    }

    /// Unacknowledged deliveries go back to the queue, as on channel close.
    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.consuming = false;
        self.pushed.clear();
        let mut state = self.queue.lock();
        let mut tags: Vec<u64> = self.held.drain().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(body) = state.unacked.remove(&tag) {
                state.ready.push_front(body);
            }
        }
        drop(state);
        self.queue.notify.notify_one();
        Ok(())
    }
}
