//! In-process queue with the same settle semantics as the Redis one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use xrayconnect_shared::{Lane, Task};

use crate::error::{QueueError, Result};
use crate::{Delivery, TaskConsumer, TaskPublisher};

#[derive(Default)]
struct Lanes {
    pending: HashMap<Lane, VecDeque<String>>,
    in_flight: HashMap<Lane, Vec<String>>,
    published: Vec<Task>,
    acked: Vec<String>,
    dropped: Vec<String>,
    requeued: usize,
    fail_publish: bool,
}

#[derive(Clone, Default)]
pub struct MemoryTaskQueue {
    lanes: Arc<Mutex<Lanes>>,
    notify: Arc<Notify>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> Result<MutexGuard<'_, Lanes>> {
        self.lanes.lock().map_err(|_| QueueError::Closed)
    }

    /// Makes every publish fail until switched off.
    pub fn fail_publishes(&self, fail: bool) {
        if let Ok(mut lanes) = self.lanes() {
            lanes.fail_publish = fail;
        }
    }

    /// Enqueues a raw payload, bypassing encoding.
    pub fn push_raw(&self, lane: Lane, payload: &str) {
        if let Ok(mut lanes) = self.lanes() {
            lanes.pending.entry(lane).or_default().push_back(payload.to_string());
        }
        self.notify.notify_waiters();
    }

    /// Every task successfully published, in order.
    pub fn published(&self) -> Vec<Task> {
        self.lanes().map(|l| l.published.clone()).unwrap_or_default()
    }

    pub fn pending_len(&self, lane: Lane) -> usize {
        self.lanes()
            .map(|l| l.pending.get(&lane).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn in_flight_len(&self, lane: Lane) -> usize {
        self.lanes()
            .map(|l| l.in_flight.get(&lane).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn acked(&self) -> Vec<String> {
        self.lanes().map(|l| l.acked.clone()).unwrap_or_default()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.lanes().map(|l| l.dropped.clone()).unwrap_or_default()
    }

    pub fn requeued(&self) -> usize {
        self.lanes().map(|l| l.requeued).unwrap_or(0)
    }

    fn take_in_flight(lanes: &mut Lanes, delivery: &Delivery) {
        if let Some(list) = lanes.in_flight.get_mut(&delivery.lane) {
            if let Some(pos) = list.iter().position(|p| *p == delivery.payload) {
                list.remove(pos);
            }
        }
    }
}

#[async_trait]
impl TaskPublisher for MemoryTaskQueue {
    async fn publish_task(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        {
            let mut lanes = self.lanes()?;
            if lanes.fail_publish {
                return Err(QueueError::Closed);
            }
            lanes.pending.entry(task.lane()).or_default().push_back(payload);
            lanes.published.push(task.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TaskConsumer for MemoryTaskQueue {
    async fn next_delivery(&self, lane: Lane, wait: Duration) -> Result<Option<Delivery>> {
        let notified = self.notify.notified();
        {
            let mut lanes = self.lanes()?;
            if let Some(payload) = lanes.pending.get_mut(&lane).and_then(VecDeque::pop_front) {
                lanes.in_flight.entry(lane).or_default().push(payload.clone());
                return Ok(Some(Delivery { lane, payload }));
            }
        }
        let _ = tokio::time::timeout(wait, notified).await;
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut lanes = self.lanes()?;
        Self::take_in_flight(&mut lanes, delivery);
        lanes.acked.push(delivery.payload.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        {
            let mut lanes = self.lanes()?;
            Self::take_in_flight(&mut lanes, delivery);
            if requeue {
                lanes.requeued += 1;
                lanes
                    .pending
                    .entry(delivery.lane)
                    .or_default()
                    .push_front(delivery.payload.clone());
            } else {
                lanes.dropped.push(delivery.payload.clone());
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
