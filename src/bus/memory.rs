//! In-memory bus backend.
//!
//! Queues live in a process-local map; unacknowledged deliveries return
//! to the head of the queue when their source is dropped, mirroring
//! broker redelivery. Acks are recorded so tests can assert settlement
//! behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BusBackend, BusDelivery, BusError, BusSource, QueueSettings, RouterSettings};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "bus::memory";

/// One recorded acknowledgement.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub queue: String,
    pub up_to_tag: u64,
    pub multiple: bool,
    pub settled: usize,
}

#[derive(Default)]
struct QueueState {
    next_tag: u64,
    pending: VecDeque<(u64, Vec<u8>)>,
    unacked: Vec<(u64, Vec<u8>)>,
}

#[derive(Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, QueueState>>,
    acks: Mutex<Vec<AckRecord>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All acknowledgements recorded so far.
    pub fn acks(&self) -> Vec<AckRecord> {
        mutex_lock!(&self.acks, SOURCE, "acks").clone()
    }

    /// Messages currently waiting in `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        mutex_lock!(&self.queues, SOURCE, "pending")
            .get(queue)
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }

    /// Bodies currently waiting in `queue`, oldest first.
    pub fn pending_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        mutex_lock!(&self.queues, SOURCE, "pending_bodies")
            .get(queue)
            .map(|state| state.pending.iter().map(|(_, body)| body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BusBackend for Arc<MemoryBus> {
    async fn publish(
        &self,
        queue: &QueueSettings,
        _router: Option<&RouterSettings>,
        _routing_key: &str,
        body: &[u8],
        _delay: Option<Duration>,
    ) -> Result<(), BusError> {
        let mut queues = mutex_lock!(&self.queues, SOURCE, "publish");
        let state = queues.entry(queue.name.clone()).or_default();
        state.next_tag += 1;
        let tag = state.next_tag;
        state.pending.push_back((tag, body.to_vec()));
        Ok(())
    }

    async fn open_source(
        &self,
        queue: &QueueSettings,
        _router: Option<&RouterSettings>,
        _consumer_name: &str,
    ) -> Result<Box<dyn BusSource>, BusError> {
        Ok(Box::new(MemorySource {
            bus: self.clone(),
            queue: queue.name.clone(),
        }))
    }
}

struct MemorySource {
    bus: Arc<MemoryBus>,
    queue: String,
}

#[async_trait]
impl BusSource for MemorySource {
    async fn next(&mut self, wait: Duration) -> Result<Option<BusDelivery>, BusError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut queues = mutex_lock!(&self.bus.queues, SOURCE, "next");
                if let Some(state) = queues.get_mut(&self.queue)
                    && let Some((tag, body)) = state.pending.pop_front()
                {
                    state.unacked.push((tag, body.clone()));
                    return Ok(Some(BusDelivery { tag, body }));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn ack_batch(&mut self, up_to_tag: u64) -> Result<(), BusError> {
        let mut queues = mutex_lock!(&self.bus.queues, SOURCE, "ack_batch");
        let settled = match queues.get_mut(&self.queue) {
            Some(state) => {
                let before = state.unacked.len();
                state.unacked.retain(|(tag, _)| *tag > up_to_tag);
                before - state.unacked.len()
            }
            None => 0,
        };
        drop(queues);
        mutex_lock!(&self.bus.acks, SOURCE, "ack_batch").push(AckRecord {
            queue: self.queue.clone(),
            up_to_tag,
            multiple: true,
            settled,
        });
        Ok(())
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        // Broker redelivery: whatever this consumer left unsettled goes
        // back to the head of the queue in tag order.
        let mut queues = mutex_lock!(&self.bus.queues, SOURCE, "drop");
        if let Some(state) = queues.get_mut(&self.queue) {
            let mut unacked = std::mem::take(&mut state.unacked);
            unacked.sort_by_key(|(tag, _)| *tag);
            for entry in unacked.into_iter().rev() {
                state.pending.push_front(entry);
            }
        }
    }
}
