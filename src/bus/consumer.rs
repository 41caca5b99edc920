//! Prefetching batched consumer.
//!
//! Deliveries accumulate until the batch reaches `prefetch_count` or
//! `max_loop_duration` elapses; the handler runs once per batch and the
//! last delivery tag is acknowledged cumulatively. A failing handler acks
//! nothing, so the whole batch is redelivered.

use std::time::{Duration, Instant};

use metrics::histogram;
use tracing::debug;

use super::{BusError, BusSource};

const SOURCE: &str = "bus::consumer";
const METRIC_BATCH_MS: &str = "stratum_bus_batch_ms";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub struct BatchConsumer {
    queue: String,
    prefetch_count: u16,
    max_loop_duration: Duration,
    disable_loop: bool,
    source: Box<dyn BusSource>,
    last_tag: Option<u64>,
}

impl BatchConsumer {
    pub(crate) fn new(queue: String, prefetch_count: u16, source: Box<dyn BusSource>) -> Self {
        Self {
            queue,
            prefetch_count,
            max_loop_duration: Duration::from_secs(1),
            disable_loop: false,
            source,
            last_tag: None,
        }
    }

    /// Return after the current batch instead of looping; used by
    /// one-shot digests and tests.
    pub fn disable_loop(&mut self) {
        self.disable_loop = true;
    }

    pub fn set_max_loop_duration(&mut self, duration: Duration) {
        self.max_loop_duration = duration;
    }

    /// Gather the next batch: up to `prefetch_count` messages, or fewer
    /// when `max_loop_duration` elapses with some in hand. `None` only
    /// when the loop is disabled and the queue stayed quiet.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Vec<u8>>>, BusError> {
        let max = usize::from(self.prefetch_count.max(1));
        let mut items: Vec<Vec<u8>> = Vec::new();
        loop {
            match self.source.next(self.max_loop_duration).await? {
                Some(delivery) => {
                    self.last_tag = Some(delivery.tag);
                    items.push(delivery.body);
                    if items.len() == max {
                        return Ok(Some(items));
                    }
                }
                None => {
                    if !items.is_empty() {
                        return Ok(Some(items));
                    }
                    if self.disable_loop {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Acknowledge everything up to the last delivery of the batch just
    /// returned, in one cumulative ack.
    pub async fn ack(&mut self) -> Result<(), BusError> {
        let Some(tag) = self.last_tag.take() else {
            return Ok(());
        };
        self.source.ack_batch(tag).await?;
        debug!(target: SOURCE, queue = %self.queue, up_to_tag = tag, "batch acknowledged");
        Ok(())
    }

    /// Consume batches until the handler fails or, with the loop
    /// disabled, the current batch completes. A failing handler
    /// acknowledges nothing.
    pub async fn consume<H, Fut>(&mut self, mut handler: H) -> Result<(), BusError>
    where
        H: FnMut(Vec<Vec<u8>>) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        while let Some(batch) = self.next_batch().await? {
            let size = batch.len();
            let started = Instant::now();
            handler(batch).await.map_err(BusError::Handler)?;
            self.ack().await?;
            histogram!(METRIC_BATCH_MS, "queue" => self.queue.clone())
                .record(started.elapsed().as_secs_f64() * 1000.0);
            debug!(target: SOURCE, queue = %self.queue, size, "batch handled");
            if self.disable_loop {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::{BusClient, MemoryBus, QueueSettings};
    use super::*;

    fn client(bus: &Arc<MemoryBus>, prefetch: u16) -> BusClient {
        BusClient::new(
            "default",
            Arc::new(bus.clone()),
            vec![QueueSettings::new("jobs").prefetch(prefetch)],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn batches_split_by_prefetch_and_ack_cumulatively() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(&bus, 3);
        for n in 0..5u8 {
            client.publish("jobs", &[n]).await.expect("publish");
        }

        let batches: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();
        let mut consumer = client.consumer("jobs", "test").await.expect("consumer");
        consumer.disable_loop();
        consumer.set_max_loop_duration(Duration::from_millis(50));
        consumer
            .consume(|items| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(items.len());
                    Ok(())
                }
            })
            .await
            .expect("first batch");

        let mut consumer = client.consumer("jobs", "test").await.expect("consumer");
        consumer.disable_loop();
        consumer.set_max_loop_duration(Duration::from_millis(50));
        let seen = batches.clone();
        consumer
            .consume(|items| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(items.len());
                    Ok(())
                }
            })
            .await
            .expect("second batch");

        assert_eq!(*batches.lock().unwrap(), vec![3, 2]);
        let acks = bus.acks();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|ack| ack.multiple));
    }

    #[tokio::test]
    async fn failing_handler_acks_nothing_and_redelivers() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(&bus, 2);
        client.publish("jobs", b"a").await.expect("publish");
        client.publish("jobs", b"b").await.expect("publish");

        let mut consumer = client.consumer("jobs", "test").await.expect("consumer");
        consumer.disable_loop();
        consumer.set_max_loop_duration(Duration::from_millis(20));
        let outcome = consumer
            .consume(|_items| async { Err::<(), HandlerError>("boom".into()) })
            .await;
        assert!(matches!(outcome, Err(BusError::Handler(_))));
        assert!(bus.acks().is_empty());
        drop(consumer);

        // Redelivered to the next consumer.
        let mut consumer = client.consumer("jobs", "test").await.expect("consumer");
        consumer.disable_loop();
        consumer.set_max_loop_duration(Duration::from_millis(20));
        let bodies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = bodies.clone();
        consumer
            .consume(|items| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().extend(items);
                    Ok(())
                }
            })
            .await
            .expect("redelivery");
        assert_eq!(*bodies.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn empty_queue_with_loop_disabled_returns() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(&bus, 3);
        let mut consumer = client.consumer("jobs", "test").await.expect("consumer");
        consumer.disable_loop();
        consumer.set_max_loop_duration(Duration::from_millis(10));
        consumer
            .consume(|_items| async { panic!("no batch expected") })
            .await
            .expect("returns on timeout");
    }
}
