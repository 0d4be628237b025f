use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::dedup::DuplicateFilter;
use crate::error::WriteError;
use crate::metrics_consts::{BATCH_FLUSHES, BATCH_SIZE, BATCH_WRITE_FAILURES, RECORDS_REQUEUED};
use crate::storage::StorageWriter;
use crate::transport::{MeasuringReceiver, MeasuringSender};
use crate::types::{Fingerprint, ReportRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Time,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Time => "time",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct Flush {
    pub trigger: FlushTrigger,
    pub records: Vec<ReportRecord>,
}

/// Buffers admitted records until `batch_size` of them are waiting or
/// `interval` has passed since the last flush, whichever comes first.
pub struct BatchAccumulator {
    buffer: Vec<ReportRecord>,
    batch_size: usize,
    interval: Duration,
    last_flush: Instant,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            interval,
            last_flush: Instant::now(),
        }
    }

    /// Adds a record, returning a flush if the buffer reached the size threshold.
    pub fn offer(&mut self, record: ReportRecord) -> Option<Flush> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            return Some(self.take(FlushTrigger::Size));
        }
        None
    }

    /// Returns a flush if the time threshold passed with records waiting.
    /// An empty buffer just restarts the timer.
    pub fn poll(&mut self) -> Option<Flush> {
        if self.last_flush.elapsed() < self.interval {
            return None;
        }
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return None;
        }
        Some(self.take(FlushTrigger::Time))
    }

    /// Hands over whatever is buffered, regardless of thresholds.
    pub fn drain(&mut self) -> Option<Flush> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.take(FlushTrigger::Shutdown))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn take(&mut self, trigger: FlushTrigger) -> Flush {
        self.last_flush = Instant::now();
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        Flush { trigger, records }
    }
}

/// Owns the accumulator and serializes batch writes.
pub struct BatchFlusher {
    writer: Arc<StorageWriter>,
    filter: Arc<DuplicateFilter>,
    retry: MeasuringSender<Value>,
    retry_delay: Duration,
}

impl BatchFlusher {
    pub fn new(
        writer: Arc<StorageWriter>,
        filter: Arc<DuplicateFilter>,
        retry: MeasuringSender<Value>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            writer,
            filter,
            retry,
            retry_delay,
        }
    }

    /// Runs until every worker has dropped its sender, then writes what is left.
    pub async fn run(
        self,
        mut accumulator: BatchAccumulator,
        mut admitted: MeasuringReceiver<ReportRecord>,
        poll_interval: Duration,
        liveness: HealthHandle,
    ) {
        info!("batch accumulator started");
        loop {
            liveness.report_healthy();

            let flush = tokio::select! {
                record = admitted.recv() => match record {
                    Some(record) => accumulator.offer(record),
                    None => break,
                },
                _ = tokio::time::sleep(poll_interval) => accumulator.poll(),
            };
            // A time flush can also be due while records keep arriving
            let flush = flush.or_else(|| accumulator.poll());

            if let Some(flush) = flush {
                self.flush(flush).await;
            }
        }

        if let Some(flush) = accumulator.drain() {
            self.flush(flush).await;
        }
        liveness.report_status(ComponentStatus::Unhealthy);
        info!("batch accumulator stopped");
    }

    pub async fn flush(&self, flush: Flush) {
        let size = flush.records.len();
        metrics::counter!(BATCH_FLUSHES, "trigger" => flush.trigger.as_str()).increment(1);
        metrics::histogram!(BATCH_SIZE).record(size as f64);
        info!("flushing {} records ({})", size, flush.trigger.as_str());

        let fingerprints: Vec<Fingerprint> =
            flush.records.iter().map(ReportRecord::fingerprint).collect();

        match self.writer.write(flush.records).await {
            Ok(_) => self.filter.remember(fingerprints).await,
            Err(e) => {
                // The re-queued copies come back through the filter
                self.filter.forget(fingerprints).await;
                self.requeue(e).await
            }
        }
    }

    async fn requeue(&self, failure: WriteError) {
        error!("batch write failed, re-queueing: {}", failure);
        metrics::counter!(BATCH_WRITE_FAILURES, "phase" => failure.phase.as_str()).increment(1);

        tokio::time::sleep(self.retry_delay).await;
        for record in failure.batch {
            let message = match serde_json::to_value(record.to_wire()) {
                Ok(message) => message,
                Err(e) => {
                    error!("failed to encode record for retry: {}", e);
                    continue;
                }
            };
            if self.retry.send(message).await.is_err() {
                warn!("retry queue closed, dropping the rest of the batch");
                return;
            }
            metrics::counter!(RECORDS_REQUEUED).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_record, MemoryStore};
    use crate::transport::measuring_channel;

    fn records(n: i64) -> Vec<ReportRecord> {
        (0..n).map(|i| sample_record(i + 1, i + 1000)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_once() {
        let mut accumulator = BatchAccumulator::new(5, Duration::from_secs(60));

        let mut flushes = Vec::new();
        for record in records(5) {
            flushes.extend(accumulator.offer(record));
        }

        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].trigger, FlushTrigger::Size);
        assert_eq!(flushes[0].records, records(5));
        assert!(accumulator.is_empty());
        assert!(accumulator.poll().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_interval() {
        let mut accumulator = BatchAccumulator::new(5, Duration::from_secs(60));
        for record in records(4) {
            assert!(accumulator.offer(record).is_none());
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(accumulator.poll().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let flush = accumulator.poll().expect("interval elapsed");
        assert_eq!(flush.trigger, FlushTrigger::Time);
        assert_eq!(flush.records.len(), 4);

        // The timer restarted with the flush
        assert!(accumulator.poll().is_none());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(accumulator.poll().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_resets_the_timer() {
        let mut accumulator = BatchAccumulator::new(2, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(50)).await;

        let mut batch = records(3).into_iter();
        assert!(accumulator.offer(batch.next().unwrap()).is_none());
        assert!(accumulator.offer(batch.next().unwrap()).is_some());
        assert!(accumulator.offer(batch.next().unwrap()).is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(accumulator.poll().is_none());
        assert_eq!(accumulator.len(), 1);
    }

    #[tokio::test]
    async fn drain_hands_over_leftovers() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_secs(60));
        assert!(accumulator.drain().is_none());

        accumulator.offer(sample_record(1, 2));
        let flush = accumulator.drain().unwrap();
        assert_eq!(flush.trigger, FlushTrigger::Shutdown);
        assert_eq!(flush.records.len(), 1);
    }

    fn flusher(store: Arc<MemoryStore>) -> (BatchFlusher, Arc<DuplicateFilter>, MeasuringReceiver<Value>) {
        let writer = Arc::new(StorageWriter::new(store.clone(), 1));
        let filter = Arc::new(DuplicateFilter::new(store, 100));
        let (retry_tx, retry_rx) = measuring_channel(100);
        let flusher = BatchFlusher::new(writer, filter.clone(), retry_tx, Duration::ZERO);
        (flusher, filter, retry_rx)
    }

    #[tokio::test]
    async fn committed_batches_are_remembered() {
        let store = Arc::new(MemoryStore::default());
        let (flusher, filter, _retry) = flusher(store.clone());

        let record = sample_record(1, 2);
        flusher
            .flush(Flush {
                trigger: FlushTrigger::Size,
                records: vec![record.clone()],
            })
            .await;

        assert_eq!(store.staging_rows(), 1);
        // Served from the cache, the store is not consulted
        store.fail_lookups(1);
        assert!(filter.is_duplicate(&record).await.unwrap());
    }

    #[tokio::test]
    async fn failed_batches_are_requeued_as_v2() {
        let store = Arc::new(MemoryStore::default());
        store.fail_stage(1);
        let (flusher, filter, mut retry) = flusher(store.clone());

        let batch = vec![sample_record(1, 2), sample_record(3, 4)];
        flusher
            .flush(Flush {
                trigger: FlushTrigger::Time,
                records: batch.clone(),
            })
            .await;

        for record in &batch {
            let message = retry.recv().await.unwrap();
            assert_eq!(message["metadata"]["version"], "v2.0.0");
            assert_eq!(message["reporter_id"], record.reporter_id);
            assert_eq!(message["reported_id"], record.reported_id);
        }

        // Nothing was committed, so nothing is remembered
        assert!(!filter.is_duplicate(&batch[0]).await.unwrap());
    }

    #[tokio::test]
    async fn run_flushes_leftovers_when_workers_stop() {
        let store = Arc::new(MemoryStore::default());
        let (flusher, _filter, _retry) = flusher(store.clone());
        let (tx, rx) = measuring_channel(10);
        let liveness =
            health::HealthRegistry::new("liveness").register("batch", time::Duration::seconds(30));

        let task = tokio::spawn(flusher.run(
            BatchAccumulator::new(100, Duration::from_secs(60)),
            rx,
            Duration::from_millis(10),
            liveness,
        ));

        for record in records(3) {
            tx.send(record).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(store.staging_rows(), 3);
        assert_eq!(store.report_rows(), 3);
    }
}
