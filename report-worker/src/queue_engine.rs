use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{BatchConsumer, RecvErr};
use common_kafka::kafka_producer::{send_iter_to_kafka, KafkaContext};
use health::{ComponentStatus, HealthHandle};
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::QueueError;
use crate::metrics_consts::{
    EGRESS_DROPPED, EGRESS_PUBLISHED, EGRESS_PUBLISH_FAILURES, EMPTY_MESSAGES, KAFKA_RECV_ERRORS,
    MALFORMED_MESSAGES, MESSAGES_RECEIVED, OFFSET_COMMIT_FAILURES, QUEUE_DEPTH, THROUGHPUT,
};
use crate::transport::{MeasuringReceiver, MeasuringSender, QueueDepth};

const MAX_PUBLISH_ATTEMPTS: u32 = 5;

/// Where inbound messages come from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `max` messages, waiting at most `timeout` for them.
    async fn recv_batch(&self, max: usize, timeout: Duration) -> Vec<Result<Value, RecvErr>>;

    /// Acknowledge everything returned by `recv_batch` so far.
    fn commit(&self) -> Result<(), QueueError>;
}

/// Where failed messages are sent for another attempt.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Publishes the messages, returning one result per message in order.
    async fn publish(&self, messages: &[Value]) -> Vec<Result<(), QueueError>>;

    /// Waits for everything published so far to be acknowledged.
    async fn flush(&self) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: MessageSource + ?Sized> MessageSource for Arc<T> {
    async fn recv_batch(&self, max: usize, timeout: Duration) -> Vec<Result<Value, RecvErr>> {
        (**self).recv_batch(max, timeout).await
    }

    fn commit(&self) -> Result<(), QueueError> {
        (**self).commit()
    }
}

#[async_trait]
impl<T: MessageSink + ?Sized> MessageSink for Arc<T> {
    async fn publish(&self, messages: &[Value]) -> Vec<Result<(), QueueError>> {
        (**self).publish(messages).await
    }

    async fn flush(&self) -> Result<(), QueueError> {
        (**self).flush().await
    }
}

#[async_trait]
impl MessageSource for BatchConsumer {
    async fn recv_batch(&self, max: usize, timeout: Duration) -> Vec<Result<Value, RecvErr>> {
        self.json_recv_batch(max, timeout).await
    }

    fn commit(&self) -> Result<(), QueueError> {
        Ok(BatchConsumer::commit(self)?)
    }
}

pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn publish(&self, messages: &[Value]) -> Vec<Result<(), QueueError>> {
        send_iter_to_kafka(&self.producer, &self.topic, messages)
            .await
            .into_iter()
            .map(|result| result.map_err(QueueError::from))
            .collect()
    }

    async fn flush(&self) -> Result<(), QueueError> {
        Ok(self.producer.flush(Timeout::After(Duration::from_secs(30)))?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngressSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EgressSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
}

/// Counts messages moved by the engine, for the throughput reporter.
#[derive(Debug, Default)]
pub struct Throughput {
    received: AtomicU64,
    published: AtomicU64,
}

impl Throughput {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Moves messages between the bus and the transport queues.
///
/// Every loop checks the shutdown token between iterations and finishes the
/// message it is working on before exiting.
pub struct QueueEngine {
    shutdown: CancellationToken,
    throughput: Arc<Throughput>,
    handles: Vec<JoinHandle<()>>,
}

impl QueueEngine {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            throughput: Arc::default(),
            handles: Vec::new(),
        }
    }

    pub fn throughput(&self) -> Arc<Throughput> {
        self.throughput.clone()
    }

    pub fn start_consumer<S>(
        &mut self,
        source: S,
        ingress: MeasuringSender<Value>,
        settings: IngressSettings,
        liveness: HealthHandle,
    ) where
        S: MessageSource + 'static,
    {
        let shutdown = self.shutdown.clone();
        let throughput = self.throughput.clone();
        self.handles.push(tokio::spawn(async move {
            run_ingress(source, ingress, settings, liveness, throughput, shutdown).await
        }));
    }

    pub fn start_producer<K>(
        &mut self,
        sink: K,
        egress: MeasuringReceiver<Value>,
        settings: EgressSettings,
        liveness: HealthHandle,
    ) where
        K: MessageSink + 'static,
    {
        let throughput = self.throughput.clone();
        self.handles.push(tokio::spawn(async move {
            run_egress(sink, egress, settings, liveness, throughput).await
        }));
    }

    pub fn start_throughput_reporter(
        &mut self,
        queues: Vec<(&'static str, QueueDepth)>,
        interval: Duration,
    ) {
        let shutdown = self.shutdown.clone();
        let throughput = self.throughput.clone();
        self.handles.push(tokio::spawn(async move {
            report_throughput(queues, throughput, interval, shutdown).await
        }));
    }

    /// Asks every loop to stop. Does not wait for them, see [`QueueEngine::join`].
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("queue engine task failed: {:?}", e);
            }
        }
    }
}

async fn run_ingress<S: MessageSource>(
    source: S,
    ingress: MeasuringSender<Value>,
    settings: IngressSettings,
    liveness: HealthHandle,
    throughput: Arc<Throughput>,
    shutdown: CancellationToken,
) {
    info!("ingress started");
    'poll: while !shutdown.is_cancelled() {
        liveness.report_healthy();

        let batch = source
            .recv_batch(settings.batch_size, settings.batch_timeout)
            .await;
        if batch.is_empty() {
            continue;
        }
        let broker_down = batch
            .iter()
            .all(|message| matches!(message, Err(RecvErr::Kafka(_))));

        for message in batch {
            let payload = match message {
                Ok(payload) => payload,
                Err(RecvErr::Empty) => {
                    warn!("received empty message");
                    metrics::counter!(EMPTY_MESSAGES).increment(1);
                    continue;
                }
                Err(RecvErr::Serde(e)) => {
                    warn!("received message that is not JSON: {}", e);
                    metrics::counter!(MALFORMED_MESSAGES).increment(1);
                    continue;
                }
                Err(RecvErr::Kafka(e)) => {
                    error!("failed to receive from kafka: {}", e);
                    metrics::counter!(KAFKA_RECV_ERRORS).increment(1);
                    continue;
                }
            };

            metrics::counter!(MESSAGES_RECEIVED).increment(1);
            throughput.received.fetch_add(1, Ordering::Relaxed);

            // Waits while the pipeline is behind
            if ingress.send(payload).await.is_err() {
                warn!("ingress queue closed, stopping ingress");
                break 'poll;
            }
        }

        // Everything polled so far is in the ingress queue
        if let Err(e) = source.commit() {
            warn!("failed to commit offsets: {}", e);
            metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
        }

        // The consumer fails fast while the broker is unreachable
        if broker_down {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(settings.batch_timeout) => {}
            }
        }
    }

    liveness.report_status(ComponentStatus::Unhealthy);
    info!("ingress stopped");
}

async fn run_egress<K: MessageSink>(
    sink: K,
    mut egress: MeasuringReceiver<Value>,
    settings: EgressSettings,
    liveness: HealthHandle,
    throughput: Arc<Throughput>,
) {
    info!("egress started");
    let mut batch = Vec::with_capacity(settings.batch_size);
    loop {
        liveness.report_healthy();

        let received = tokio::select! {
            received = egress.recv_many(&mut batch, settings.batch_size) => received,
            _ = tokio::time::sleep(settings.poll_interval) => continue,
        };
        // Every sender is gone and the queue is drained
        if received == 0 {
            break;
        }

        publish_with_retries(&sink, &mut batch, &settings, &liveness, &throughput).await;
    }

    if let Err(e) = sink.flush().await {
        error!("failed to flush egress: {}", e);
    }
    liveness.report_status(ComponentStatus::Unhealthy);
    info!("egress stopped");
}

/// Publishes the batch, then the subset that failed, until everything went
/// out or the attempts ran out. Leaves `batch` empty.
async fn publish_with_retries<K: MessageSink>(
    sink: &K,
    batch: &mut Vec<Value>,
    settings: &EgressSettings,
    liveness: &HealthHandle,
    throughput: &Throughput,
) {
    let mut attempt = 1;
    while !batch.is_empty() {
        let results = sink.publish(batch).await;

        let mut failed = Vec::new();
        let mut last_error = None;
        for (message, result) in batch.drain(..).zip(results) {
            match result {
                Ok(()) => {
                    metrics::counter!(EGRESS_PUBLISHED).increment(1);
                    throughput.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    metrics::counter!(EGRESS_PUBLISH_FAILURES).increment(1);
                    failed.push(message);
                    last_error = Some(e);
                }
            }
        }
        if failed.is_empty() {
            return;
        }

        if attempt >= MAX_PUBLISH_ATTEMPTS {
            error!(
                "dropping {} messages after {} publish attempts, last error: {:?}",
                failed.len(),
                attempt,
                last_error
            );
            metrics::counter!(EGRESS_DROPPED).increment(failed.len() as u64);
            return;
        }

        warn!(
            "failed to publish {} messages, retrying in {:?}: {:?}",
            failed.len(),
            settings.retry_delay,
            last_error
        );
        liveness.report_healthy();
        tokio::time::sleep(settings.retry_delay).await;
        *batch = failed;
        attempt += 1;
    }
}

async fn report_throughput(
    queues: Vec<(&'static str, QueueDepth)>,
    throughput: Arc<Throughput>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    let mut last_received = throughput.received();
    let mut last_published = throughput.published();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let seconds = interval.as_secs_f64().max(f64::EPSILON);
        let (received, published) = (throughput.received(), throughput.published());
        let received_rate = (received - last_received) as f64 / seconds;
        let published_rate = (published - last_published) as f64 / seconds;
        (last_received, last_published) = (received, published);

        metrics::gauge!(THROUGHPUT, "direction" => "ingress").set(received_rate);
        metrics::gauge!(THROUGHPUT, "direction" => "egress").set(published_rate);
        let depths: Vec<String> = queues
            .iter()
            .map(|(name, depth)| {
                metrics::gauge!(QUEUE_DEPTH, "queue" => *name).set(depth.get() as f64);
                format!("{}={}", name, depth.get())
            })
            .collect();

        info!(
            "throughput: {:.1} received/s, {:.1} republished/s, queue depths: {}",
            received_rate,
            published_rate,
            depths.join(" ")
        );
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use serde_json::json;

    use super::*;
    use crate::test_utils::{RecordingSink, VecSource};
    use crate::transport::measuring_channel;

    fn liveness() -> HealthHandle {
        health::HealthRegistry::new("liveness").register("test", time::Duration::seconds(30))
    }

    fn ingress_settings() -> IngressSettings {
        IngressSettings {
            batch_size: 2,
            batch_timeout: Duration::from_millis(10),
        }
    }

    fn egress_settings() -> EgressSettings {
        EgressSettings {
            batch_size: 2,
            poll_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn ingress_moves_messages_and_commits() {
        let source = Arc::new(VecSource::new(vec![
            Ok(json!({"n": 1})),
            Ok(json!({"n": 2})),
            Err(RecvErr::Empty),
            Ok(json!({"n": 3})),
        ]));
        let (tx, mut rx) = measuring_channel(10);
        let shutdown = CancellationToken::new();

        let mut engine = QueueEngine::new(shutdown.clone());
        let throughput = engine.throughput();
        engine.start_consumer(source.clone(), tx, ingress_settings(), liveness());

        for n in 1..=3 {
            assert_eq!(rx.recv().await, Some(json!({ "n": n })));
        }

        engine.stop();
        engine.join().await;

        assert_eq!(throughput.received(), 3);
        assert!(source.commits() >= 2);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn ingress_blocks_on_a_full_queue() {
        let source = Arc::new(VecSource::new(
            (0..5).map(|n| Ok(json!({ "n": n }))).collect(),
        ));
        let (tx, mut rx) = measuring_channel(1);
        let depth = rx.depth();
        let shutdown = CancellationToken::new();

        let mut engine = QueueEngine::new(shutdown.clone());
        engine.start_consumer(source.clone(), tx, ingress_settings(), liveness());

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Nothing was dropped, the rest is still upstream or waiting on the queue
        assert!(depth.get() >= 1);
        assert!(source.remaining() >= 2);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap()["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        engine.stop();
        engine.join().await;
    }

    struct UnreachableBroker {
        polls: AtomicU64,
    }

    #[async_trait]
    impl MessageSource for UnreachableBroker {
        async fn recv_batch(&self, _max: usize, _timeout: Duration) -> Vec<Result<Value, RecvErr>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            vec![Err(RecvErr::Kafka(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure,
            )))]
        }

        fn commit(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ingress_backs_off_while_the_broker_fails() {
        let source = Arc::new(UnreachableBroker {
            polls: AtomicU64::new(0),
        });
        let (tx, _rx) = measuring_channel(10);
        let shutdown = CancellationToken::new();

        let mut engine = QueueEngine::new(shutdown.clone());
        engine.start_consumer(
            source.clone(),
            tx,
            IngressSettings {
                batch_size: 2,
                batch_timeout: Duration::from_millis(50),
            },
            liveness(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.stop();
        engine.join().await;

        let polls = source.polls.load(Ordering::SeqCst);
        assert!((1..=10).contains(&polls), "polled {polls} times");
    }

    #[tokio::test]
    async fn egress_publishes_and_exits_when_drained() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = measuring_channel(10);

        let mut engine = QueueEngine::new(CancellationToken::new());
        engine.start_producer(sink.clone(), rx, egress_settings(), liveness());

        for n in 0..5 {
            tx.send(json!({ "n": n })).await.unwrap();
        }
        drop(tx);
        engine.join().await;

        assert_eq!(sink.published().len(), 5);
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test]
    async fn egress_retries_failed_publishes() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_publishes(2);
        let (tx, rx) = measuring_channel(10);

        let mut engine = QueueEngine::new(CancellationToken::new());
        let throughput = engine.throughput();
        engine.start_producer(sink.clone(), rx, egress_settings(), liveness());

        tx.send(json!({"n": 1})).await.unwrap();
        tx.send(json!({"n": 2})).await.unwrap();
        drop(tx);
        engine.join().await;

        let mut published = sink.published();
        published.sort_by_key(|m| m["n"].as_i64());
        assert_eq!(published, vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(throughput.published(), 2);
    }

    #[tokio::test]
    async fn egress_gives_up_after_max_attempts() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_publishes(usize::MAX);
        let (tx, rx) = measuring_channel(10);

        let mut engine = QueueEngine::new(CancellationToken::new());
        engine.start_producer(sink.clone(), rx, egress_settings(), liveness());

        tx.send(json!({"n": 1})).await.unwrap();
        drop(tx);
        engine.join().await;

        assert!(sink.published().is_empty());
        assert_eq!(sink.publish_attempts(), MAX_PUBLISH_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let mut engine = QueueEngine::new(shutdown.clone());
        engine.start_throughput_reporter(
            vec![("ingress", QueueDepth::default())],
            Duration::from_secs(60),
        );

        tokio::time::advance(Duration::from_secs(125)).await;
        engine.stop();
        engine.join().await;
    }
}
