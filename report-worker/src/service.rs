use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app_context::AppContext;
use crate::batch::{BatchAccumulator, BatchFlusher};
use crate::config::Config;
use crate::pipeline::{run_worker, WorkerContext};
use crate::queue_engine::{EgressSettings, IngressSettings, MessageSink, MessageSource, QueueEngine};
use crate::transport::measuring_channel;
use crate::types::ReportRecord;

// Longest a loop may go without reporting in, on top of any store writes it waits on
const LIVENESS_DEADLINE: time::Duration = time::Duration::seconds(60);
// Deadlines are added to the current time, so they have to stay representable
const MAX_LIVENESS_DEADLINE: time::Duration = time::Duration::days(1);

/// The accumulator reports in between flushes only, so its deadline has to
/// cover a batch write where every attempt of both phases waits out the pool.
pub fn accumulator_deadline(config: &Config) -> time::Duration {
    let attempts = config.store_max_attempts.max(1).saturating_mul(2);
    config
        .pg_acquire_timeout
        .0
        .checked_mul(attempts)
        .and_then(|write| write.checked_add(config.retry_delay.0))
        .and_then(|write| time::Duration::try_from(write).ok())
        .map_or(MAX_LIVENESS_DEADLINE, |write| {
            LIVENESS_DEADLINE
                .saturating_add(write)
                .min(MAX_LIVENESS_DEADLINE)
        })
}

/// The running pipeline: ingress, workers, the batch accumulator and egress.
///
/// Cancelling the shutdown token stops ingress. Everything downstream then
/// drains in order as its upstream senders are dropped: the workers empty the
/// ingress queue, the accumulator writes its last batch, and egress publishes
/// whatever was re-queued before flushing the producer.
pub struct ReportService {
    engine: QueueEngine,
    workers: Vec<JoinHandle<()>>,
    accumulator: JoinHandle<()>,
}

impl ReportService {
    pub fn start<S, K>(
        config: &Config,
        context: &AppContext,
        source: S,
        sink: K,
        shutdown: CancellationToken,
    ) -> Self
    where
        S: MessageSource + 'static,
        K: MessageSink + 'static,
    {
        let (ingress_tx, ingress_rx) = measuring_channel::<Value>(config.ingress_queue_capacity);
        let (admitted_tx, admitted_rx) =
            measuring_channel::<ReportRecord>(config.admitted_queue_capacity);
        let (retry_tx, retry_rx) = measuring_channel::<Value>(config.egress_queue_capacity);

        let mut engine = QueueEngine::new(shutdown);
        engine.start_throughput_reporter(
            vec![
                ("ingress", ingress_tx.depth()),
                ("admitted", admitted_tx.depth()),
                ("egress", retry_tx.depth()),
            ],
            config.throughput_report_interval.0,
        );
        engine.start_consumer(
            source,
            ingress_tx,
            IngressSettings {
                batch_size: config.consumer_batch_size,
                batch_timeout: config.consumer_batch_timeout.0,
            },
            context.liveness.register("ingress", LIVENESS_DEADLINE),
        );
        engine.start_producer(
            sink,
            retry_rx,
            EgressSettings {
                batch_size: config.producer_batch_size,
                poll_interval: config.poll_interval.0,
                retry_delay: config.retry_delay.0,
            },
            context.liveness.register("egress", LIVENESS_DEADLINE),
        );

        let ingress = Arc::new(Mutex::new(ingress_rx));
        let workers = (0..config.worker_count.max(1))
            .map(|id| {
                let worker_context = WorkerContext {
                    ingress: ingress.clone(),
                    admitted: admitted_tx.clone(),
                    retry: retry_tx.clone(),
                    poll_interval: config.poll_interval.0,
                    retry_delay: config.retry_delay.0,
                };
                let liveness = context
                    .liveness
                    .register(format!("worker-{id}"), LIVENESS_DEADLINE);
                tokio::spawn(run_worker(
                    id,
                    context.pipeline.clone(),
                    worker_context,
                    liveness,
                ))
            })
            .collect();
        // The workers hold the only admitted senders from here on
        drop(admitted_tx);

        let flusher = BatchFlusher::new(
            context.writer.clone(),
            context.filter.clone(),
            retry_tx,
            config.retry_delay.0,
        );
        let accumulator = tokio::spawn(flusher.run(
            BatchAccumulator::new(config.batch_size, config.batch_interval.0),
            admitted_rx,
            config.poll_interval.0,
            context
                .liveness
                .register("accumulator", accumulator_deadline(config)),
        ));

        info!(
            "report service started with {} workers, batches of {} every {:?}",
            config.worker_count.max(1),
            config.batch_size,
            config.batch_interval.0
        );
        Self {
            engine,
            workers,
            accumulator,
        }
    }

    /// Cancels the shutdown token. [`ReportService::join`] waits for the drain.
    pub fn stop(&self) {
        self.engine.stop();
    }

    pub async fn join(self) {
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!("worker task failed: {:?}", e);
            }
        }
        if let Err(e) = self.accumulator.await {
            error!("batch accumulator task failed: {:?}", e);
        }
        self.engine.join().await;
        info!("report service stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::*;

    fn config(attempts: &str, acquire_timeout: &str) -> Config {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "report-worker".to_string()),
            ("KAFKA_CONSUMER_TOPIC".to_string(), "report".to_string()),
            ("STORE_MAX_ATTEMPTS".to_string(), attempts.to_string()),
            ("PG_ACQUIRE_TIMEOUT".to_string(), acquire_timeout.to_string()),
        ]);
        Config::init_from_hashmap(&env).expect("config should load")
    }

    #[test]
    fn accumulator_deadline_covers_a_fully_retried_write() {
        // 3 attempts of 30s in each of two phases, plus the 1s retry delay
        assert_eq!(
            accumulator_deadline(&config("3", "30000")),
            LIVENESS_DEADLINE + time::Duration::seconds(181)
        );
        assert!(accumulator_deadline(&config("1", "100")) > LIVENESS_DEADLINE);
    }

    #[test]
    fn accumulator_deadline_is_capped() {
        assert_eq!(
            accumulator_deadline(&config("4294967295", "18446744073709551615")),
            MAX_LIVENESS_DEADLINE
        );
        assert_eq!(
            accumulator_deadline(&config("1000", "3600000")),
            MAX_LIVENESS_DEADLINE
        );
    }
}
