use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::decoder::Decoder;
use crate::dedup::DuplicateFilter;
use crate::error::PipelineError;
use crate::metrics_consts::{
    DUPLICATE_RECORDS, IDENTITY_FAILURES, MALFORMED_MESSAGES, RECORDS_ADMITTED, REJECTED_RECORDS,
    SELF_REPORTS, TRANSIENT_RETRIES,
};
use crate::transport::{MeasuringReceiver, MeasuringSender};
use crate::types::ReportRecord;

/// What happened to one inbound message.
#[derive(Debug)]
pub enum Outcome {
    Admitted(ReportRecord),
    Duplicate,
}

/// Decode, resolve and filter: everything a worker does to a single message.
pub struct Pipeline {
    decoder: Decoder,
    filter: Arc<DuplicateFilter>,
}

impl Pipeline {
    pub fn new(decoder: Decoder, filter: Arc<DuplicateFilter>) -> Self {
        Self { decoder, filter }
    }

    pub async fn process(&self, payload: &Value) -> Result<Outcome, PipelineError> {
        let record = self.decoder.decode(payload).await?;
        if self.filter.is_duplicate(&record).await? {
            return Ok(Outcome::Duplicate);
        }
        Ok(Outcome::Admitted(record))
    }
}

pub type SharedReceiver<T> = Arc<Mutex<MeasuringReceiver<T>>>;

/// Channels and timings a worker runs with.
pub struct WorkerContext {
    pub ingress: SharedReceiver<Value>,
    pub admitted: MeasuringSender<ReportRecord>,
    pub retry: MeasuringSender<Value>,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
}

/// Pulls messages off the shared ingress queue until it is closed and empty.
///
/// Workers don't watch the shutdown token themselves: ingress stops on it and
/// drops its sender, and the workers then drain what is left.
pub async fn run_worker(
    id: usize,
    pipeline: Arc<Pipeline>,
    context: WorkerContext,
    liveness: HealthHandle,
) {
    info!("worker {} started", id);
    loop {
        liveness.report_healthy();

        let next = {
            let mut ingress = context.ingress.lock().await;
            tokio::time::timeout(context.poll_interval, ingress.recv()).await
        };
        let payload = match next {
            Ok(Some(payload)) => payload,
            // Ingress has stopped and everything it queued has been taken
            Ok(None) => break,
            Err(_) => continue,
        };

        match pipeline.process(&payload).await {
            Ok(Outcome::Admitted(record)) => {
                if record.is_self_report() {
                    metrics::counter!(SELF_REPORTS).increment(1);
                }
                metrics::counter!(RECORDS_ADMITTED).increment(1);
                if context.admitted.send(record).await.is_err() {
                    warn!("worker {} lost the batch accumulator, stopping", id);
                    break;
                }
            }
            Ok(Outcome::Duplicate) => {
                metrics::counter!(DUPLICATE_RECORDS).increment(1);
            }
            Err(e) if e.is_retryable() => {
                warn!("worker {}: {}, re-queueing message", id, e);
                metrics::counter!(TRANSIENT_RETRIES).increment(1);
                tokio::time::sleep(context.retry_delay).await;
                if context.retry.send(payload).await.is_err() {
                    warn!("worker {} lost the retry queue, stopping", id);
                    break;
                }
            }
            Err(e) => {
                let counter = match e {
                    PipelineError::MalformedMessage(_) => MALFORMED_MESSAGES,
                    PipelineError::RejectedRecord(_) => REJECTED_RECORDS,
                    _ => IDENTITY_FAILURES,
                };
                metrics::counter!(counter).increment(1);
                warn!("worker {} dropped message: {}", id, e);
            }
        }
    }

    liveness.report_status(ComponentStatus::Unhealthy);
    info!("worker {} stopped", id);
}
