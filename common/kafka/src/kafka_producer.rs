use std::time::Duration;

use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientContext, Statistics};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: Statistics) {
        // The main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // Ping the brokers so a bad address fails start-up instead of the first retry
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => info!(
            "connected to Kafka brokers, found {} topics",
            metadata.topics().len()
        ),
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: serde_json::Error },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Serialize every item as JSON and produce it to `topic`, returning one result per item
/// in the order they were passed in.
///
/// All records are enqueued before any delivery report is awaited, so a batch is
/// acknowledged concurrently by the brokers.
pub async fn send_iter_to_kafka<T, C>(
    producer: &FutureProducer<C>,
    topic: &str,
    iter: impl IntoIterator<Item = T>,
) -> Vec<Result<(), KafkaProduceError>>
where
    T: Serialize,
    C: ClientContext + 'static,
{
    let mut pending = Vec::new();

    for item in iter {
        let payload = match serde_json::to_string(&item) {
            Ok(payload) => payload,
            Err(error) => {
                pending.push(Err(KafkaProduceError::SerializationError { error }));
                continue;
            }
        };

        let record: FutureRecord<'_, (), String> = FutureRecord::to(topic).payload(&payload);
        match producer.send_result(record) {
            Ok(delivery) => pending.push(Ok(delivery)),
            Err((error, _)) => pending.push(Err(KafkaProduceError::KafkaProduceError { error })),
        }
    }

    let mut results = Vec::with_capacity(pending.len());
    for entry in pending {
        let result = match entry {
            Err(e) => Err(e),
            Ok(delivery) => match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((error, _))) => Err(KafkaProduceError::KafkaProduceError { error }),
                Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
            },
        };
        results.push(result);
    }
    results
}
