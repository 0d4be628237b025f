use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientContext, Message, Statistics};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

pub struct ConsumerStatsContext {
    liveness: HealthHandle,
}

impl ClientContext for ConsumerStatsContext {
    fn stats(&self, _: Statistics) {
        // The main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for ConsumerStatsContext {}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

/// A single-topic consumer that hands out JSON payloads in batches.
///
/// Offsets of received messages are only committed when the caller asks for it via
/// [`BatchConsumer::commit`], so a caller that commits after handing messages off gets
/// at-least-once delivery.
#[derive(Clone)]
pub struct BatchConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<ConsumerStatsContext>,
    topic: String,
}

impl BatchConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "enable.auto.commit",
                consumer_config.kafka_consumer_auto_commit.to_string(),
            )
            .set("enable.auto.offset.store", "true");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<ConsumerStatsContext> =
            client_config.create_with_context(ConsumerStatsContext { liveness })?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        info!(
            "subscribed to {} as {}",
            consumer_config.kafka_consumer_topic, consumer_config.kafka_consumer_group
        );

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: consumer_config.kafka_consumer_topic.clone(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Receive up to `max` messages, waiting at most `timeout` for the batch to fill.
    ///
    /// Payloads that are empty or not valid JSON come back as per-message errors, so the
    /// caller can count and skip them. A broker error ends the batch early.
    pub async fn json_recv_batch<T>(&self, max: usize, timeout: Duration) -> Vec<Result<T, RecvErr>>
    where
        T: DeserializeOwned,
    {
        let mut results = Vec::with_capacity(max);
        let deadline = Instant::now() + timeout;

        while results.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.inner.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(error)) => {
                    results.push(Err(RecvErr::Kafka(error)));
                    break;
                }
                Ok(Ok(message)) => results.push(decode_payload(&message)),
            }
        }

        results
    }

    /// Commit the offsets of every message received so far.
    pub fn commit(&self) -> Result<(), KafkaError> {
        match self.inner.consumer.commit_consumer_state(CommitMode::Async) {
            // Nothing consumed since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other,
        }
    }
}

fn decode_payload<T: DeserializeOwned>(message: &BorrowedMessage<'_>) -> Result<T, RecvErr> {
    let Some(payload) = message.payload() else {
        return Err(RecvErr::Empty);
    };
    Ok(serde_json::from_slice(payload)?)
}
