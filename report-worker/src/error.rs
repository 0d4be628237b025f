use std::fmt;

use common_kafka::kafka_producer::KafkaProduceError;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::ReportRecord;

// SQLSTATEs worth another attempt: serialization failure, deadlock,
// lock not available, query canceled (statement timeout).
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014"];

/// Errors from the backing store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

impl StoreError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }

    /// Whether the same operation could succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionError { .. } => true,
            StoreError::QueryError { error, .. } => match error {
                sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)),
                _ => false,
            },
        }
    }
}

/// Why a single inbound message did not make it into a batch.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("rejected record: {0}")]
    RejectedRecord(String),
    #[error("could not resolve player identity: {0}")]
    IdentityResolutionFailure(String),
    #[error("transient store error: {0}")]
    TransientStoreError(#[source] StoreError),
}

impl PipelineError {
    /// Only transient store failures are sent back through the retry topic,
    /// everything else is dropped where it was detected.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientStoreError(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Stage,
    Normalize,
}

impl WritePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePhase::Stage => "stage",
            WritePhase::Normalize => "normalize",
        }
    }
}

impl fmt::Display for WritePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch write that ran out of attempts. The batch is handed back so it can be re-queued.
#[derive(Error, Debug)]
#[error("{phase} phase failed for a batch of {} records: {error}", batch.len())]
pub struct WriteError {
    pub phase: WritePhase,
    pub error: StoreError,
    pub batch: Vec<ReportRecord>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error(transparent)]
    Publish(#[from] KafkaProduceError),
    #[error("transport queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        let error = StoreError::query("stage", sqlx::Error::PoolTimedOut);
        assert!(error.is_transient());
        assert!(PipelineError::TransientStoreError(error).is_retryable());
    }

    #[test]
    fn only_transient_store_errors_are_retried() {
        let error = StoreError::query("find_player", sqlx::Error::RowNotFound);
        assert!(!error.is_transient());

        assert!(!PipelineError::MalformedMessage("nope".to_string()).is_retryable());
        assert!(!PipelineError::RejectedRecord("future".to_string()).is_retryable());
        assert!(!PipelineError::IdentityResolutionFailure("empty".to_string()).is_retryable());
    }

    #[test]
    fn write_error_message() {
        let error = WriteError {
            phase: WritePhase::Normalize,
            error: StoreError::ConnectionError {
                error: sqlx::Error::PoolClosed,
            },
            batch: Vec::new(),
        };
        assert!(error
            .to_string()
            .starts_with("normalize phase failed for a batch of 0 records: connection failed with:"));
    }
}
