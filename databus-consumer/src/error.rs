use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors returned to callers of the consumer controller.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer has already been started")]
    AlreadyStarted,
    #[error("consumer is closed")]
    Closed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashRingError {
    #[error("hash ring has no members")]
    Empty,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{value} is not a valid {kind}")]
pub struct ParseModeError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("queue for worker {0} is closed")]
    QueueClosed(usize),
}
