use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};

use crate::message::{KafkaMessage, Partition};

/// Everything the broker client can hand to the consumer loop
#[derive(Debug)]
pub enum TransportEvent {
    Message(KafkaMessage),
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
    PartitionEof(i32),
    Error(KafkaError),
    /// Anything else the client reports (statistics, notices)
    Other(String),
}

/// The broker client capability the consumer is built on.
///
/// Implementations are driven from a single poll loop task, except
/// `commit_message`, which callers may also use directly through
/// `Consumer::commit_message`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn subscribe(&self, topic: &str) -> KafkaResult<()>;

    /// Wait up to `timeout` for the next event. `None` means nothing arrived.
    async fn poll(&self, timeout: Duration) -> Option<TransportEvent>;

    /// Wait for the next event on the client's event channel.
    /// `None` means the channel is closed and no more events will come.
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Commit the current consumer position for every assigned partition
    fn commit(&self) -> KafkaResult<()>;

    /// Commit the position right after `message`
    fn commit_message(&self, message: &KafkaMessage) -> KafkaResult<()>;

    /// Take `partitions` as the assignment. No-op when they are already the assignment.
    fn assign(&self, partitions: &[Partition]) -> KafkaResult<()>;

    /// Drop the assignment. No-op when nothing is assigned.
    fn unassign(&self) -> KafkaResult<()>;

    /// Leave the group and release the client. Later calls fail or return no event.
    fn close(&self);
}

/// True when the client reports that no broker can be reached at all
pub fn is_all_brokers_down(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::AllBrokersDown)
    )
}

/// True for the harmless "nothing to commit" answer of a bulk commit
pub fn is_no_offset(error: &KafkaError) -> bool {
    matches!(error.rdkafka_error_code(), Some(RDKafkaErrorCode::NoOffset))
}
