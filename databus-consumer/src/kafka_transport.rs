use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{AutoCommitMode, ConsumerConfig};
use crate::message::{KafkaMessage, Partition};
use crate::transport::{Transport, TransportEvent};

/// Build the librdkafka client settings for a consumer.
///
/// Offsets are stored as messages are delivered, so a bulk commit moves
/// every assigned partition up to the last record handed to the dispatcher.
/// The client only commits on its own when running in `AutoCommitMode::Auto`.
pub fn client_config(config: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    let client_id = format!(
        "rdkafka-{}-{}-{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        std::process::id(),
        config.instance_id
    );

    client_config
        .set("bootstrap.servers", &config.address)
        .set("broker.address.family", "v4")
        .set("group.id", &config.group_id)
        .set("session.timeout.ms", "6000")
        .set("client.id", client_id)
        .set("auto.offset.reset", &config.offset_reset)
        .set(
            "enable.auto.commit",
            (config.auto_commit_mode == AutoCommitMode::Auto).to_string(),
        )
        .set("enable.auto.offset.store", "true")
        .set("socket.keepalive.enable", "true")
        .set("enable.partition.eof", "true");

    if config.tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    client_config
}

/// Forwards librdkafka callbacks onto the transport's event channel
pub struct TransportContext {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportContext {
    fn forward(&self, event: TransportEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("transport event channel closed, dropping event");
        }
    }
}

impl ClientContext for TransportContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "librdkafka client error");
        self.forward(TransportEvent::Error(error));
    }
}

impl ConsumerContext for TransportContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned: Vec<Partition> =
                    partitions.elements().into_iter().map(Partition::from).collect();
                info!(count = assigned.len(), "partitions assigned");
                self.forward(TransportEvent::Assigned(assigned));
            }
            Rebalance::Revoke(partitions) => {
                let revoked: Vec<Partition> =
                    partitions.elements().into_iter().map(Partition::from).collect();
                info!(count = revoked.len(), "partitions revoked");
                self.forward(TransportEvent::Revoked(revoked));
            }
            Rebalance::Error(e) => {
                self.forward(TransportEvent::Other(format!("rebalance error: {e}")));
            }
        }
    }
}

/// `Transport` backed by an rdkafka `StreamConsumer`.
///
/// `close()` drops the client, which leaves the group and stops the
/// librdkafka threads even while other `Arc` holders of the transport remain.
/// Calls made after that fail with `KafkaError::Canceled` or return no event.
pub struct KafkaTransport {
    consumer: RwLock<Option<Arc<StreamConsumer<TransportContext>>>>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl KafkaTransport {
    pub fn new(config: &ConsumerConfig) -> KafkaResult<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = TransportContext { events_tx };

        let consumer: StreamConsumer<TransportContext> =
            client_config(config).create_with_context(context)?;

        Ok(Self {
            consumer: RwLock::new(Some(Arc::new(consumer))),
            events_rx: Mutex::new(events_rx),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.client().is_err()
    }

    fn client(&self) -> KafkaResult<Arc<StreamConsumer<TransportContext>>> {
        self.consumer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(KafkaError::Canceled)
    }

    fn convert(result: KafkaResult<BorrowedMessage<'_>>) -> TransportEvent {
        match result {
            Ok(message) => TransportEvent::Message(KafkaMessage::from_borrowed_message(&message)),
            Err(KafkaError::PartitionEOF(partition)) => TransportEvent::PartitionEof(partition),
            Err(e) => TransportEvent::Error(e),
        }
    }
}

/// True when `current` holds exactly the `requested` partitions.
///
/// The default rebalance callback has already applied a group assignment by
/// the time it reaches the event channel. Assigning the same set again would
/// reset every fetch position to the last committed offset.
fn is_current_assignment(current: &TopicPartitionList, requested: &[Partition]) -> bool {
    let current: HashSet<Partition> = current
        .elements()
        .into_iter()
        .map(Partition::from)
        .collect();
    let requested: HashSet<Partition> = requested.iter().cloned().collect();
    current == requested
}

#[async_trait]
impl Transport for KafkaTransport {
    fn subscribe(&self, topic: &str) -> KafkaResult<()> {
        self.client()?.subscribe(&[topic])
    }

    async fn poll(&self, timeout: Duration) -> Option<TransportEvent> {
        let mut events = self.events_rx.lock().await;
        if let Ok(event) = events.try_recv() {
            return Some(event);
        }
        let consumer = self.client().ok()?;

        tokio::select! {
            event = events.recv() => event,
            received = tokio::time::timeout(timeout, consumer.recv()) => {
                received.ok().map(Self::convert)
            }
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut events = self.events_rx.lock().await;
        let Ok(consumer) = self.client() else {
            return events.try_recv().ok();
        };

        tokio::select! {
            event = events.recv() => event,
            received = consumer.recv() => Some(Self::convert(received)),
        }
    }

    fn commit(&self) -> KafkaResult<()> {
        self.client()?.commit_consumer_state(CommitMode::Sync)
    }

    fn commit_message(&self, message: &KafkaMessage) -> KafkaResult<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            message.get_topic(),
            message.get_partition(),
            Offset::Offset(message.get_offset() + 1),
        )?;
        self.client()?.commit(&list, CommitMode::Sync)
    }

    fn assign(&self, partitions: &[Partition]) -> KafkaResult<()> {
        let consumer = self.client()?;
        if is_current_assignment(&consumer.assignment()?, partitions) {
            debug!(count = partitions.len(), "partitions already assigned");
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition(partition.topic(), partition.partition_number());
        }
        consumer.assign(&list)
    }

    fn unassign(&self) -> KafkaResult<()> {
        let consumer = self.client()?;
        if consumer.assignment()?.count() == 0 {
            debug!("no partitions assigned");
            return Ok(());
        }
        consumer.unassign()
    }

    fn close(&self) {
        let consumer = self
            .consumer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(consumer) = consumer {
            consumer.unsubscribe();
            drop(consumer);
            info!("kafka transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerMode;

    #[test]
    fn test_client_config_for_batch_mode() {
        let config = ConsumerConfig::new("kafka:9092", "group-a", "events")
            .with_consumer_mode(ConsumerMode::Poll)
            .with_instance_id(7);
        let client = client_config(&config);

        assert_eq!(client.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(client.get("group.id"), Some("group-a"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("true"));
        assert_eq!(client.get("enable.partition.eof"), Some("true"));
        assert_eq!(client.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client.get("security.protocol"), None);

        let client_id = client.get("client.id").unwrap();
        assert!(client_id.starts_with("rdkafka-"));
        assert!(client_id.ends_with(&format!("-{}-7", std::process::id())));
    }

    #[test]
    fn test_client_config_for_auto_commit_with_tls() {
        let mut config = ConsumerConfig::new("kafka:9092", "group-a", "events")
            .with_auto_commit_mode(AutoCommitMode::Auto);
        config.tls = true;
        let client = client_config(&config);

        assert_eq!(client.get("enable.auto.commit"), Some("true"));
        assert_eq!(client.get("security.protocol"), Some("ssl"));
    }

    fn partitions(numbers: &[i32]) -> Vec<Partition> {
        numbers
            .iter()
            .map(|n| Partition::new("events".to_string(), *n))
            .collect()
    }

    #[test]
    fn test_same_assignment_is_detected() {
        let mut current = TopicPartitionList::new();
        current.add_partition("events", 0);
        current.add_partition("events", 1);

        assert!(is_current_assignment(&current, &partitions(&[1, 0])));
        assert!(!is_current_assignment(&current, &partitions(&[0])));
        assert!(!is_current_assignment(&current, &partitions(&[0, 1, 2])));
        assert!(!is_current_assignment(
            &current,
            &[
                Partition::new("other".to_string(), 0),
                Partition::new("events".to_string(), 1)
            ]
        ));

        let empty = TopicPartitionList::new();
        assert!(is_current_assignment(&empty, &[]));
        assert!(!is_current_assignment(&empty, &partitions(&[0])));
    }

    #[tokio::test]
    async fn test_unassign_without_assignment_is_a_no_op() {
        let transport =
            KafkaTransport::new(&ConsumerConfig::new("localhost:9092", "group-a", "events"))
                .unwrap();

        assert!(transport.unassign().is_ok());
        // Same (empty) assignment, nothing handed to librdkafka
        assert!(transport.assign(&[]).is_ok());
        transport.close();
    }

    #[tokio::test]
    async fn test_close_releases_the_client() {
        let transport =
            KafkaTransport::new(&ConsumerConfig::new("localhost:9092", "group-a", "events"))
                .unwrap();
        assert!(!transport.is_closed());

        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(transport.commit(), Err(KafkaError::Canceled)));
        assert!(matches!(
            transport.subscribe("events"),
            Err(KafkaError::Canceled)
        ));
        assert!(transport.poll(Duration::from_millis(10)).await.is_none());

        // Second close is a no-op
        transport.close();
    }
}
