use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// An owned copy of a broker record.
///
/// The transport hands these to the dispatcher, which moves each one into
/// exactly one worker queue. The worker owns it until the handler returns.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    topic_partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: Option<i64>,
}

impl KafkaMessage {
    pub fn new(
        topic_partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            key,
            payload,
            timestamp,
        }
    }

    /// Detach a record from the rdkafka client buffer
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            topic_partition: Partition::new(msg.topic().to_string(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp: msg.timestamp().to_millis(),
        }
    }

    pub fn new_for_test(
        partition: Partition,
        offset: i64,
        key: Option<&str>,
        payload: Option<&str>,
    ) -> Self {
        Self::new(
            partition,
            offset,
            key.map(|k| k.as_bytes().to_vec()),
            payload.map(|p| p.as_bytes().to_vec()),
            None,
        )
    }

    pub fn get_topic_partition(&self) -> &Partition {
        &self.topic_partition
    }

    pub fn get_topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn get_partition(&self) -> i32 {
        self.topic_partition.partition_number()
    }

    pub fn get_offset(&self) -> i64 {
        self.offset
    }

    pub fn get_key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// The routing key as a string, or None when the record carries no key
    /// or an empty one. Non UTF-8 bytes are replaced, which keeps routing
    /// deterministic for binary keys.
    pub fn routing_key(&self) -> Option<String> {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => Some(String::from_utf8_lossy(key).into_owned()),
            _ => None,
        }
    }

    pub fn get_payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.timestamp
    }
}
