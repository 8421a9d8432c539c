use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ParseModeError;

pub const DEFAULT_WORKER_COUNT: usize = 51;
pub const WORKER_QUEUE_CAPACITY: usize = 2;
pub const BATCH_COMMIT_THRESHOLD: usize = 1000;
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Floor for the liveness deadline, the loops report twice per deadline
pub const MIN_HEALTH_DEADLINE: Duration = Duration::from_secs(1);

/// How the controller pulls events from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerMode {
    /// Loop on `poll(100ms)`, checking the close flag between polls
    #[default]
    Poll,
    /// Wait on the transport's event channel, handling partition assignment explicitly
    Channel,
}

impl FromStr for ConsumerMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "0" | "poll" => Ok(ConsumerMode::Poll),
            "1" | "channel" | "event" => Ok(ConsumerMode::Channel),
            _ => Err(ParseModeError {
                kind: "consumer mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Offset commit policy applied by the dispatcher.
///
/// Commits in `Batch` and `Message` modes are issued from the poll loop as
/// soon as a message is enqueued, not when its handler finishes. A crash can
/// therefore commit past work that never completed. Callers that need every
/// message handled before its offset moves should commit from their handler
/// with `Consumer::commit_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoCommitMode {
    /// Bulk commit every 1000 dispatched messages, and once more on close
    #[default]
    Batch,
    /// Synchronous commit of each message right after it is enqueued
    Message,
    /// Leave commits to the client's background auto commit
    Auto,
}

impl FromStr for AutoCommitMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "0" | "batch" | "commit" => Ok(AutoCommitMode::Batch),
            "1" | "message" | "commitmsg" => Ok(AutoCommitMode::Message),
            "2" | "auto" => Ok(AutoCommitMode::Auto),
            _ => Err(ParseModeError {
                kind: "auto commit mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Immutable consumer settings, resolved once before construction
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub address: String,
    pub group_id: String,
    pub topic: String,
    pub consumer_mode: ConsumerMode,
    pub auto_commit_mode: AutoCommitMode,
    /// Non-positive values fall back to `DEFAULT_WORKER_COUNT`
    pub worker_count: i32,
    /// Distinguishes several consumers in one process, ends up in `client.id`
    pub instance_id: u32,
    pub offset_reset: String,
    pub tls: bool,
    pub worker_drain_timeout: Duration,
    pub health_deadline: Duration,
}

impl ConsumerConfig {
    pub fn new(address: &str, group_id: &str, topic: &str) -> Self {
        Self {
            address: address.to_string(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            consumer_mode: ConsumerMode::default(),
            auto_commit_mode: AutoCommitMode::default(),
            worker_count: 0,
            instance_id: 0,
            offset_reset: "latest".to_string(),
            tls: false,
            worker_drain_timeout: Duration::from_secs(5),
            health_deadline: Duration::from_secs(30),
        }
    }

    pub fn with_consumer_mode(mut self, mode: ConsumerMode) -> Self {
        self.consumer_mode = mode;
        self
    }

    pub fn with_auto_commit_mode(mut self, mode: AutoCommitMode) -> Self {
        self.auto_commit_mode = mode;
        self
    }

    pub fn with_worker_count(mut self, count: i32) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_instance_id(mut self, id: u32) -> Self {
        self.instance_id = id;
        self
    }

    pub fn with_worker_drain_timeout(mut self, timeout: Duration) -> Self {
        self.worker_drain_timeout = timeout;
        self
    }

    pub fn with_health_deadline(mut self, deadline: Duration) -> Self {
        self.health_deadline = deadline;
        self
    }

    pub fn effective_health_deadline(&self) -> Duration {
        self.health_deadline.max(MIN_HEALTH_DEADLINE)
    }

    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count <= 0 {
            DEFAULT_WORKER_COUNT
        } else {
            self.worker_count as usize
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "databus-consumer")]
    pub kafka_consumer_group: String,

    pub kafka_consumer_topic: String,

    // "latest" skips the backlog when a new group starts, set "earliest" to replay it
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "poll")]
    pub consumer_mode: ConsumerMode,

    #[envconfig(default = "batch")]
    pub auto_commit_mode: AutoCommitMode,

    #[envconfig(default = "0")]
    pub worker_count: i32,

    #[envconfig(default = "0")]
    pub consumer_instance_id: u32,

    #[envconfig(default = "5000")]
    pub worker_drain_timeout_ms: u64,

    #[envconfig(default = "30")]
    pub health_deadline_secs: u64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            address: self.kafka_hosts.clone(),
            group_id: self.kafka_consumer_group.clone(),
            topic: self.kafka_consumer_topic.clone(),
            consumer_mode: self.consumer_mode,
            auto_commit_mode: self.auto_commit_mode,
            worker_count: self.worker_count,
            instance_id: self.consumer_instance_id,
            offset_reset: self.kafka_consumer_offset_reset.clone(),
            tls: self.kafka_tls,
            worker_drain_timeout: Duration::from_millis(self.worker_drain_timeout_ms),
            health_deadline: Duration::from_secs(self.health_deadline_secs)
                .max(MIN_HEALTH_DEADLINE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_worker_count_defaults_to_51() {
        let config = ConsumerConfig::new("localhost:9092", "group", "topic");
        assert_eq!(config.effective_worker_count(), 51);

        let negative = config.clone().with_worker_count(-3);
        assert_eq!(negative.effective_worker_count(), 51);

        let explicit = config.with_worker_count(4);
        assert_eq!(explicit.effective_worker_count(), 4);
    }

    #[test]
    fn test_modes_parse_codes_and_names() {
        assert_eq!("0".parse::<ConsumerMode>(), Ok(ConsumerMode::Poll));
        assert_eq!("1".parse::<ConsumerMode>(), Ok(ConsumerMode::Channel));
        assert_eq!("Channel".parse::<ConsumerMode>(), Ok(ConsumerMode::Channel));
        assert!("2".parse::<ConsumerMode>().is_err());

        assert_eq!("0".parse::<AutoCommitMode>(), Ok(AutoCommitMode::Batch));
        assert_eq!("1".parse::<AutoCommitMode>(), Ok(AutoCommitMode::Message));
        assert_eq!("2".parse::<AutoCommitMode>(), Ok(AutoCommitMode::Auto));
        assert_eq!(" auto ".parse::<AutoCommitMode>(), Ok(AutoCommitMode::Auto));

        let err = "sometimes".parse::<AutoCommitMode>().unwrap_err();
        assert_eq!(err.to_string(), "sometimes is not a valid auto commit mode");
    }

    #[test]
    fn test_config_from_env() {
        let env: HashMap<String, String> = [
            ("KAFKA_CONSUMER_TOPIC", "clickhouse_events"),
            ("CONSUMER_MODE", "1"),
            ("AUTO_COMMIT_MODE", "message"),
            ("WORKER_COUNT", "8"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.bind(), "0.0.0.0:3310");

        let consumer = config.consumer_config();
        assert_eq!(consumer.topic, "clickhouse_events");
        assert_eq!(consumer.group_id, "databus-consumer");
        assert_eq!(consumer.consumer_mode, ConsumerMode::Channel);
        assert_eq!(consumer.auto_commit_mode, AutoCommitMode::Message);
        assert_eq!(consumer.effective_worker_count(), 8);
        assert_eq!(consumer.offset_reset, "latest");
        assert_eq!(consumer.worker_drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_health_deadline_is_floored() {
        let env: HashMap<String, String> = [
            ("KAFKA_CONSUMER_TOPIC", "clickhouse_events"),
            ("HEALTH_DEADLINE_SECS", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap().consumer_config();
        assert_eq!(config.health_deadline, MIN_HEALTH_DEADLINE);

        let config = ConsumerConfig::new("localhost:9092", "group", "topic")
            .with_health_deadline(Duration::ZERO);
        assert_eq!(config.effective_health_deadline(), MIN_HEALTH_DEADLINE);

        let config = config.with_health_deadline(Duration::from_secs(45));
        assert_eq!(config.effective_health_deadline(), Duration::from_secs(45));
    }

    #[test]
    fn test_config_requires_topic() {
        let env: HashMap<String, String> = HashMap::new();
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
