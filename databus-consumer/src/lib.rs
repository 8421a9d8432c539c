//! Kafka consumer front-end that fans messages out to a fixed pool of worker units.
//!
//! Messages with a key always reach the same worker through a consistent-hash
//! ring, so per-key order is preserved. Messages without a key are spread by
//! partition. Each worker has a small bounded queue, and a full queue blocks
//! the poll loop until the worker catches up.

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod hash_ring;
pub mod health;
pub mod kafka_transport;
pub mod message;
pub mod metrics_consts;
pub mod router;
pub mod test_utils;
pub mod transport;
pub mod worker_pool;

pub use config::{AutoCommitMode, ConsumerConfig, ConsumerMode};
pub use consumer::{Consumer, ConsumerState};
pub use error::ConsumerError;
pub use message::{KafkaMessage, Partition};
pub use transport::{Transport, TransportEvent};
pub use worker_pool::MessageHandler;
