//! Dispatcher - picks a worker for each message and applies the commit policy
//!
//! Keyed messages go to the worker the hash ring assigns to their key, so a
//! key sticks to one worker for the life of the consumer. Messages without a
//! key, or whose ring lookup cannot be used, go to `partition mod workers`.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{AutoCommitMode, BATCH_COMMIT_THRESHOLD};
use crate::error::DispatchError;
use crate::hash_ring::HashRing;
use crate::message::KafkaMessage;
use crate::metrics_consts::{
    CONSUMER_COMMITS, DISPATCHER_BACKPRESSURE_TOTAL, DISPATCHER_BACKPRESSURE_WAIT_MS,
    DISPATCHER_MESSAGES_DISPATCHED,
};
use crate::transport::{is_no_offset, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Chosen by the hash ring from the message key
    Key(usize),
    /// Chosen by partition number
    Partition(usize),
}

impl Route {
    pub fn worker(&self) -> usize {
        match self {
            Route::Key(worker) | Route::Partition(worker) => *worker,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Route::Key(_) => "key",
            Route::Partition(_) => "partition",
        }
    }
}

pub struct Dispatcher {
    ring: HashRing,
    queues: Vec<mpsc::Sender<KafkaMessage>>,
    transport: Arc<dyn Transport>,
    commit_mode: AutoCommitMode,
    // messages dispatched since the last bulk commit
    pending_commit: usize,
    // queue count as a partition divisor, capped at i32::MAX
    partition_modulus: i32,
}

impl Dispatcher {
    pub fn new(
        ring: HashRing,
        queues: Vec<mpsc::Sender<KafkaMessage>>,
        transport: Arc<dyn Transport>,
        commit_mode: AutoCommitMode,
    ) -> Self {
        assert!(!queues.is_empty(), "dispatcher needs at least one queue");
        let partition_modulus = i32::try_from(queues.len()).unwrap_or(i32::MAX);
        Self {
            ring,
            queues,
            transport,
            commit_mode,
            pending_commit: 0,
            partition_modulus,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    pub fn pending_commit(&self) -> usize {
        self.pending_commit
    }

    pub fn route(&self, message: &KafkaMessage) -> Route {
        let worker_count = self.queues.len();

        if let Some(key) = message.routing_key() {
            match self.ring.get(&key).map(str::parse::<usize>) {
                Ok(Ok(worker)) if worker < worker_count => return Route::Key(worker),
                Ok(_) => {
                    warn!(key = %key, "hash ring returned an unusable worker, routing by partition")
                }
                Err(e) => warn!(key = %key, error = %e, "hash ring lookup failed, routing by partition"),
            }
        }

        let worker = message.get_partition().rem_euclid(self.partition_modulus);
        Route::Partition(usize::try_from(worker).unwrap_or_default())
    }

    /// Enqueue `message` on its worker, then apply the commit policy.
    ///
    /// Waits while the destination queue is full. This is what slows the poll
    /// loop down when a worker falls behind; the other workers keep running.
    pub async fn dispatch(&mut self, message: KafkaMessage) -> Result<Route, DispatchError> {
        let route = self.route(&message);
        let worker = route.worker();
        let sender = &self.queues[worker];

        let send_start = if sender.capacity() == 0 {
            metrics::counter!(DISPATCHER_BACKPRESSURE_TOTAL, "worker" => worker.to_string())
                .increment(1);
            Some(Instant::now())
        } else {
            None
        };

        // Keep a copy of the coordinates for the commit, the message moves into the queue
        let commit_target = (self.commit_mode == AutoCommitMode::Message).then(|| message.clone());

        if sender.send(message).await.is_err() {
            error!(worker, "worker queue closed, message not dispatched");
            return Err(DispatchError::QueueClosed(worker));
        }

        if let Some(start) = send_start {
            metrics::histogram!(DISPATCHER_BACKPRESSURE_WAIT_MS, "worker" => worker.to_string())
                .record(start.elapsed().as_millis() as f64);
        }
        metrics::counter!(DISPATCHER_MESSAGES_DISPATCHED, "route" => route.label()).increment(1);

        match self.commit_mode {
            AutoCommitMode::Batch => {
                self.pending_commit += 1;
                if self.pending_commit >= BATCH_COMMIT_THRESHOLD {
                    self.commit("batch");
                    self.pending_commit = 0;
                }
            }
            AutoCommitMode::Message => {
                if let Some(message) = commit_target {
                    self.commit_message(&message);
                }
            }
            AutoCommitMode::Auto => {}
        }

        Ok(route)
    }

    /// Final bulk commit issued when the poll loop exits.
    /// Skipped in per-message mode, where every message was already committed.
    pub fn flush(&mut self) {
        if self.commit_mode == AutoCommitMode::Message {
            return;
        }
        self.commit("final");
        self.pending_commit = 0;
    }

    /// Close every worker queue. Workers exit once they drain what is left.
    pub fn close(self) {
        debug!(count = self.queues.len(), "closing worker queues");
        drop(self.queues);
    }

    // Commit failures on this path are not returned to anyone, only logged and counted
    fn commit(&self, kind: &'static str) {
        match self.transport.commit() {
            Ok(()) => {
                debug!(kind, "committed consumer offsets");
                metrics::counter!(CONSUMER_COMMITS, "kind" => kind, "status" => "ok").increment(1);
            }
            Err(e) if is_no_offset(&e) => {
                debug!(kind, "no offsets to commit");
                metrics::counter!(CONSUMER_COMMITS, "kind" => kind, "status" => "empty")
                    .increment(1);
            }
            Err(e) => {
                warn!(kind, error = %e, "failed to commit consumer offsets");
                metrics::counter!(CONSUMER_COMMITS, "kind" => kind, "status" => "error")
                    .increment(1);
            }
        }
    }

    fn commit_message(&self, message: &KafkaMessage) {
        match self.transport.commit_message(message) {
            Ok(()) => {
                metrics::counter!(CONSUMER_COMMITS, "kind" => "message", "status" => "ok")
                    .increment(1);
            }
            Err(e) => {
                warn!(
                    topic = message.get_topic(),
                    partition = message.get_partition(),
                    offset = message.get_offset(),
                    error = %e,
                    "failed to commit message offset"
                );
                metrics::counter!(CONSUMER_COMMITS, "kind" => "message", "status" => "error")
                    .increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Partition;
    use crate::test_utils::{MockTransport, TransportCall};
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};

    fn dispatcher_with_queues(
        workers: usize,
        capacity: usize,
        mode: AutoCommitMode,
        transport: Arc<MockTransport>,
    ) -> (Dispatcher, Vec<mpsc::Receiver<KafkaMessage>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| mpsc::channel(capacity)).unzip();
        let dispatcher = Dispatcher::new(HashRing::for_workers(workers), senders, transport, mode);
        (dispatcher, receivers)
    }

    fn keyless(partition: i32, offset: i64) -> KafkaMessage {
        KafkaMessage::new_for_test(
            Partition::new("events".to_string(), partition),
            offset,
            None,
            Some("{}"),
        )
    }

    fn keyed(key: &str, partition: i32, offset: i64) -> KafkaMessage {
        KafkaMessage::new_for_test(
            Partition::new("events".to_string(), partition),
            offset,
            Some(key),
            Some("{}"),
        )
    }

    #[tokio::test]
    async fn test_keyless_messages_route_by_partition() {
        let transport = Arc::new(MockTransport::new());
        let (mut dispatcher, mut receivers) =
            dispatcher_with_queues(4, 8, AutoCommitMode::Auto, transport);

        let partitions = [0, 1, 2, 3, 0, 1, 2, 3];
        let mut routes = vec![];
        for (offset, partition) in partitions.iter().enumerate() {
            let route = dispatcher
                .dispatch(keyless(*partition, offset as i64))
                .await
                .unwrap();
            assert!(matches!(route, Route::Partition(_)));
            routes.push(route.worker());
        }
        assert_eq!(routes, vec![0, 1, 2, 3, 0, 1, 2, 3]);

        for (worker, receiver) in receivers.iter_mut().enumerate() {
            let first = receiver.try_recv().unwrap();
            let second = receiver.try_recv().unwrap();
            assert_eq!(first.get_partition() as usize, worker);
            assert!(first.get_offset() < second.get_offset());
        }
    }

    #[test]
    fn test_partition_modulo() {
        let transport = Arc::new(MockTransport::new());
        for workers in [1usize, 3, 7, 51] {
            let (dispatcher, _receivers) =
                dispatcher_with_queues(workers, 2, AutoCommitMode::Auto, transport.clone());
            for partition in 0..200 {
                assert_eq!(
                    dispatcher.route(&keyless(partition, 0)),
                    Route::Partition(partition as usize % workers)
                );
            }
        }
    }

    #[test]
    fn test_negative_partition_routes_in_range() {
        let transport = Arc::new(MockTransport::new());
        let (dispatcher, _receivers) =
            dispatcher_with_queues(4, 2, AutoCommitMode::Auto, transport);
        assert_eq!(dispatcher.partition_modulus, 4);

        // -1 is librdkafka's unassigned partition
        assert_eq!(dispatcher.route(&keyless(-1, 0)), Route::Partition(3));
        assert_eq!(dispatcher.route(&keyless(i32::MIN, 0)), Route::Partition(0));
        assert_eq!(
            dispatcher.route(&keyless(i32::MAX, 0)),
            Route::Partition(i32::MAX as usize % 4)
        );
    }

    #[test]
    fn test_empty_key_routes_by_partition() {
        let transport = Arc::new(MockTransport::new());
        let (dispatcher, _receivers) =
            dispatcher_with_queues(4, 2, AutoCommitMode::Auto, transport);
        assert_eq!(dispatcher.route(&keyed("", 6, 0)), Route::Partition(2));
    }

    #[test]
    fn test_same_key_same_worker_across_partitions() {
        let transport = Arc::new(MockTransport::new());
        let (dispatcher, _receivers) =
            dispatcher_with_queues(51, 2, AutoCommitMode::Auto, transport);

        let a = dispatcher.route(&keyed("user-42", 0, 10));
        let b = dispatcher.route(&keyed("user-42", 7, 11));
        assert!(matches!(a, Route::Key(_)));
        assert_eq!(a, b);

        let ring = HashRing::for_workers(51);
        let expected: usize = ring.get("user-42").unwrap().parse().unwrap();
        assert_eq!(a.worker(), expected);
    }

    #[test]
    fn test_unusable_ring_answer_falls_back_to_partition() {
        let transport = Arc::new(MockTransport::new());
        let (senders, _receivers): (Vec<_>, Vec<_>) = (0..4).map(|_| mpsc::channel(2)).unzip();

        // Members that are not worker indexes
        let mut ring = HashRing::new();
        ring.add("not-a-number");
        let dispatcher = Dispatcher::new(ring, senders, transport.clone(), AutoCommitMode::Auto);
        assert_eq!(dispatcher.route(&keyed("user-42", 5, 0)), Route::Partition(1));

        // Member index out of range
        let (senders, _receivers): (Vec<_>, Vec<_>) = (0..4).map(|_| mpsc::channel(2)).unzip();
        let mut ring = HashRing::new();
        ring.add("9");
        let dispatcher = Dispatcher::new(ring, senders, transport.clone(), AutoCommitMode::Auto);
        assert_eq!(dispatcher.route(&keyed("user-42", 2, 0)), Route::Partition(2));

        // Empty ring
        let (senders, _receivers): (Vec<_>, Vec<_>) = (0..4).map(|_| mpsc::channel(2)).unzip();
        let dispatcher =
            Dispatcher::new(HashRing::new(), senders, transport, AutoCommitMode::Auto);
        assert_eq!(dispatcher.route(&keyed("user-42", 3, 0)), Route::Partition(3));
    }

    #[tokio::test]
    async fn test_batch_mode_commits_every_thousand() {
        let transport = Arc::new(MockTransport::new());
        let (mut dispatcher, mut receivers) = dispatcher_with_queues(
            1,
            BATCH_COMMIT_THRESHOLD * 3,
            AutoCommitMode::Batch,
            transport.clone(),
        );

        for offset in 0..(BATCH_COMMIT_THRESHOLD as i64 - 1) {
            dispatcher.dispatch(keyless(0, offset)).await.unwrap();
        }
        assert_eq!(transport.commit_count(), 0);
        assert_eq!(dispatcher.pending_commit(), BATCH_COMMIT_THRESHOLD - 1);

        dispatcher
            .dispatch(keyless(0, BATCH_COMMIT_THRESHOLD as i64))
            .await
            .unwrap();
        assert_eq!(transport.commit_count(), 1);
        assert_eq!(dispatcher.pending_commit(), 0);

        for offset in 0..(BATCH_COMMIT_THRESHOLD as i64 + 10) {
            dispatcher.dispatch(keyless(0, offset)).await.unwrap();
        }
        assert_eq!(transport.commit_count(), 2);
        assert_eq!(dispatcher.pending_commit(), 10);

        dispatcher.flush();
        assert_eq!(transport.commit_count(), 3);
        assert!(transport.committed_messages().is_empty());

        receivers[0].close();
    }

    #[tokio::test]
    async fn test_message_mode_commits_each_message() {
        let transport = Arc::new(MockTransport::new());
        let (mut dispatcher, _receivers) =
            dispatcher_with_queues(2, 8, AutoCommitMode::Message, transport.clone());

        dispatcher.dispatch(keyless(0, 41)).await.unwrap();
        dispatcher.dispatch(keyless(1, 42)).await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::CommitMessage {
                    partition: 0,
                    offset: 41
                },
                TransportCall::CommitMessage {
                    partition: 1,
                    offset: 42
                },
            ]
        );

        // No final flush in per-message mode
        dispatcher.flush();
        assert_eq!(transport.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_mode_only_commits_on_flush() {
        let transport = Arc::new(MockTransport::new());
        let (mut dispatcher, _receivers) =
            dispatcher_with_queues(2, 8, AutoCommitMode::Auto, transport.clone());

        for offset in 0..5 {
            dispatcher.dispatch(keyless(0, offset)).await.unwrap();
        }
        assert!(transport.calls().is_empty());

        dispatcher.flush();
        assert_eq!(transport.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_errors_are_not_propagated() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_commits(KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut));
        let (mut dispatcher, _receivers) =
            dispatcher_with_queues(1, 8, AutoCommitMode::Message, transport.clone());

        assert!(dispatcher.dispatch(keyless(0, 1)).await.is_ok());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_to_closed_queue_fails() {
        let transport = Arc::new(MockTransport::new());
        let (mut dispatcher, receivers) =
            dispatcher_with_queues(2, 2, AutoCommitMode::Message, transport.clone());
        drop(receivers);

        assert_eq!(
            dispatcher.dispatch(keyless(1, 0)).await,
            Err(DispatchError::QueueClosed(1))
        );
        // Nothing enqueued, so nothing committed
        assert!(transport.calls().is_empty());
    }
}
