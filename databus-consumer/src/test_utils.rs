use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use crate::message::{KafkaMessage, Partition};
use crate::transport::{Transport, TransportEvent};
use crate::worker_pool::MessageHandler;

/// One call made against a `MockTransport`, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Subscribe(String),
    /// A poll or next_event call that delivered an event
    Delivered,
    Commit,
    CommitMessage { partition: i32, offset: i64 },
    Assign(Vec<Partition>),
    Unassign,
    Close,
}

/// In-memory transport driven by events the test pushes
pub struct MockTransport {
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events_rx: TokioMutex<mpsc::UnboundedReceiver<TransportEvent>>,
    calls: Mutex<Vec<TransportCall>>,
    subscribe_failures: Mutex<VecDeque<KafkaError>>,
    commit_error: Mutex<Option<KafkaError>>,
    subscribe_attempts: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: TokioMutex::new(events_rx),
            calls: Mutex::new(Vec::new()),
            subscribe_failures: Mutex::new(VecDeque::new()),
            commit_error: Mutex::new(None),
            subscribe_attempts: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, event: TransportEvent) {
        let events_tx = self.events_tx.lock().unwrap();
        if let Some(tx) = events_tx.as_ref() {
            tx.send(event).expect("mock event receiver dropped");
        }
    }

    pub fn push_message(&self, message: KafkaMessage) {
        self.push(TransportEvent::Message(message));
    }

    /// Close the event stream. `next_event` returns `None` once drained.
    pub fn close_events(&self) {
        self.events_tx.lock().unwrap().take();
    }

    /// Make the next `times` subscribe calls fail with `error`
    pub fn fail_subscribe(&self, times: usize, error: KafkaError) {
        let mut failures = self.subscribe_failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Make every commit and commit_message call fail with `error`
    pub fn fail_commits(&self, error: KafkaError) {
        *self.commit_error.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Commit))
    }

    pub fn committed_messages(&self) -> Vec<(i32, i64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::CommitMessage { partition, offset } => Some((partition, offset)),
                _ => None,
            })
            .collect()
    }

    pub fn was_closed(&self) -> bool {
        self.count_calls(|call| matches!(call, TransportCall::Close)) > 0
    }

    fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn commit_result(&self) -> KafkaResult<()> {
        match self.commit_error.lock().unwrap().as_ref() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn subscribe(&self, topic: &str) -> KafkaResult<()> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.subscribe_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.record(TransportCall::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        let event = tokio::time::timeout(timeout, rx.recv()).await.ok().flatten();
        if event.is_some() {
            self.record(TransportCall::Delivered);
        }
        event
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let event = self.events_rx.lock().await.recv().await;
        if event.is_some() {
            self.record(TransportCall::Delivered);
        }
        event
    }

    fn commit(&self) -> KafkaResult<()> {
        self.record(TransportCall::Commit);
        self.commit_result()
    }

    fn commit_message(&self, message: &KafkaMessage) -> KafkaResult<()> {
        self.record(TransportCall::CommitMessage {
            partition: message.get_partition(),
            offset: message.get_offset(),
        });
        self.commit_result()
    }

    fn assign(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.record(TransportCall::Assign(partitions.to_vec()));
        Ok(())
    }

    fn unassign(&self) -> KafkaResult<()> {
        self.record(TransportCall::Unassign);
        Ok(())
    }

    fn close(&self) {
        self.record(TransportCall::Close);
    }
}

/// Handler that records every message it sees, optionally sleeping first
#[derive(Default)]
pub struct RecordingHandler {
    delay: Option<Duration>,
    handled: Mutex<Vec<KafkaMessage>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            handled: Mutex::new(Vec::new()),
        }
    }

    /// (partition, offset) of every handled message, in handling order
    pub fn handled(&self) -> Vec<(i32, i64)> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .map(|m| (m.get_partition(), m.get_offset()))
            .collect()
    }

    pub fn handled_messages(&self) -> Vec<KafkaMessage> {
        self.handled.lock().unwrap().clone()
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &KafkaMessage) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.handled.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
/// Returns whether the condition was met.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test message on `topic`, keyed when `key` is set
pub fn test_message(
    topic: &str,
    partition: i32,
    offset: i64,
    key: Option<&str>,
) -> KafkaMessage {
    KafkaMessage::new_for_test(
        Partition::new(topic.to_string(), partition),
        offset,
        key,
        Some("{}"),
    )
}
