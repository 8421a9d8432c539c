use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rdkafka::error::KafkaError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    ConsumerConfig, ConsumerMode, POLL_TIMEOUT, RETRY_BACKOFF, WORKER_QUEUE_CAPACITY,
};
use crate::dispatcher::Dispatcher;
use crate::error::ConsumerError;
use crate::hash_ring::HashRing;
use crate::health::{HealthHandle, HealthRegistry};
use crate::kafka_transport::KafkaTransport;
use crate::message::KafkaMessage;
use crate::metrics_consts::{
    CONSUMER_COMMITS, CONSUMER_EVENTS_IGNORED, CONSUMER_KAFKA_ERROR, CONSUMER_SUBSCRIBE_FAILURES,
};
use crate::transport::{is_all_brokers_down, Transport, TransportEvent};
use crate::worker_pool::{MessageHandler, WorkerPool};

const POLL_LOOP_COMPONENT: &str = "poll_loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Workers running, nothing subscribed yet
    Created,
    /// Retrying the topic subscription
    Subscribing,
    Running,
    /// `close()` in progress
    Draining,
    Closed,
}

// Pieces handed from construction to `start()` and from `start()` to `close()`
struct Lifecycle {
    dispatcher: Option<Dispatcher>,
    pool: Option<WorkerPool>,
    poll_loop: Option<JoinHandle<Dispatcher>>,
}

/// Consumer controller
///
/// Construction spawns the worker units and populates the hash ring with one
/// member per unit. `start()` spawns the loop that subscribes, receives and
/// dispatches. `close()` stops the loop, issues the final commit, closes the
/// worker queues and the transport.
///
/// Must be constructed inside a tokio runtime.
pub struct Consumer {
    config: ConsumerConfig,
    transport: Arc<dyn Transport>,
    health: HealthRegistry,
    poll_loop_health: HealthHandle,
    state: Arc<watch::Sender<ConsumerState>>,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    worker_count: usize,
}

impl Consumer {
    /// Create a consumer connected to Kafka through rdkafka.
    /// Fails only if the client cannot be created.
    pub fn new(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ConsumerError> {
        let transport = KafkaTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport), handler))
    }

    pub fn with_transport(
        config: ConsumerConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let worker_count = config.effective_worker_count();
        let health_deadline = config.effective_health_deadline();
        let health = HealthRegistry::new("liveness");
        let poll_loop_health = health.register(POLL_LOOP_COMPONENT.to_string(), health_deadline);

        let (pool, queues) = WorkerPool::spawn(
            worker_count,
            WORKER_QUEUE_CAPACITY,
            handler,
            &health,
            health_deadline,
        );
        let dispatcher = Dispatcher::new(
            HashRing::for_workers(worker_count),
            queues,
            transport.clone(),
            config.auto_commit_mode,
        );

        info!(
            topic = %config.topic,
            group_id = %config.group_id,
            workers = worker_count,
            consumer_mode = ?config.consumer_mode,
            auto_commit_mode = ?config.auto_commit_mode,
            "consumer created"
        );

        let (state, _) = watch::channel(ConsumerState::Created);

        Self {
            config,
            transport,
            health,
            poll_loop_health,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                dispatcher: Some(dispatcher),
                pool: Some(pool),
                poll_loop: None,
            }),
            worker_count,
        }
    }

    /// Spawn the poll loop and return without waiting for the subscription.
    /// Subscription failures are retried inside the loop until `close()`.
    pub fn start(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lock_lifecycle();

        match self.state() {
            ConsumerState::Created => {}
            ConsumerState::Draining | ConsumerState::Closed => return Err(ConsumerError::Closed),
            ConsumerState::Subscribing | ConsumerState::Running => {
                return Err(ConsumerError::AlreadyStarted)
            }
        }
        let dispatcher = lifecycle
            .dispatcher
            .take()
            .ok_or(ConsumerError::AlreadyStarted)?;

        self.state.send_replace(ConsumerState::Subscribing);

        let poll_loop = PollLoop {
            transport: self.transport.clone(),
            topic: self.config.topic.clone(),
            mode: self.config.consumer_mode,
            health: self.poll_loop_health.clone(),
            heartbeat: self.config.effective_health_deadline() / 2,
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        };
        lifecycle.poll_loop = Some(tokio::spawn(poll_loop.run(dispatcher)));

        info!(topic = %self.config.topic, "consumer started");
        Ok(())
    }

    /// Stop the consumer. Returns once the poll loop has exited, the queues
    /// are closed and the transport is closed. Calling it again is a no-op.
    pub async fn close(&self) {
        let taken = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.pool.take().map(|pool| {
                self.state.send_replace(ConsumerState::Draining);
                (
                    lifecycle.poll_loop.take(),
                    lifecycle.dispatcher.take(),
                    pool,
                )
            })
        };
        let Some((poll_loop, dispatcher, pool)) = taken else {
            // Another call owns the shutdown
            self.wait_for_closed().await;
            return;
        };

        info!("closing consumer");
        self.shutdown.cancel();

        let dispatcher = match poll_loop {
            Some(handle) => match handle.await {
                Ok(dispatcher) => Some(dispatcher),
                Err(e) => {
                    error!(error = %e, "poll loop ended abnormally");
                    None
                }
            },
            None => dispatcher,
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.close();
        }

        pool.shutdown(self.config.worker_drain_timeout).await;
        self.transport.close();
        self.health.stop_all();

        self.state.send_replace(ConsumerState::Closed);
        info!("consumer closed");
    }

    /// Commit the position right after `message`, outside the automatic policy.
    pub fn commit_message(&self, message: &KafkaMessage) -> Result<(), ConsumerError> {
        if self.state() == ConsumerState::Closed {
            return Err(ConsumerError::Closed);
        }

        match self.transport.commit_message(message) {
            Ok(()) => {
                metrics::counter!(CONSUMER_COMMITS, "kind" => "manual", "status" => "ok")
                    .increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(CONSUMER_COMMITS, "kind" => "manual", "status" => "error")
                    .increment(1);
                Err(e.into())
            }
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    async fn wait_for_closed(&self) {
        let mut state = self.state.subscribe();
        if state
            .wait_for(|s| *s == ConsumerState::Closed)
            .await
            .is_err()
        {
            debug!("state channel closed while waiting for close");
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Lets a loop that was never closed exit on its own
        self.shutdown.cancel();
    }
}

struct PollLoop {
    transport: Arc<dyn Transport>,
    topic: String,
    mode: ConsumerMode,
    health: HealthHandle,
    heartbeat: Duration,
    state: Arc<watch::Sender<ConsumerState>>,
    shutdown: CancellationToken,
}

impl PollLoop {
    async fn run(self, mut dispatcher: Dispatcher) -> Dispatcher {
        if !self.subscribe().await {
            info!("consumer closed before the subscription succeeded");
            return dispatcher;
        }

        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Subscribing {
                *state = ConsumerState::Running;
                true
            } else {
                false
            }
        });

        match self.mode {
            ConsumerMode::Poll => self.poll_events(&mut dispatcher).await,
            ConsumerMode::Channel => self.channel_events(&mut dispatcher).await,
        }

        dispatcher.flush();
        info!(topic = %self.topic, "poll loop exited");
        dispatcher
    }

    /// Returns false if the consumer was closed before subscribing
    async fn subscribe(&self) -> bool {
        let mut attempts: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            self.health.report_healthy();
            attempts += 1;

            match self.transport.subscribe(&self.topic) {
                Ok(()) => {
                    info!(topic = %self.topic, attempts, "subscribed to topic");
                    return true;
                }
                Err(e) => {
                    warn!(
                        topic = %self.topic,
                        attempts,
                        error = %e,
                        "failed to subscribe, retrying"
                    );
                    metrics::counter!(CONSUMER_SUBSCRIBE_FAILURES).increment(1);
                    if !self.backoff().await {
                        return false;
                    }
                }
            }
        }
    }

    async fn poll_events(&self, dispatcher: &mut Dispatcher) {
        while !self.shutdown.is_cancelled() {
            self.health.report_healthy();

            match self.transport.poll(POLL_TIMEOUT).await {
                None => continue,
                Some(TransportEvent::Message(message)) => {
                    Self::dispatch(dispatcher, message).await;
                }
                Some(TransportEvent::Error(e)) => {
                    self.handle_kafka_error(e).await;
                }
                Some(event) => Self::ignore(event),
            }
        }
    }

    async fn channel_events(&self, dispatcher: &mut Dispatcher) {
        let mut heartbeat = tokio::time::interval(self.heartbeat);

        loop {
            self.health.report_healthy();

            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => continue,
                event = self.transport.next_event() => event,
            };

            match event {
                Some(TransportEvent::Message(message)) => {
                    Self::dispatch(dispatcher, message).await;
                }
                Some(TransportEvent::Assigned(partitions)) => {
                    info!(count = partitions.len(), "assigning partitions");
                    if let Err(e) = self.transport.assign(&partitions) {
                        error!(error = %e, "failed to assign partitions");
                    }
                }
                Some(TransportEvent::Revoked(partitions)) => {
                    info!(count = partitions.len(), "unassigning partitions");
                    if let Err(e) = self.transport.unassign() {
                        error!(error = %e, "failed to unassign partitions");
                    }
                }
                Some(TransportEvent::PartitionEof(partition)) => {
                    debug!(partition, "reached end of partition");
                }
                Some(TransportEvent::Error(e)) => {
                    error!(error = %e, "kafka error on event channel");
                    metrics::counter!(CONSUMER_KAFKA_ERROR, "error" => error_label(&e))
                        .increment(1);
                }
                Some(event) => Self::ignore(event),
                None => {
                    warn!("transport event channel closed, waiting for close");
                    self.shutdown.cancelled().await;
                    break;
                }
            }
        }
    }

    async fn dispatch(dispatcher: &mut Dispatcher, message: KafkaMessage) {
        if let Err(e) = dispatcher.dispatch(message).await {
            debug!(error = %e, "message dropped by dispatcher");
        }
    }

    async fn handle_kafka_error(&self, error: KafkaError) {
        error!(error = %error, "kafka error while polling");
        metrics::counter!(CONSUMER_KAFKA_ERROR, "error" => error_label(&error)).increment(1);

        if is_all_brokers_down(&error) {
            warn!("all brokers are down, backing off");
            self.backoff().await;
        }
    }

    fn ignore(event: TransportEvent) {
        let kind = match &event {
            TransportEvent::Assigned(partitions) => {
                info!(count = partitions.len(), "partitions assigned");
                "assigned"
            }
            TransportEvent::Revoked(partitions) => {
                info!(count = partitions.len(), "partitions revoked");
                "revoked"
            }
            TransportEvent::PartitionEof(partition) => {
                debug!(partition, "reached end of partition");
                "partition_eof"
            }
            TransportEvent::Other(description) => {
                info!(event = %description, "ignored transport event");
                "other"
            }
            TransportEvent::Message(_) | TransportEvent::Error(_) => "unexpected",
        };
        metrics::counter!(CONSUMER_EVENTS_IGNORED, "event" => kind).increment(1);
    }

    /// Sleep for the retry backoff. Returns false if closed while sleeping.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(RETRY_BACKOFF) => true,
        }
    }
}

fn error_label(error: &KafkaError) -> String {
    match error.rdkafka_error_code() {
        Some(code) => format!("{code:?}"),
        None => "other".to_string(),
    }
}
