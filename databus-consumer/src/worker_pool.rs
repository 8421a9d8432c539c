//! Worker Pool - a fixed set of units, each draining one bounded queue
//!
//! Every unit owns the receiving end of its queue and invokes the user
//! handler once per message, in enqueue order. This gives:
//! 1. Ordering for every message routed to the same unit
//! 2. Parallelism across units
//! 3. Backpressure on the producer when a unit falls behind

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::health::{ComponentStatus, HealthHandle, HealthRegistry};
use crate::message::KafkaMessage;
use crate::metrics_consts::{WORKER_HANDLER_DURATION_MS, WORKER_MESSAGES_HANDLED};

/// Application logic invoked once per delivered message.
///
/// Runs on a shared worker unit: a handler that blocks stalls every later
/// message routed to the same unit and, once its queue fills, the poll loop.
/// A returned error is logged and the message still counts as delivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &KafkaMessage) -> anyhow::Result<()>;
}

struct Worker {
    index: usize,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `count` units with queues of `capacity` messages.
    /// Returns the pool and the sending half of every queue, indexed by unit.
    pub fn spawn(
        count: usize,
        capacity: usize,
        handler: Arc<dyn MessageHandler>,
        health: &HealthRegistry,
        health_deadline: Duration,
    ) -> (Self, Vec<mpsc::Sender<KafkaMessage>>) {
        let mut workers = Vec::with_capacity(count);
        let mut senders = Vec::with_capacity(count);

        for index in 0..count {
            let (sender, receiver) = mpsc::channel(capacity);
            let health_handle = health.register(format!("worker_{index}"), health_deadline);
            let handler = handler.clone();

            let handle = tokio::spawn(async move {
                run_worker(index, receiver, handler, health_handle).await;
            });

            workers.push(Worker { index, handle });
            senders.push(sender);
        }

        (Self { workers }, senders)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every unit to drain its queue and exit.
    ///
    /// Queues must already be closed (all senders dropped). Units still
    /// running after `timeout` are left to finish on their own.
    pub async fn shutdown(self, timeout: Duration) {
        let count = self.workers.len();
        let joins = self
            .workers
            .into_iter()
            .map(|worker| async move { (worker.index, worker.handle.await) });

        match tokio::time::timeout(timeout, join_all(joins)).await {
            Ok(results) => {
                for (index, result) in results {
                    if let Err(e) = result {
                        warn!(worker = index, error = %e, "worker task ended abnormally");
                    }
                }
                debug!(count, "all workers drained");
            }
            Err(_) => {
                warn!(
                    count,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for workers to drain their queues"
                );
            }
        }
    }
}

async fn run_worker(
    index: usize,
    mut receiver: mpsc::Receiver<KafkaMessage>,
    handler: Arc<dyn MessageHandler>,
    health: HealthHandle,
) {
    debug!(worker = index, "starting worker");
    health.report_idle();

    while let Some(message) = receiver.recv().await {
        health.report_busy();
        let start = Instant::now();

        // A panicking handler only loses the current message, the unit keeps going
        let outcome = AssertUnwindSafe(handler.handle(&message))
            .catch_unwind()
            .await;

        let status = match outcome {
            Ok(Ok(())) => "ok",
            Ok(Err(e)) => {
                error!(
                    worker = index,
                    topic = message.get_topic(),
                    partition = message.get_partition(),
                    offset = message.get_offset(),
                    error = ?e,
                    "handler failed, message dropped"
                );
                "error"
            }
            Err(panic) => {
                error!(
                    worker = index,
                    topic = message.get_topic(),
                    partition = message.get_partition(),
                    offset = message.get_offset(),
                    panic = panic_message(panic.as_ref()),
                    "handler panicked, message dropped"
                );
                "panic"
            }
        };

        metrics::counter!(WORKER_MESSAGES_HANDLED, "status" => status).increment(1);
        metrics::histogram!(WORKER_HANDLER_DURATION_MS).record(start.elapsed().as_millis() as f64);
        health.report_idle();
    }

    info!(worker = index, "worker queue closed, worker exiting");
    health.report_status(ComponentStatus::Stopped);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
