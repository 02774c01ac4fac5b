//! Long-running background consumers.
//!
//! A [`ConsumerWorker`] keeps one subscription alive for the lifetime of the
//! process. When the subscription fails, or ends before shutdown was
//! requested (for example because the broker was unreachable), the worker
//! logs, waits a fixed delay and subscribes again.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    events::{TaskAssignedEvent, TaskCreatedEvent, TaskEvent, TaskUpdatedEvent},
    log_error,
    log_info,
    log_warn,
    HandlerError,
    HandlerResult,
    ServiceBus,
};

/// Wait between a failed subscription and the next attempt.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Keeps a subscription to one queue running until shutdown.
#[derive(Debug, Clone)]
pub struct ConsumerWorker {
    // ---
    queue: String,
    restart_delay: Duration,
}

impl ConsumerWorker {
    /// Worker for `queue`.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    /// Worker for the queue an event type is published to.
    pub fn for_event<E: TaskEvent>() -> Self {
        Self::new(E::QUEUE)
    }

    /// Set the wait before resubscribing.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Queue this worker consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Run the subscription until `cancel` fires, restarting it as needed.
    pub async fn run<T, F, Fut>(&self, bus: &ServiceBus, handler: F, cancel: &CancellationToken)
    where
        T: DeserializeOwned + Send,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerResult> + Send,
    {
        // ---
        let queue = self.queue.as_str();
        log_info!("starting consumer for {queue}");

        loop {
            let result = bus.subscribe(queue, &handler, cancel).await;

            if cancel.is_cancelled() {
                break;
            }

            let delay_secs = self.restart_delay.as_secs_f64();
            match result {
                Ok(()) => log_warn!(
                    "subscription to {queue} ended before shutdown, restarting in {delay_secs}s"
                ),
                Err(e) => log_error!("consumer for {queue} failed: {e}, restarting in {delay_secs}s"),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(self.restart_delay) => {}
            }
        }

        log_info!("consumer for {queue} stopped");
    }

    /// Run the worker on its own task.
    pub fn spawn<T, F, Fut>(
        self,
        bus: ServiceBus,
        handler: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        tokio::spawn(async move { self.run(&bus, handler, &cancel).await })
    }
}

/// Handler that logs a task event and acknowledges it.
pub async fn log_event<E: TaskEvent>(event: E, cancel: CancellationToken) -> HandlerResult {
    // ---
    log_info!("processing {}: {}", E::QUEUE, event.summary());

    if cancel.is_cancelled() {
        return Err(HandlerError::Cancelled);
    }
    Ok(())
}

/// Spawn one logging consumer per task event queue.
pub fn spawn_task_consumers(bus: &ServiceBus, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    // ---
    vec![
        ConsumerWorker::for_event::<TaskCreatedEvent>().spawn(
            bus.clone(),
            log_event::<TaskCreatedEvent>,
            cancel.clone(),
        ),
        ConsumerWorker::for_event::<TaskUpdatedEvent>().spawn(
            bus.clone(),
            log_event::<TaskUpdatedEvent>,
            cancel.clone(),
        ),
        ConsumerWorker::for_event::<TaskAssignedEvent>().spawn(
            bus.clone(),
            log_event::<TaskAssignedEvent>,
            cancel.clone(),
        ),
    ]
}
