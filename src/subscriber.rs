//! Flow-controlled message consumption.
//!
//! [`Subscriber::subscribe`] binds a handler to a durable queue for as long as
//! its cancellation token stays live.
//!
//! # Delivery rules
//!
//! - prefetch 1: the broker never hands this consumer a second message while
//!   one is unacknowledged, so a queue is processed one message at a time
//! - handler success acks the message
//! - handler failure nacks it with requeue, so it will be delivered again
//! - a payload that does not decode is nacked without requeue and dropped
//! - a message that arrives after shutdown began is left unacknowledged and
//!   returns to the queue when the channel closes
//!
//! # Recovery
//!
//! When the broker stops delivering (connection lost, consumer cancelled by
//! the broker) the subscription releases its channel, waits one setup
//! backoff interval and subscribes again on a fresh connection.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    publisher::validate_queue,
    retry_with_backoff,
    BusError,
    ChannelGuard,
    ConnectionManager,
    Delivery,
    DeliveryStream,
    HandlerResult,
    QueueOptions,
    Result,
    RetryError,
    RetryPolicy,
};

/// Unacknowledged messages a subscription may hold at once.
pub const DEFAULT_PREFETCH: u16 = 1;

/// A consumer that finished setup and is receiving messages.
struct ActiveConsumer {
    channel: ChannelGuard,
    deliveries: DeliveryStream,
}

/// Why a receive loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    StreamEnded,
}

/// Consumes JSON messages from durable queues.
#[derive(Clone)]
pub struct Subscriber {
    // ---
    connection: Arc<ConnectionManager>,
    retry: RetryPolicy,
}

impl Subscriber {
    /// Subscriber on `connection` using [`RetryPolicy::operation`] for setup.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            retry: RetryPolicy::operation(),
        }
    }

    /// Replace the setup retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Feed messages from `queue` to `handler` until `cancel` fires.
    ///
    /// The handler receives each decoded message together with a token that
    /// fires when the subscription is shutting down. This call does not
    /// return while the subscription is live.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidArgument`] for a blank queue name
    /// - the last broker error if subscription setup failed on every retry
    /// - [`BusError::ConnectionUnavailable`] if a lost subscription could not
    ///   be re-established because the broker stayed unreachable
    ///
    /// An unreachable broker on the first setup, or cancellation at any
    /// point, returns `Ok(())` after logging.
    pub async fn subscribe<T, F, Fut>(
        &self,
        queue: &str,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerResult> + Send,
    {
        // ---
        validate_queue(queue)?;

        // Fires with the caller's token, and when this subscription ends.
        let token = cancel.child_token();
        let _token_guard = token.clone().drop_guard();
        let mut recovering = false;

        loop {
            let ActiveConsumer {
                channel,
                deliveries,
            } = match self.set_up(queue, cancel).await? {
                Some(active) => active,
                None if cancel.is_cancelled() => break,
                None if recovering => {
                    return Err(BusError::ConnectionUnavailable(format!(
                        "subscription to {queue} was lost and the broker is unreachable"
                    )));
                }
                None => return Ok(()),
            };

            let exit = receive_loop(queue, deliveries, &handler, &token).await;

            if let Err(e) = channel.release().await {
                log_warn!("failed to close channel for {queue}: {e}");
            }

            if exit == LoopExit::Shutdown {
                break;
            }

            let pause = self.retry.delay_for(1);
            log_warn!(
                "consumer for {queue} stopped receiving, resubscribing in {} ms",
                pause.as_millis()
            );
            recovering = true;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }

        log_info!("subscription to {queue} stopped");
        Ok(())
    }

    /// Run subscription setup under the retry policy.
    ///
    /// `Ok(None)` means no consumer was started because the broker is
    /// unreachable or `cancel` fired.
    async fn set_up(
        &self,
        queue: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ActiveConsumer>> {
        // ---
        let setup = retry_with_backoff(
            &self.retry,
            cancel,
            |err, delay, attempt| {
                log_warn!(
                    "subscribe to {queue} failed (retry {attempt}), retrying in {} ms: {err}",
                    delay.as_millis()
                );
            },
            || self.start_consumer(queue, cancel),
        )
        .await;

        match setup {
            Ok(active) => Ok(active),
            Err(RetryError::Cancelled) => {
                log_info!("subscription to {queue} cancelled during setup");
                Ok(None)
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                log_error!("failed to subscribe to {queue} after {attempts} attempts: {source}");
                Err(source)
            }
        }
    }

    async fn start_consumer(
        &self,
        queue: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ActiveConsumer>> {
        // ---
        if !self.connection.try_connect(cancel).await {
            log_error!("broker unavailable, not subscribing to {queue}");
            return Ok(None);
        }

        let channel = self.connection.create_channel().await?;

        let consumer_tag = format!("{queue}-{}", Uuid::new_v4());
        let started = async {
            channel.queue_declare(queue, QueueOptions::durable()).await?;
            channel.basic_qos(DEFAULT_PREFETCH).await?;
            channel.basic_consume(queue, &consumer_tag).await
        }
        .await;

        match started {
            Ok(deliveries) => {
                log_info!("subscribed to {queue} as {consumer_tag}");
                Ok(Some(ActiveConsumer {
                    channel,
                    deliveries,
                }))
            }
            Err(e) => {
                if let Err(close_err) = channel.release().await {
                    log_debug!("failed to release channel after setup error: {close_err}");
                }
                Err(e)
            }
        }
    }
}

async fn receive_loop<T, F, Fut>(
    queue: &str,
    mut deliveries: DeliveryStream,
    handler: &F,
    token: &CancellationToken,
) -> LoopExit
where
    T: DeserializeOwned,
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = HandlerResult>,
{
    // ---
    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                log_debug!("receive loop for {queue} exiting");
                return LoopExit::Shutdown;
            }

            next = deliveries.recv() => match next {
                Some(delivery) => process_delivery(queue, delivery, handler, token).await,
                None => return LoopExit::StreamEnded,
            },
        }
    }
}

async fn process_delivery<T, F, Fut>(
    queue: &str,
    delivery: Delivery,
    handler: &F,
    token: &CancellationToken,
) where
    T: DeserializeOwned,
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = HandlerResult>,
{
    // ---
    let tag = delivery.delivery_tag;

    if token.is_cancelled() {
        log_debug!("shutting down, leaving message {tag} on {queue} unacknowledged");
        return;
    }

    let message: T = match serde_json::from_slice(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            log_warn!("discarding malformed message {tag} on {queue}: {e}");
            if let Err(e) = delivery.nack(false).await {
                log_error!("failed to reject message {tag} on {queue}: {e}");
            }
            return;
        }
    };

    if delivery.redelivered {
        log_debug!("message {tag} on {queue} is a redelivery");
    }

    match handler(message, token.clone()).await {
        Ok(()) => match delivery.ack().await {
            Ok(()) => log_debug!("acknowledged message {tag} on {queue}"),
            Err(e) => log_error!("failed to acknowledge message {tag} on {queue}: {e}"),
        },
        Err(e) => {
            log_warn!("handler failed for message {tag} on {queue}, requeueing: {e}");
            if let Err(e) = delivery.nack(true).await {
                log_error!("failed to requeue message {tag} on {queue}: {e}");
            }
        }
    }
}
