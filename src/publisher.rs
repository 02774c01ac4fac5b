//! Durable message publishing.
//!
//! [`Publisher::send_message`] serializes a value to JSON once and then, under
//! the operation retry policy, makes sure the broker is reachable, declares
//! the target queue and publishes a persistent, mandatory message to it
//! through the default exchange.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    retry_with_backoff,
    BusError,
    ConnectionManager,
    OutboundMessage,
    QueueOptions,
    Result,
    RetryError,
    RetryPolicy,
};

/// Reject empty or blank queue names before any I/O.
pub(crate) fn validate_queue(queue: &str) -> Result<()> {
    // ---
    if queue.trim().is_empty() {
        return Err(BusError::InvalidArgument(
            "queue name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Serialize `message` to JSON, rejecting values that encode as `null`.
fn encode<T>(message: &T) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    // ---
    let json = serde_json::to_vec(message)?;
    if json == b"null" {
        return Err(BusError::InvalidArgument(
            "message must not be null".to_string(),
        ));
    }
    Ok(Bytes::from(json))
}

/// Publishes JSON messages to durable queues.
///
/// Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct Publisher {
    // ---
    connection: Arc<ConnectionManager>,
    retry: RetryPolicy,
}

impl Publisher {
    /// Publisher on `connection` using [`RetryPolicy::operation`].
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            retry: RetryPolicy::operation(),
        }
    }

    /// Replace the per-publish retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish `message` as JSON to `queue`.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidArgument`] for a blank queue name or a message
    ///   that serializes to `null`, before any I/O
    /// - [`BusError::Serialization`] if the message cannot be serialized
    /// - the last broker error once every retry has failed
    /// - [`BusError::Cancelled`] if `cancel` fires while waiting to retry
    ///
    /// If the broker cannot be reached at all the message is dropped: the
    /// failure is logged and `Ok(())` is returned.
    pub async fn send_message<T>(
        &self,
        message: &T,
        queue: &str,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        // ---
        validate_queue(queue)?;
        let payload = encode(message)?;

        let result = retry_with_backoff(
            &self.retry,
            cancel,
            |err, delay, attempt| {
                log_warn!(
                    "publish to {queue} failed (retry {attempt}), retrying in {} ms: {err}",
                    delay.as_millis()
                );
            },
            || self.publish_once(queue, payload.clone(), cancel),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Exhausted { attempts, source }) => {
                log_error!("failed to publish to {queue} after {attempts} attempts: {source}");
                Err(source)
            }
            Err(RetryError::Cancelled) => {
                log_info!("publish to {queue} cancelled");
                Err(BusError::Cancelled)
            }
        }
    }

    async fn publish_once(
        &self,
        queue: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // ---
        if !self.connection.try_connect(cancel).await {
            log_error!("broker unavailable, message for {queue} was not published");
            return Ok(());
        }

        let channel = self.connection.create_channel().await?;

        let outcome = async {
            channel.queue_declare(queue, QueueOptions::durable()).await?;
            channel
                .basic_publish(OutboundMessage::to_queue(queue, payload))
                .await
        }
        .await;

        if let Err(e) = channel.release().await {
            log_debug!("failed to release publish channel: {e}");
        }

        outcome?;
        log_info!("published message to {queue}");
        Ok(())
    }
}
