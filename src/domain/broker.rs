// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the broker-facing interface used by the connection
//! manager, publisher and subscriber. It intentionally avoids any reference to
//! a concrete client library; concrete implementations live under
//! `src/transport/`.
//!
//! The shape follows AMQP 0-9-1 closely (connection → channel → queue /
//! publish / consume / ack) because that is the delivery model the engine
//! relies on: durable queues, persistent messages, per-channel prefetch and
//! manual acknowledgement.
//!
//! Consumption is pull-based. [`BrokerChannel::basic_consume`] returns a
//! [`DeliveryStream`] backed by a bounded channel that the transport's reader
//! task feeds; the subscriber drains it at its own pace and settles each
//! [`Delivery`] explicitly.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The default (nameless) exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,

    /// Restricted to the declaring connection.
    pub exclusive: bool,

    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, long-lived queue; the only kind this crate declares.
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Per-message properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME type of the payload.
    pub content_type: Option<String>,

    /// Ask the broker to write the message to disk (delivery mode 2).
    pub persistent: bool,
}

impl MessageProperties {
    /// Persistent JSON message.
    pub fn persistent_json() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
        }
    }
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Target exchange; [`DEFAULT_EXCHANGE`] routes straight to a queue.
    pub exchange: String,

    /// Routing key; on the default exchange this is the queue name.
    pub routing_key: String,

    /// Encoded body.
    pub payload: Bytes,

    /// Delivery properties.
    pub properties: MessageProperties,

    /// Fail instead of silently dropping a message no queue can accept.
    pub mandatory: bool,
}

impl OutboundMessage {
    /// Durable JSON message for `queue` via the default exchange.
    pub fn to_queue(queue: &str, payload: Bytes) -> Self {
        // ---
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: queue.to_string(),
            payload,
            properties: MessageProperties::persistent_json(),
            mandatory: true,
        }
    }
}

/// Settles deliveries on behalf of the channel they arrived on.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    // ---
    /// Positively acknowledge a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledge a single delivery, optionally requeueing it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer, awaiting settlement.
///
/// A delivery that is dropped without being settled stays unacknowledged
/// until its channel closes, at which point the broker requeues it.
pub struct Delivery {
    // ---
    /// Channel-scoped identifier used to settle this delivery.
    pub delivery_tag: u64,

    /// Set when the broker has delivered this message before.
    pub redelivered: bool,

    /// Raw message body.
    pub payload: Bytes,

    /// Content type, if the publisher set one.
    pub content_type: Option<String>,

    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery settled through `acker`.
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        payload: Bytes,
        content_type: Option<String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            payload,
            content_type,
            acker,
        }
    }

    /// Acknowledge this delivery only (never cumulative).
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Reject this delivery only; `requeue` puts it back on the queue.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Pull side of a consumer.
///
/// The stream ends (`recv` returns `None`) when the consumer is cancelled,
/// its channel closes, or the connection drops.
pub struct DeliveryStream {
    // ---
    /// Receiver for deliveries from the transport's reader task.
    pub inbox: mpsc::Receiver<Delivery>,
}

impl DeliveryStream {
    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }
}

/// A lightweight session on a connection.
///
/// Channels are never shared between concurrent operations; each publish
/// opens its own and each subscription holds one for its lifetime.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    // ---
    /// Declare `queue`; a no-op if it already exists with the same flags.
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Limit unacknowledged deliveries outstanding on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Publish one message.
    async fn basic_publish(&self, message: OutboundMessage) -> Result<()>;

    /// Start a manual-acknowledgement consumer on `queue`.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the channel; unsettled deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn BrokerChannel>;

/// One physical broker connection.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    // ---
    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<ChannelPtr>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn BrokerConnection>;

/// Opens physical connections to a broker.
///
/// The connection manager calls [`connect`](Connector::connect) once per
/// attempt; implementations should not retry internally.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    // ---
    /// `host:port` or similar, used in log messages.
    fn endpoint(&self) -> String;

    /// Make one connection attempt.
    async fn connect(&self) -> Result<ConnectionPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
