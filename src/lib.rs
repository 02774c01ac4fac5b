//! Durable, at-least-once publish/subscribe messaging for domain events
//!
//! This library sits between application code and a message broker. It owns
//! the broker connection (lazy, retried, shared), publishes JSON messages to
//! durable queues under a retry policy, and drives subscription handlers one
//! message at a time with manual acknowledgement.
//!
//! ```no_run
//! use mom_bus::{events::TaskCreatedEvent, BrokerSettings, HandlerResult, ServiceBusBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mom_bus::Result<()> {
//! let bus = ServiceBusBuilder::new(BrokerSettings::from_env()?).build()?;
//! let shutdown = CancellationToken::new();
//!
//! bus.subscribe(
//!     "task-created",
//!     |event: TaskCreatedEvent, _token| async move {
//!         println!("task {} created", event.id);
//!         HandlerResult::Ok(())
//!     },
//!     &shutdown,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```
//!

// Import all sub modules once...
mod macros;

mod connection;
mod consumer;
mod domain;
mod publisher;
mod service_bus;
mod subscriber;
mod transport;

mod bus_config;
mod error;
mod retry;

pub mod events;

pub(crate) use macros::{log_critical, log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use service_bus::{ServiceBus, ServiceBusBuilder};

pub use connection::{ChannelGuard, ConnectionManager, ConnectionManagerPtr, ConnectionStatus};
pub use publisher::Publisher;
pub use subscriber::{Subscriber, DEFAULT_PREFETCH};

pub use consumer::{log_event, spawn_task_consumers, ConsumerWorker, DEFAULT_RESTART_DELAY};

pub use bus_config::{env as settings_env, BrokerSettings};
pub use error::{BusError, HandlerError, HandlerResult, Result};
pub use retry::{retry_with_backoff, RetryError, RetryPolicy};

pub use transport::{MemoryBroker, QueueSnapshot, QueueStats, StoredMessage};

#[cfg(feature = "transport_lapin")]
pub use transport::{create_amqp_connector, AmqpConnector};

// --- public re-exports
pub use domain::{
    //
    Acknowledger,
    BrokerChannel,
    BrokerConnection,
    ChannelPtr,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    MessageProperties,
    OutboundMessage,
    QueueOptions,
    CONTENT_TYPE_JSON,
    DEFAULT_EXCHANGE,
};
