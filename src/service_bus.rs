//! Service bus facade.
//!
//! [`ServiceBus`] bundles one shared [`ConnectionManager`] with a
//! [`Publisher`] and a [`Subscriber`], which is how applications normally use
//! this crate: build one bus at startup, clone it into every producer and
//! consumer, and dispose of it at shutdown.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    events::TaskEvent,
    BrokerSettings,
    ConnectionManager,
    ConnectorPtr,
    HandlerResult,
    Publisher,
    Result,
    RetryPolicy,
    Subscriber,
};

/// Builder for [`ServiceBus`].
///
/// # Examples
///
/// ## In-process broker
/// ```
/// use mom_bus::{BrokerSettings, MemoryBroker, ServiceBusBuilder};
///
/// # fn example() -> mom_bus::Result<()> {
/// let broker = MemoryBroker::new();
/// let bus = ServiceBusBuilder::new(BrokerSettings::default())
///     .connector(broker.connector())
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## RabbitMQ from the environment
/// ```no_run
/// use mom_bus::{BrokerSettings, ServiceBusBuilder};
///
/// # fn example() -> mom_bus::Result<()> {
/// let bus = ServiceBusBuilder::new(BrokerSettings::from_env()?).build()?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBusBuilder {
    // ---
    settings: BrokerSettings,
    connector: Option<ConnectorPtr>,

    // Retry overrides (all optional)
    connect_retry: Option<RetryPolicy>,
    operation_retry: Option<RetryPolicy>,
}

impl ServiceBusBuilder {
    /// Start a builder for a broker described by `settings`.
    pub fn new(settings: BrokerSettings) -> Self {
        // ---
        Self {
            settings,
            connector: None,
            connect_retry: None,
            operation_retry: None,
        }
    }

    /// Connect through `connector` instead of the default AMQP transport.
    pub fn connector(mut self, connector: ConnectorPtr) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the connect retry policy.
    ///
    /// Default: [`RetryPolicy::connect`] from the settings.
    pub fn connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = Some(policy);
        self
    }

    /// Override the publish / subscribe-setup retry policy.
    ///
    /// Default: [`RetryPolicy::operation`].
    pub fn operation_retry(mut self, policy: RetryPolicy) -> Self {
        self.operation_retry = Some(policy);
        self
    }

    /// Build the bus. No connection is made until first use.
    pub fn build(self) -> Result<ServiceBus> {
        // ---
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&self.settings)?,
        };

        let connect_retry = self
            .connect_retry
            .unwrap_or_else(|| RetryPolicy::connect(&self.settings));
        let operation_retry = self.operation_retry.unwrap_or_else(RetryPolicy::operation);

        let connection = Arc::new(ConnectionManager::new(connector, connect_retry));

        Ok(ServiceBus {
            publisher: Publisher::new(connection.clone()).with_retry(operation_retry.clone()),
            subscriber: Subscriber::new(connection.clone()).with_retry(operation_retry),
            connection,
        })
    }
}

#[cfg(feature = "transport_lapin")]
fn default_connector(settings: &BrokerSettings) -> Result<ConnectorPtr> {
    Ok(crate::create_amqp_connector(settings))
}

#[cfg(not(feature = "transport_lapin"))]
fn default_connector(_settings: &BrokerSettings) -> Result<ConnectorPtr> {
    Err(crate::BusError::Config(
        "no connector given and the transport_lapin feature is disabled".to_string(),
    ))
}

/// Publish/subscribe entry point sharing one broker connection.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ServiceBus {
    // ---
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    subscriber: Subscriber,
}

impl ServiceBus {
    /// Shortcut for `ServiceBusBuilder::new(settings).connector(connector).build()`.
    pub fn new(settings: BrokerSettings, connector: ConnectorPtr) -> Result<Self> {
        ServiceBusBuilder::new(settings).connector(connector).build()
    }

    /// The shared connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Publish `message` as JSON to `queue`. See [`Publisher::send_message`].
    pub async fn send_message<T>(
        &self,
        message: &T,
        queue: &str,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.send_message(message, queue, cancel).await
    }

    /// Publish a task event to its own queue.
    pub async fn publish<E: TaskEvent>(&self, event: &E, cancel: &CancellationToken) -> Result<()> {
        self.publisher.send_message(event, E::QUEUE, cancel).await
    }

    /// Consume `queue` until `cancel` fires. See [`Subscriber::subscribe`].
    pub async fn subscribe<T, F, Fut>(
        &self,
        queue: &str,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        T: serde::de::DeserializeOwned + Send,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerResult> + Send,
    {
        self.subscriber.subscribe(queue, handler, cancel).await
    }

    /// Close the connection. Every clone of this bus stops working.
    pub async fn dispose(&self) {
        self.connection.dispose().await;
    }
}
