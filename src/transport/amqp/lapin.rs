//! AMQP transport implementation using `lapin`.
//!
//! This module implements the domain broker traits on top of a RabbitMQ
//! (AMQP 0-9-1) connection.
//!
//! ## Concurrency model
//!
//! - `lapin::Connection` and `lapin::Channel` are internally synchronized and
//!   safe to call from any task; each wrapper here holds one of them.
//! - Every consumer gets a **reader task** that drains the `lapin::Consumer`
//!   stream and forwards deliveries into a bounded channel of capacity 1.
//!   The subscriber pulls from that channel, so broker delivery, local
//!   buffering and handler execution are decoupled.
//!
//! ## Connection behavior
//!
//! [`AmqpConnector::connect`] makes exactly one connection attempt. Retrying
//! is the connection manager's job.
//!
//! ## Publishing
//!
//! Channels are opened in publisher-confirm mode so that a `mandatory`
//! message the broker cannot route comes back as an error instead of
//! vanishing.

use std::sync::Arc;

use bytes::Bytes;
use futures_lite::stream::StreamExt;
use lapin::{
    //
    message::Delivery as LapinDelivery,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::mpsc;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Acknowledger,
    BrokerChannel,
    BrokerConnection,
    BrokerSettings,
    BusError,
    ChannelPtr,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    OutboundMessage,
    QueueOptions,
    Result,
};

/// AMQP delivery mode for messages written to disk.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections described by [`BrokerSettings`].
pub struct AmqpConnector {
    // ---
    settings: BrokerSettings,
}

impl AmqpConnector {
    /// Connector for the given broker settings.
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl Connector for AmqpConnector {
    // ---
    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }

    async fn connect(&self) -> Result<ConnectionPtr> {
        // ---
        log_debug!("connecting to AMQP broker at {}", self.endpoint());

        let uri = self.settings.amqp_uri();
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::ConnectionUnavailable(format!("amqp: connection failed: {e}")))?;

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

/// Creates a connector for an AMQP broker.
pub fn create_connector(settings: &BrokerSettings) -> ConnectorPtr {
    Arc::new(AmqpConnector::new(settings.clone()))
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    // ---
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<ChannelPtr> {
        // ---
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Transport(format!("amqp: channel creation failed: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Transport(format!("amqp: confirm select failed: {e}")))?;

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Normal shutdown".into())
            .await
            .map_err(|e| BusError::Transport(format!("amqp: connection close failed: {e}")))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    // ---
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<()> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };

        self.channel
            .queue_declare(queue.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| BusError::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_debug!("declared queue: {queue}");
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Transport(format!("amqp: qos failed: {e}")))
    }

    async fn basic_publish(&self, message: OutboundMessage) -> Result<()> {
        // ---
        let mut properties = BasicProperties::default();
        if let Some(content_type) = &message.properties.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }
        if message.properties.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            ..BasicPublishOptions::default()
        };

        let confirmation = self
            .channel
            .basic_publish(
                message.exchange.as_str().into(),
                message.routing_key.as_str().into(),
                options,
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Transport(format!("amqp: publish failed: {e}")))?
            .await
            .map_err(|e| BusError::Transport(format!("amqp: publish confirm failed: {e}")))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(BusError::Transport(format!(
                "amqp: message to '{}' was returned as unroutable",
                message.routing_key
            ))),
            Confirmation::Nack(_) => Err(BusError::Transport(format!(
                "amqp: broker rejected message to '{}'",
                message.routing_key
            ))),
        }
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        // ---
        let consumer_opts = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };

        let mut consumer = self
            .channel
            .basic_consume(queue.into(), consumer_tag.into(), consumer_opts, FieldTable::default())
            .await
            .map_err(|e| BusError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("started consuming queue: {queue}");

        let (tx, rx) = mpsc::channel(1);
        let queue = queue.to_string();

        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let content_type = delivery
                            .properties
                            .content_type()
                            .as_ref()
                            .map(|ct| ct.as_str().to_string());

                        let delivery = Delivery::new(
                            delivery.delivery_tag,
                            delivery.redelivered,
                            Bytes::copy_from_slice(&delivery.data),
                            content_type,
                            Box::new(LapinAcker { delivery }),
                        );

                        // Receiver gone: the subscription ended. Whatever is
                        // unsettled goes back to the queue when its channel closes.
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("consumer error on {queue}: {e}");
                        break;
                    }
                }
            }

            log_info!("consumer task ended for queue: {queue}");
        });

        Ok(DeliveryStream { inbox: rx })
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Normal shutdown".into())
            .await
            .map_err(|e| BusError::Transport(format!("amqp: channel close failed: {e}")))
    }
}

struct LapinAcker {
    delivery: LapinDelivery,
}

#[async_trait::async_trait]
impl Acknowledger for LapinAcker {
    // ---
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| BusError::Transport(format!("amqp: ack failed: {e}")))
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BusError::Transport(format!("amqp: nack failed: {e}")))
    }
}
