//! Domain layer public interface.
//!
//! This module defines broker-level abstractions that are independent of
//! any client library or wire protocol implementation.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;

// --- Broker domain re-exports ---

pub use broker::{
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
