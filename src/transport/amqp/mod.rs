//! AMQP protocol transports.
//!
//! This module contains broker implementations for AMQP-based brokers.
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub use self::lapin::{create_connector as create_amqp_connector, AmqpConnector};
