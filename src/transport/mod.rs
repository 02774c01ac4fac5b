//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level broker
//! traits. Library-backed transports are hidden behind feature flags and
//! exposed only through their connector types and constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::{create_amqp_connector, AmqpConnector};

pub use memory::{MemoryBroker, QueueSnapshot, QueueStats, StoredMessage};
