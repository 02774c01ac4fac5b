// src/transport/memory/mod.rs

//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! broker traits. It is intended primarily for testing, local execution, and
//! as the reference for the delivery semantics the bus relies on.
//!
//! ## Reference Semantics
//!
//! - Queues are declared idempotently; re-declaring with different flags fails.
//! - A channel with prefetch `n` never holds more than `n` unsettled deliveries.
//! - `nack(requeue = true)` and closing a channel put messages back at the
//!   head of their queue, flagged as redelivered.
//! - `nack(requeue = false)` discards the message for good.
//!
//! ## Non-Goals
//!
//! Persistence across process restarts, exchanges other than the default
//! one, and publisher confirms are not modelled. Durability and persistence
//! flags are recorded so callers can assert on them.

mod broker;

pub use broker::{MemoryBroker, QueueSnapshot, QueueStats, StoredMessage};
