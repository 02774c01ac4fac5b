// src/transport/memory/broker.rs

//! In-memory broker implementation.
//!
//! This file contains a concrete implementation of the domain-level
//! [`Connector`] / [`BrokerConnection`] / [`BrokerChannel`] traits using
//! in-process data structures only.
//!
//! All broker state lives behind one mutex that is never held across an
//! `.await`. Deliveries are pushed into each consumer's bounded inbox with
//! `try_send` while the lock is held, so the view of "ready" versus
//! "unacknowledged" messages is always consistent.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    // ---
    Acknowledger,
    BrokerChannel,
    BrokerConnection,
    BusError,
    ChannelPtr,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    MessageProperties,
    OutboundMessage,
    QueueOptions,
    Result,
    DEFAULT_EXCHANGE,
};

/// Inbox capacity for consumers without a prefetch limit.
const UNLIMITED_INBOX: usize = 256;

/// A message held by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Message body.
    pub payload: Bytes,
    /// Properties supplied by the publisher.
    pub properties: MessageProperties,
    /// Whether the message has been delivered before.
    pub redelivered: bool,
}

/// Lifetime counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: usize,
    pub delivered: usize,
    pub acked: usize,
    pub requeued: usize,
    pub discarded: usize,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    /// Flags the queue was declared with.
    pub options: QueueOptions,
    /// Messages waiting for a consumer, head first.
    pub ready: Vec<StoredMessage>,
    /// Messages delivered but not yet settled.
    pub unacked: usize,
    /// Active consumers.
    pub consumers: usize,
    /// Lifetime counters.
    pub stats: QueueStats,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct ConsumerSlot {
    channel_id: u64,
    tag: String,
    sender: mpsc::Sender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    stats: QueueStats,
}

#[derive(Default)]
struct State {
    reachable: bool,
    failing_connects: u32,
    failing_publishes: u32,
    connect_delay: Duration,
    next_id: u64,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    queues: HashMap<String, QueueState>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Shared {
    endpoint: String,
    state: Mutex<State>,
    connect_calls: AtomicUsize,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process message broker.
///
/// Reproduces the parts of AMQP 0-9-1 the bus depends on:
///
/// - queues declared with durability flags; re-declaring with different
///   flags fails
/// - publishing through the default exchange, with `mandatory` messages to a
///   missing queue rejected
/// - per-channel prefetch limiting unacknowledged deliveries
/// - ack, nack with and without requeue; requeued messages go back to the
///   head of the queue flagged as redelivered
/// - closing a channel or connection requeues everything it left unsettled
///
/// It also offers fault injection (unreachable broker, failing connects or
/// publishes, slow connects) and inspection helpers for tests.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a reachable, empty broker.
    pub fn new() -> Self {
        Self::with_endpoint("memory")
    }

    /// Create a broker reporting `endpoint` in log messages.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        // ---
        let state = State {
            reachable: true,
            ..State::default()
        };

        Self {
            shared: Arc::new(Shared {
                endpoint: endpoint.into(),
                state: Mutex::new(state),
                connect_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Connector opening connections to this broker.
    pub fn connector(&self) -> ConnectorPtr {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock_ignore_poison(&self.shared.state)
    }

    // --------------------
    // Fault injection
    // --------------------

    /// Refuse (or accept again) every connection attempt.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().failing_publishes = count;
    }

    /// Delay every connection attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Drop every open connection from the broker side.
    pub fn sever_connections(&self) {
        // ---
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.iter().copied().collect();
        for id in ids {
            close_connection(&self.shared, &mut state, id);
        }
    }

    // --------------------
    // Inspection
    // --------------------

    /// Number of connection attempts made so far.
    pub fn connect_calls(&self) -> usize {
        self.shared.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    /// Snapshot of `queue`, if it has been declared.
    pub fn queue(&self, queue: &str) -> Option<QueueSnapshot> {
        // ---
        let state = self.state();
        let q = state.queues.get(queue)?;

        let unacked = state
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|u| u.queue == queue)
            .count();

        Some(QueueSnapshot {
            options: q.options,
            ready: q.ready.iter().cloned().collect(),
            unacked,
            consumers: q.consumers.len(),
            stats: q.stats.clone(),
        })
    }

    /// Enqueue raw bytes on an existing queue, bypassing any client.
    ///
    /// Useful for injecting payloads a well-behaved publisher would never
    /// produce.
    pub fn inject(&self, queue: &str, payload: impl Into<Bytes>) -> Result<()> {
        // ---
        let mut state = self.state();
        let message = StoredMessage {
            payload: payload.into(),
            properties: MessageProperties::persistent_json(),
            redelivered: false,
        };
        enqueue(&mut state, queue, message, true)?;
        dispatch(&self.shared, &mut state, queue);
        Ok(())
    }
}

// --------------------
// Broker operations (state lock held by caller)
// --------------------

fn enqueue(state: &mut State, queue: &str, message: StoredMessage, mandatory: bool) -> Result<()> {
    // ---
    match state.queues.get_mut(queue) {
        Some(q) => {
            q.ready.push_back(message);
            q.stats.published += 1;
            Ok(())
        }
        None if mandatory => Err(BusError::Transport(format!(
            "NO_ROUTE - message to '{queue}' is unroutable"
        ))),
        None => Ok(()),
    }
}

/// Push ready messages of `queue` to consumers with spare prefetch capacity.
fn dispatch(shared: &Arc<Shared>, state: &mut State, queue: &str) {
    // ---
    let State {
        queues, channels, ..
    } = state;

    let Some(q) = queues.get_mut(queue) else {
        return;
    };

    loop {
        if q.ready.is_empty() || q.consumers.is_empty() {
            break;
        }

        let count = q.consumers.len();
        let mut delivered = false;
        let mut dead = Vec::new();

        for offset in 0..count {
            let idx = (q.next_consumer + offset) % count;
            let slot = &q.consumers[idx];

            let Some(channel) = channels.get_mut(&slot.channel_id) else {
                dead.push(idx);
                continue;
            };
            if channel.prefetch != 0 && channel.unacked.len() >= channel.prefetch as usize {
                continue;
            }

            let Some(message) = q.ready.pop_front() else {
                break;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery::new(
                tag,
                message.redelivered,
                message.payload.clone(),
                message.properties.content_type.clone(),
                Box::new(MemoryAcker {
                    shared: Arc::downgrade(shared),
                    channel_id: slot.channel_id,
                }),
            );

            match slot.sender.try_send(delivery) {
                Ok(()) => {
                    channel.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue.to_string(),
                            message,
                        },
                    );
                    q.stats.delivered += 1;
                    q.next_consumer = idx + 1;
                    delivered = true;
                    break;
                }
                Err(TrySendError::Full(_)) => {
                    q.ready.push_front(message);
                }
                Err(TrySendError::Closed(_)) => {
                    q.ready.push_front(message);
                    dead.push(idx);
                }
            }
        }

        if !dead.is_empty() {
            dead.sort_unstable();
            for idx in dead.into_iter().rev() {
                q.consumers.remove(idx);
            }
            q.next_consumer = 0;
        }

        if !delivered {
            break;
        }
    }
}

fn settle(shared: &Arc<Shared>, channel_id: u64, tag: u64, outcome: Settle) -> Result<()> {
    // ---
    let mut state = lock_ignore_poison(&shared.state);

    let channel = state
        .channels
        .get_mut(&channel_id)
        .ok_or_else(|| BusError::Transport(format!("channel {channel_id} is closed")))?;

    let Unacked { queue, mut message } = channel.unacked.remove(&tag).ok_or_else(|| {
        BusError::Transport(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
    })?;

    if let Some(q) = state.queues.get_mut(&queue) {
        match outcome {
            Settle::Ack => q.stats.acked += 1,
            Settle::Requeue => {
                message.redelivered = true;
                q.ready.push_front(message);
                q.stats.requeued += 1;
            }
            Settle::Discard => q.stats.discarded += 1,
        }
    }

    dispatch(shared, &mut state, &queue);
    Ok(())
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

/// Close a channel: drop its consumers and requeue its unsettled deliveries.
///
/// Returns the queues whose messages or consumers changed; the caller
/// dispatches them once it has finished tearing down.
fn close_channel(state: &mut State, channel_id: u64) -> Vec<String> {
    // ---
    let Some(channel) = state.channels.remove(&channel_id) else {
        return Vec::new();
    };

    let mut touched: Vec<String> = Vec::new();

    // Newest first, so the oldest delivery ends up at the head.
    for (_, Unacked { queue, mut message }) in channel.unacked.into_iter().rev() {
        if let Some(q) = state.queues.get_mut(&queue) {
            message.redelivered = true;
            q.ready.push_front(message);
            q.stats.requeued += 1;
        }
        if !touched.contains(&queue) {
            touched.push(queue);
        }
    }

    for (name, q) in state.queues.iter_mut() {
        let before = q.consumers.len();
        q.consumers.retain(|slot| slot.channel_id != channel_id);
        if q.consumers.len() != before {
            q.next_consumer = 0;
            if !touched.contains(name) {
                touched.push(name.clone());
            }
        }
    }

    touched
}

fn close_connection(shared: &Arc<Shared>, state: &mut State, connection_id: u64) {
    // ---
    if !state.connections.remove(&connection_id) {
        return;
    }

    let channel_ids: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, ch)| ch.connection_id == connection_id)
        .map(|(id, _)| *id)
        .collect();

    // Tear down every channel first so nothing is handed to a consumer
    // that is about to disappear with this connection.
    let mut touched: Vec<String> = Vec::new();
    for id in channel_ids {
        for queue in close_channel(state, id) {
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
    }

    for queue in touched {
        dispatch(shared, state, &queue);
    }
}

// --------------------
// Connector / connection / channel
// --------------------

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    // ---
    fn endpoint(&self) -> String {
        self.broker.shared.endpoint.clone()
    }

    async fn connect(&self) -> Result<ConnectionPtr> {
        // ---
        self.broker.shared.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.broker.state().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.state();

        if !state.reachable {
            return Err(BusError::ConnectionUnavailable(format!(
                "connection refused by {}",
                self.broker.shared.endpoint
            )));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::ConnectionUnavailable(format!(
                "simulated connect failure at {}",
                self.broker.shared.endpoint
            )));
        }

        let id = state.next_id();
        state.connections.insert(id);

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    // ---
    fn is_open(&self) -> bool {
        self.broker
            .state()
            .connections
            .contains(&self.id)
    }

    async fn create_channel(&self) -> Result<ChannelPtr> {
        // ---
        let mut state = self.broker.state();

        if !state.connections.contains(&self.id) {
            return Err(BusError::Transport(format!("connection {} is closed", self.id)));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        close_connection(&self.broker.shared, &mut self.broker.state(), self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>> {
        // ---
        let state = self.broker.state();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BusError::Transport(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    // ---
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<()> {
        // ---
        let mut state = self.open_state()?;

        match state.queues.get(queue) {
            Some(existing) if existing.options != options => Err(BusError::Transport(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{queue}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.to_string(),
                    QueueState {
                        options,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                        stats: QueueStats::default(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        // ---
        let mut state = self.open_state()?;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }

        let queues: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.consumers.iter().any(|c| c.channel_id == self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in queues {
            dispatch(&self.broker.shared, &mut state, &queue);
        }
        Ok(())
    }

    async fn basic_publish(&self, message: OutboundMessage) -> Result<()> {
        // ---
        let mut state = self.open_state()?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BusError::Transport("simulated publish failure".into()));
        }
        if message.exchange != DEFAULT_EXCHANGE {
            return Err(BusError::Transport(format!(
                "NOT_FOUND - no exchange '{}'",
                message.exchange
            )));
        }

        let queue = message.routing_key;
        let stored = StoredMessage {
            payload: message.payload,
            properties: message.properties,
            redelivered: false,
        };
        enqueue(&mut state, &queue, stored, message.mandatory)?;
        dispatch(&self.broker.shared, &mut state, &queue);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        // ---
        let mut state = self.open_state()?;

        let prefetch = state.channels.get(&self.id).map(|ch| ch.prefetch).unwrap_or(0);
        let capacity = if prefetch == 0 {
            UNLIMITED_INBOX
        } else {
            prefetch as usize
        };

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;

        if q.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(BusError::Transport(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }

        let (tx, rx) = mpsc::channel(capacity);
        q.consumers.push(ConsumerSlot {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            sender: tx,
        });

        dispatch(&self.broker.shared, &mut state, queue);
        Ok(DeliveryStream { inbox: rx })
    }

    async fn close(&self) -> Result<()> {
        // ---
        let mut state = self.broker.state();
        for queue in close_channel(&mut state, self.id) {
            dispatch(&self.broker.shared, &mut state, &queue);
        }
        Ok(())
    }
}

struct MemoryAcker {
    shared: Weak<Shared>,
    channel_id: u64,
}

impl MemoryAcker {
    fn broker(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| BusError::Transport("broker has shut down".into()))
    }
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    // ---
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        settle(&self.broker()?, self.channel_id, delivery_tag, Settle::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::Discard
        };
        settle(&self.broker()?, self.channel_id, delivery_tag, outcome)
    }
}
