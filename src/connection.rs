//! Broker connection management.
//!
//! [`ConnectionManager`] owns the single physical broker connection shared by
//! every publisher and subscriber in a process. It connects lazily and
//! reconnects on demand: callers ask [`ConnectionManager::try_connect`] before
//! each operation, and the manager either reports the live connection or
//! runs a fresh, retried connect.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──try_connect──▶ Connecting ──ok──▶ Connected
//!      ▲                            │                  │
//!      └──────── exhausted ─────────┘   connection lost (is_open = false)
//!      ▲                                               │
//!      └──────────────── next try_connect ─────────────┘
//!
//! any state ──dispose──▶ Disposed (terminal)
//! ```
//!
//! Only one task at a time may be in `Connecting`; that is what the async
//! connect lock guarantees. The state itself sits behind a short-lived
//! `RwLock` that is never held across an `.await`.

use std::ops::Deref;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    log_critical,
    log_debug,
    log_error,
    log_info,
    log_warn,
    retry_with_backoff,
    BrokerChannel,
    BrokerSettings,
    BusError,
    ChannelPtr,
    ConnectionPtr,
    ConnectorPtr,
    Result,
    RetryError,
    RetryPolicy,
};

enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(ConnectionPtr),
    Disposed,
}

/// Observable connection state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection; the next `try_connect` will open one.
    Disconnected,
    /// A connect is in progress.
    Connecting,
    /// A connection exists. It may have been lost since; see
    /// [`ConnectionManager::is_connected`].
    Connected,
    /// The manager has been shut down.
    Disposed,
}

fn read_ignore_poison<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    // ---
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_ignore_poison<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    // ---
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns the process-wide broker connection.
///
/// Share it between publishers and subscribers with an `Arc`:
///
/// ```
/// use std::sync::Arc;
/// use mom_bus::{ConnectionManager, MemoryBroker, RetryPolicy};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = MemoryBroker::new();
/// let manager = Arc::new(ConnectionManager::new(broker.connector(), RetryPolicy::none()));
///
/// assert!(manager.try_connect(&CancellationToken::new()).await);
/// assert!(manager.is_connected());
/// manager.dispose().await;
/// # }
/// ```
pub struct ConnectionManager {
    // ---
    connector: ConnectorPtr,
    retry: RetryPolicy,
    state: RwLock<ConnectionState>,
    connect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Manager connecting through `connector`, retrying connects per `retry`.
    pub fn new(connector: ConnectorPtr, retry: RetryPolicy) -> Self {
        // ---
        Self {
            connector,
            retry,
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: Mutex::new(()),
        }
    }

    /// Manager using the connect retry policy from `settings`.
    pub fn from_settings(settings: &BrokerSettings, connector: ConnectorPtr) -> Self {
        Self::new(connector, RetryPolicy::connect(settings))
    }

    /// Endpoint of the broker this manager connects to.
    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionStatus {
        // ---
        match &*read_ignore_poison(&self.state) {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
            ConnectionState::Disposed => ConnectionStatus::Disposed,
        }
    }

    /// Whether a connection exists and is still open.
    pub fn is_connected(&self) -> bool {
        // ---
        match &*read_ignore_poison(&self.state) {
            ConnectionState::Connected(conn) => conn.is_open(),
            _ => false,
        }
    }

    /// Make sure a connection is open, connecting if needed.
    ///
    /// Returns `true` when a usable connection exists afterwards. Returns
    /// `false`, without an error, when the broker stayed unreachable through
    /// every retry, when `cancel` fired, or when the manager is disposed.
    ///
    /// Concurrent callers are serialized: at most one connect runs at a
    /// time, and callers that queued behind it reuse its result.
    pub async fn try_connect(&self, cancel: &CancellationToken) -> bool {
        // ---
        if self.is_connected() {
            return true;
        }

        let _connect_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            guard = self.connect_lock.lock() => guard,
        };

        // Someone else may have connected (or disposed) while we waited.
        {
            let mut state = write_ignore_poison(&self.state);
            match &*state {
                ConnectionState::Disposed => {
                    log_debug!("connection manager disposed, not connecting");
                    return false;
                }
                ConnectionState::Connected(conn) if conn.is_open() => return true,
                _ => *state = ConnectionState::Connecting,
            }
        }

        let endpoint = self.connector.endpoint();
        log_info!("connecting to broker at {endpoint}");

        let result = retry_with_backoff(
            &self.retry,
            cancel,
            |err, delay, attempt| {
                log_warn!(
                    "connection attempt {attempt} to {endpoint} failed, retrying in {} ms: {err}",
                    delay.as_millis()
                );
            },
            || self.connector.connect(),
        )
        .await;

        match result {
            Ok(conn) => {
                let accepted = {
                    let mut state = write_ignore_poison(&self.state);
                    if matches!(*state, ConnectionState::Disposed) {
                        false
                    } else {
                        *state = ConnectionState::Connected(conn.clone());
                        true
                    }
                };

                if accepted {
                    log_info!("connected to broker at {endpoint}");
                    return true;
                }

                log_debug!("disposed during connect, closing new connection to {endpoint}");
                if let Err(e) = conn.close().await {
                    log_warn!("failed to close connection to {endpoint}: {e}");
                }
                false
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                log_critical!("broker unreachable at {endpoint} after {attempts} attempts: {source}");
                self.leave_connecting();
                false
            }
            Err(RetryError::Cancelled) => {
                log_info!("connect to {endpoint} cancelled");
                self.leave_connecting();
                false
            }
        }
    }

    fn leave_connecting(&self) {
        // ---
        let mut state = write_ignore_poison(&self.state);
        if matches!(*state, ConnectionState::Connecting) {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Open a channel on the current connection.
    ///
    /// Fails with [`BusError::NoConnection`] unless connected. The caller owns
    /// the returned guard and should [`release`](ChannelGuard::release) it.
    pub async fn create_channel(&self) -> Result<ChannelGuard> {
        // ---
        let conn = match &*read_ignore_poison(&self.state) {
            ConnectionState::Connected(conn) if conn.is_open() => conn.clone(),
            _ => return Err(BusError::NoConnection),
        };

        let channel = conn.create_channel().await?;
        Ok(ChannelGuard::new(channel))
    }

    /// Close the connection and shut the manager down.
    ///
    /// Idempotent. Close failures are logged, never returned. A disposed
    /// manager never connects again.
    pub async fn dispose(&self) {
        // ---
        let previous = std::mem::replace(
            &mut *write_ignore_poison(&self.state),
            ConnectionState::Disposed,
        );

        match previous {
            ConnectionState::Connected(conn) => match conn.close().await {
                Ok(()) => log_info!("broker connection closed"),
                Err(e) => log_error!("error closing broker connection: {e}"),
            },
            ConnectionState::Disposed => {}
            _ => log_debug!("connection manager disposed"),
        }
    }
}

/// A broker channel owned by one operation.
///
/// Dereferences to [`BrokerChannel`]. Call [`release`](Self::release) when
/// done; a guard dropped without release closes its channel in the
/// background, provided a Tokio runtime is still running.
pub struct ChannelGuard {
    // ---
    channel: ChannelPtr,
    released: bool,
}

impl ChannelGuard {
    fn new(channel: ChannelPtr) -> Self {
        Self {
            channel,
            released: false,
        }
    }

    /// Close the channel, returning unsettled deliveries to their queues.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.channel.close().await
    }
}

impl Deref for ChannelGuard {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        // ---
        if self.released {
            return;
        }

        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close().await {
                        log_debug!("background channel close failed: {e}");
                    }
                });
            }
            Err(_) => log_debug!("no runtime to close dropped channel"),
        }
    }
}

/// Shared connection manager pointer.
pub type ConnectionManagerPtr = Arc<ConnectionManager>;
