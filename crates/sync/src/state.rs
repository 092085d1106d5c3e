/// Connection state shared with the UI layer
///
/// One `ConnectionState` per sync context, published through a watch channel.
/// The supervisor is the only writer of transport fields; the fallback
/// controller owns `polling_fallback_active`.
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Transport-level connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Observable state of the realtime channel
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub transport_status: TransportStatus,
    /// Instant of the most recent inbound frame
    pub last_heartbeat: Option<Instant>,
    /// Reconnect attempts since the last successful connection
    pub reconnect_attempts: u32,
    /// Degraded snapshot polling is active
    pub polling_fallback_active: bool,
    /// Whether the channel connected at least once this session
    pub connected_once: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            transport_status: TransportStatus::Disconnected,
            last_heartbeat: None,
            reconnect_attempts: 0,
            polling_fallback_active: false,
            connected_once: false,
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.transport_status == TransportStatus::Connected
    }
}

/// Writer handle over the shared connection state
#[derive(Clone)]
pub struct ConnectionStateHandle {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionStateHandle {
    pub fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::default());
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn set_status(&self, status: TransportStatus) {
        self.tx.send_modify(|state| {
            state.transport_status = status;
            if status == TransportStatus::Connected {
                state.connected_once = true;
            }
        });
    }

    /// Any inbound frame counts as a heartbeat
    pub fn heartbeat(&self) {
        self.tx
            .send_modify(|state| state.last_heartbeat = Some(Instant::now()));
    }

    pub fn set_attempts(&self, attempts: u32) {
        self.tx
            .send_modify(|state| state.reconnect_attempts = attempts);
    }

    pub fn set_fallback(&self, active: bool) {
        self.tx
            .send_modify(|state| state.polling_fallback_active = active);
    }
}
