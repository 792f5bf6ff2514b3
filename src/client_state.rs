/// file: src/client_state.rs
/// description: connection lifecycle state and client integrity counters
use std::fmt;
use std::sync::{
    Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        })
    }
}

/// Observable connection status. Only the connection manager writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_error: None,
        }
    }
}

pub type StatusSender = watch::Sender<ConnectionStatus>;
pub type StatusReceiver = watch::Receiver<ConnectionStatus>;

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    watch::channel(ConnectionStatus::default())
}

#[derive(Debug)]
pub struct ClientState {
    connection_id: StdMutex<String>,
    last_message_time: StdMutex<Option<Instant>>,
    last_disconnection_time: StdMutex<Option<Instant>>,
    pub total_messages_received: AtomicU64,

    // Push stream integrity tracking
    pub duplicate_bids: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub unknown_events: AtomicU64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            connection_id: StdMutex::new(uuid::Uuid::new_v4().to_string()),
            last_message_time: StdMutex::new(None),
            last_disconnection_time: StdMutex::new(None),
            total_messages_received: AtomicU64::new(0),
            duplicate_bids: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            unknown_events: AtomicU64::new(0),
        }
    }
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new session id; returns it.
    pub fn reset_connection(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        *lock(&self.connection_id) = id.clone();
        *lock(&self.last_message_time) = Some(Instant::now());
        id
    }

    pub fn connection_id(&self) -> String {
        lock(&self.connection_id).clone()
    }

    pub fn record_disconnect(&self) {
        *lock(&self.last_disconnection_time) = Some(Instant::now());
    }

    pub fn last_disconnection_time(&self) -> Option<Instant> {
        *lock(&self.last_disconnection_time)
    }

    pub fn record_message(&self) {
        *lock(&self.last_message_time) = Some(Instant::now());
        self.total_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_message_time(&self) -> Option<Instant> {
        *lock(&self.last_message_time)
    }

    pub fn record_duplicate_bid(&self) {
        self.duplicate_bids.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_event(&self) {
        self.unknown_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> ClientCounters {
        ClientCounters {
            messages: self.total_messages_received.load(Ordering::Relaxed),
            duplicate_bids: self.duplicate_bids.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientCounters {
    pub messages: u64,
    pub duplicate_bids: u64,
    pub malformed_frames: u64,
    pub unknown_events: u64,
}

pub type SharedClientState = Arc<ClientState>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn disconnect_time_tracks_latest_outage() {
        let state = ClientState::new();
        assert!(state.last_disconnection_time().is_none());

        state.record_disconnect();
        tokio::time::advance(Duration::from_secs(3)).await;
        let at = state.last_disconnection_time().unwrap();
        assert_eq!(at.elapsed(), Duration::from_secs(3));

        state.record_disconnect();
        assert!(state.last_disconnection_time().unwrap() > at);
    }
}
