/// file: src/events.rs
/// description: event bus between the engine and whatever renders it
use crate::{
    client_state::ConnectionState,
    types::{AuctionId, Money, NotificationItem},
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidPhase {
    Pending,
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionChanged {
        state: ConnectionState,
        retry_count: u32,
    },
    SnapshotUpdated {
        auction_id: AuctionId,
    },
    HistoryUpdated {
        auction_id: AuctionId,
    },
    /// The auction is about to close; drive a countdown.
    EndingSoon {
        auction_id: AuctionId,
    },
    Toast {
        level: ToastLevel,
        message: String,
    },
    NotificationAdded(Box<NotificationItem>),
    UnreadCountChanged(usize),
    BidStateChanged {
        auction_id: AuctionId,
        amount: Option<Money>,
        phase: BidPhase,
    },
    /// Cached listing views for this auction hold stale prices.
    ListingsInvalidated {
        auction_id: AuctionId,
    },
}

// Slow renderers lag rather than block the push pipeline; a lagged receiver
// skips ahead and re-reads state.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

pub type EventSender = broadcast::Sender<ClientEvent>;
pub type EventReceiver = broadcast::Receiver<ClientEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Publishes an event; having no listeners is not an error.
pub fn publish(sender: &EventSender, event: ClientEvent) {
    let _ = sender.send(event);
}
