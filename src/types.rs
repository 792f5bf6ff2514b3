/// file: src/types.rs
/// description: auction data model, push envelopes and REST payloads
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AuctionId = i64;
pub type BidId = i64;
/// Whole currency units. Auction prices are never fractional.
pub type Money = i64;

pub mod topics {
    use super::AuctionId;

    pub const AUCTION_PREFIX: &str = "/topic/auction/";
    pub const USER_PREFIX: &str = "/queue/user/";

    pub fn auction(auction_id: AuctionId) -> String {
        format!("{AUCTION_PREFIX}{auction_id}")
    }

    pub fn user_notifications(user_id: &str) -> String {
        format!("{USER_PREFIX}{user_id}/notifications")
    }

    /// Extracts the auction id from an auction topic.
    pub fn auction_id(topic: &str) -> Option<AuctionId> {
        topic.strip_prefix(AUCTION_PREFIX)?.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Scheduled,
    InProgress,
    EndingSoon,
    Ended,
    Cancelled,
}

impl AuctionStatus {
    /// Lifecycle position. Push events may only move an auction forward.
    pub fn rank(self) -> u8 {
        match self {
            AuctionStatus::Scheduled => 0,
            AuctionStatus::InProgress => 1,
            AuctionStatus::EndingSoon => 2,
            AuctionStatus::Ended | AuctionStatus::Cancelled => 3,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, AuctionStatus::InProgress | AuctionStatus::EndingSoon)
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuctionStatus::Scheduled => "SCHEDULED",
            AuctionStatus::InProgress => "IN_PROGRESS",
            AuctionStatus::EndingSoon => "ENDING_SOON",
            AuctionStatus::Ended => "ENDED",
            AuctionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub auction_id: AuctionId,
    pub status: AuctionStatus,
    #[serde(default)]
    pub current_highest_bid: Option<Money>,
    pub starting_price: Money,
    #[serde(default)]
    pub buy_it_now_price: Option<Money>,
    pub bid_unit: Money,
    #[serde(default)]
    pub total_bids: u64,
    #[serde(default)]
    pub total_bidders: u64,
    #[serde(default)]
    pub current_winner_nickname: Option<String>,
    pub scheduled_end_time: DateTime<Utc>,
}

impl AuctionSnapshot {
    /// The amount a new bid has to exceed.
    pub fn price_floor(&self) -> Money {
        self.current_highest_bid
            .filter(|bid| *bid > 0)
            .unwrap_or(self.starting_price)
    }
}

/// Lightweight live status returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    pub auction_id: AuctionId,
    pub status: AuctionStatus,
    #[serde(default)]
    pub current_highest_bid: Option<Money>,
    pub bid_unit: Money,
    #[serde(default)]
    pub total_bids: u64,
    #[serde(default)]
    pub total_bidders: u64,
    #[serde(default)]
    pub current_winner_nickname: Option<String>,
    #[serde(default)]
    pub scheduled_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidEvent {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub bid_amount: Money,
    pub bidder_nickname: String,
    pub bid_time: DateTime<Utc>,
    #[serde(default)]
    pub is_auto_bid: bool,
    #[serde(default)]
    pub is_winning: bool,
    #[serde(default)]
    pub is_my_bid: bool,
}

impl BidEvent {
    pub fn bid_time_local(&self) -> DateTime<Local> {
        self.bid_time.with_timezone(&Local)
    }
}

// Push envelope payloads

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPayload {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub bid_amount: Money,
    pub bidder_nickname: String,
    pub bid_time: DateTime<Utc>,
    #[serde(default)]
    pub is_auto_bid: bool,
    #[serde(default)]
    pub total_bids: Option<u64>,
    #[serde(default)]
    pub total_bidders: Option<u64>,
}

impl BidPayload {
    pub fn to_bid_event(&self) -> BidEvent {
        BidEvent {
            bid_id: self.bid_id,
            auction_id: self.auction_id,
            bid_amount: self.bid_amount,
            bidder_nickname: self.bidder_nickname.clone(),
            bid_time: self.bid_time,
            is_auto_bid: self.is_auto_bid,
            is_winning: false,
            is_my_bid: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutbidPayload {
    #[serde(flatten)]
    pub bid: BidPayload,
    #[serde(default)]
    pub previous_bidder_id: Option<String>,
    #[serde(default)]
    pub previous_bidder_nickname: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionNotice {
    pub auction_id: AuctionId,
    #[serde(default)]
    pub notification_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub product_image: Option<String>,
    #[serde(default)]
    pub amount: Option<Money>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub scheduled_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidderCountPayload {
    pub auction_id: AuctionId,
    pub total_bidders: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    pub auction_id: AuctionId,
    #[serde(default)]
    pub status: Option<AuctionStatus>,
    #[serde(default)]
    pub current_highest_bid: Option<Money>,
    #[serde(default)]
    pub total_bids: Option<u64>,
    #[serde(default)]
    pub total_bidders: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLostPayload {
    pub reason: String,
    #[serde(default)]
    pub retry_in_ms: Option<u64>,
}

/// Every push message the engine understands, tagged by the envelope `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushEvent {
    NewBid(BidPayload),
    BidOutbid(OutbidPayload),
    AuctionEndingSoon(AuctionNotice),
    AuctionEnded(AuctionNotice),
    AuctionCancelled(AuctionNotice),
    AuctionStarted(AuctionNotice),
    BidderCount(BidderCountPayload),
    AuctionStatusUpdate(StatusUpdatePayload),
    ConnectionLost(ConnectionLostPayload),
    AuctionWon(AuctionNotice),
    AuctionLost(AuctionNotice),
    PaymentRequired(AuctionNotice),
}

impl PushEvent {
    pub fn auction_id(&self) -> Option<AuctionId> {
        match self {
            PushEvent::NewBid(bid) => Some(bid.auction_id),
            PushEvent::BidOutbid(outbid) => Some(outbid.bid.auction_id),
            PushEvent::AuctionEndingSoon(n)
            | PushEvent::AuctionEnded(n)
            | PushEvent::AuctionCancelled(n)
            | PushEvent::AuctionStarted(n)
            | PushEvent::AuctionWon(n)
            | PushEvent::AuctionLost(n)
            | PushEvent::PaymentRequired(n) => Some(n.auction_id),
            PushEvent::BidderCount(count) => Some(count.auction_id),
            PushEvent::AuctionStatusUpdate(update) => Some(update.auction_id),
            PushEvent::ConnectionLost(_) => None,
        }
    }
}

/// Loose envelope used only to name the `type` of frames that fail to parse.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// Notifications

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BidOutbid,
    AuctionEndingSoon,
    AuctionEnded,
    AuctionCancelled,
    AuctionWon,
    AuctionLost,
    PaymentRequired,
    ConnectionLost,
    BidPlaced,
    PurchaseCompleted,
    WishlistAdded,
    WishlistRemoved,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub related_id: Option<AuctionId>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub product_image: Option<String>,
    #[serde(default)]
    pub amount: Option<Money>,
}

impl NotificationItem {
    /// New unread item stamped now, with a fresh uuid unless `id` is given.
    pub fn new(
        id: Option<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind,
            title: title.into(),
            message: message.into(),
            is_read: false,
            created_at: Utc::now(),
            related_id: None,
            action_url: None,
            product_name: None,
            product_image: None,
            amount: None,
        }
    }

    pub fn for_auction(mut self, auction_id: AuctionId) -> Self {
        self.related_id = Some(auction_id);
        self.action_url = Some(format!("/auctions/{auction_id}"));
        self
    }

    pub fn with_product(mut self, name: Option<String>, image: Option<String>) -> Self {
        self.product_name = name;
        self.product_image = image;
        self
    }

    pub fn with_amount(mut self, amount: Option<Money>) -> Self {
        self.amount = amount;
        self
    }
}

// REST payloads

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    /// Sort expression sent with history requests, newest first.
    pub const SORT_NEWEST_FIRST: &'static str = "bidTime,desc";

    pub fn first(size: u32) -> Self {
        Self { page: 0, size }
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRequest {
    pub auction_id: AuctionId,
    pub bid_amount: Money,
    pub is_auto_bid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_auto_bid_amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidReceipt {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub bid_amount: Money,
    #[serde(default)]
    pub is_winning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub auction_id: AuctionId,
    pub price: Money,
    #[serde(default)]
    pub payment_id: Option<String>,
}
