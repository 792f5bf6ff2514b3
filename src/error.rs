use crate::types::{AuctionStatus, Money};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuctionError {
    #[error("WebSocket connection error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("STOMP protocol error: {0}")]
    Stomp(#[from] StompError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("No heartbeat received for {silent_ms}ms")]
    HeartbeatTimeout { silent_ms: u128 },

    #[error("Broker rejected the session: {message}")]
    BrokerError { message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Auction {0} is not being tracked")]
    UntrackedAuction(i64),

    #[error("Metrics server error: {0}")]
    MetricsError(String),
}

impl AuctionError {
    /// Human-readable reason for user-facing surfaces.
    pub fn reason(&self) -> String {
        match self {
            AuctionError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StompError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("malformed header line `{0}`")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header `{0}`")]
    InvalidEscape(String),

    #[error("frame is missing its NULL terminator")]
    MissingTerminator,

    #[error("invalid content-length `{0}`")]
    InvalidContentLength(String),

    #[error("invalid heart-beat header `{0}`")]
    InvalidHeartBeat(String),
}

/// Client-side bid checks. Advisory only: the server remains authoritative.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BidValidationError {
    #[error("auction has not been loaded yet")]
    AuctionNotLoaded,

    #[error("auction is not accepting bids (status: {status})")]
    AuctionNotOpen { status: AuctionStatus },

    #[error("bid amount must be a positive number")]
    NonPositiveAmount,

    #[error("bid must be higher than {floor}")]
    NotAboveCurrent { floor: Money },

    #[error("bid must be lower than the buy-it-now price {buy_it_now}")]
    NotBelowBuyItNow { buy_it_now: Money },

    #[error("bid must be a multiple of {unit}")]
    NotMultipleOfUnit { unit: Money },

    #[error("auto-bid ceiling is required")]
    MissingAutoBidCeiling,

    #[error("auto-bid ceiling must be higher than the bid amount")]
    AutoBidCeilingTooLow { ceiling: Money },

    #[error("this auction has no buy-it-now price")]
    NoBuyItNow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BidError {
    #[error(transparent)]
    Validation(#[from] BidValidationError),

    #[error("a submission for this auction is already in progress")]
    AlreadySubmitting,

    #[error("rejected by server: {reason}")]
    Rejected { reason: String },

    #[error("no response from server; the outcome is unknown, please check and retry")]
    Timeout,
}

impl BidError {
    pub fn is_validation(&self) -> bool {
        matches!(self, BidError::Validation(_))
    }
}
