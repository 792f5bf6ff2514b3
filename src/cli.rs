use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    /// Try websocket first, fall back to long-polling
    Auto,
    Websocket,
    Polling,
}

#[derive(Parser, Debug)]
#[command(
    name = "auction-live",
    about = "live auction client: push sync, bidding and notifications from the terminal",
    version
)]
pub struct Args {
    /// Push endpoint base URL (SockJS-style; the websocket lives at <base>/websocket)
    #[arg(long, default_value = "http://localhost:8080/ws")]
    pub ws_url: String,

    /// REST API base URL
    #[arg(long, default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Bearer token for both the push connection and the REST API
    #[arg(long)]
    pub token: Option<String>,

    /// Current user id; enables the per-user notification queue
    #[arg(long)]
    pub user_id: Option<String>,

    /// Current user nickname, used to recognise own bids
    #[arg(long)]
    pub nickname: Option<String>,

    /// Auction to open on startup (repeatable)
    #[arg(short, long = "auction")]
    pub auctions: Vec<i64>,

    /// Push transport selection
    #[arg(long, value_enum, default_value = "auto")]
    pub transport: TransportArg,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,

    /// Reconnection delay in seconds
    #[arg(long, default_value = "5")]
    pub reconnect_delay: u64,

    /// Heartbeat interval in milliseconds, both directions
    #[arg(long, default_value = "4000")]
    pub heartbeat_ms: u64,

    /// Seconds to wait for the broker to accept a new session
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,

    /// Seconds before a pending bid is abandoned as timed out
    #[arg(long, default_value = "30")]
    pub bid_timeout: u64,

    /// REST request timeout in seconds
    #[arg(long, default_value = "15")]
    pub request_timeout: u64,

    /// Poll live status of open auctions every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub poll_interval: u64,

    /// Bids fetched per history page
    #[arg(long, default_value = "20")]
    pub history_page_size: u32,

    /// Disable colored output (useful for piping to files)
    #[arg(long)]
    pub no_color: bool,
}
