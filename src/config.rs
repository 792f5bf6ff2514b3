/// file: src/config.rs
/// description: engine configuration, built from CLI arguments or defaults
use crate::cli::{Args, TransportArg};
use anyhow::Result;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub api: ApiConfig,
    pub viewer: Viewer,
    pub reconciler: ReconcilerConfig,
    pub bidding: BiddingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Auto,
    WebSocket,
    Polling,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub base_url: Url,
    pub transport: TransportKind,
    pub auth_token: Option<String>,
    /// Flat delay between reconnect attempts. There is no backoff ceiling.
    pub reconnect_delay: Duration,
    pub heartbeat: Duration,
    /// Missed incoming heartbeat intervals tolerated before the transport is reset.
    pub heartbeat_grace: u32,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

/// Who is looking at the screen; decides `isMyBid` and outbid toasts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Option<String>,
    pub nickname: Option<String>,
}

impl Viewer {
    pub fn is_me(&self, user_id: Option<&str>, nickname: Option<&str>) -> bool {
        let id_match = matches!((self.user_id.as_deref(), user_id), (Some(a), Some(b)) if a == b);
        let nick_match =
            matches!((self.nickname.as_deref(), nickname), (Some(a), Some(b)) if a == b);
        id_match || nick_match
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub history_page_size: u32,
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BiddingConfig {
    pub submission_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8080/ws").expect("static url"),
            transport: TransportKind::Auto,
            auth_token: None,
            reconnect_delay: Duration::from_secs(5),
            heartbeat: Duration::from_millis(4000),
            heartbeat_grace: 2,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8080").expect("static url"),
            auth_token: None,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            history_page_size: 20,
            poll_interval: None,
        }
    }
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            submission_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            api: ApiConfig::default(),
            viewer: Viewer::default(),
            reconciler: ReconcilerConfig::default(),
            bidding: BiddingConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                port: 9090,
            },
        }
    }
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        let ws_url = Url::parse(&args.ws_url)?;
        let api_url = Url::parse(&args.api_url)?;

        Ok(Config {
            connection: ConnectionConfig {
                base_url: ws_url,
                transport: match args.transport {
                    TransportArg::Auto => TransportKind::Auto,
                    TransportArg::Websocket => TransportKind::WebSocket,
                    TransportArg::Polling => TransportKind::Polling,
                },
                auth_token: args.token.clone(),
                reconnect_delay: Duration::from_secs(args.reconnect_delay),
                heartbeat: Duration::from_millis(args.heartbeat_ms),
                heartbeat_grace: 2,
                connect_timeout: Duration::from_secs(args.connect_timeout),
            },
            api: ApiConfig {
                base_url: api_url,
                auth_token: args.token.clone(),
                request_timeout: Duration::from_secs(args.request_timeout),
            },
            viewer: Viewer {
                user_id: args.user_id.clone(),
                nickname: args.nickname.clone(),
            },
            reconciler: ReconcilerConfig {
                history_page_size: args.history_page_size.max(1),
                poll_interval: (args.poll_interval > 0)
                    .then(|| Duration::from_secs(args.poll_interval)),
            },
            bidding: BiddingConfig {
                submission_timeout: Duration::from_secs(args.bid_timeout),
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
        })
    }
}
