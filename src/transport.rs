// file: src/transport.rs
// description: pluggable push transports (websocket, xhr long-polling, in-memory)
// reference: https://github.com/sockjs/sockjs-protocol

use crate::{
    config::{ConnectionConfig, TransportKind},
    error::AuctionError,
    stomp::Frame,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use url::Url;

/// One open transport session, reduced to text in and text out.
///
/// The session is closed from the client side by dropping the link; a closed
/// `inbound` channel means the remote end went away.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl TransportLink {
    pub fn send_frame(&self, frame: &Frame) -> Result<(), AuctionError> {
        self.outbound
            .send(frame.encode())
            .map_err(|_| AuctionError::ConnectionClosed)
    }

    pub fn send_heartbeat(&self) -> Result<(), AuctionError> {
        self.outbound
            .send("\n".to_string())
            .map_err(|_| AuctionError::ConnectionClosed)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<TransportLink, AuctionError>;
}

pub fn build_connector(config: &ConnectionConfig) -> Result<Arc<dyn Connector>, AuctionError> {
    let websocket = || -> Result<Box<dyn Connector>, AuctionError> {
        Ok(Box::new(WebSocketConnector::from_base(&config.base_url)?))
    };
    let polling = || -> Result<Box<dyn Connector>, AuctionError> {
        Ok(Box::new(PollingConnector::new(config.base_url.clone())?))
    };

    Ok(match config.transport {
        TransportKind::WebSocket => Arc::from(websocket()?),
        TransportKind::Polling => Arc::from(polling()?),
        TransportKind::Auto => Arc::new(FallbackConnector::new(websocket()?, polling()?)),
    })
}

pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Raw websocket endpoint below a SockJS-style base URL.
    pub fn from_base(base: &Url) -> Result<Self, AuctionError> {
        let scheme = match base.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        let rest = &base.as_str()[base.scheme().len()..];
        let url = Url::parse(&format!("{scheme}{}/websocket", rest.trim_end_matches('/')))?;
        Ok(Self::new(url))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self) -> Result<TransportLink, AuctionError> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        info!("WebSocket transport established to {}", self.url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary message of {} bytes", data.len());
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Received close frame: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket stream error: {}", e);
                        break;
                    }
                };
                if inbound_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(TransportLink { outbound, inbound })
    }
}

/// SockJS xhr-polling transport used when websockets are unavailable.
pub struct PollingConnector {
    http: reqwest::Client,
    base: Url,
}

impl PollingConnector {
    pub fn new(base: Url) -> Result<Self, AuctionError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base })
    }

    fn session_url(&self) -> String {
        let server = fastrand::u16(0..1000);
        let session = uuid::Uuid::new_v4().simple();
        format!(
            "{}/{server:03}/{session}",
            self.base.as_str().trim_end_matches('/')
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollChunk {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close(String),
}

fn parse_poll_body(body: &str) -> Result<Vec<PollChunk>, AuctionError> {
    let mut chunks = Vec::new();
    for line in body.lines().filter(|line| !line.is_empty()) {
        let mut chars = line.chars();
        let tag = chars.next();
        let rest = chars.as_str();
        chunks.push(match tag {
            Some('o') => PollChunk::Open,
            Some('h') => PollChunk::Heartbeat,
            Some('a') => PollChunk::Messages(serde_json::from_str(rest)?),
            Some('c') => PollChunk::Close(rest.to_string()),
            _ => {
                return Err(AuctionError::BrokerError {
                    message: format!("unexpected polling frame `{line}`"),
                });
            }
        });
    }
    Ok(chunks)
}

#[async_trait]
impl Connector for PollingConnector {
    fn name(&self) -> &'static str {
        "xhr-polling"
    }

    async fn connect(&self) -> Result<TransportLink, AuctionError> {
        let session_url = self.session_url();
        let receive_url = format!("{session_url}/xhr");
        let send_url = format!("{session_url}/xhr_send");

        let opening = self
            .http
            .post(&receive_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        if parse_poll_body(&opening)?.first() != Some(&PollChunk::Open) {
            return Err(AuctionError::BrokerError {
                message: "polling session did not open".to_string(),
            });
        }
        info!("Long-polling transport established at {}", session_url);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        let http = self.http.clone();
        tokio::spawn(async move {
            while let Some(first) = outbound_rx.recv().await {
                let mut batch = vec![first];
                while let Ok(next) = outbound_rx.try_recv() {
                    batch.push(next);
                }
                let sent = http
                    .post(&send_url)
                    .json(&batch)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status());
                if let Err(e) = sent {
                    debug!("Polling send failed: {}", e);
                    break;
                }
            }
        });

        let http = self.http.clone();
        tokio::spawn(async move {
            loop {
                let body = match http.post(&receive_url).send().await {
                    Ok(response) => match response.error_for_status() {
                        Ok(response) => response.text().await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let body = match body {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Polling receive failed: {}", e);
                        break;
                    }
                };
                let chunks = match parse_poll_body(&body) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!("Polling session sent garbage: {}", e);
                        break;
                    }
                };
                for chunk in chunks {
                    match chunk {
                        PollChunk::Open => {}
                        PollChunk::Heartbeat => {
                            trace!("Polling heartbeat");
                            if inbound_tx.send("\n".to_string()).is_err() {
                                return;
                            }
                        }
                        PollChunk::Messages(messages) => {
                            for message in messages {
                                if inbound_tx.send(message).is_err() {
                                    return;
                                }
                            }
                        }
                        PollChunk::Close(reason) => {
                            debug!("Polling session closed by server: {}", reason);
                            return;
                        }
                    }
                }
            }
        });

        Ok(TransportLink { outbound, inbound })
    }
}

/// Tries the primary transport and negotiates down to the fallback on failure.
pub struct FallbackConnector {
    primary: Box<dyn Connector>,
    fallback: Box<dyn Connector>,
}

impl FallbackConnector {
    pub fn new(primary: Box<dyn Connector>, fallback: Box<dyn Connector>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Connector for FallbackConnector {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn connect(&self) -> Result<TransportLink, AuctionError> {
        match self.primary.connect().await {
            Ok(link) => Ok(link),
            Err(e) => {
                warn!(
                    "{} transport failed ({}), falling back to {}",
                    self.primary.name(),
                    e,
                    self.fallback.name()
                );
                self.fallback.connect().await
            }
        }
    }
}

/// In-process transport. Every successful `connect` hands the broker side of
/// the session to whoever holds the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    sessions: mpsc::UnboundedSender<MemorySession>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySession>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions,
                failures: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<TransportLink, AuctionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AuctionError::ConnectionClosed);
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.sessions
            .send(MemorySession {
                to_client,
                from_client,
            })
            .map_err(|_| AuctionError::ConnectionClosed)?;
        Ok(TransportLink { outbound, inbound })
    }
}

/// Broker end of an in-memory session.
#[derive(Debug)]
pub struct MemorySession {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl MemorySession {
    /// Next non-heartbeat frame sent by the client, or `None` once it hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        while let Some(text) = self.from_client.recv().await {
            match Frame::decode_all(&text) {
                Ok(mut frames) if !frames.is_empty() => return Some(frames.remove(0)),
                _ => continue,
            }
        }
        None
    }

    pub fn send(&self, frame: &Frame) -> bool {
        self.to_client.send(frame.encode()).is_ok()
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_derived_from_http_base() {
        let base = Url::parse("https://auction.example.com/ws/").unwrap();
        let connector = WebSocketConnector::from_base(&base).unwrap();
        assert_eq!(
            connector.url().as_str(),
            "wss://auction.example.com/ws/websocket"
        );

        let base = Url::parse("http://localhost:8080/ws").unwrap();
        let connector = WebSocketConnector::from_base(&base).unwrap();
        assert_eq!(connector.url().as_str(), "ws://localhost:8080/ws/websocket");
    }

    #[test]
    fn parses_polling_chunks() {
        let chunks = parse_poll_body("o\nh\na[\"MESSAGE\\n\\n{}\\u0000\"]\nc[3000,\"Go away!\"]\n")
            .unwrap();
        assert_eq!(chunks[0], PollChunk::Open);
        assert_eq!(chunks[1], PollChunk::Heartbeat);
        assert_eq!(
            chunks[2],
            PollChunk::Messages(vec!["MESSAGE\n\n{}\0".to_string()])
        );
        assert!(matches!(chunks[3], PollChunk::Close(_)));
        assert!(parse_poll_body("x").is_err());
    }

    #[tokio::test]
    async fn memory_connector_fails_requested_attempts() {
        let (connector, mut sessions) = MemoryConnector::new();
        connector.fail_next(1);
        assert!(connector.connect().await.is_err());
        let link = connector.connect().await.unwrap();
        assert_eq!(connector.attempts(), 2);

        let mut session = sessions.recv().await.unwrap();
        link.send_heartbeat().unwrap();
        link.send_frame(&Frame::unsubscribe("sub-1")).unwrap();
        let frame = session.next_frame().await.unwrap();
        assert_eq!(frame.get("id"), Some("sub-1"));
    }

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }

        async fn connect(&self) -> Result<TransportLink, AuctionError> {
            Err(AuctionError::Timeout)
        }
    }

    #[tokio::test]
    async fn fallback_used_when_primary_fails() {
        let (memory, mut sessions) = MemoryConnector::new();
        let connector = FallbackConnector::new(Box::new(Refusing), Box::new(memory));
        assert!(connector.connect().await.is_ok());
        assert!(sessions.recv().await.is_some());
    }
}
