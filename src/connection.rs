// file: src/connection.rs
// description: lifecycle of the single push connection: connect, heartbeat, reconnect, teardown
// reference: https://stomp.github.io/stomp-specification-1.2.html#Heart-beating

use crate::{
    client_state::{ConnectionState, ConnectionStatus, SharedClientState, StatusReceiver, StatusSender},
    config::ConnectionConfig,
    error::AuctionError,
    events::{ClientEvent, EventSender, publish},
    monitoring::{CONNECTED_GAUGE, FRAMES_DROPPED_COUNTER, FRAMES_RECEIVED_COUNTER, RECONNECT_COUNTER},
    registry::{CommandReceiver, CommandSender, SubscriptionRegistry, TransportCommand},
    stomp::{Command, Frame, HeartBeat},
    transport::{Connector, TransportLink},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval_at, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

/// Told about every outage so it can surface a `CONNECTION_LOST` notice.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_lost(&self, reason: &str, retry_in: Duration);
}

enum SessionEnd {
    Shutdown,
    Lost(AuctionError),
}

/// Cheap handle for observing and stopping a running manager.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: CommandSender,
    status: StatusReceiver,
}

impl ConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> StatusReceiver {
        self.status.clone()
    }

    /// Asks the manager to disconnect. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.commands.send(TransportCommand::Shutdown);
    }

    /// Resolves once the connection reaches `state`, or the manager stops.
    pub async fn wait_for(&self, state: ConnectionState) -> bool {
        let mut rx = self.status.clone();
        rx.wait_for(|status| status.state == state).await.is_ok()
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    commands: CommandReceiver,
    status: StatusSender,
    state: SharedClientState,
    observer: Option<Arc<dyn ConnectionObserver>>,
    events: Option<EventSender>,
}

impl ConnectionManager {
    /// `commands` must be the receiving end of the channel the registry was
    /// built with; `command_tx` is kept for [`ConnectionHandle::shutdown`].
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriptionRegistry>,
        command_tx: CommandSender,
        commands: CommandReceiver,
        state: SharedClientState,
    ) -> (Self, ConnectionHandle) {
        let (status, status_rx) = crate::client_state::status_channel();
        let handle = ConnectionHandle {
            commands: command_tx,
            status: status_rx,
        };
        (
            Self {
                config,
                connector,
                registry,
                commands,
                status,
                state,
                observer: None,
                events: None,
            },
            handle,
        )
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs until shutdown. Transport failures never escape: they are retried
    /// after a flat delay, forever.
    pub async fn run(mut self) {
        self.set_state(ConnectionState::Connecting, None);

        loop {
            match self.connect_and_run().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    if !self.handle_connection_error(e).await {
                        break;
                    }
                }
            }
        }

        CONNECTED_GAUGE.set(0.0);
        self.set_state(ConnectionState::Disconnected, None);
        info!("Connection manager stopped");
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let mut changed = false;
        let mut retry_count = 0;
        self.status.send_modify(|status| {
            changed = status.state != state || state == ConnectionState::Reconnecting;
            status.state = state;
            match state {
                ConnectionState::Connected => {
                    status.retry_count = 0;
                    status.last_error = None;
                }
                ConnectionState::Reconnecting => {
                    status.retry_count += 1;
                    status.last_error = error;
                }
                _ => {}
            }
            retry_count = status.retry_count;
        });
        if let (true, Some(events)) = (changed, &self.events) {
            publish(
                events,
                ClientEvent::ConnectionChanged { state, retry_count },
            );
        }
    }

    async fn connect_and_run(&mut self) -> SessionEnd {
        debug!("Opening {} transport", self.connector.name());
        let link = tokio::select! {
            result = timeout(self.config.connect_timeout, self.connector.connect()) => match result {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => return SessionEnd::Lost(e),
                Err(_) => return SessionEnd::Lost(AuctionError::Timeout),
            },
            _ = shutdown_requested(&mut self.commands) => {
                info!("Shutdown requested while connecting");
                return SessionEnd::Shutdown;
            }
        };
        self.run_session(link).await
    }

    async fn run_session(&mut self, mut link: TransportLink) -> SessionEnd {
        let client_beat = HeartBeat::symmetric(self.config.heartbeat);
        let host = self.config.base_url.host_str().unwrap_or("localhost").to_string();
        let connect = Frame::connect(&host, self.config.auth_token.as_deref(), client_beat);
        if let Err(e) = link.send_frame(&connect) {
            return SessionEnd::Lost(e);
        }

        let server_beat = tokio::select! {
            result = await_connected(&mut link, self.config.connect_timeout) => match result {
                Ok(beat) => beat,
                Err(e) => return SessionEnd::Lost(e),
            },
            _ = shutdown_requested(&mut self.commands) => {
                let _ = link.send_frame(&Frame::disconnect("disconnect-0"));
                info!("Shutdown requested during handshake");
                return SessionEnd::Shutdown;
            }
        };
        let (send_every, expect_every) = HeartBeat::negotiate(client_beat, server_beat);

        let offline_for = self.state.last_disconnection_time().map(|at| at.elapsed());
        let connection_id = self.state.reset_connection();
        CONNECTED_GAUGE.set(1.0);
        if let Some(gap) = offline_for {
            info!("Recovered after {:?} offline", gap);
        }
        self.set_state(ConnectionState::Connected, None);
        info!(
            connection_id = %connection_id,
            "Session established (send heartbeat {:?}, expect {:?})",
            send_every,
            expect_every
        );

        // The broker has no memory of earlier sessions.
        let mut active: HashMap<String, String> = HashMap::new();
        for subscription in self.registry.live() {
            if let Err(e) = link.send_frame(&Frame::subscribe(&subscription.handle, &subscription.topic)) {
                return SessionEnd::Lost(e);
            }
            active.insert(subscription.handle, subscription.topic);
        }
        if !active.is_empty() {
            info!("Resubscribed {} topics", active.len());
        }

        let now = Instant::now();
        let never = Duration::from_secs(3600);
        let mut send_tick = interval_at(now + send_every.unwrap_or(never), send_every.unwrap_or(never));
        let mut check_tick =
            interval_at(now + expect_every.unwrap_or(never), expect_every.unwrap_or(never));
        let mut last_seen = now;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let result = match command {
                        None | Some(TransportCommand::Shutdown) => {
                            let _ = link.send_frame(&Frame::disconnect("disconnect-0"));
                            info!("Disconnecting");
                            return SessionEnd::Shutdown;
                        }
                        Some(TransportCommand::Subscribe { id, destination }) => {
                            // Already replayed, or released before we got to it.
                            if active.contains_key(&id) || self.registry.topic_for_handle(&id).is_none() {
                                Ok(())
                            } else {
                                let sent = link.send_frame(&Frame::subscribe(&id, &destination));
                                active.insert(id, destination);
                                sent
                            }
                        }
                        Some(TransportCommand::Unsubscribe { id }) => match active.remove(&id) {
                            Some(_) => link.send_frame(&Frame::unsubscribe(&id)),
                            None => Ok(()),
                        },
                    };
                    if let Err(e) = result {
                        return SessionEnd::Lost(e);
                    }
                }

                message = link.inbound.recv() => {
                    let Some(text) = message else {
                        return SessionEnd::Lost(AuctionError::ConnectionClosed);
                    };
                    last_seen = Instant::now();
                    if let Err(e) = self.handle_text(&text) {
                        return SessionEnd::Lost(e);
                    }
                }

                _ = send_tick.tick(), if send_every.is_some() => {
                    trace!("Sending heartbeat");
                    if let Err(e) = link.send_heartbeat() {
                        return SessionEnd::Lost(e);
                    }
                }

                _ = check_tick.tick(), if expect_every.is_some() => {
                    let silent = last_seen.elapsed();
                    let limit = expect_every.unwrap_or(never) * self.config.heartbeat_grace.max(1);
                    if silent > limit {
                        warn!("Missed heartbeats for {:?}, resetting transport", silent);
                        return SessionEnd::Lost(AuctionError::HeartbeatTimeout {
                            silent_ms: silent.as_millis(),
                        });
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> Result<(), AuctionError> {
        self.state.record_message();
        let frames = match Frame::decode_all(text) {
            Ok(frames) => frames,
            Err(e) => {
                // One corrupt message never takes the session down.
                FRAMES_DROPPED_COUNTER.increment(1);
                self.state.record_malformed_frame();
                warn!(
                    "Dropping malformed frame: {}. Message: {}",
                    e,
                    text.chars().take(100).collect::<String>()
                );
                return Ok(());
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => {
                    FRAMES_RECEIVED_COUNTER.increment(1);
                    let topic = frame.get("destination").map(str::to_string).or_else(|| {
                        frame
                            .get("subscription")
                            .and_then(|id| self.registry.topic_for_handle(id))
                    });
                    match topic {
                        Some(topic) => {
                            if self.registry.dispatch(&topic, &frame.body) == 0 {
                                trace!(topic = %topic, "Message for a topic nobody holds");
                            }
                        }
                        None => {
                            FRAMES_DROPPED_COUNTER.increment(1);
                            warn!("MESSAGE frame without destination or known subscription");
                        }
                    }
                }
                Command::Error => {
                    return Err(AuctionError::BrokerError {
                        message: error_message(&frame),
                    });
                }
                Command::Receipt => debug!("Receipt {:?}", frame.get("receipt-id")),
                other => debug!("Ignoring unexpected {} frame", other),
            }
        }
        Ok(())
    }

    /// Records the outage and waits out the reconnect delay. Returns false if
    /// shutdown was requested meanwhile.
    async fn handle_connection_error(&mut self, e: AuctionError) -> bool {
        let was_reconnecting = self.status.borrow().state == ConnectionState::Reconnecting;
        CONNECTED_GAUGE.set(0.0);
        RECONNECT_COUNTER.increment(1);
        self.state.record_disconnect();
        self.set_state(ConnectionState::Reconnecting, Some(e.to_string()));

        let delay = self.config.reconnect_delay;
        let attempt = self.status.borrow().retry_count;
        if was_reconnecting {
            debug!("Reconnect attempt {} failed: {}", attempt, e);
        } else {
            error!("Connection lost: {}", e);
            if let Some(observer) = &self.observer {
                observer.on_connection_lost(&e.to_string(), delay);
            }
        }
        warn!(
            "Reconnecting in {} seconds (attempt {})",
            delay.as_secs(),
            attempt
        );

        tokio::select! {
            _ = sleep_until(Instant::now() + delay) => true,
            _ = shutdown_requested(&mut self.commands) => false,
        }
    }
}

async fn await_connected(link: &mut TransportLink, limit: Duration) -> Result<HeartBeat, AuctionError> {
    let deadline = Instant::now() + limit;
    loop {
        let text = match timeout(deadline.saturating_duration_since(Instant::now()), link.inbound.recv()).await {
            Ok(Some(text)) => text,
            Ok(None) => return Err(AuctionError::ConnectionClosed),
            Err(_) => return Err(AuctionError::Timeout),
        };
        for frame in Frame::decode_all(&text)? {
            match frame.command {
                Command::Connected => {
                    return Ok(match frame.get("heart-beat") {
                        Some(value) => HeartBeat::parse(value)?,
                        None => HeartBeat::default(),
                    });
                }
                Command::Error => {
                    return Err(AuctionError::BrokerError {
                        message: error_message(&frame),
                    });
                }
                other => debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }
}

/// Resolves on shutdown. Subscription changes seen meanwhile are dropped;
/// the registry replay covers them once a session is up.
async fn shutdown_requested(commands: &mut CommandReceiver) {
    while let Some(command) = commands.recv().await {
        if let TransportCommand::Shutdown = command {
            return;
        }
    }
}

fn error_message(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client_state::ClientState,
        registry::{MessageHandler, command_channel},
        transport::{MemoryConnector, MemorySession},
    };
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<String>>);

    impl ConnectionObserver for RecordingObserver {
        fn on_connection_lost(&self, reason: &str, _retry_in: Duration) {
            self.0.lock().unwrap().push(reason.to_string());
        }
    }

    struct Harness {
        registry: Arc<SubscriptionRegistry>,
        handle: ConnectionHandle,
        connector: Arc<MemoryConnector>,
        sessions: mpsc::UnboundedReceiver<MemorySession>,
        observer: Arc<RecordingObserver>,
    }

    fn start() -> Harness {
        let (memory, sessions) = MemoryConnector::new();
        let connector = Arc::new(memory);
        let (tx, rx) = command_channel();
        let registry = Arc::new(SubscriptionRegistry::new(tx.clone()));
        let observer = Arc::new(RecordingObserver::default());
        let (manager, handle) = ConnectionManager::new(
            ConnectionConfig::default(),
            connector.clone(),
            registry.clone(),
            tx,
            rx,
            Arc::new(ClientState::new()),
        );
        tokio::spawn(manager.with_observer(observer.clone()).run());
        Harness {
            registry,
            handle,
            connector,
            sessions,
            observer,
        }
    }

    async fn accept(sessions: &mut mpsc::UnboundedReceiver<MemorySession>, beat: &str) -> MemorySession {
        let mut session = sessions.recv().await.unwrap();
        let connect = session.next_frame().await.unwrap();
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.get("heart-beat"), Some("4000,4000"));
        session.send(&Frame::new(Command::Connected).header("heart-beat", beat));
        session
    }

    fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(move |_topic: &str, body: &str| {
                let _ = tx.send(body.to_string());
            }),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_and_routes_messages() {
        let mut h = start();
        let (handler, mut bodies) = collector();
        h.registry.subscribe("/topic/auction/1", handler);

        let mut session = accept(&mut h.sessions, "0,0").await;
        let subscribe = session.next_frame().await.unwrap();
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some("/topic/auction/1"));
        assert!(h.handle.wait_for(ConnectionState::Connected).await);

        session.send(
            &Frame::new(Command::Message)
                .header("destination", "/topic/auction/1")
                .body("{\"type\":\"NEW_BID\"}"),
        );
        assert_eq!(bodies.recv().await.unwrap(), "{\"type\":\"NEW_BID\"}");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_does_not_drop_session() {
        let mut h = start();
        let (handler, mut bodies) = collector();
        h.registry.subscribe("/topic/auction/1", handler);
        let mut session = accept(&mut h.sessions, "0,0").await;
        session.next_frame().await.unwrap();

        session.send_raw("GARBAGE\n\n\0");
        session.send(
            &Frame::new(Command::Message)
                .header("subscription", "sub-0")
                .body("ok"),
        );
        assert_eq!(bodies.recv().await.unwrap(), "ok");
        assert_eq!(h.handle.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_every_topic_once() {
        let mut h = start();
        for id in 1..=3 {
            h.registry.subscribe(format!("/topic/auction/{id}"), Arc::new(|_, _| {}));
        }
        // A second holder of the same topic must not add a subscription.
        h.registry.subscribe("/topic/auction/2", Arc::new(|_, _| {}));

        let mut session = accept(&mut h.sessions, "0,0").await;
        for _ in 0..3 {
            assert_eq!(session.next_frame().await.unwrap().command, Command::Subscribe);
        }
        drop(session);

        let mut session = accept(&mut h.sessions, "0,0").await;
        let mut destinations = Vec::new();
        for _ in 0..3 {
            let frame = session.next_frame().await.unwrap();
            assert_eq!(frame.command, Command::Subscribe);
            destinations.push(frame.get("destination").unwrap().to_string());
        }
        destinations.sort();
        assert_eq!(
            destinations,
            vec!["/topic/auction/1", "/topic/auction/2", "/topic/auction/3"]
        );
        assert!(
            timeout(Duration::from_secs(1), session.next_frame())
                .await
                .is_err(),
            "no duplicate subscriptions expected"
        );
        assert_eq!(h.observer.0.lock().unwrap().len(), 1);
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_during_handshake_keeps_one_server_subscription() {
        let mut h = start();
        let mut session = h.sessions.recv().await.unwrap();
        assert_eq!(session.next_frame().await.unwrap().command, Command::Connect);

        let first = h.registry.subscribe("/topic/auction/7", Arc::new(|_, _| {}));
        h.registry.unsubscribe(first);
        h.registry.subscribe("/topic/auction/7", Arc::new(|_, _| {}));
        session.send(&Frame::new(Command::Connected).header("heart-beat", "0,0"));

        let subscribe = session.next_frame().await.unwrap();
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("id"), Some("sub-1"));
        assert!(
            timeout(Duration::from_secs(1), session.next_frame())
                .await
                .is_err(),
            "released handle must not reach the broker"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn released_handle_queued_while_connected_is_skipped() {
        let mut h = start();
        let mut session = accept(&mut h.sessions, "0,0").await;
        assert!(h.handle.wait_for(ConnectionState::Connected).await);

        let first = h.registry.subscribe("/topic/auction/8", Arc::new(|_, _| {}));
        h.registry.unsubscribe(first);
        h.registry.subscribe("/topic/auction/8", Arc::new(|_, _| {}));

        let subscribe = session.next_frame().await.unwrap();
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("id"), Some("sub-1"));
        assert!(
            timeout(Duration::from_secs(1), session.next_frame())
                .await
                .is_err()
        );
        assert_eq!(h.registry.ref_count("/topic/auction/8"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_handshake_is_prompt_and_silent() {
        let mut h = start();
        let mut session = h.sessions.recv().await.unwrap();
        assert_eq!(session.next_frame().await.unwrap().command, Command::Connect);

        let started = Instant::now();
        h.handle.shutdown();
        assert_eq!(session.next_frame().await.unwrap().command, Command::Disconnect);
        assert!(h.handle.wait_for(ConnectionState::Disconnected).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(h.observer.0.lock().unwrap().is_empty());
        assert_eq!(h.handle.status().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_retry_after_fixed_delay() {
        let mut h = start();
        h.connector.fail_next(2);
        let started = Instant::now();
        let _session = accept(&mut h.sessions, "0,0").await;
        assert_eq!(h.connector.attempts(), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(h.handle.wait_for(ConnectionState::Connected).await);
        assert_eq!(h.handle.status().retry_count, 0);
        // One notice per outage, not per attempt.
        assert_eq!(h.observer.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_is_reset() {
        let mut h = start();
        let session = accept(&mut h.sessions, "4000,4000").await;
        assert!(h.handle.wait_for(ConnectionState::Connected).await);

        // Broker never sends heartbeats; the client gives up after the grace.
        assert!(h.handle.wait_for(ConnectionState::Reconnecting).await);
        let status = h.handle.status();
        assert!(status.last_error.unwrap().contains("heartbeat"));
        drop(session);

        let _session = accept(&mut h.sessions, "0,0").await;
        assert!(h.handle.wait_for(ConnectionState::Connected).await);
    }

    #[tokio::test(start_paused = true)]
    async fn client_sends_heartbeats() {
        let mut h = start();
        let mut session = accept(&mut h.sessions, "0,4000").await;
        let text = timeout(Duration::from_secs(5), session.from_client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "\n");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_and_disconnects() {
        let mut h = start();
        h.registry.subscribe("/topic/auction/5", Arc::new(|_, _| {}));
        let mut session = accept(&mut h.sessions, "0,0").await;
        session.next_frame().await.unwrap();

        h.registry.release_all();
        h.handle.shutdown();
        let unsubscribe = session.next_frame().await.unwrap();
        assert_eq!(unsubscribe.command, Command::Unsubscribe);
        assert_eq!(unsubscribe.get("id"), Some("sub-0"));
        assert_eq!(session.next_frame().await.unwrap().command, Command::Disconnect);
        assert!(h.handle.wait_for(ConnectionState::Disconnected).await);
    }
}
