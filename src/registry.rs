// file: src/registry.rs
// description: ref-counted topic subscriptions, one server subscription per topic, fan-out to handlers

use crate::types::topics;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receives `(topic, body)` for every message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Auction,
    User,
}

impl TopicKind {
    pub fn of(topic: &str) -> Self {
        if topic.starts_with(topics::USER_PREFIX) {
            TopicKind::User
        } else {
            TopicKind::Auction
        }
    }
}

/// Instructions for the connection manager, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Shutdown,
}

pub type CommandSender = mpsc::UnboundedSender<TransportCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<TransportCommand>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// Public view of one live topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub kind: TopicKind,
    pub ref_count: usize,
    /// Server-side subscription id (`sub-N`).
    pub handle: String,
}

struct TopicEntry {
    kind: TopicKind,
    handle: String,
    handlers: Vec<(SubscriptionToken, MessageHandler)>,
}

#[derive(Default)]
struct RegistryInner {
    topics: HashMap<String, TopicEntry>,
    tokens: HashMap<SubscriptionToken, String>,
    next_token: u64,
    next_handle: u64,
}

pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    commands: CommandSender,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.lock().topics.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new(commands: CommandSender) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            commands,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, command: TransportCommand) {
        // A closed channel means the connection manager is gone; there is
        // nothing left to subscribe on.
        if self.commands.send(command).is_err() {
            debug!("Connection manager stopped; dropping transport command");
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>, handler: MessageHandler) -> SubscriptionToken {
        let topic = topic.into();
        let mut inner = self.lock();
        let token = SubscriptionToken(inner.next_token);
        inner.next_token += 1;

        let opened = if let Some(entry) = inner.topics.get_mut(&topic) {
            entry.handlers.push((token, handler));
            trace!(topic = %topic, ref_count = entry.handlers.len(), "Joined existing subscription");
            None
        } else {
            let handle = format!("sub-{}", inner.next_handle);
            inner.next_handle += 1;
            inner.topics.insert(
                topic.clone(),
                TopicEntry {
                    kind: TopicKind::of(&topic),
                    handle: handle.clone(),
                    handlers: vec![(token, handler)],
                },
            );
            Some(handle)
        };
        inner.tokens.insert(token, topic.clone());
        drop(inner);

        if let Some(id) = opened {
            debug!(topic = %topic, id = %id, "Opening subscription");
            self.issue(TransportCommand::Subscribe {
                id,
                destination: topic,
            });
        }
        token
    }

    /// Releases one handler. Unknown or already released tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut inner = self.lock();
        let Some(topic) = inner.tokens.remove(&token) else {
            return;
        };
        let closed = match inner.topics.get_mut(&topic) {
            Some(entry) => {
                entry.handlers.retain(|(t, _)| *t != token);
                entry.handlers.is_empty().then(|| entry.handle.clone())
            }
            None => None,
        };
        if closed.is_some() {
            inner.topics.remove(&topic);
        }
        drop(inner);

        if let Some(id) = closed {
            debug!(topic = %topic, id = %id, "Closing subscription");
            self.issue(TransportCommand::Unsubscribe { id });
        }
    }

    /// Drops every subscription, issuing one server unsubscribe per topic.
    pub fn release_all(&self) {
        let handles: Vec<String> = {
            let mut inner = self.lock();
            inner.tokens.clear();
            inner
                .topics
                .drain()
                .map(|(_, entry)| entry.handle)
                .collect()
        };
        for id in handles {
            self.issue(TransportCommand::Unsubscribe { id });
        }
    }

    /// Fans a message out to the topic's handlers; returns how many ran.
    /// Handlers run outside the registry lock so they may subscribe or
    /// unsubscribe themselves.
    pub fn dispatch(&self, topic: &str, body: &str) -> usize {
        let handlers: Vec<MessageHandler> = match self.lock().topics.get(topic) {
            Some(entry) => entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(topic, body);
        }
        handlers.len()
    }

    pub fn topic_for_handle(&self, handle: &str) -> Option<String> {
        self.lock()
            .topics
            .iter()
            .find(|(_, entry)| entry.handle == handle)
            .map(|(topic, _)| topic.clone())
    }

    /// Live subscriptions (ref count > 0), used to replay after a reconnect.
    pub fn live(&self) -> Vec<Subscription> {
        let mut live: Vec<Subscription> = self
            .lock()
            .topics
            .iter()
            .map(|(topic, entry)| Subscription {
                topic: topic.clone(),
                kind: entry.kind,
                ref_count: entry.handlers.len(),
                handle: entry.handle.clone(),
            })
            .collect();
        live.sort_by(|a, b| a.topic.cmp(&b.topic));
        live
    }

    pub fn ref_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |entry| entry.handlers.len())
    }
}
