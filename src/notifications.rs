/// file: src/notifications.rs
/// description: local notification ledger with optimistic, fire-and-forget persistence
use crate::{
    api::NotificationStore,
    error::AuctionError,
    events::{ClientEvent, EventSender, publish},
    types::{AuctionId, NotificationItem, NotificationKind},
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct NotificationCenter {
    items: Mutex<Vec<NotificationItem>>,
    store: Option<Arc<dyn NotificationStore>>,
    unread: watch::Sender<usize>,
    events: EventSender,
}

impl NotificationCenter {
    /// Without a store every change stays local.
    pub fn new(store: Option<Arc<dyn NotificationStore>>, events: EventSender) -> Self {
        let (unread, _) = watch::channel(0);
        Self {
            items: Mutex::new(Vec::new()),
            store,
            unread,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NotificationItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recomputes the unread count from the ledger and publishes it if it moved.
    fn sync_unread(&self, items: &[NotificationItem]) {
        let count = items.iter().filter(|item| !item.is_read).count();
        let moved = self.unread.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
        if moved {
            publish(&self.events, ClientEvent::UnreadCountChanged(count));
        }
    }

    /// Inserts keeping newest-first order. Returns false for a known id.
    pub fn add(&self, item: NotificationItem) -> bool {
        let mut items = self.lock();
        if items.iter().any(|existing| existing.id == item.id) {
            debug!(id = %item.id, "Ignoring duplicate notification");
            return false;
        }
        let position = items
            .iter()
            .position(|existing| existing.created_at < item.created_at)
            .unwrap_or(items.len());
        items.insert(position, item.clone());
        self.sync_unread(&items);
        drop(items);

        publish(&self.events, ClientEvent::NotificationAdded(Box::new(item)));
        true
    }

    /// Adds a client-generated notice, e.g. after a successful bid.
    pub fn notify_local(
        &self,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        related_id: Option<AuctionId>,
    ) -> NotificationItem {
        let mut item = NotificationItem::new(None, kind, title, message);
        if let Some(auction_id) = related_id {
            item = item.for_auction(auction_id);
        }
        self.add(item.clone());
        item
    }

    pub fn mark_read(&self, id: &str) -> bool {
        let mut items = self.lock();
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        if item.is_read {
            return true;
        }
        item.is_read = true;
        self.sync_unread(&items);
        drop(items);

        let id = id.to_string();
        self.persist("mark_read", move |store| async move { store.mark_read(&id).await });
        true
    }

    pub fn mark_all_read(&self) {
        let mut items = self.lock();
        for item in items.iter_mut() {
            item.is_read = true;
        }
        self.sync_unread(&items);
        drop(items);

        self.persist("mark_all_read", |store| async move { store.mark_all_read().await });
    }

    pub fn clear_all(&self) {
        let mut items = self.lock();
        items.clear();
        self.sync_unread(&items);
        drop(items);

        self.persist("clear_all", |store| async move { store.clear_all().await });
    }

    /// Local state is already updated; the server call is spawned and a
    /// failure is only logged.
    fn persist<F, Fut>(&self, operation: &'static str, call: F)
    where
        F: FnOnce(Arc<dyn NotificationStore>) -> Fut,
        Fut: Future<Output = Result<(), AuctionError>> + Send + 'static,
    {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(operation, "No runtime available; notification change kept local");
            return;
        };
        let fut = call(store);
        runtime.spawn(async move {
            if let Err(e) = fut.await {
                warn!(operation, error = %e, "Failed to persist notification change");
            }
        });
    }

    /// Merges the persisted ledger into the local one. Items already present
    /// locally keep their local read state. Returns how many were added.
    pub async fn load(&self) -> Result<usize, AuctionError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let fetched = store.fetch_notifications().await?;
        let mut added = 0;
        for item in fetched {
            if self.add(item) {
                added += 1;
            }
        }
        info!(added, "Loaded persisted notifications");
        Ok(added)
    }

    /// Newest first.
    pub fn list(&self) -> Vec<NotificationItem> {
        self.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<NotificationItem> {
        self.lock().iter().find(|item| item.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn unread_count(&self) -> usize {
        *self.unread.borrow()
    }

    pub fn watch_unread(&self) -> watch::Receiver<usize> {
        self.unread.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::create_event_channel;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub persisted: Mutex<Vec<NotificationItem>>,
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl FakeStore {
        fn result(&self) -> Result<(), AuctionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(AuctionError::Api {
                    status: 500,
                    message: "storage offline".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl NotificationStore for FakeStore {
        async fn fetch_notifications(&self) -> Result<Vec<NotificationItem>, AuctionError> {
            Ok(self.persisted.lock().unwrap().clone())
        }

        async fn mark_read(&self, _id: &str) -> Result<(), AuctionError> {
            self.result()
        }

        async fn mark_all_read(&self) -> Result<(), AuctionError> {
            self.result()
        }

        async fn clear_all(&self) -> Result<(), AuctionError> {
            self.result()
        }
    }

    fn item(id: &str, minutes_ago: i64) -> NotificationItem {
        let mut item = NotificationItem::new(
            Some(id.to_string()),
            NotificationKind::BidOutbid,
            "Outbid",
            "Someone outbid you",
        );
        item.created_at = Utc::now() - Duration::minutes(minutes_ago);
        item
    }

    fn center(store: Option<Arc<FakeStore>>) -> NotificationCenter {
        let (events, _) = create_event_channel();
        NotificationCenter::new(store.map(|s| s as Arc<dyn NotificationStore>), events)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let center = center(None);
        assert!(center.add(item("a", 1)));
        assert!(!center.add(item("a", 0)));
        assert_eq!(center.len(), 1);
        assert_eq!(center.unread_count(), 1);
    }

    #[test]
    fn list_is_newest_first() {
        let center = center(None);
        center.add(item("old", 30));
        center.add(item("new", 1));
        center.add(item("mid", 10));
        let ids: Vec<_> = center.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn unread_count_tracks_items() {
        let center = center(None);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            center.add(item(id, i as i64));
        }
        assert_eq!(center.unread_count(), 3);
        assert!(center.mark_read("b"));
        assert!(!center.mark_read("missing"));
        assert_eq!(center.unread_count(), 2);
        assert_eq!(
            center.unread_count(),
            center.list().iter().filter(|i| !i.is_read).count()
        );
        center.mark_all_read();
        assert_eq!(center.unread_count(), 0);
        center.clear_all();
        assert!(center.is_empty());
    }

    #[tokio::test]
    async fn failed_persistence_is_not_rolled_back() {
        let store = Arc::new(FakeStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let center = center(Some(store.clone()));
        center.add(item("a", 0));
        center.add(item("b", 1));

        center.mark_all_read();
        assert_eq!(center.unread_count(), 0);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(center.unread_count(), 0);
        assert!(center.list().iter().all(|i| i.is_read));
    }

    #[tokio::test]
    async fn load_merges_persisted_ledger() {
        let store = Arc::new(FakeStore::default());
        store
            .persisted
            .lock()
            .unwrap()
            .extend([item("a", 5), item("b", 6)]);
        let center = center(Some(store));
        let mut local = item("a", 5);
        local.is_read = true;
        center.add(local);

        assert_eq!(center.load().await.unwrap(), 1);
        assert_eq!(center.len(), 2);
        assert!(center.get("a").unwrap().is_read);
        assert_eq!(center.unread_count(), 1);
    }

    #[tokio::test]
    async fn unread_watch_observes_changes() {
        let center = center(None);
        let mut rx = center.watch_unread();
        center.notify_local(NotificationKind::BidPlaced, "Bid placed", "36,000", Some(3));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        let item = &center.list()[0];
        assert_eq!(item.related_id, Some(3));
        assert_eq!(item.action_url.as_deref(), Some("/auctions/3"));
    }
}
