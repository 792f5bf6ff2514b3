// file: src/engine.rs
// description: wires the push connection, registry, dispatcher, reconciler, bidding and notifications

use crate::{
    api::{AuctionApi, NotificationStore},
    bidding::{BidController, SubmissionState},
    client_state::{ClientCounters, ClientState, ConnectionState, ConnectionStatus, SharedClientState, StatusReceiver},
    config::Config,
    connection::{ConnectionHandle, ConnectionManager},
    dispatcher::{EventDispatcher, run_refresh_worker},
    error::{AuctionError, BidError},
    events::{EventReceiver, EventSender, create_event_channel},
    monitoring::HealthStatus,
    notifications::NotificationCenter,
    reconciler::AuctionReconciler,
    registry::{MessageHandler, Subscription, SubscriptionRegistry, SubscriptionToken, command_channel},
    transport::Connector,
    types::{AuctionId, AuctionSnapshot, BidEvent, BidReceipt, Money, PurchaseReceipt, topics},
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything a screen needs, behind one explicit `init`/`shutdown` pair.
/// Each call to [`AuctionEngine::init`] builds a fresh, independent graph.
pub struct AuctionEngine {
    config: Config,
    registry: Arc<SubscriptionRegistry>,
    reconciler: Arc<AuctionReconciler>,
    notifications: Arc<NotificationCenter>,
    bids: BidController,
    dispatcher: Arc<EventDispatcher>,
    state: SharedClientState,
    connection: ConnectionHandle,
    events: EventSender,
    manager_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AuctionEngine {
    /// Builds the component graph and starts connecting. Must be called inside
    /// a tokio runtime.
    pub async fn init(
        config: Config,
        connector: Arc<dyn Connector>,
        api: Arc<dyn AuctionApi>,
        store: Option<Arc<dyn NotificationStore>>,
    ) -> Self {
        let (events, _) = create_event_channel();
        let state = Arc::new(ClientState::new());

        let (command_tx, command_rx) = command_channel();
        let registry = Arc::new(SubscriptionRegistry::new(command_tx.clone()));

        let reconciler = Arc::new(AuctionReconciler::new(
            api.clone(),
            config.reconciler.clone(),
            config.viewer.clone(),
            events.clone(),
        ));
        let notifications = Arc::new(NotificationCenter::new(store, events.clone()));
        let bids = BidController::new(
            api,
            reconciler.clone(),
            notifications.clone(),
            config.bidding.clone(),
            events.clone(),
        );
        let (dispatcher, refresh_rx) = EventDispatcher::new(
            reconciler.clone(),
            notifications.clone(),
            config.viewer.clone(),
            state.clone(),
            events.clone(),
        );
        let dispatcher = Arc::new(dispatcher);

        let (manager, connection) = ConnectionManager::new(
            config.connection.clone(),
            connector,
            registry.clone(),
            command_tx,
            command_rx,
            state.clone(),
        );
        let manager = manager
            .with_observer(dispatcher.clone())
            .with_events(events.clone());
        let manager_task = tokio::spawn(manager.run());

        let mut background = vec![tokio::spawn(run_refresh_worker(
            reconciler.clone(),
            refresh_rx,
        ))];
        if let Some(every) = config.reconciler.poll_interval {
            background.push(tokio::spawn(poll_status(reconciler.clone(), every)));
        }

        let engine = Self {
            config,
            registry,
            reconciler,
            notifications,
            bids,
            dispatcher,
            state,
            connection,
            events,
            manager_task: Mutex::new(Some(manager_task)),
            background: Mutex::new(background),
        };

        if let Some(user_id) = engine.config.viewer.user_id.clone() {
            engine
                .registry
                .subscribe(topics::user_notifications(&user_id), engine.frame_handler());
        }
        if let Err(e) = engine.notifications.load().await {
            warn!(error = %e, "Could not load persisted notifications");
        }

        info!(
            "Engine started ({:?} transport, base {})",
            engine.config.connection.transport, engine.config.connection.base_url
        );
        engine
    }

    fn frame_handler(&self) -> MessageHandler {
        let dispatcher = self.dispatcher.clone();
        Arc::new(move |topic: &str, body: &str| dispatcher.handle_frame(topic, body))
    }

    /// Starts watching an auction: subscribes to its topic and loads it from
    /// REST. Dropping the returned page stops watching.
    pub async fn open_auction(&self, auction_id: AuctionId) -> Result<AuctionPage, AuctionError> {
        self.reconciler.track(auction_id);
        let token = self
            .registry
            .subscribe(topics::auction(auction_id), self.frame_handler());
        let page = AuctionPage {
            auction_id,
            token,
            registry: self.registry.clone(),
            reconciler: self.reconciler.clone(),
        };
        self.reconciler.force_refresh(auction_id).await?;
        debug!(auction_id, "Auction opened");
        Ok(page)
    }

    /// Releases every subscription, disconnects and stops background work.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.registry.release_all();
        self.connection.shutdown();

        let manager = self
            .manager_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = manager
            && let Err(e) = task.await
        {
            warn!(error = %e, "Connection manager ended abnormally");
        }

        let background: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in background {
            task.abort();
        }
        info!("Engine stopped");
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection(&self) -> StatusReceiver {
        self.connection.watch()
    }

    pub async fn wait_for_state(&self, state: ConnectionState) -> bool {
        self.connection.wait_for(state).await
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.live()
    }

    pub fn snapshot(&self, auction_id: AuctionId) -> Option<AuctionSnapshot> {
        self.reconciler.snapshot(auction_id)
    }

    pub fn history(&self, auction_id: AuctionId) -> Vec<BidEvent> {
        self.reconciler.history(auction_id)
    }

    pub fn open_auctions(&self) -> Vec<AuctionId> {
        self.reconciler.tracked()
    }

    pub async fn force_refresh(&self, auction_id: AuctionId) -> Result<(), AuctionError> {
        self.reconciler.force_refresh(auction_id).await
    }

    pub async fn submit_bid(
        &self,
        auction_id: AuctionId,
        amount: Money,
        is_auto_bid: bool,
        max_auto_bid_amount: Option<Money>,
    ) -> Result<BidReceipt, BidError> {
        self.bids
            .submit_bid(auction_id, amount, is_auto_bid, max_auto_bid_amount)
            .await
    }

    pub async fn buy_now(&self, auction_id: AuctionId) -> Result<PurchaseReceipt, BidError> {
        self.bids.buy_now(auction_id).await
    }

    pub fn submission_state(&self, auction_id: AuctionId) -> SubmissionState {
        self.bids.status(auction_id)
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn counters(&self) -> ClientCounters {
        self.state.counters()
    }

    pub fn health(&self) -> HealthStatus {
        let status = self.connection.status();
        HealthStatus {
            is_connected: status.state == ConnectionState::Connected,
            counters: self.state.counters(),
            open_auctions: self.reconciler.tracked().len(),
            unread_notifications: self.notifications.unread_count(),
            reconnect_count: status.retry_count,
        }
    }
}

async fn poll_status(reconciler: Arc<AuctionReconciler>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for auction_id in reconciler.tracked() {
            if let Err(e) = reconciler.refresh_status(auction_id).await {
                debug!(auction_id, error = %e, "Status poll failed");
            }
        }
    }
}

/// A watched auction. Dropping it unsubscribes and forgets local state once
/// no other page shows the same auction.
pub struct AuctionPage {
    auction_id: AuctionId,
    token: SubscriptionToken,
    registry: Arc<SubscriptionRegistry>,
    reconciler: Arc<AuctionReconciler>,
}

impl AuctionPage {
    pub fn auction_id(&self) -> AuctionId {
        self.auction_id
    }

    pub fn snapshot(&self) -> Option<AuctionSnapshot> {
        self.reconciler.snapshot(self.auction_id)
    }

    pub fn history(&self) -> Vec<BidEvent> {
        self.reconciler.history(self.auction_id)
    }

    pub fn has_more_history(&self) -> bool {
        self.reconciler.has_more_history(self.auction_id)
    }

    pub async fn load_more_history(&self) -> Result<usize, AuctionError> {
        self.reconciler.load_more_history(self.auction_id).await
    }
}

impl Drop for AuctionPage {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.token);
        self.reconciler.release(self.auction_id);
    }
}

impl std::fmt::Debug for AuctionPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuctionPage")
            .field("auction_id", &self.auction_id)
            .finish()
    }
}
