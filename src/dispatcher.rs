// file: src/dispatcher.rs
// description: turns push frames into reconciler updates, notifications and refresh requests

use crate::{
    client_state::SharedClientState,
    config::Viewer,
    connection::ConnectionObserver,
    events::{ClientEvent, EventSender, ToastLevel, publish},
    monitoring::FRAMES_DROPPED_COUNTER,
    notifications::NotificationCenter,
    reconciler::{AuctionReconciler, BidMerge},
    types::{
        AuctionId, AuctionNotice, AuctionStatus, NotificationItem, NotificationKind,
        OutbidPayload, PushEvent, RawEnvelope,
    },
};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshKind {
    Status,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequest {
    pub auction_id: AuctionId,
    pub kind: RefreshKind,
}

pub type RefreshSender = mpsc::UnboundedSender<RefreshRequest>;
pub type RefreshReceiver = mpsc::UnboundedReceiver<RefreshRequest>;

pub struct EventDispatcher {
    reconciler: Arc<AuctionReconciler>,
    notifications: Arc<NotificationCenter>,
    viewer: Viewer,
    state: SharedClientState,
    events: EventSender,
    refresh: RefreshSender,
}

impl EventDispatcher {
    pub fn new(
        reconciler: Arc<AuctionReconciler>,
        notifications: Arc<NotificationCenter>,
        viewer: Viewer,
        state: SharedClientState,
        events: EventSender,
    ) -> (Self, RefreshReceiver) {
        let (refresh, refresh_rx) = mpsc::unbounded_channel();
        (
            Self {
                reconciler,
                notifications,
                viewer,
                state,
                events,
                refresh,
            },
            refresh_rx,
        )
    }

    /// Entry point for every message body on a subscribed topic.
    pub fn handle_frame(&self, topic: &str, body: &str) {
        match serde_json::from_str::<PushEvent>(body) {
            Ok(event) => self.route(event),
            Err(e) => {
                FRAMES_DROPPED_COUNTER.increment(1);
                match serde_json::from_str::<RawEnvelope>(body) {
                    Ok(raw) => {
                        self.state.record_unknown_event();
                        debug!(topic, event_type = %raw.event_type, error = %e, "Dropping unhandled event");
                    }
                    Err(_) => {
                        self.state.record_malformed_frame();
                        warn!(topic, error = %e, "Dropping unparseable message body");
                    }
                }
            }
        }
    }

    pub fn route(&self, event: PushEvent) {
        match event {
            PushEvent::NewBid(bid) => {
                if self.reconciler.apply_bid(&bid) == BidMerge::Duplicate {
                    self.state.record_duplicate_bid();
                    trace!(bid_id = bid.bid_id, "Duplicate bid ignored");
                }
            }
            PushEvent::BidOutbid(outbid) => {
                if self.reconciler.apply_bid(&outbid.bid) == BidMerge::Duplicate {
                    self.state.record_duplicate_bid();
                }
                if self.viewer_was_outbid(&outbid) {
                    self.on_outbid(&outbid);
                }
            }
            PushEvent::AuctionEndingSoon(notice) => {
                self.reconciler
                    .advance_status(notice.auction_id, AuctionStatus::EndingSoon);
                publish(&self.events, ClientEvent::EndingSoon {
                    auction_id: notice.auction_id,
                });
                self.add_notice(NotificationKind::AuctionEndingSoon, &notice, "Auction ending soon");
            }
            PushEvent::AuctionEnded(notice) => {
                self.reconciler
                    .advance_status(notice.auction_id, AuctionStatus::Ended);
                self.request_refresh(notice.auction_id, RefreshKind::Full);
                self.add_notice(NotificationKind::AuctionEnded, &notice, "Auction ended");
            }
            PushEvent::AuctionCancelled(notice) => {
                self.reconciler
                    .advance_status(notice.auction_id, AuctionStatus::Cancelled);
                self.request_refresh(notice.auction_id, RefreshKind::Full);
                self.add_notice(NotificationKind::AuctionCancelled, &notice, "Auction cancelled");
            }
            PushEvent::AuctionStarted(notice) => {
                self.reconciler
                    .advance_status(notice.auction_id, AuctionStatus::InProgress);
                self.request_refresh(notice.auction_id, RefreshKind::Full);
            }
            PushEvent::BidderCount(count) => {
                self.reconciler
                    .apply_bidder_count(count.auction_id, count.total_bidders);
            }
            PushEvent::AuctionStatusUpdate(update) => {
                // High frequency: no logging on this path.
                self.reconciler.apply_status_update(&update);
                self.request_refresh(update.auction_id, RefreshKind::Status);
            }
            PushEvent::ConnectionLost(lost) => {
                let retry = lost
                    .retry_in_ms
                    .map(|ms| format!(" Retrying in {}s.", ms / 1000))
                    .unwrap_or_default();
                self.notifications.add(NotificationItem::new(
                    None,
                    NotificationKind::ConnectionLost,
                    "Connection lost",
                    format!("{}.{}", lost.reason, retry),
                ));
            }
            PushEvent::AuctionWon(notice) => {
                self.request_refresh(notice.auction_id, RefreshKind::Full);
                self.add_notice(NotificationKind::AuctionWon, &notice, "You won the auction");
            }
            PushEvent::AuctionLost(notice) => {
                self.add_notice(NotificationKind::AuctionLost, &notice, "Auction lost");
            }
            PushEvent::PaymentRequired(notice) => {
                self.add_notice(NotificationKind::PaymentRequired, &notice, "Payment required");
            }
        }
    }

    fn viewer_was_outbid(&self, outbid: &OutbidPayload) -> bool {
        self.viewer.is_me(
            outbid.previous_bidder_id.as_deref(),
            outbid.previous_bidder_nickname.as_deref(),
        )
    }

    fn on_outbid(&self, outbid: &OutbidPayload) {
        let product = outbid.product_name.as_deref().unwrap_or("an auction");
        let message = format!(
            "You were outbid on {} with a bid of {}",
            product,
            crate::formatter::format_money(outbid.bid.bid_amount)
        );
        info!(auction_id = outbid.bid.auction_id, amount = outbid.bid.bid_amount, "Viewer was outbid");
        publish(&self.events, ClientEvent::Toast {
            level: ToastLevel::Warning,
            message: message.clone(),
        });
        self.notifications.add(
            NotificationItem::new(None, NotificationKind::BidOutbid, "Outbid", message)
                .for_auction(outbid.bid.auction_id)
                .with_product(outbid.product_name.clone(), None)
                .with_amount(Some(outbid.bid.bid_amount)),
        );
    }

    fn add_notice(&self, kind: NotificationKind, notice: &AuctionNotice, title: &str) {
        let message = notice.message.clone().unwrap_or_else(|| match &notice.product_name {
            Some(product) => format!("{title}: {product}"),
            None => format!("{title} (#{})", notice.auction_id),
        });
        let item = NotificationItem::new(notice.notification_id.clone(), kind, title, message)
            .for_auction(notice.auction_id)
            .with_product(notice.product_name.clone(), notice.product_image.clone())
            .with_amount(notice.amount);
        self.notifications.add(item);
    }

    fn request_refresh(&self, auction_id: AuctionId, kind: RefreshKind) {
        if !self.reconciler.is_tracked(auction_id) {
            return;
        }
        let _ = self.refresh.send(RefreshRequest { auction_id, kind });
    }
}

impl ConnectionObserver for EventDispatcher {
    fn on_connection_lost(&self, reason: &str, retry_in: Duration) {
        let retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX);
        self.route(PushEvent::ConnectionLost(crate::types::ConnectionLostPayload {
            reason: reason.to_string(),
            retry_in_ms: Some(retry_in_ms),
        }));
    }
}

/// Drains queued requests into one batch per wake-up, keeping the strongest
/// kind per auction, in first-request order.
fn coalesce(first: RefreshRequest, rx: &mut RefreshReceiver) -> Vec<RefreshRequest> {
    let mut order = vec![first.auction_id];
    let mut kinds = HashMap::from([(first.auction_id, first.kind)]);
    while let Ok(request) = rx.try_recv() {
        match kinds.get_mut(&request.auction_id) {
            Some(kind) => *kind = (*kind).max(request.kind),
            None => {
                order.push(request.auction_id);
                kinds.insert(request.auction_id, request.kind);
            }
        }
    }
    order
        .into_iter()
        .map(|auction_id| RefreshRequest {
            auction_id,
            kind: kinds[&auction_id],
        })
        .collect()
}

/// Runs refreshes requested by the dispatcher until every sender is gone.
pub async fn run_refresh_worker(reconciler: Arc<AuctionReconciler>, mut rx: RefreshReceiver) {
    while let Some(first) = rx.recv().await {
        let batch = coalesce(first, &mut rx);
        let results = join_all(batch.iter().map(|request| {
            let reconciler = reconciler.clone();
            async move {
                match request.kind {
                    RefreshKind::Full => reconciler.force_refresh(request.auction_id).await,
                    RefreshKind::Status => reconciler
                        .refresh_status(request.auction_id)
                        .await
                        .map(|_| ()),
                }
            }
        }))
        .await;

        for (request, result) in batch.iter().zip(results) {
            if let Err(e) = result {
                warn!(auction_id = request.auction_id, kind = ?request.kind, error = %e, "Refresh failed");
            }
        }
    }
    debug!("Refresh worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_state::ClientState;
    use crate::config::ReconcilerConfig;
    use crate::events::create_event_channel;
    use crate::reconciler::tests::{FakeApi, bid, snapshot};
    use std::sync::atomic::Ordering;

    struct Harness {
        dispatcher: EventDispatcher,
        reconciler: Arc<AuctionReconciler>,
        notifications: Arc<NotificationCenter>,
        state: SharedClientState,
        refresh_rx: RefreshReceiver,
        api: Arc<FakeApi>,
    }

    async fn harness() -> Harness {
        let api = FakeApi::with_snapshot(snapshot(1));
        let (events, _) = create_event_channel();
        let viewer = Viewer {
            user_id: Some("7".into()),
            nickname: Some("me".into()),
        };
        let reconciler = Arc::new(AuctionReconciler::new(
            api.clone(),
            ReconcilerConfig::default(),
            viewer.clone(),
            events.clone(),
        ));
        reconciler.track(1);
        reconciler.force_refresh(1).await.unwrap();
        let notifications = Arc::new(NotificationCenter::new(None, events.clone()));
        let state = Arc::new(ClientState::new());
        let (dispatcher, refresh_rx) = EventDispatcher::new(
            reconciler.clone(),
            notifications.clone(),
            viewer,
            state.clone(),
            events,
        );
        Harness {
            dispatcher,
            reconciler,
            notifications,
            state,
            refresh_rx,
            api,
        }
    }

    fn envelope(event: &PushEvent) -> String {
        serde_json::to_string(event).unwrap()
    }

    #[tokio::test]
    async fn new_bid_frame_reaches_reconciler() {
        let h = harness().await;
        let body = envelope(&PushEvent::NewBid(bid(9, 1, 37_000, 1)));
        h.dispatcher.handle_frame("/topic/auction/1", &body);
        h.dispatcher.handle_frame("/topic/auction/1", &body);
        assert_eq!(
            h.reconciler.snapshot(1).unwrap().current_highest_bid,
            Some(37_000)
        );
        assert_eq!(h.reconciler.history(1).len(), 1);
        assert_eq!(h.state.duplicate_bids.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn garbage_and_unknown_types_are_dropped() {
        let h = harness().await;
        h.dispatcher.handle_frame("/topic/auction/1", "not json");
        h.dispatcher
            .handle_frame("/topic/auction/1", r#"{"type":"FLASH_SALE","data":{}}"#);
        h.dispatcher
            .handle_frame("/topic/auction/1", r#"{"type":"NEW_BID","data":{"bidId":"x"}}"#);
        let counters = h.state.counters();
        assert_eq!(counters.malformed_frames, 1);
        assert_eq!(counters.unknown_events, 2);
        assert_eq!(h.reconciler.snapshot(1), Some(snapshot(1)));
    }

    #[tokio::test]
    async fn outbid_viewer_gets_notified() {
        let h = harness().await;
        let outbid = OutbidPayload {
            bid: bid(11, 1, 40_000, 2),
            previous_bidder_id: Some("7".into()),
            previous_bidder_nickname: None,
            product_name: Some("Camera".into()),
        };
        h.dispatcher.route(PushEvent::BidOutbid(outbid.clone()));
        assert_eq!(h.notifications.unread_count(), 1);
        assert_eq!(h.notifications.list()[0].kind, NotificationKind::BidOutbid);

        let mut other = outbid;
        other.bid.bid_id = 12;
        other.previous_bidder_id = Some("8".into());
        h.dispatcher.route(PushEvent::BidOutbid(other));
        assert_eq!(h.notifications.unread_count(), 1);
        assert_eq!(h.reconciler.history(1).len(), 2);
    }

    #[tokio::test]
    async fn ended_auction_requests_full_refresh_and_notifies() {
        let mut h = harness().await;
        let notice = AuctionNotice {
            auction_id: 1,
            notification_id: Some("n-1".into()),
            product_name: Some("Camera".into()),
            product_image: None,
            amount: Some(50_000),
            message: None,
            scheduled_end_time: None,
        };
        h.dispatcher.route(PushEvent::AuctionEnded(notice.clone()));
        h.dispatcher.route(PushEvent::AuctionEnded(notice));
        assert_eq!(h.notifications.len(), 1);
        assert_eq!(
            h.reconciler.snapshot(1).unwrap().status,
            AuctionStatus::Ended
        );
        assert_eq!(
            h.refresh_rx.try_recv().unwrap(),
            RefreshRequest {
                auction_id: 1,
                kind: RefreshKind::Full
            }
        );
    }

    #[tokio::test]
    async fn connection_lost_adds_notice_only() {
        let h = harness().await;
        h.dispatcher
            .on_connection_lost("socket closed", Duration::from_secs(5));
        let items = h.notifications.list();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, NotificationKind::ConnectionLost);
        assert!(items[0].message.contains("5s"));
        assert_eq!(h.reconciler.snapshot(1), Some(snapshot(1)));
    }

    #[tokio::test]
    async fn refreshes_for_untracked_auctions_are_skipped() {
        let mut h = harness().await;
        h.dispatcher.route(PushEvent::AuctionStarted(AuctionNotice {
            auction_id: 99,
            notification_id: None,
            product_name: None,
            product_image: None,
            amount: None,
            message: None,
            scheduled_end_time: None,
        }));
        assert!(h.refresh_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn worker_coalesces_queued_requests() {
        let h = harness().await;
        let before = h.api.fetches.load(Ordering::SeqCst);
        let Harness {
            dispatcher,
            reconciler,
            refresh_rx,
            api,
            ..
        } = h;
        for _ in 0..5 {
            dispatcher.route(PushEvent::AuctionStatusUpdate(
                crate::types::StatusUpdatePayload {
                    auction_id: 1,
                    status: None,
                    current_highest_bid: None,
                    total_bids: None,
                    total_bidders: None,
                },
            ));
        }
        dispatcher.request_refresh(1, RefreshKind::Full);
        drop(dispatcher);

        run_refresh_worker(reconciler.clone(), refresh_rx).await;
        // One full refresh: one snapshot fetch, nothing for the status requests.
        assert_eq!(api.fetches.load(Ordering::SeqCst), before + 1);
        assert_eq!(
            reconciler.last_origin(1),
            Some(crate::reconciler::ApplyOrigin::ForceRefresh)
        );
    }
}
