use async_trait::async_trait;
use auction_live::{
    AuctionEngine, AuctionError,
    api::{AuctionApi, NotificationStore},
    client_state::ConnectionState,
    config::{Config, Viewer},
    events::{ClientEvent, EventReceiver},
    stomp::{Command, Frame},
    transport::{MemoryConnector, MemorySession},
    types::{
        AuctionId, AuctionSnapshot, AuctionStatus, BidEvent, BidReceipt, BidRequest, LiveStatus,
        NotificationItem, NotificationKind, Page, PageRequest, PurchaseReceipt,
    },
};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Default)]
struct StubServer {
    auctions: Mutex<HashMap<AuctionId, AuctionSnapshot>>,
    next_bid_id: AtomicI64,
    bids_placed: AtomicUsize,
    read_all_calls: AtomicUsize,
}

impl StubServer {
    fn with_auctions(ids: &[AuctionId]) -> Arc<Self> {
        let server = StubServer::default();
        server.next_bid_id.store(1000, Ordering::SeqCst);
        {
            let mut auctions = server.auctions.lock().unwrap();
            for id in ids {
                auctions.insert(
                    *id,
                    AuctionSnapshot {
                        auction_id: *id,
                        status: AuctionStatus::InProgress,
                        current_highest_bid: Some(35_000),
                        starting_price: 10_000,
                        buy_it_now_price: Some(60_000),
                        bid_unit: 1_000,
                        total_bids: 5,
                        total_bidders: 3,
                        current_winner_nickname: Some("lee".into()),
                        scheduled_end_time: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
                    },
                );
            }
        }
        Arc::new(server)
    }
}

#[async_trait]
impl AuctionApi for StubServer {
    async fn fetch_auction(&self, auction_id: AuctionId) -> Result<AuctionSnapshot, AuctionError> {
        self.auctions
            .lock()
            .unwrap()
            .get(&auction_id)
            .cloned()
            .ok_or(AuctionError::Api {
                status: 404,
                message: "Auction not found".into(),
            })
    }

    async fn fetch_live_status(&self, auction_id: AuctionId) -> Result<LiveStatus, AuctionError> {
        let s = self.fetch_auction(auction_id).await?;
        Ok(LiveStatus {
            auction_id,
            status: s.status,
            current_highest_bid: s.current_highest_bid,
            bid_unit: s.bid_unit,
            total_bids: s.total_bids,
            total_bidders: s.total_bidders,
            current_winner_nickname: s.current_winner_nickname,
            scheduled_end_time: Some(s.scheduled_end_time),
        })
    }

    async fn fetch_bid_history(
        &self,
        _auction_id: AuctionId,
        page: PageRequest,
    ) -> Result<Page<BidEvent>, AuctionError> {
        Ok(Page {
            content: Vec::new(),
            number: page.page,
            total_elements: 0,
            last: true,
        })
    }

    async fn place_bid(&self, request: BidRequest) -> Result<BidReceipt, AuctionError> {
        self.bids_placed.fetch_add(1, Ordering::SeqCst);
        let mut auctions = self.auctions.lock().unwrap();
        let auction = auctions
            .get_mut(&request.auction_id)
            .ok_or(AuctionError::Api {
                status: 404,
                message: "Auction not found".into(),
            })?;
        auction.current_highest_bid = Some(request.bid_amount);
        auction.current_winner_nickname = Some("me".into());
        auction.total_bids += 1;
        Ok(BidReceipt {
            bid_id: self.next_bid_id.fetch_add(1, Ordering::SeqCst),
            auction_id: request.auction_id,
            bid_amount: request.bid_amount,
            is_winning: true,
        })
    }

    async fn buy_now(&self, auction_id: AuctionId) -> Result<PurchaseReceipt, AuctionError> {
        Err(AuctionError::Api {
            status: 409,
            message: format!("auction {auction_id} already sold"),
        })
    }
}

#[async_trait]
impl NotificationStore for StubServer {
    async fn fetch_notifications(&self) -> Result<Vec<NotificationItem>, AuctionError> {
        Ok(vec![NotificationItem::new(
            Some("persisted-1".into()),
            NotificationKind::System,
            "Welcome",
            "Happy bidding",
        )])
    }

    async fn mark_read(&self, _id: &str) -> Result<(), AuctionError> {
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), AuctionError> {
        self.read_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), AuctionError> {
        Ok(())
    }
}

struct Harness {
    engine: AuctionEngine,
    server: Arc<StubServer>,
    sessions: mpsc::UnboundedReceiver<MemorySession>,
    events: EventReceiver,
}

async fn start(auctions: &[AuctionId], user_id: Option<&str>) -> Harness {
    let server = StubServer::with_auctions(auctions);
    let (connector, sessions) = MemoryConnector::new();
    let config = Config {
        viewer: Viewer {
            user_id: user_id.map(str::to_string),
            nickname: Some("me".into()),
        },
        ..Config::default()
    };
    let engine = AuctionEngine::init(
        config,
        Arc::new(connector),
        server.clone(),
        Some(server.clone()),
    )
    .await;
    let events = engine.subscribe_events();
    Harness {
        engine,
        server,
        sessions,
        events,
    }
}

/// Plays the broker side of a handshake.
async fn accept(sessions: &mut mpsc::UnboundedReceiver<MemorySession>) -> MemorySession {
    let mut session = sessions.recv().await.expect("client should connect");
    let connect = session.next_frame().await.expect("CONNECT frame");
    assert_eq!(connect.command, Command::Connect);
    session.send(&Frame::new(Command::Connected).header("heart-beat", "0,0"));
    session
}

async fn subscribed_destinations(session: &mut MemorySession, count: usize) -> Vec<String> {
    let mut destinations = Vec::new();
    for _ in 0..count {
        let frame = session.next_frame().await.expect("SUBSCRIBE frame");
        assert_eq!(frame.command, Command::Subscribe);
        destinations.push(frame.get("destination").unwrap().to_string());
    }
    destinations.sort();
    destinations
}

fn message(destination: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("destination", destination)
        .body(body)
}

async fn next_matching(events: &mut EventReceiver, wanted: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

#[tokio::test(start_paused = true)]
async fn three_topics_are_resubscribed_once_after_connection_loss() {
    let mut h = start(&[1, 2, 3], None).await;
    let _pages = [
        h.engine.open_auction(1).await.unwrap(),
        h.engine.open_auction(2).await.unwrap(),
        h.engine.open_auction(3).await.unwrap(),
    ];

    let mut session = accept(&mut h.sessions).await;
    assert_eq!(subscribed_destinations(&mut session, 3).await.len(), 3);
    assert!(h.engine.wait_for_state(ConnectionState::Connected).await);

    drop(session);
    let mut session = accept(&mut h.sessions).await;
    assert_eq!(
        subscribed_destinations(&mut session, 3).await,
        vec!["/topic/auction/1", "/topic/auction/2", "/topic/auction/3"]
    );
    assert!(
        timeout(Duration::from_secs(2), session.next_frame())
            .await
            .is_err(),
        "each topic is resubscribed exactly once"
    );

    let lost: Vec<_> = h
        .engine
        .notifications()
        .list()
        .into_iter()
        .filter(|item| item.kind == NotificationKind::ConnectionLost)
        .collect();
    assert_eq!(lost.len(), 1);
    // Snapshots are untouched by the outage.
    assert_eq!(h.engine.snapshot(2).unwrap().current_highest_bid, Some(35_000));
}

#[tokio::test(start_paused = true)]
async fn pushed_bid_updates_snapshot_and_duplicates_are_ignored() {
    let mut h = start(&[7], None).await;
    let _page = h.engine.open_auction(7).await.unwrap();
    let mut session = accept(&mut h.sessions).await;
    subscribed_destinations(&mut session, 1).await;

    let body = r#"{"type":"NEW_BID","data":{"bidId":55,"auctionId":7,"bidAmount":37000,
        "bidderNickname":"kim","bidTime":"2026-03-01T12:00:00Z","totalBids":6}}"#;
    session.send(&message("/topic/auction/7", body));
    session.send(&message("/topic/auction/7", body));
    session.send(&message("/topic/auction/7", "{not json"));
    session.send(&message(
        "/topic/auction/7",
        r#"{"type":"BIDDER_COUNT","data":{"auctionId":7,"totalBidders":9}}"#,
    ));

    next_matching(&mut h.events, |e| matches!(e, ClientEvent::SnapshotUpdated { auction_id: 7 })).await;
    timeout(Duration::from_secs(5), async {
        while h.engine.snapshot(7).unwrap().total_bidders != 9 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let snapshot = h.engine.snapshot(7).unwrap();
    assert_eq!(snapshot.current_highest_bid, Some(37_000));
    assert_eq!(snapshot.current_winner_nickname.as_deref(), Some("kim"));
    assert_eq!(snapshot.total_bids, 6);
    assert_eq!(h.engine.history(7).len(), 1);

    let counters = h.engine.counters();
    assert_eq!(counters.duplicate_bids, 1);
    assert_eq!(counters.malformed_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn accepted_bid_refreshes_from_server() {
    let mut h = start(&[4], None).await;
    let _page = h.engine.open_auction(4).await.unwrap();

    assert!(
        h.engine
            .submit_bid(4, 35_500, false, None)
            .await
            .unwrap_err()
            .is_validation()
    );
    assert_eq!(h.server.bids_placed.load(Ordering::SeqCst), 0);

    let receipt = h.engine.submit_bid(4, 36_000, false, None).await.unwrap();
    assert!(receipt.is_winning);
    next_matching(&mut h.events, |e| matches!(e, ClientEvent::ListingsInvalidated { auction_id: 4 })).await;

    let snapshot = h.engine.snapshot(4).unwrap();
    assert_eq!(snapshot.current_highest_bid, Some(36_000));
    assert_eq!(snapshot.current_winner_nickname.as_deref(), Some("me"));
    assert!(
        h.engine
            .notifications()
            .list()
            .iter()
            .any(|item| item.kind == NotificationKind::BidPlaced && item.related_id == Some(4))
    );

    let rejected = h.engine.buy_now(4).await.unwrap_err();
    assert_eq!(rejected.to_string(), "rejected by server: auction 4 already sold");
}

#[tokio::test(start_paused = true)]
async fn user_queue_notices_are_deduplicated() {
    let mut h = start(&[9], Some("42")).await;
    let _page = h.engine.open_auction(9).await.unwrap();
    let mut session = accept(&mut h.sessions).await;
    assert_eq!(
        subscribed_destinations(&mut session, 2).await,
        vec!["/queue/user/42/notifications", "/topic/auction/9"]
    );

    let won = r#"{"type":"AUCTION_WON","data":{"auctionId":9,"notificationId":"won-9",
        "productName":"Film camera","amount":52000}}"#;
    session.send(&message("/queue/user/42/notifications", won));
    session.send(&message("/queue/user/42/notifications", won));
    next_matching(&mut h.events, |e| matches!(e, ClientEvent::NotificationAdded(_))).await;

    let notifications = h.engine.notifications();
    // Persisted welcome notice plus exactly one win.
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications.unread_count(), 2);
    let won = notifications.get("won-9").unwrap();
    assert_eq!(won.kind, NotificationKind::AuctionWon);
    assert_eq!(won.action_url.as_deref(), Some("/auctions/9"));

    notifications.mark_all_read();
    assert_eq!(notifications.unread_count(), 0);
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.server.read_all_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn closing_pages_unsubscribes_once_and_shutdown_disconnects() {
    let mut h = start(&[5], None).await;
    let first = h.engine.open_auction(5).await.unwrap();
    let second = h.engine.open_auction(5).await.unwrap();
    let mut session = accept(&mut h.sessions).await;
    subscribed_destinations(&mut session, 1).await;
    assert_eq!(h.engine.subscriptions()[0].ref_count, 2);

    drop(first);
    assert!(h.engine.snapshot(5).is_some());
    drop(second);
    assert!(h.engine.open_auctions().is_empty());

    let unsubscribe = session.next_frame().await.unwrap();
    assert_eq!(unsubscribe.command, Command::Unsubscribe);

    h.engine.shutdown().await;
    assert_eq!(session.next_frame().await.unwrap().command, Command::Disconnect);
    assert_eq!(h.engine.connection_status().state, ConnectionState::Disconnected);
    // Second shutdown is harmless.
    h.engine.shutdown().await;
}
