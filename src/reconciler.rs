// file: src/reconciler.rs
// description: per-auction snapshot and history; push deltas only advance, forced refreshes replace

use crate::{
    api::AuctionApi,
    config::{ReconcilerConfig, Viewer},
    error::AuctionError,
    events::{ClientEvent, EventSender, publish},
    monitoring::{BIDS_MERGED_COUNTER, REFRESH_COUNTER},
    types::{
        AuctionId, AuctionSnapshot, AuctionStatus, BidEvent, BidId, BidPayload, LiveStatus,
        PageRequest, StatusUpdatePayload,
    },
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Where the last change to a view came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOrigin {
    Push,
    StatusRefresh,
    ForceRefresh,
}

/// Outcome of applying a pushed bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidMerge {
    Applied { new_high: bool },
    Duplicate,
    /// Nobody is viewing this auction.
    Untracked,
}

#[derive(Debug)]
struct AuctionView {
    viewers: usize,
    snapshot: Option<AuctionSnapshot>,
    history: Vec<BidEvent>,
    seen: HashSet<BidId>,
    /// Next history page to request when loading older bids.
    next_page: Option<PageRequest>,
    /// Issue number of the newest refresh whose result was applied.
    applied_refresh: u64,
    last_origin: Option<ApplyOrigin>,
}

impl AuctionView {
    fn new() -> Self {
        Self {
            viewers: 0,
            snapshot: None,
            history: Vec::new(),
            seen: HashSet::new(),
            next_page: None,
            applied_refresh: 0,
            last_origin: None,
        }
    }

    fn insert_bid(&mut self, bid: BidEvent) -> bool {
        if !self.seen.insert(bid.bid_id) {
            return false;
        }
        // Newest first; ties keep arrival order.
        let position = self
            .history
            .iter()
            .position(|existing| existing.bid_time < bid.bid_time)
            .unwrap_or(self.history.len());
        self.history.insert(position, bid);
        true
    }

    fn refresh_winning_flags(&mut self) {
        let high = self.snapshot.as_ref().and_then(|s| s.current_highest_bid);
        for bid in &mut self.history {
            bid.is_winning = Some(bid.bid_amount) == high;
        }
        // Equal amounts cannot both win: only the earliest keeps the flag.
        let mut seen_winner = false;
        for bid in self.history.iter_mut().rev() {
            if bid.is_winning {
                if seen_winner {
                    bid.is_winning = false;
                }
                seen_winner = true;
            }
        }
    }
}

pub struct AuctionReconciler {
    api: Arc<dyn AuctionApi>,
    config: ReconcilerConfig,
    viewer: Viewer,
    views: RwLock<HashMap<AuctionId, AuctionView>>,
    refresh_counter: std::sync::atomic::AtomicU64,
    events: EventSender,
}

impl AuctionReconciler {
    pub fn new(
        api: Arc<dyn AuctionApi>,
        config: ReconcilerConfig,
        viewer: Viewer,
        events: EventSender,
    ) -> Self {
        Self {
            api,
            config,
            viewer,
            views: RwLock::new(HashMap::new()),
            refresh_counter: std::sync::atomic::AtomicU64::new(0),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AuctionId, AuctionView>> {
        self.views.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AuctionId, AuctionView>> {
        self.views.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers one more viewer of the auction; returns true for the first.
    pub fn track(&self, auction_id: AuctionId) -> bool {
        let mut views = self.write();
        let view = views.entry(auction_id).or_insert_with(AuctionView::new);
        view.viewers += 1;
        view.viewers == 1
    }

    /// Drops one viewer; the view is evicted when the last one leaves.
    pub fn release(&self, auction_id: AuctionId) {
        let mut views = self.write();
        if let Some(view) = views.get_mut(&auction_id) {
            view.viewers = view.viewers.saturating_sub(1);
            if view.viewers == 0 {
                views.remove(&auction_id);
                debug!(auction_id, "Evicted auction view");
            }
        }
    }

    pub fn is_tracked(&self, auction_id: AuctionId) -> bool {
        self.read().contains_key(&auction_id)
    }

    pub fn tracked(&self) -> Vec<AuctionId> {
        let mut ids: Vec<AuctionId> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self, auction_id: AuctionId) -> Option<AuctionSnapshot> {
        self.read().get(&auction_id)?.snapshot.clone()
    }

    pub fn history(&self, auction_id: AuctionId) -> Vec<BidEvent> {
        self.read()
            .get(&auction_id)
            .map(|view| view.history.clone())
            .unwrap_or_default()
    }

    pub fn last_origin(&self, auction_id: AuctionId) -> Option<ApplyOrigin> {
        self.read().get(&auction_id)?.last_origin
    }

    fn is_mine(&self, bidder_nickname: &str) -> bool {
        self.viewer.is_me(None, Some(bidder_nickname))
    }

    /// Merges a pushed bid. Known bid ids are ignored; price and counters
    /// only move forward.
    pub fn apply_bid(&self, payload: &BidPayload) -> BidMerge {
        let mut bid = payload.to_bid_event();
        bid.is_my_bid = self.is_mine(&bid.bidder_nickname);

        let mut views = self.write();
        let Some(view) = views.get_mut(&payload.auction_id) else {
            return BidMerge::Untracked;
        };
        if view.seen.contains(&bid.bid_id) {
            return BidMerge::Duplicate;
        }

        let mut new_high = false;
        if let Some(snapshot) = view.snapshot.as_mut() {
            if snapshot.current_highest_bid.is_none_or(|high| bid.bid_amount > high) {
                snapshot.current_highest_bid = Some(bid.bid_amount);
                snapshot.current_winner_nickname = Some(bid.bidder_nickname.clone());
                new_high = true;
            }
            snapshot.total_bids = match payload.total_bids {
                Some(total) => snapshot.total_bids.max(total),
                None => snapshot.total_bids + 1,
            };
            if let Some(bidders) = payload.total_bidders {
                snapshot.total_bidders = snapshot.total_bidders.max(bidders);
            }
        }
        view.insert_bid(bid);
        view.refresh_winning_flags();
        view.last_origin = Some(ApplyOrigin::Push);
        drop(views);

        BIDS_MERGED_COUNTER.increment(1);
        debug!(
            auction_id = payload.auction_id,
            bid_id = payload.bid_id,
            amount = payload.bid_amount,
            "Merged pushed bid"
        );
        publish(&self.events, ClientEvent::HistoryUpdated {
            auction_id: payload.auction_id,
        });
        publish(&self.events, ClientEvent::SnapshotUpdated {
            auction_id: payload.auction_id,
        });
        BidMerge::Applied { new_high }
    }

    /// Moves the auction forward in its lifecycle; never backwards.
    pub fn advance_status(&self, auction_id: AuctionId, status: AuctionStatus) -> bool {
        let advanced = self.mutate_snapshot(auction_id, |snapshot| {
            if status.rank() > snapshot.status.rank() {
                snapshot.status = status;
                true
            } else {
                false
            }
        });
        if advanced {
            publish(&self.events, ClientEvent::SnapshotUpdated { auction_id });
        }
        advanced
    }

    pub fn apply_bidder_count(&self, auction_id: AuctionId, total_bidders: u64) -> bool {
        let changed = self.mutate_snapshot(auction_id, |snapshot| {
            if total_bidders > snapshot.total_bidders {
                snapshot.total_bidders = total_bidders;
                true
            } else {
                false
            }
        });
        if changed {
            publish(&self.events, ClientEvent::SnapshotUpdated { auction_id });
        }
        changed
    }

    /// Applies whichever fields a high-frequency status push carries.
    /// Deliberately silent: no logging on this path.
    pub fn apply_status_update(&self, update: &StatusUpdatePayload) -> bool {
        let changed = self.mutate_snapshot(update.auction_id, |snapshot| {
            let mut changed = false;
            if let Some(status) = update.status
                && status.rank() > snapshot.status.rank()
            {
                snapshot.status = status;
                changed = true;
            }
            if let Some(high) = update.current_highest_bid
                && snapshot.current_highest_bid.is_none_or(|current| high > current)
            {
                snapshot.current_highest_bid = Some(high);
                changed = true;
            }
            if let Some(total) = update.total_bids
                && total > snapshot.total_bids
            {
                snapshot.total_bids = total;
                changed = true;
            }
            if let Some(bidders) = update.total_bidders
                && bidders > snapshot.total_bidders
            {
                snapshot.total_bidders = bidders;
                changed = true;
            }
            changed
        });
        if changed {
            publish(&self.events, ClientEvent::SnapshotUpdated {
                auction_id: update.auction_id,
            });
        }
        changed
    }

    fn mutate_snapshot(
        &self,
        auction_id: AuctionId,
        apply: impl FnOnce(&mut AuctionSnapshot) -> bool,
    ) -> bool {
        let mut views = self.write();
        let Some(view) = views.get_mut(&auction_id) else {
            return false;
        };
        let Some(snapshot) = view.snapshot.as_mut() else {
            return false;
        };
        let changed = apply(snapshot);
        if changed {
            view.last_origin = Some(ApplyOrigin::Push);
        }
        changed
    }

    fn next_refresh_issue(&self) -> u64 {
        self.refresh_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1
    }

    /// Re-fetches snapshot and first history page and replaces local state.
    /// A refresh that finishes after a newer one was applied is discarded.
    pub async fn force_refresh(&self, auction_id: AuctionId) -> Result<(), AuctionError> {
        if !self.is_tracked(auction_id) {
            return Err(AuctionError::UntrackedAuction(auction_id));
        }
        let issue = self.next_refresh_issue();
        let first_page = PageRequest::first(self.config.history_page_size);
        let (snapshot, history) = tokio::try_join!(
            self.api.fetch_auction(auction_id),
            self.api.fetch_bid_history(auction_id, first_page),
        )?;
        REFRESH_COUNTER.increment(1);

        let mut views = self.write();
        let Some(view) = views.get_mut(&auction_id) else {
            debug!(auction_id, "Auction left during refresh; discarding result");
            return Ok(());
        };
        if issue < view.applied_refresh {
            debug!(auction_id, issue, "Discarding superseded refresh");
            return Ok(());
        }

        view.applied_refresh = issue;
        view.snapshot = Some(snapshot);
        view.history.clear();
        view.seen.clear();
        for mut bid in history.content {
            bid.is_my_bid = self.is_mine(&bid.bidder_nickname);
            view.insert_bid(bid);
        }
        view.refresh_winning_flags();
        view.next_page = (!history.last).then(|| first_page.next());
        view.last_origin = Some(ApplyOrigin::ForceRefresh);
        let bids = view.history.len();
        drop(views);

        info!(auction_id, bids, "Auction state refreshed");
        publish(&self.events, ClientEvent::SnapshotUpdated { auction_id });
        publish(&self.events, ClientEvent::HistoryUpdated { auction_id });
        Ok(())
    }

    /// Lightweight live-status poll. Authoritative for status, bid unit and
    /// end time; counters and price still only move forward here.
    pub async fn refresh_status(&self, auction_id: AuctionId) -> Result<bool, AuctionError> {
        if !self.is_tracked(auction_id) {
            return Err(AuctionError::UntrackedAuction(auction_id));
        }
        let live = self.api.fetch_live_status(auction_id).await?;
        let changed = {
            let mut views = self.write();
            let Some(view) = views.get_mut(&auction_id) else {
                return Ok(false);
            };
            let Some(snapshot) = view.snapshot.as_mut() else {
                return Ok(false);
            };
            let changed = merge_live_status(snapshot, &live);
            if changed {
                view.last_origin = Some(ApplyOrigin::StatusRefresh);
                view.refresh_winning_flags();
            }
            changed
        };
        if changed {
            publish(&self.events, ClientEvent::SnapshotUpdated { auction_id });
        }
        Ok(changed)
    }

    /// Appends the next older history page; bids already known are skipped.
    /// Returns how many bids were added.
    pub async fn load_more_history(&self, auction_id: AuctionId) -> Result<usize, AuctionError> {
        let page = {
            let views = self.read();
            let view = views
                .get(&auction_id)
                .ok_or(AuctionError::UntrackedAuction(auction_id))?;
            match view.next_page {
                Some(page) => page,
                None => return Ok(0),
            }
        };
        let fetched = self.api.fetch_bid_history(auction_id, page).await?;

        let mut views = self.write();
        let Some(view) = views.get_mut(&auction_id) else {
            return Ok(0);
        };
        // A refresh in the meantime restarted paging.
        if view.next_page != Some(page) {
            return Ok(0);
        }
        let mut added = 0;
        for mut bid in fetched.content {
            bid.is_my_bid = self.is_mine(&bid.bidder_nickname);
            if view.insert_bid(bid) {
                added += 1;
            }
        }
        view.refresh_winning_flags();
        view.next_page = (!fetched.last).then(|| page.next());
        drop(views);

        if added > 0 {
            publish(&self.events, ClientEvent::HistoryUpdated { auction_id });
        }
        Ok(added)
    }

    pub fn has_more_history(&self, auction_id: AuctionId) -> bool {
        self.read()
            .get(&auction_id)
            .is_some_and(|view| view.next_page.is_some())
    }
}

fn merge_live_status(snapshot: &mut AuctionSnapshot, live: &LiveStatus) -> bool {
    let before = snapshot.clone();
    snapshot.status = live.status;
    snapshot.bid_unit = live.bid_unit;
    if let Some(end) = live.scheduled_end_time {
        snapshot.scheduled_end_time = end;
    }
    if let Some(high) = live.current_highest_bid
        && snapshot.current_highest_bid.is_none_or(|current| high > current)
    {
        snapshot.current_highest_bid = Some(high);
        if live.current_winner_nickname.is_some() {
            snapshot.current_winner_nickname = live.current_winner_nickname.clone();
        }
    }
    snapshot.total_bids = snapshot.total_bids.max(live.total_bids);
    snapshot.total_bidders = snapshot.total_bidders.max(live.total_bidders);
    *snapshot != before
}
