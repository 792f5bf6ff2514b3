// file: src/bidding.rs
// description: single-flight bid and buy-it-now submission with advisory local validation

use crate::{
    api::AuctionApi,
    config::BiddingConfig,
    error::{AuctionError, BidError, BidValidationError},
    events::{BidPhase, ClientEvent, EventSender, ToastLevel, publish},
    formatter::format_money,
    monitoring::record_submission,
    notifications::NotificationCenter,
    reconciler::AuctionReconciler,
    types::{AuctionId, AuctionSnapshot, BidReceipt, BidRequest, Money, NotificationKind, PurchaseReceipt},
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    /// `amount` is `None` for a buy-it-now purchase.
    Pending { amount: Option<Money> },
}

/// Checks a bid against the locally known snapshot.
pub fn validate_bid(
    snapshot: Option<&AuctionSnapshot>,
    amount: Money,
    is_auto_bid: bool,
    max_auto_bid_amount: Option<Money>,
) -> Result<(), BidValidationError> {
    let snapshot = snapshot.ok_or(BidValidationError::AuctionNotLoaded)?;
    if !snapshot.status.is_open() {
        return Err(BidValidationError::AuctionNotOpen {
            status: snapshot.status,
        });
    }
    if amount <= 0 {
        return Err(BidValidationError::NonPositiveAmount);
    }
    let floor = snapshot.price_floor();
    if amount <= floor {
        return Err(BidValidationError::NotAboveCurrent { floor });
    }
    if let Some(buy_it_now) = snapshot.buy_it_now_price
        && amount >= buy_it_now
    {
        return Err(BidValidationError::NotBelowBuyItNow { buy_it_now });
    }
    if snapshot.bid_unit > 0 && amount % snapshot.bid_unit != 0 {
        return Err(BidValidationError::NotMultipleOfUnit {
            unit: snapshot.bid_unit,
        });
    }
    if is_auto_bid {
        let ceiling = max_auto_bid_amount.ok_or(BidValidationError::MissingAutoBidCeiling)?;
        if ceiling <= amount {
            return Err(BidValidationError::AutoBidCeilingTooLow { ceiling });
        }
    }
    Ok(())
}

pub fn validate_buy_now(snapshot: Option<&AuctionSnapshot>) -> Result<Money, BidValidationError> {
    let snapshot = snapshot.ok_or(BidValidationError::AuctionNotLoaded)?;
    if !snapshot.status.is_open() {
        return Err(BidValidationError::AuctionNotOpen {
            status: snapshot.status,
        });
    }
    snapshot.buy_it_now_price.ok_or(BidValidationError::NoBuyItNow)
}

/// Holds the per-auction slot; releasing it on drop covers every exit path.
struct InFlight<'a> {
    slots: &'a Mutex<HashMap<AuctionId, SubmissionState>>,
    auction_id: AuctionId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.auction_id);
    }
}

pub struct BidController {
    api: Arc<dyn AuctionApi>,
    reconciler: Arc<AuctionReconciler>,
    notifications: Arc<NotificationCenter>,
    config: BiddingConfig,
    in_flight: Mutex<HashMap<AuctionId, SubmissionState>>,
    events: EventSender,
}

impl BidController {
    pub fn new(
        api: Arc<dyn AuctionApi>,
        reconciler: Arc<AuctionReconciler>,
        notifications: Arc<NotificationCenter>,
        config: BiddingConfig,
        events: EventSender,
    ) -> Self {
        Self {
            api,
            reconciler,
            notifications,
            config,
            in_flight: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<AuctionId, SubmissionState>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, auction_id: AuctionId) -> SubmissionState {
        self.slots()
            .get(&auction_id)
            .copied()
            .unwrap_or(SubmissionState::Idle)
    }

    fn claim(&self, auction_id: AuctionId, amount: Option<Money>) -> Result<InFlight<'_>, BidError> {
        let mut slots = self.slots();
        if slots.contains_key(&auction_id) {
            return Err(BidError::AlreadySubmitting);
        }
        slots.insert(auction_id, SubmissionState::Pending { amount });
        Ok(InFlight {
            slots: &self.in_flight,
            auction_id,
        })
    }

    fn phase(&self, auction_id: AuctionId, amount: Option<Money>, phase: BidPhase) {
        publish(&self.events, ClientEvent::BidStateChanged {
            auction_id,
            amount,
            phase,
        });
    }

    pub async fn submit_bid(
        &self,
        auction_id: AuctionId,
        amount: Money,
        is_auto_bid: bool,
        max_auto_bid_amount: Option<Money>,
    ) -> Result<BidReceipt, BidError> {
        let guard = self.claim(auction_id, Some(amount))?;
        let snapshot = self.reconciler.snapshot(auction_id);
        if let Err(e) = validate_bid(snapshot.as_ref(), amount, is_auto_bid, max_auto_bid_amount) {
            record_submission("invalid");
            return Err(e.into());
        }

        let request = BidRequest {
            auction_id,
            bid_amount: amount,
            is_auto_bid,
            max_auto_bid_amount: max_auto_bid_amount.filter(|_| is_auto_bid),
        };
        let receipt = self
            .run(auction_id, Some(amount), self.api.place_bid(request))
            .await;
        drop(guard);

        let receipt = receipt?;
        info!(auction_id, amount, bid_id = receipt.bid_id, "Bid accepted");
        self.notifications.notify_local(
            NotificationKind::BidPlaced,
            "Bid placed",
            format!("Your bid of {} was placed", format_money(amount)),
            Some(auction_id),
        );
        self.after_success(auction_id).await;
        Ok(receipt)
    }

    pub async fn buy_now(&self, auction_id: AuctionId) -> Result<PurchaseReceipt, BidError> {
        let guard = self.claim(auction_id, None)?;
        let snapshot = self.reconciler.snapshot(auction_id);
        if let Err(e) = validate_buy_now(snapshot.as_ref()) {
            record_submission("invalid");
            return Err(e.into());
        }

        let receipt = self.run(auction_id, None, self.api.buy_now(auction_id)).await;
        drop(guard);

        let receipt = receipt?;
        info!(auction_id, price = receipt.price, "Purchase completed");
        self.notifications.notify_local(
            NotificationKind::PurchaseCompleted,
            "Purchase completed",
            format!("You bought it for {}", format_money(receipt.price)),
            Some(auction_id),
        );
        self.after_success(auction_id).await;
        Ok(receipt)
    }

    /// Drives one mutation through PENDING to its outcome.
    async fn run<T>(
        &self,
        auction_id: AuctionId,
        amount: Option<Money>,
        call: impl Future<Output = Result<T, AuctionError>>,
    ) -> Result<T, BidError> {
        self.phase(auction_id, amount, BidPhase::Pending);

        match tokio::time::timeout(self.config.submission_timeout, call).await {
            Ok(Ok(value)) => {
                record_submission("accepted");
                self.phase(auction_id, amount, BidPhase::Succeeded);
                Ok(value)
            }
            Ok(Err(e)) => {
                let reason = e.reason();
                warn!(auction_id, error = %e, "Submission rejected");
                record_submission("rejected");
                publish(&self.events, ClientEvent::Toast {
                    level: ToastLevel::Error,
                    message: reason.clone(),
                });
                self.phase(auction_id, amount, BidPhase::Failed {
                    reason: reason.clone(),
                });
                Err(BidError::Rejected { reason })
            }
            Err(_) => {
                warn!(
                    auction_id,
                    timeout_secs = self.config.submission_timeout.as_secs(),
                    "Submission timed out; outcome unknown"
                );
                record_submission("timeout");
                publish(&self.events, ClientEvent::Toast {
                    level: ToastLevel::Warning,
                    message: BidError::Timeout.to_string(),
                });
                self.phase(auction_id, amount, BidPhase::TimedOut);
                Err(BidError::Timeout)
            }
        }
    }

    async fn after_success(&self, auction_id: AuctionId) {
        publish(&self.events, ClientEvent::ListingsInvalidated { auction_id });
        if let Err(e) = self.reconciler.force_refresh(auction_id).await {
            warn!(auction_id, error = %e, "Refresh after submission failed");
        }
    }
}
