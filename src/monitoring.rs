use crate::{client_state::ClientCounters, error::AuctionError};
use anyhow::Result;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock};
use tracing::{error, info};

// Global metrics
pub static FRAMES_RECEIVED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("auction_frames_received_total"));
pub static FRAMES_DROPPED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("auction_frames_dropped_total"));
pub static BIDS_MERGED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("auction_bids_merged_total"));
pub static RECONNECT_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("auction_reconnects_total"));
pub static REFRESH_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("auction_snapshot_refreshes_total"));
pub static CONNECTED_GAUGE: LazyLock<Gauge> = LazyLock::new(|| gauge!("auction_connected"));

/// Counts a finished submission by outcome label.
pub fn record_submission(outcome: &'static str) {
    counter!("auction_bid_submissions_total", "outcome" => outcome).increment(1);
}

pub async fn setup_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "auction-live")
        .add_global_label("version", env!("CARGO_PKG_VERSION"));

    match builder.install() {
        Ok(_handle) => {
            info!(
                "Prometheus metrics server started on http://{}/metrics",
                addr
            );

            FRAMES_RECEIVED_COUNTER.absolute(0);
            FRAMES_DROPPED_COUNTER.absolute(0);
            BIDS_MERGED_COUNTER.absolute(0);
            RECONNECT_COUNTER.absolute(0);
            REFRESH_COUNTER.absolute(0);
            CONNECTED_GAUGE.set(0.0);

            Ok(())
        }
        Err(e) => {
            error!("Failed to start metrics server: {}", e);
            Err(AuctionError::MetricsError(e.to_string()).into())
        }
    }
}

#[derive(Debug)]
pub struct HealthStatus {
    pub is_connected: bool,
    pub counters: ClientCounters,
    pub open_auctions: usize,
    pub unread_notifications: usize,
    pub reconnect_count: u32,
}

impl HealthStatus {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.is_connected { "connected" } else { "degraded" },
            "total_messages": self.counters.messages,
            "duplicate_bids": self.counters.duplicate_bids,
            "malformed_frames": self.counters.malformed_frames,
            "unknown_events": self.counters.unknown_events,
            "open_auctions": self.open_auctions,
            "unread_notifications": self.unread_notifications,
            "reconnect_count": self.reconnect_count,
            "timestamp": chrono::Utc::now()
        })
    }
}
