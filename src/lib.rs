//! Real-time synchronization and notification engine for live auctions.
//!
//! One push connection (STOMP over WebSocket, with a long-polling fallback)
//! feeds ref-counted topic subscriptions. Incoming events are merged into
//! per-auction snapshots that REST refreshes keep honest, bids go through a
//! single-flight controller, and user-facing notices land in a local ledger.

/// REST collaborators: auction reads, bid mutations, notification persistence.
pub mod api;
/// Bid and buy-it-now submission with local validation.
pub mod bidding;
/// Command-line argument definitions.
pub mod cli;
/// Connection lifecycle state and integrity counters.
pub mod client_state;
/// Runtime configuration model.
pub mod config;
/// Push connection: connect, heartbeat, reconnect, resubscribe.
pub mod connection;
/// Push event routing.
pub mod dispatcher;
/// Component wiring and the watched-auction handle.
pub mod engine;
/// Error types used across the crate.
pub mod error;
/// Event bus between the engine and its presenters.
pub mod events;
/// Terminal formatting helpers.
pub mod formatter;
/// Metrics and health status structures.
pub mod monitoring;
/// Local notification ledger.
pub mod notifications;
/// Per-auction snapshot and bid history reconciliation.
pub mod reconciler;
/// Topic subscription registry.
pub mod registry;
/// STOMP 1.2 frame codec and heart-beat negotiation.
pub mod stomp;
/// Tracing/logging initialization.
pub mod tracing_setup;
/// Push transports.
pub mod transport;
/// Auction data model and wire payloads.
pub mod types;
/// Console presenter.
pub mod ui;

/// Primary crate error type.
pub use error::AuctionError;
pub use engine::{AuctionEngine, AuctionPage};
