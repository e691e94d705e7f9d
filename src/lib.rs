//! Gavel - Real-Time Live Auction Service
//!
//! The auction core: a stream of client bid submissions becomes a
//! consistent, broadcast, anti-sniped outcome across many concurrent
//! auction rooms.
//!
//! - **Bid engine**: monotonic highest-bid semantics via an atomic
//!   compare-and-commit on shared state
//! - **Timer controller**: authoritative per-auction end times,
//!   anti-snipe extensions, closure
//! - **Realtime gateway**: WebSocket session mux with pub/sub fan-out
//!   to auction rooms
//! - **Settlement sink**: durable bid history and close notifications,
//!   decoupled from the hot path
//!
//! # Architecture
//!
//! Layered the obvious way:
//! - **Models**: domain records and wire payloads
//! - **Store**: the shared state store (hot state, atomic scripts,
//!   pub/sub)
//! - **Services**: business logic
//! - **Gateway**: realtime sessions and fan-out
//! - **Handlers**: REST API
//! - **Db / Queue**: durable repositories and the settlement queue

pub mod app;
pub mod auth;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod media;
pub mod models;
pub mod queue;
pub mod services;
pub mod settings;
pub mod store;

pub use app::{App, AppContext};
pub use error::{AuctionError, Result};
pub use settings::Settings;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use models::{Auction, AuctionStatus, Bid, BidPlacement, LiveState, User};
pub use services::{AuctionService, BidEngine, SettlementSink, TimerController};
pub use store::{LiveStore, MemoryStore, RedisStore};
