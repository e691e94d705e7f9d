//! Gavel Business Logic Services
//!
//! Service layer implementing the auction core: bid admission, the
//! anti-snipe timer controller, auction lifecycle, user sync, and the
//! settlement sink.

pub mod auction;
pub mod bid_engine;
pub mod closer;
pub mod settlement;
pub mod timer;
pub mod user;

pub use auction::AuctionService;
pub use bid_engine::BidEngine;
pub use closer::{AuctionCloser, CloseOutcome};
pub use settlement::{Notifier, SettlementSink, WebhookNotifier};
pub use timer::TimerController;
pub use user::UserDirectory;
