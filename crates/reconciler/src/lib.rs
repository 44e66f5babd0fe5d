//! WoM Blockchain Reconciler
//!
//! Keeps the local records in line with the chain: applies mined contract
//! events (leases, offers, reward claims and payouts, federation bindings),
//! resolves transactions still in progress and settles reward payouts.

pub mod chain;
pub mod events;
pub mod reconciler;

pub use chain::{ChainReader, InMemoryChain, MinedEvent, TransactionOutcome};
pub use events::{ChainEvent, LeaseChange, LeaseEvent, OfferChange, OfferEvent, RewardEvent};
pub use reconciler::{BlockWatermark, BlockchainReconciler, ReconcilerConfig, MINED_EVENTS_CHECK_SETTING};
