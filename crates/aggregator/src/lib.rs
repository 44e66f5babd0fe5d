//! WoM Aggregator Service
//!
//! Receives signed hub reports, checks them against the federation binding,
//! feeds them into the reward periods, and once a period has ended
//! materializes its UEM reward and submits the payout transaction.

pub mod batch;
pub mod collector;
pub mod locks;
pub mod poster;
pub mod service;
#[cfg(test)]
mod tests;

pub use batch::{RewardBuilder, REWARD_PERIOD_TYPE};
pub use collector::ReportCollector;
pub use locks::{JobLock, KeyedLocks};
pub use poster::{BuiltTransaction, DryRunSubmitter, RewardPoster, SubmitResult, TransactionSubmitter};
pub use service::{AggregatorConfig, AggregatorService};
