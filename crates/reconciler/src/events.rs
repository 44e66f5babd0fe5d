//! Contract events mined on chain.
//!
//! Every event carries the absolute state of what it describes, so applying
//! it overwrites the local mirror and applying it twice changes nothing.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use wom_core::amount::decimal;
use wom_core::{Address, Lease, Offer, TransactionStatus};
use wom_federation::FederationEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChainEvent {
    Lease(LeaseEvent),
    Offer(OfferEvent),
    Reward(RewardEvent),
    Federation(FederationEvent),
}

impl ChainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lease(_) => "lease",
            Self::Offer(_) => "offer",
            Self::Reward(_) => "reward",
            Self::Federation(_) => "federation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseChange {
    Acquired,
    RentPaid,
    Ended,
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseEvent {
    pub change: LeaseChange,
    pub id: u64,
    pub deed_id: u64,
    pub owner: Address,
    pub tenant: Address,
    pub start_date: u64,
    pub end_date: u64,
    pub paid_months: u32,
    pub owner_minting_percentage: u8,
}

impl LeaseEvent {
    /// Lease mirror after this event, keeping the stored record version.
    pub fn apply(&self, existing: Option<&Lease>, transaction_hash: &str) -> Lease {
        Lease {
            id: self.id,
            deed_id: self.deed_id,
            owner: self.owner.clone(),
            tenant: self.tenant.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            paid_months: self.paid_months,
            owner_minting_percentage: self.owner_minting_percentage,
            confirmed: true,
            transaction_hash: Some(transaction_hash.to_ascii_lowercase()),
            transaction_status: TransactionStatus::Validated,
            version: existing.map(|l| l.version).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferChange {
    Created,
    Updated,
    Deleted,
    Acquired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferEvent {
    pub change: OfferChange,
    pub id: u64,
    pub deed_id: u64,
    pub owner: Address,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    #[serde(default)]
    pub expiration_date: Option<u64>,
}

impl OfferEvent {
    pub fn apply(&self, existing: Option<&Offer>, transaction_hash: &str) -> Offer {
        Offer {
            id: self.id,
            deed_id: self.deed_id,
            owner: self.owner.clone(),
            amount: self.amount.clone(),
            expiration_date: self.expiration_date,
            enabled: matches!(self.change, OfferChange::Created | OfferChange::Updated),
            transaction_hash: Some(transaction_hash.to_ascii_lowercase()),
            transaction_status: TransactionStatus::Validated,
            version: existing.map(|o| o.version).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RewardEvent {
    /// Accumulated rewards withdrawn by a recipient.
    #[serde(rename_all = "camelCase")]
    Claimed {
        recipient: Address,
        receiver: Address,
        #[serde(with = "decimal")]
        amount: BigUint,
    },
    /// Payout transaction of a computed reward.
    #[serde(rename_all = "camelCase")]
    RewardSent { reward_id: String },
}
