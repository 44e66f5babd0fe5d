//! Persisted records: hubs, deeds, hub reports, UEM rewards and the lease/offer
//! mirror.

use std::collections::{BTreeMap, BTreeSet};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::amount::{decimal, decimal_map};
use crate::{codes, Address, WomError};

/// Deed card rarity. Minting power is expressed in percent (100 = x1.0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeedCard {
    Common = 0,
    Uncommon = 1,
    Rare = 2,
    Legendary = 3,
}

impl DeedCard {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Common),
            1 => Some(Self::Uncommon),
            2 => Some(Self::Rare),
            3 => Some(Self::Legendary),
            _ => None,
        }
    }

    pub fn minting_power(&self) -> u64 {
        match self {
            Self::Common => 100,
            Self::Uncommon => 110,
            Self::Rare => 130,
            Self::Legendary => 200,
        }
    }

    /// Maximum rewarded users. Legendary deeds are unbounded.
    pub fn max_users(&self) -> u64 {
        match self {
            Self::Common => 100,
            Self::Uncommon => 1_000,
            Self::Rare => 10_000,
            Self::Legendary => u64::MAX,
        }
    }
}

/// Mirror of a Deed NFT as known to the federation contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deed {
    pub id: u64,
    pub city: u8,
    pub card_type: DeedCard,
    pub minting_power: u64,
    pub max_users: u64,
    pub owner: Address,
    pub manager: Address,
    pub owner_percentage: u8,
    pub tenant_percentage: u8,
    /// Connected hub, zero address when none.
    pub hub: Address,
    pub version: u64,
}

/// Named attributes for [`Deed`] creation and update.
#[derive(Debug, Clone)]
pub struct DeedAttributes {
    pub id: u64,
    pub city: u8,
    pub card_type: DeedCard,
    pub owner: Address,
    pub manager: Address,
    pub owner_percentage: u8,
}

impl Deed {
    pub fn from_attributes(attributes: &DeedAttributes) -> Self {
        let mut deed = Self {
            id: attributes.id,
            city: 0,
            card_type: attributes.card_type,
            minting_power: 0,
            max_users: 0,
            owner: Address::zero(),
            manager: Address::zero(),
            owner_percentage: 0,
            tenant_percentage: 0,
            hub: Address::zero(),
            version: 0,
        };
        deed.set_attributes(attributes);
        deed
    }

    /// Overwrite the NFT attributes, keeping the connected hub.
    pub fn set_attributes(&mut self, attributes: &DeedAttributes) {
        self.city = attributes.city;
        self.card_type = attributes.card_type;
        self.minting_power = attributes.card_type.minting_power();
        self.max_users = attributes.card_type.max_users();
        self.owner = attributes.owner.clone();
        self.manager = attributes.manager.clone();
        self.owner_percentage = attributes.owner_percentage;
        self.tenant_percentage = 100 - attributes.owner_percentage.min(100);
    }
}

impl DeedAttributes {
    pub fn new(id: u64, card_type: DeedCard, owner: Address, manager: Address) -> Self {
        Self {
            id,
            city: 0,
            card_type,
            owner,
            manager,
            owner_percentage: 100,
        }
    }

    pub fn city(mut self, city: u8) -> Self {
        self.city = city;
        self
    }

    pub fn owner_percentage(mut self, percentage: u8) -> Self {
        self.owner_percentage = percentage;
        self
    }

    pub fn validate(&self) -> Result<(), WomError> {
        if self.id == 0 || self.owner.is_zero() || self.manager.is_zero() || self.owner_percentage > 100 {
            return Err(WomError::request(codes::INVALID_DEED));
        }
        Ok(())
    }
}

/// Off-chain record of a hub and its federation binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hub {
    pub address: Address,
    /// Linked deed, `None` when unbound. A link survives a manager change;
    /// `enabled` tells whether it currently counts as a connection.
    pub deed_id: Option<u64>,
    pub city: Option<u8>,
    pub card_type: Option<DeedCard>,
    pub hub_owner: Address,
    pub deed_owner: Address,
    pub deed_manager: Address,
    /// Wallet receiving the tenant share of rewards.
    pub earner: Address,
    pub enabled: bool,
    /// End of the binding validity window, `None` for indefinite.
    pub until_date: Option<u64>,
    /// Set on first connection, never changed afterwards.
    pub join_date: Option<u64>,
    pub created_date: u64,
    pub updated_date: u64,
    pub version: u64,
}

impl Hub {
    pub fn new(address: Address, now: u64) -> Self {
        Self {
            address,
            deed_id: None,
            city: None,
            card_type: None,
            hub_owner: Address::zero(),
            deed_owner: Address::zero(),
            deed_manager: Address::zero(),
            earner: Address::zero(),
            enabled: false,
            until_date: None,
            join_date: None,
            created_date: now,
            updated_date: now,
            version: 0,
        }
    }

    /// Linked to a deed whose manager owns the hub.
    pub fn is_connected(&self) -> bool {
        self.enabled && self.deed_id.is_some()
    }

    /// Whether the binding is valid at `now`.
    pub fn is_binding_valid(&self, now: u64) -> bool {
        self.is_connected() && self.until_date.map_or(true, |until| now < until)
    }
}

/// Signed report payload. Field order is the canonical serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubReportData {
    pub hub_address: Address,
    pub deed_id: u64,
    pub from_date: u64,
    pub to_date: u64,
    pub period_type: String,
    pub users_count: u64,
    pub participants_count: u64,
    pub recipients_count: u64,
    pub achievements_count: u64,
    pub reward_token_address: Address,
    pub reward_token_network_id: u64,
    pub hub_reward_amount: f64,
    #[serde(default)]
    pub transactions: BTreeSet<String>,
}

impl HubReportData {
    /// Canonical JSON signed by the hub: lowercase transactions without blanks,
    /// sorted and de-duplicated.
    pub fn canonical_json(&self) -> Result<String, WomError> {
        let mut normalized = self.clone();
        normalized.transactions = self
            .transactions
            .iter()
            .map(|tx| tx.trim().to_ascii_lowercase())
            .filter(|tx| !tx.is_empty())
            .collect();
        serde_json::to_string(&normalized).map_err(|_| WomError::parsing(codes::MALFORMED_PAYLOAD))
    }

    /// Parse a payload, mapping any shape error to a parsing error.
    pub fn from_json(raw: &str) -> Result<Self, WomError> {
        serde_json::from_str(raw).map_err(|_| WomError::parsing(codes::MALFORMED_PAYLOAD))
    }
}

/// Payload plus the verification wrapper sent by a hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubReportVerifiableData {
    #[serde(flatten)]
    pub data: HubReportData,
    pub hash: String,
    pub signature: String,
}

impl HubReportVerifiableData {
    pub fn from_json(raw: &str) -> Result<Self, WomError> {
        serde_json::from_str(raw).map_err(|_| WomError::parsing(codes::MALFORMED_PAYLOAD))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubReportStatus {
    None,
    Invalid,
    Sent,
    ErrorSending,
    PendingReward,
    RewardTransactionError,
    Rewarded,
    Rejected,
}

impl HubReportStatus {
    pub fn can_refresh(&self) -> bool {
        matches!(self, Self::Sent | Self::PendingReward | Self::RewardTransactionError)
    }

    pub fn can_send(&self) -> bool {
        matches!(self, Self::None | Self::ErrorSending)
    }

    /// Statuses whose reports take no part in reward computation.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::None | Self::Invalid | Self::Rejected | Self::ErrorSending)
    }
}

/// Accepted hub report with its derived reward fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubReport {
    pub hash: String,
    pub signature: String,
    pub data: HubReportData,
    pub sent_date: u64,
    /// Sequential id assigned by the reward period accumulator.
    pub report_id: u64,
    pub reward_period_id: u64,
    #[serde(with = "decimal")]
    pub fixed_reward_index: BigUint,
    #[serde(with = "decimal")]
    pub owner_fixed_index: BigUint,
    #[serde(with = "decimal")]
    pub tenant_fixed_index: BigUint,
    #[serde(with = "decimal")]
    pub last_rewarded_amount: BigUint,
    pub owner: Address,
    pub tenant: Address,
    pub owner_percentage: u8,
    pub fraud: bool,
    pub status: HubReportStatus,
    pub reward_id: Option<String>,
    #[serde(with = "decimal")]
    pub reward_amount: BigUint,
    pub reward_transaction_hash: Option<String>,
    pub error: Option<String>,
    pub version: u64,
}

impl HubReport {
    pub fn hub_address(&self) -> &Address {
        &self.data.hub_address
    }

    /// Move to `status`, dropping reward bookkeeping for invalid statuses.
    pub fn set_status(&mut self, status: HubReportStatus) {
        self.status = status;
        if status.is_invalid() {
            self.reward_id = None;
            self.reward_amount = BigUint::default();
            self.reward_transaction_hash = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UemRewardStatus {
    None,
    PendingReward,
    PartialReward,
    Rewarded,
    RewardTransactionError,
}

/// One materialized reward period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UemReward {
    pub id: String,
    pub period_id: u64,
    pub period_type: String,
    pub from_date: u64,
    pub to_date: u64,
    pub reward_token_address: Address,
    pub reward_token_network_id: u64,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    #[serde(with = "decimal")]
    pub fixed_global_index: BigUint,
    /// Report hash to reward amount, sorted by hash.
    #[serde(with = "decimal_map")]
    pub report_rewards: BTreeMap<String, BigUint>,
    pub hub_addresses: BTreeSet<Address>,
    pub report_hashes: BTreeSet<String>,
    pub hub_achievements_count: u64,
    pub hub_rewards_amount: f64,
    pub merkle_root: String,
    pub transaction_hashes: BTreeSet<String>,
    pub status: UemRewardStatus,
    pub created_date: u64,
    pub version: u64,
}

impl UemReward {
    pub fn reward_id(network_id: u64, period_id: u64) -> String {
        format!("{network_id}-{period_id}")
    }
}

/// Outcome of a blockchain transaction tracked by a mirror record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    InProgress,
    Validated,
    Error,
}

/// Mirror of a deed lease as observed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: u64,
    pub deed_id: u64,
    pub owner: Address,
    pub tenant: Address,
    pub start_date: u64,
    pub end_date: u64,
    pub paid_months: u32,
    pub owner_minting_percentage: u8,
    pub confirmed: bool,
    pub transaction_hash: Option<String>,
    pub transaction_status: TransactionStatus,
    pub version: u64,
}

impl Lease {
    /// Whether the lease is confirmed and running at `now`.
    pub fn is_in_progress(&self, now: u64) -> bool {
        self.confirmed && self.start_date <= now && now < self.end_date
    }
}

/// Mirror of a renting offer as observed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: u64,
    pub deed_id: u64,
    pub owner: Address,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    pub expiration_date: Option<u64>,
    pub enabled: bool,
    pub transaction_hash: Option<String>,
    pub transaction_status: TransactionStatus,
    pub version: u64,
}

/// Reward claim, keyed by the hash of its transfer transaction. Written for
/// claims paid by the engine and for claims observed on chain; the sum per
/// recipient is what the claim ledger counts as claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub transaction_hash: String,
    pub recipient: Address,
    pub receiver: Address,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    /// Unset until the transfer is seen mined.
    #[serde(default)]
    pub block_number: Option<u64>,
}
