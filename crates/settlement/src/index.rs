//! Fixed reward index.
//!
//! A report's weight inside its reward period:
//!
//! ```text
//! index = 10^18 * achievements * amount * min(recipients, maxUsers) * mintingPower
//!         / 100 / participants / lastRewardedAmount / users
//! ```
//!
//! `amount / lastRewardedAmount` is replaced by `1 / 1` for a hub without a
//! previously rewarded report. Every division truncates, in the order above.

use num_bigint::BigUint;
use num_traits::Zero;
use wom_core::amount::{to_base_units, ten_pow, TOKEN_DECIMALS};
use wom_core::{codes, HubReportData, WomError};

/// Fixed-point precision of the index.
pub const INDEX_DECIMALS: u32 = 18;

/// Minting power denominator (minting power is in percent).
pub const MINTING_POWER_BASE: u32 = 100;

/// Usage counters of a report, validated and scaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounters {
    pub users: u64,
    pub participants: u64,
    pub recipients: u64,
    pub achievements: u64,
    /// Reward amount used by the hub, in token base units.
    pub amount: BigUint,
}

impl UsageCounters {
    /// Extract counters from a payload, rejecting zero values.
    pub fn from_report(data: &HubReportData) -> Result<Self, WomError> {
        if data.users_count == 0 {
            return Err(WomError::request(codes::HUB_USERS_MANDATORY));
        }
        if data.participants_count == 0 {
            return Err(WomError::request(codes::HUB_PARTICIPANTS_MANDATORY));
        }
        if data.achievements_count == 0 {
            return Err(WomError::request(codes::HUB_ACHIEVEMENTS_MANDATORY));
        }
        let amount = to_base_units(data.hub_reward_amount, TOKEN_DECIMALS)
            .filter(|amount| !amount.is_zero())
            .ok_or_else(|| WomError::request(codes::HUB_REWARD_AMOUNT_MANDATORY))?;
        Ok(Self {
            users: data.users_count,
            participants: data.participants_count,
            recipients: data.recipients_count,
            achievements: data.achievements_count,
            amount,
        })
    }
}

/// Compute the fixed index. Returns `None` when participants or users are zero.
pub fn fixed_index(
    counters: &UsageCounters,
    last_rewarded_amount: &BigUint,
    max_users: u64,
    minting_power: u64,
) -> Option<BigUint> {
    if counters.participants == 0 || counters.users == 0 {
        return None;
    }
    let (amount, last) = if last_rewarded_amount.is_zero() {
        (BigUint::from(1u32), BigUint::from(1u32))
    } else {
        (counters.amount.clone(), last_rewarded_amount.clone())
    };
    let recipients = counters.recipients.min(max_users);

    let numerator = ten_pow(INDEX_DECIMALS)
        * BigUint::from(counters.achievements)
        * amount
        * BigUint::from(recipients)
        * BigUint::from(minting_power);
    Some(
        numerator / BigUint::from(MINTING_POWER_BASE)
            / BigUint::from(counters.participants)
            / last
            / BigUint::from(counters.users),
    )
}

/// Split an index between deed owner and tenant. The tenant takes the
/// truncation remainder.
pub fn split_index(index: &BigUint, owner_percentage: u8) -> (BigUint, BigUint) {
    let owner = index * BigUint::from(owner_percentage.min(100)) / BigUint::from(100u32);
    let tenant = index - &owner;
    (owner, tenant)
}

/// `budget * index / global_index`, zero for an empty period.
pub fn share_of(budget: &BigUint, index: &BigUint, global_index: &BigUint) -> BigUint {
    if global_index.is_zero() {
        return BigUint::zero();
    }
    budget * index / global_index
}
