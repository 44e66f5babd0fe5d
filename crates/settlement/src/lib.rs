//! WoM Settlement
//!
//! Reward accounting for federated hubs: the fixed reward index of a report,
//! weekly reward periods that accumulate those indexes, and the claim ledger
//! through which deed owners and tenants withdraw their share.
//!
//! This crate holds no I/O. Persistence and token transfers are supplied by
//! the caller.

pub mod index;
pub mod ledger;
pub mod period;

use std::collections::{BTreeSet, HashSet};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use wom_core::amount::{decimal, ten_pow};
use wom_core::{Address, ClaimReceipt, Deed, Hub, HubReport, HubReportData, WomError};

pub use index::{fixed_index, share_of, split_index, UsageCounters};
pub use ledger::{ClaimLedger, Claimed, RecipientBalance, TokenMover};
pub use period::{AcceptedReport, RewardPeriod, RewardPeriodAccumulator};

/// 2023-01-02T00:00:00Z
pub const DEFAULT_START_REWARD_TIME: u64 = 1_672_617_600;

/// One week.
pub const DEFAULT_PERIOD_LENGTH_SECS: u64 = 604_800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardConfig {
    pub start_reward_time: u64,
    pub period_length_secs: u64,
    /// Budget of each period in token base units.
    #[serde(with = "decimal")]
    pub periodic_reward_amount: BigUint,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            start_reward_time: DEFAULT_START_REWARD_TIME,
            period_length_secs: DEFAULT_PERIOD_LENGTH_SECS,
            periodic_reward_amount: BigUint::from(5u32) * ten_pow(18),
        }
    }
}

/// Reward periods and the claim ledger kept in step.
pub struct Settlement {
    periods: RewardPeriodAccumulator,
    ledger: ClaimLedger,
    /// Transfer hashes already counted by the ledger.
    claim_transactions: HashSet<String>,
}

impl Settlement {
    pub fn new(config: RewardConfig) -> Self {
        Self {
            periods: RewardPeriodAccumulator::new(config),
            ledger: ClaimLedger::new(),
            claim_transactions: HashSet::new(),
        }
    }

    /// Rebuild both structures from persisted reports and claim receipts.
    pub fn rebuild(
        config: RewardConfig,
        reports: &[HubReport],
        closed_periods: &BTreeSet<u64>,
        claims: &[ClaimReceipt],
    ) -> Self {
        let periods = RewardPeriodAccumulator::rebuild(config, reports, closed_periods);
        let mut ledger = ClaimLedger::new();
        let mut ids: Vec<u64> = reports.iter().map(|r| r.report_id).filter(|id| *id > 0).collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(report) = periods.report(id) {
                ledger.register(report);
            }
        }
        let mut settlement = Self {
            periods,
            ledger,
            claim_transactions: HashSet::new(),
        };
        for claim in claims {
            settlement.record_claim(claim);
        }
        settlement
    }

    pub fn add_report(
        &mut self,
        data: &HubReportData,
        hub: &Hub,
        deed: &Deed,
        now: u64,
    ) -> Result<AcceptedReport, WomError> {
        let accepted = self.periods.add_report(data, hub, deed, now)?;
        self.ledger.register(&accepted);
        Ok(accepted)
    }

    /// Undo the latest accepted report.
    pub fn rollback(&mut self, report: &AcceptedReport) -> bool {
        if !self.periods.rollback(report.report_id) {
            return false;
        }
        self.ledger.unregister(report);
        true
    }

    pub fn close_period(&mut self, period_id: u64, now: u64) -> Result<RewardPeriod, WomError> {
        self.periods.close_period(period_id, now)
    }

    pub fn pending_reward_balance_of(&self, recipient: &Address) -> BigUint {
        self.ledger.pending_reward_balance_of(recipient, &self.periods)
    }

    pub fn claim(
        &mut self,
        recipient: &Address,
        amount: &BigUint,
        receiver: Option<&Address>,
        mover: &dyn TokenMover,
    ) -> Result<Option<Claimed>, WomError> {
        let claimed = self.ledger.claim(recipient, amount, receiver, &self.periods, mover)?;
        if let Some(claimed) = &claimed {
            self.claim_transactions.insert(claimed.transaction_hash.clone());
        }
        Ok(claimed)
    }

    /// Count a claim paid outside the ledger. A transfer hash already counted
    /// is ignored. Returns whether the claim was new.
    pub fn record_claim(&mut self, receipt: &ClaimReceipt) -> bool {
        let hash = receipt.transaction_hash.to_ascii_lowercase();
        if !self.claim_transactions.insert(hash) {
            return false;
        }
        self.ledger
            .record_claim(&receipt.recipient, &receipt.amount, &self.periods);
        true
    }

    pub fn periods(&self) -> &RewardPeriodAccumulator {
        &self.periods
    }

    pub fn ledger(&self) -> &ClaimLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RewardConfig::default();
        assert_eq!(config.periodic_reward_amount.to_string(), "5000000000000000000");

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["periodicRewardAmount"], "5000000000000000000");
        assert_eq!(json["periodLengthSecs"], 604_800);

        let parsed: RewardConfig = serde_json::from_str(r#"{"startRewardTime": 10}"#).unwrap();
        assert_eq!(parsed.start_reward_time, 10);
        assert_eq!(parsed.period_length_secs, DEFAULT_PERIOD_LENGTH_SECS);
    }

    #[test]
    fn test_claim_receipts_counted_once() {
        let receipt = ClaimReceipt {
            transaction_hash: "0xAB".into(),
            recipient: Address::from_bytes([1; 20]),
            receiver: Address::from_bytes([1; 20]),
            amount: BigUint::from(3u32),
            block_number: Some(4),
        };
        let mut settlement = Settlement::rebuild(
            RewardConfig::default(),
            &[],
            &BTreeSet::new(),
            &[receipt.clone(), receipt.clone()],
        );
        assert_eq!(settlement.ledger().claimed(&receipt.recipient), BigUint::from(3u32));

        let mut lowered = receipt.clone();
        lowered.transaction_hash = "0xab".into();
        assert!(!settlement.record_claim(&lowered));

        lowered.transaction_hash = "0xac".into();
        assert!(settlement.record_claim(&lowered));
        assert_eq!(settlement.ledger().claimed(&receipt.recipient), BigUint::from(6u32));
    }
}
