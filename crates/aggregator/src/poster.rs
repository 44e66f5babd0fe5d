//! Reward poster: builds and submits reward payout transactions and tracks
//! their outcome.
//!
//! Supports pluggable submission backends via the [`TransactionSubmitter`]
//! trait. [`DryRunSubmitter`] records transactions without sending them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use num_bigint::BigUint;
use tracing::{info, warn};
use wom_core::{
    Address, DocumentStore, HubReportStatus, UemReward, UemRewardStatus, WomError,
};
use wom_crypto::keccak_hex;

/// A reward payout ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTransaction {
    pub reward_id: String,
    pub network_id: u64,
    pub token_address: Address,
    pub merkle_root: String,
    /// Report hash to reward amount.
    pub payouts: BTreeMap<String, BigUint>,
    /// Human-readable description for logging.
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub transaction_hash: String,
}

/// Sends built transactions to the chain.
#[async_trait::async_trait]
pub trait TransactionSubmitter: Send + Sync {
    async fn submit(&self, tx: &BuiltTransaction) -> Result<SubmitResult, WomError>;
}

/// Builds payout transactions for computed rewards and records their hashes.
pub struct RewardPoster {
    store: Arc<dyn DocumentStore>,
}

impl RewardPoster {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn build_payout(&self, reward: &UemReward) -> BuiltTransaction {
        BuiltTransaction {
            reward_id: reward.id.clone(),
            network_id: reward.reward_token_network_id,
            token_address: reward.reward_token_address.clone(),
            merkle_root: reward.merkle_root.clone(),
            payouts: reward.report_rewards.clone(),
            description: format!(
                "payout(reward={}, reports={}, amount={})",
                reward.id,
                reward.report_rewards.len(),
                reward.amount,
            ),
        }
    }

    /// Submit every computed reward not sent yet. Returns the number of
    /// rewards sent; a failed submission is logged and retried later.
    pub async fn send_pending_rewards(&self, submitter: &dyn TransactionSubmitter) -> Result<usize, WomError> {
        let rewards = self.store.rewards_by_status(&[UemRewardStatus::None])?;
        let mut sent = 0;
        for reward in rewards.into_iter().filter(|r| r.transaction_hashes.is_empty()) {
            let tx = self.build_payout(&reward);
            match submitter.submit(&tx).await {
                Ok(result) => {
                    self.save_reward_transaction_hash(&reward.id, &result.transaction_hash)?;
                    sent += 1;
                }
                Err(e) => warn!(reward = %reward.id, error = %e, "reward payout submission failed"),
            }
        }
        Ok(sent)
    }

    /// Record a payout transaction on the reward and on each of its reports.
    pub fn save_reward_transaction_hash(&self, reward_id: &str, transaction_hash: &str) -> Result<(), WomError> {
        let transaction_hash = transaction_hash.to_ascii_lowercase();
        let Some(mut reward) = self.store.reward(reward_id)? else {
            warn!(reward = %reward_id, "transaction hash for unknown reward");
            return Ok(());
        };
        reward.transaction_hashes.insert(transaction_hash.clone());
        reward.status = UemRewardStatus::PendingReward;
        self.store.save_reward(&mut reward)?;

        for hash in &reward.report_hashes {
            let Some(mut report) = self.store.report(hash)? else {
                continue;
            };
            report.reward_transaction_hash = Some(transaction_hash.clone());
            report.set_status(HubReportStatus::PendingReward);
            self.store.save_report(&mut report)?;
        }
        info!(reward = %reward_id, transaction = %transaction_hash, "reward transaction recorded");
        Ok(())
    }

    /// Update a reward and its reports from mined transaction outcomes
    /// (`hash -> confirmed`). Transactions not mined yet are absent.
    pub fn refresh_reward_status(
        &self,
        reward_id: &str,
        mined: &HashMap<String, bool>,
    ) -> Result<Option<UemRewardStatus>, WomError> {
        let Some(mut reward) = self.store.reward(reward_id)? else {
            return Ok(None);
        };
        let mut reports = self.store.reports_by_reward(reward_id)?;
        for report in &mut reports {
            let Some(hash) = report.reward_transaction_hash.clone() else {
                continue;
            };
            let Some(confirmed) = mined.get(&hash) else {
                continue;
            };
            let status = if *confirmed {
                HubReportStatus::Rewarded
            } else {
                HubReportStatus::RewardTransactionError
            };
            if report.status != status {
                report.set_status(status);
                self.store.save_report(report)?;
            }
        }

        let with_tx = |status: HubReportStatus| {
            reports
                .iter()
                .filter(|r| r.reward_transaction_hash.is_some())
                .any(|r| r.status == status)
        };
        let all_rewarded = !reports.is_empty()
            && reports
                .iter()
                .all(|r| r.reward_transaction_hash.is_some() && r.status == HubReportStatus::Rewarded);
        let not_rewarded_yet = reports
            .iter()
            .any(|r| r.reward_transaction_hash.is_none() || r.status == HubReportStatus::Sent);

        let status = if all_rewarded {
            Some(UemRewardStatus::Rewarded)
        } else if with_tx(HubReportStatus::RewardTransactionError) {
            Some(UemRewardStatus::RewardTransactionError)
        } else if with_tx(HubReportStatus::PendingReward) {
            Some(UemRewardStatus::PendingReward)
        } else if not_rewarded_yet && with_tx(HubReportStatus::Rewarded) {
            Some(UemRewardStatus::PartialReward)
        } else {
            None
        };

        if let Some(status) = status {
            if reward.status != status {
                info!(reward = %reward_id, status = ?status, "reward status changed");
                reward.status = status;
                self.store.save_reward(&mut reward)?;
            }
        }
        Ok(Some(reward.status))
    }
}

/// Records submissions instead of sending them. Hashes are derived from the
/// transaction content and a counter.
#[derive(Default)]
pub struct DryRunSubmitter {
    submissions: Mutex<Vec<BuiltTransaction>>,
}

impl DryRunSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<BuiltTransaction> {
        match self.submissions.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn submission_count(&self) -> usize {
        self.submissions().len()
    }
}

#[async_trait::async_trait]
impl TransactionSubmitter for DryRunSubmitter {
    async fn submit(&self, tx: &BuiltTransaction) -> Result<SubmitResult, WomError> {
        let mut submissions = self
            .submissions
            .lock()
            .map_err(|_| WomError::Transient("dry-run submitter poisoned".into()))?;
        submissions.push(tx.clone());
        let seed = format!("{}#{}", tx.description, submissions.len());
        info!(description = %tx.description, "dry-run: recorded transaction");
        Ok(SubmitResult {
            transaction_hash: keccak_hex(seed.as_bytes()),
        })
    }
}
