//! Blockchain reconciler: applies mined contract events to the local records
//! and resolves transactions still in progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wom_aggregator::{AggregatorService, JobLock};
use wom_core::{
    current_timestamp, ClaimReceipt, DocumentStore, TransactionStatus, UemRewardStatus, WomError,
};
use wom_events::{BusState, EventBus};
use wom_federation::FederationRegistry;

use crate::chain::{ChainReader, TransactionOutcome};
use crate::events::{ChainEvent, RewardEvent};

/// Setting holding the mined events watermark.
pub const MINED_EVENTS_CHECK_SETTING: &str = "minedProvisioningTransactionsCheck";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// Delay between checks of in-progress lease and offer transactions.
    pub pending_transactions_interval_secs: u64,
    /// Delay between scans of newly mined blocks.
    pub mined_events_interval_secs: u64,
    /// Delay between checks of reward payout transactions.
    pub reward_transactions_interval_secs: u64,
    /// First block scanned when no watermark is stored.
    pub start_block: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pending_transactions_interval_secs: 60,
            mined_events_interval_secs: 300,
            reward_transactions_interval_secs: 60,
            start_block: 0,
        }
    }
}

/// Progress of the mined events scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockWatermark {
    /// Chain head when the last scan ran.
    pub last_block: u64,
    /// Last block whose events were fully applied.
    pub last_checked_block: u64,
}

pub struct BlockchainReconciler {
    config: ReconcilerConfig,
    store: Arc<dyn DocumentStore>,
    chain: Arc<dyn ChainReader>,
    registry: Arc<FederationRegistry>,
    aggregator: Arc<AggregatorService>,
    bus: Arc<EventBus>,
    pending_job: JobLock,
    mined_job: JobLock,
    reward_job: JobLock,
}

impl BlockchainReconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn DocumentStore>,
        chain: Arc<dyn ChainReader>,
        registry: Arc<FederationRegistry>,
        aggregator: Arc<AggregatorService>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            registry,
            aggregator,
            bus,
            pending_job: JobLock::new("pending-transactions"),
            mined_job: JobLock::new("mined-events"),
            reward_job: JobLock::new("reward-transactions"),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Stored watermark. A bare block number is read as the last checked block.
    pub fn watermark(&self) -> Result<Option<BlockWatermark>, WomError> {
        let Some(raw) = self.store.setting(MINED_EVENTS_CHECK_SETTING)? else {
            return Ok(None);
        };
        if let Ok(watermark) = serde_json::from_str::<BlockWatermark>(&raw) {
            return Ok(Some(watermark));
        }
        match raw.trim().parse::<u64>() {
            Ok(block) => Ok(Some(BlockWatermark {
                last_block: block,
                last_checked_block: block,
            })),
            Err(_) => {
                warn!(value = %raw, "unreadable mined events watermark, scanning from start block");
                Ok(None)
            }
        }
    }

    fn save_watermark(&self, watermark: &BlockWatermark) -> Result<(), WomError> {
        let raw = serde_json::to_string(watermark).map_err(|e| WomError::Anomaly(e.to_string()))?;
        self.store.save_setting(MINED_EVENTS_CHECK_SETTING, &raw)?;
        Ok(())
    }

    /// Apply events mined since the watermark. Returns the number of events
    /// applied. A failing event is skipped unless the failure is transient,
    /// in which case the batch aborts and the watermark stays put.
    pub async fn check_mined_events(&self, now: u64) -> Result<usize, WomError> {
        let Some(_job) = self.mined_job.try_start() else {
            return Ok(0);
        };
        let current = self.chain.block_number().await?;
        let from_block = match self.watermark()? {
            Some(w) => w.last_checked_block + 1,
            None => self.config.start_block,
        };
        if from_block > current {
            debug!(from_block, current, "no new block");
            return Ok(0);
        }

        let events = self.chain.events_in_range(from_block, current).await?;
        debug!(from_block, to_block = current, events = events.len(), "mined events retrieved");
        let mut applied = 0;
        for mined in &events {
            match self
                .apply_event(&mined.event, &mined.transaction_hash, mined.block_number, now)
                .await
            {
                Ok(()) => applied += 1,
                Err(e) if e.should_retry() => {
                    error!(block = mined.block_number, error = %e, "mined events check aborted");
                    return Err(e);
                }
                Err(e) => warn!(
                    block = mined.block_number,
                    transaction = %mined.transaction_hash,
                    kind = mined.event.kind(),
                    error = %e,
                    "mined event skipped"
                ),
            }
        }

        self.save_watermark(&BlockWatermark {
            last_block: current,
            last_checked_block: current,
        })?;
        if !events.is_empty() {
            info!(from_block, to_block = current, applied, skipped = events.len() - applied, "mined events applied");
        }
        Ok(applied)
    }

    /// Resolve lease and offer transactions still in progress. Returns the
    /// number of records resolved.
    pub async fn check_pending_transactions(&self, now: u64) -> Result<usize, WomError> {
        let Some(_job) = self.pending_job.try_start() else {
            return Ok(0);
        };
        let mut resolved = 0;
        for lease in self.store.leases_by_transaction_status(TransactionStatus::InProgress)? {
            match self.resolve_lease(lease.id, lease.transaction_hash.as_deref(), now).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => warn!(lease = lease.id, error = %e, "lease transaction check failed, retrying later"),
            }
        }
        for offer in self.store.offers_by_transaction_status(TransactionStatus::InProgress)? {
            match self.resolve_offer(offer.id, offer.transaction_hash.as_deref(), now).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => warn!(offer = offer.id, error = %e, "offer transaction check failed, retrying later"),
            }
        }
        if resolved > 0 {
            info!(resolved, "pending transactions resolved");
        }
        Ok(resolved)
    }

    /// Refresh the status of rewards whose payout is not settled.
    pub async fn check_pending_reward_transactions(&self) -> Result<usize, WomError> {
        let Some(_job) = self.reward_job.try_start() else {
            return Ok(0);
        };
        let rewards = self
            .store
            .rewards_by_status(&[UemRewardStatus::PendingReward, UemRewardStatus::PartialReward])?;
        let mut updated = 0;
        for reward in rewards {
            let mut mined = HashMap::new();
            for hash in &reward.transaction_hashes {
                match self.chain.transaction_outcome(hash).await {
                    Ok(TransactionOutcome::Pending) => {}
                    Ok(outcome) => {
                        mined.insert(hash.clone(), outcome == TransactionOutcome::Confirmed);
                    }
                    Err(e) => warn!(reward = %reward.id, transaction = %hash, error = %e, "transaction check failed"),
                }
            }
            if mined.is_empty() {
                continue;
            }
            match self.aggregator.poster().refresh_reward_status(&reward.id, &mined) {
                Ok(Some(status)) if status != reward.status => updated += 1,
                Ok(_) => {}
                Err(e) => warn!(reward = %reward.id, error = %e, "reward status refresh failed"),
            }
        }
        Ok(updated)
    }

    async fn resolve_lease(&self, lease_id: u64, hash: Option<&str>, now: u64) -> Result<bool, WomError> {
        if !self.settle_transaction(hash, now).await? {
            return Ok(false);
        }
        let Some(mut lease) = self.store.lease(lease_id)? else {
            return Ok(false);
        };
        if lease.transaction_status == TransactionStatus::InProgress {
            warn!(lease = lease_id, "lease transaction failed");
            lease.transaction_status = TransactionStatus::Error;
            self.store.save_lease(&mut lease)?;
        }
        Ok(true)
    }

    async fn resolve_offer(&self, offer_id: u64, hash: Option<&str>, now: u64) -> Result<bool, WomError> {
        if !self.settle_transaction(hash, now).await? {
            return Ok(false);
        }
        let Some(mut offer) = self.store.offer(offer_id)? else {
            return Ok(false);
        };
        if offer.transaction_status == TransactionStatus::InProgress {
            warn!(offer = offer_id, "offer transaction failed");
            offer.transaction_status = TransactionStatus::Error;
            self.store.save_offer(&mut offer)?;
        }
        Ok(true)
    }

    /// Apply the events of a confirmed transaction. Returns `false` while it
    /// is not mined; a blank hash counts as settled.
    async fn settle_transaction(&self, hash: Option<&str>, now: u64) -> Result<bool, WomError> {
        let Some(hash) = hash.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(true);
        };
        match self.chain.transaction_outcome(hash).await? {
            TransactionOutcome::Pending => Ok(false),
            TransactionOutcome::Reverted => Ok(true),
            TransactionOutcome::Confirmed => {
                self.apply_transaction_events(&hash.to_ascii_lowercase(), now).await?;
                Ok(true)
            }
        }
    }

    async fn apply_transaction_events(&self, hash: &str, now: u64) -> Result<(), WomError> {
        let block_number = self.chain.block_number().await?;
        for event in self.chain.transaction_events(hash).await? {
            self.apply_event(&event, hash, block_number, now).await?;
        }
        Ok(())
    }

    /// Apply one mined event to the local records.
    pub async fn apply_event(
        &self,
        event: &ChainEvent,
        transaction_hash: &str,
        block_number: u64,
        now: u64,
    ) -> Result<(), WomError> {
        match event {
            ChainEvent::Lease(lease) => {
                let existing = self.store.lease(lease.id)?;
                let mut updated = lease.apply(existing.as_ref(), transaction_hash);
                if existing.as_ref() != Some(&updated) {
                    self.store.save_lease(&mut updated)?;
                    debug!(lease = lease.id, change = ?lease.change, "lease updated from chain");
                    // The binding window of the deed's hub follows its lease.
                    if let Some(deed) = self.store.deed(lease.deed_id)?.filter(|d| !d.hub.is_zero()) {
                        self.registry.refresh_hub(&deed.hub, now)?;
                    }
                }
            }
            ChainEvent::Offer(offer) => {
                let existing = self.store.offer(offer.id)?;
                let mut updated = offer.apply(existing.as_ref(), transaction_hash);
                if existing.as_ref() != Some(&updated) {
                    self.store.save_offer(&mut updated)?;
                    debug!(offer = offer.id, change = ?offer.change, "offer updated from chain");
                }
            }
            ChainEvent::Reward(RewardEvent::Claimed {
                recipient,
                receiver,
                amount,
            }) => {
                let receipt = ClaimReceipt {
                    transaction_hash: transaction_hash.to_ascii_lowercase(),
                    recipient: recipient.clone(),
                    receiver: if receiver.is_zero() { recipient.clone() } else { receiver.clone() },
                    amount: amount.clone(),
                    block_number: Some(block_number),
                };
                self.aggregator.record_chain_claim(&receipt).await?;
            }
            ChainEvent::Reward(RewardEvent::RewardSent { reward_id }) => {
                let hash = transaction_hash.to_ascii_lowercase();
                let known = self
                    .store
                    .reward(reward_id)?
                    .is_some_and(|r| r.transaction_hashes.contains(&hash));
                if !known {
                    self.aggregator.poster().save_reward_transaction_hash(reward_id, &hash)?;
                }
            }
            ChainEvent::Federation(federation) => self.registry.apply_chain_state(federation, now)?,
        }
        Ok(())
    }

    /// Run the reconciliation jobs until the bus closes.
    pub async fn run(&self) {
        info!(
            pending_interval = self.config.pending_transactions_interval_secs,
            mined_interval = self.config.mined_events_interval_secs,
            reward_interval = self.config.reward_transactions_interval_secs,
            "blockchain reconciler starting"
        );
        let mut pending = time::interval(Duration::from_secs(self.config.pending_transactions_interval_secs.max(1)));
        let mut mined = time::interval(Duration::from_secs(self.config.mined_events_interval_secs.max(1)));
        let mut rewards = time::interval(Duration::from_secs(self.config.reward_transactions_interval_secs.max(1)));
        for interval in [&mut pending, &mut mined, &mut rewards] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = pending.tick() => {
                    if let Err(e) = self.check_pending_transactions(current_timestamp()).await {
                        error!(error = %e, "pending transactions check failed");
                    }
                }
                _ = mined.tick() => {
                    if let Err(e) = self.check_mined_events(current_timestamp()).await {
                        error!(error = %e, "mined events check failed");
                    }
                }
                _ = rewards.tick() => {
                    if let Err(e) = self.check_pending_reward_transactions().await {
                        error!(error = %e, "reward transactions check failed");
                    }
                }
            }
            if self.bus.state() == BusState::Closed {
                info!("event bus closed, reconciler stopping");
                return;
            }
        }
    }
}
