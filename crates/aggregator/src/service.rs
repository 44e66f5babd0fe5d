//! Top-level aggregator service with its scheduled jobs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wom_core::{
    current_timestamp, Address, ClaimReceipt, DocumentStore, HubReport, HubReportStatus, HubReportVerifiableData, UemReward,
    UemRewardStatus, WomError,
};
use wom_events::{topics, EventBus};
use wom_settlement::{Claimed, RewardConfig, Settlement, TokenMover};

use crate::batch::RewardBuilder;
use crate::collector::ReportCollector;
use crate::locks::{JobLock, KeyedLocks};
use crate::poster::{RewardPoster, TransactionSubmitter};

/// Configuration for the aggregator service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregatorConfig {
    /// Network of the token rewards are paid in.
    pub reward_token_network_id: u64,
    pub reward_token_address: Address,
    /// Additional accepted hub reward tokens, as `networkId:address`.
    pub whitelist_reward_contracts: Vec<String>,
    /// Delay between reward computations (default: 1 hour).
    pub compute_interval_secs: u64,
    /// Delay between payout submissions (default: 10 minutes).
    pub send_interval_secs: u64,
    /// Skip the report date checks. Test networks only.
    pub accept_outdated_reports: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            reward_token_network_id: 137,
            reward_token_address: Address::zero(),
            whitelist_reward_contracts: Vec::new(),
            compute_interval_secs: 3600,
            send_interval_secs: 600,
            accept_outdated_reports: false,
        }
    }
}

impl AggregatorConfig {
    /// Accepted `(network, token)` pairs: the reward token plus the
    /// whitelist. Malformed entries are ignored.
    pub fn supported_tokens(&self) -> BTreeSet<(u64, Address)> {
        let mut tokens = BTreeSet::new();
        tokens.insert((self.reward_token_network_id, self.reward_token_address.clone()));
        for entry in &self.whitelist_reward_contracts {
            let Some((network, address)) = entry.trim().split_once(':') else {
                warn!(entry = %entry, "ignoring malformed whitelisted reward contract");
                continue;
            };
            match (network.trim().parse::<u64>(), Address::parse(address.trim())) {
                (Ok(network), Ok(address)) => {
                    tokens.insert((network, address));
                }
                _ => warn!(entry = %entry, "ignoring malformed whitelisted reward contract"),
            }
        }
        tokens
    }
}

/// The report pipeline, from submission to payout and claim.
pub struct AggregatorService {
    config: AggregatorConfig,
    store: Arc<dyn DocumentStore>,
    bus: Arc<EventBus>,
    settlement: Arc<Mutex<Settlement>>,
    collector: ReportCollector,
    builder: RewardBuilder,
    poster: RewardPoster,
    compute_job: JobLock,
    send_job: JobLock,
    claim_locks: KeyedLocks<Address>,
}

impl AggregatorService {
    pub fn new(
        config: AggregatorConfig,
        reward: RewardConfig,
        store: Arc<dyn DocumentStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::with_settlement(config, Settlement::new(reward), store, bus)
    }

    /// Rebuild reward periods and claim state from the store.
    pub fn restore(
        config: AggregatorConfig,
        reward: RewardConfig,
        store: Arc<dyn DocumentStore>,
        bus: Arc<EventBus>,
    ) -> Result<Self, WomError> {
        let reports = store.reports_by_status(&[
            HubReportStatus::Sent,
            HubReportStatus::PendingReward,
            HubReportStatus::RewardTransactionError,
            HubReportStatus::Rewarded,
            HubReportStatus::Rejected,
        ])?;
        let closed: BTreeSet<u64> = store
            .rewards_by_status(&[
                UemRewardStatus::None,
                UemRewardStatus::PendingReward,
                UemRewardStatus::PartialReward,
                UemRewardStatus::Rewarded,
                UemRewardStatus::RewardTransactionError,
            ])?
            .iter()
            .map(|r| r.period_id)
            .collect();
        let claims = store.claim_receipts()?;
        let settlement = Settlement::rebuild(reward, &reports, &closed, &claims);
        info!(reports = reports.len(), periods = closed.len(), claims = claims.len(), "settlement restored");
        Ok(Self::with_settlement(config, settlement, store, bus))
    }

    fn with_settlement(
        config: AggregatorConfig,
        settlement: Settlement,
        store: Arc<dyn DocumentStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        let start_reward_time = settlement.periods().config().start_reward_time;
        let settlement = Arc::new(Mutex::new(settlement));
        let collector = ReportCollector::new(&config, start_reward_time, store.clone(), settlement.clone(), bus.clone());
        let builder = RewardBuilder::new(
            store.clone(),
            settlement.clone(),
            bus.clone(),
            config.reward_token_network_id,
            config.reward_token_address.clone(),
        );
        let poster = RewardPoster::new(store.clone());
        Self {
            config,
            store,
            bus,
            settlement,
            collector,
            builder,
            poster,
            compute_job: JobLock::new("compute-rewards"),
            send_job: JobLock::new("send-rewards"),
            claim_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn settlement(&self) -> Arc<Mutex<Settlement>> {
        self.settlement.clone()
    }

    pub fn poster(&self) -> &RewardPoster {
        &self.poster
    }

    pub async fn submit_report(&self, report: HubReportVerifiableData, now: u64) -> Result<HubReport, WomError> {
        self.collector.submit(report, now).await
    }

    pub async fn submit_report_json(&self, raw: &str, now: u64) -> Result<HubReport, WomError> {
        self.collector.submit_json(raw, now).await
    }

    /// Close matured periods and materialize their rewards. Skipped while a
    /// previous run is in progress.
    pub async fn compute_rewards(&self, now: u64) -> Vec<UemReward> {
        let Some(_job) = self.compute_job.try_start() else {
            return Vec::new();
        };
        self.builder.compute_matured(now).await
    }

    pub async fn compute_reward(&self, period_id: u64, now: u64) -> Result<Option<UemReward>, WomError> {
        self.builder.compute(period_id, now).await
    }

    /// Submit payouts of computed rewards. Skipped while a previous run is in
    /// progress.
    pub async fn send_pending_rewards(&self, submitter: &dyn TransactionSubmitter) -> Result<usize, WomError> {
        let Some(_job) = self.send_job.try_start() else {
            return Ok(0);
        };
        self.poster.send_pending_rewards(submitter).await
    }

    pub async fn pending_reward_balance_of(&self, recipient: &Address) -> BigUint {
        self.settlement.lock().await.pending_reward_balance_of(recipient)
    }

    /// Claim accumulated rewards of `recipient`. Claims of one recipient are
    /// serialized.
    ///
    /// The claim is persisted as a receipt keyed by the transfer hash. When
    /// that write fails the tokens have already moved: the ledger keeps the
    /// claim and the error is returned. The receipt is written again once the
    /// reconciler sees the transfer's `Claimed` event mined.
    pub async fn claim(
        &self,
        recipient: &Address,
        amount: &BigUint,
        receiver: Option<&Address>,
        mover: &dyn TokenMover,
    ) -> Result<Option<Claimed>, WomError> {
        let _guard = self.claim_locks.lock(recipient).await;
        let Some(claimed) = self
            .settlement
            .lock()
            .await
            .claim(recipient, amount, receiver, mover)?
        else {
            return Ok(None);
        };
        match self.store.insert_claim_receipt(&claimed.receipt()) {
            Ok(true) => {}
            Ok(false) => warn!(transaction = %claimed.transaction_hash, "claim receipt already stored"),
            Err(e) => {
                error!(
                    recipient = %recipient,
                    transaction = %claimed.transaction_hash,
                    error = %e,
                    "claim paid but its receipt was not stored"
                );
                return Err(e.into());
            }
        }
        self.bus.emit(topics::REWARD_CLAIMED, &claimed);
        Ok(Some(claimed))
    }

    /// Count a claim mined on chain. Receipts are keyed by transaction hash,
    /// so a claim paid through [`AggregatorService::claim`] or replayed from
    /// an earlier block is counted once. Returns whether anything changed.
    pub async fn record_chain_claim(&self, receipt: &ClaimReceipt) -> Result<bool, WomError> {
        let _guard = self.claim_locks.lock(&receipt.recipient).await;
        let stored = self.store.insert_claim_receipt(receipt)?;
        let counted = self.settlement.lock().await.record_claim(receipt);
        if !stored && !counted {
            debug!(transaction = %receipt.transaction_hash, "claim already recorded");
            return Ok(false);
        }
        info!(
            recipient = %receipt.recipient,
            amount = %receipt.amount,
            transaction = %receipt.transaction_hash,
            "chain claim recorded"
        );
        Ok(true)
    }

    /// Run the compute and send jobs until the bus closes.
    pub async fn run(&self, submitter: Arc<dyn TransactionSubmitter>) {
        info!(
            compute_interval = self.config.compute_interval_secs,
            send_interval = self.config.send_interval_secs,
            "aggregator service starting"
        );
        let mut compute = time::interval(Duration::from_secs(self.config.compute_interval_secs.max(1)));
        let mut send = time::interval(Duration::from_secs(self.config.send_interval_secs.max(1)));
        compute.set_missed_tick_behavior(MissedTickBehavior::Delay);
        send.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = compute.tick() => {
                    let rewards = self.compute_rewards(current_timestamp()).await;
                    debug!(rewards = rewards.len(), "compute job done");
                }
                _ = send.tick() => {
                    match self.send_pending_rewards(submitter.as_ref()).await {
                        Ok(sent) => debug!(sent, "send job done"),
                        Err(e) => error!(error = %e, "send job failed"),
                    }
                }
            }
            if self.bus.state() == wom_events::BusState::Closed {
                info!("event bus closed, aggregator service stopping");
                return;
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
