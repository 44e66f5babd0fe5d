//! Reward builder: closes matured periods and materializes their UEM reward.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use num_bigint::BigUint;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wom_core::{Address, DocumentStore, HubReport, HubReportStatus, UemReward, UemRewardStatus, WomError};
use wom_crypto::compute_merkle_root;
use wom_events::{topics, EventBus};
use wom_settlement::{share_of, RewardPeriod, Settlement};

pub const REWARD_PERIOD_TYPE: &str = "WEEK";

/// Builds `UemReward` records from closed reward periods.
pub struct RewardBuilder {
    store: Arc<dyn DocumentStore>,
    settlement: Arc<Mutex<Settlement>>,
    bus: Arc<EventBus>,
    network_id: u64,
    token_address: Address,
}

impl RewardBuilder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        settlement: Arc<Mutex<Settlement>>,
        bus: Arc<EventBus>,
        network_id: u64,
        token_address: Address,
    ) -> Self {
        Self {
            store,
            settlement,
            bus,
            network_id,
            token_address,
        }
    }

    /// Close every ended period and build its reward. Returns the rewards
    /// built; a period failing to build is logged and retried on the next run.
    pub async fn compute_matured(&self, now: u64) -> Vec<UemReward> {
        let (mut pending, closed) = {
            let settlement = self.settlement.lock().await;
            (settlement.periods().matured_periods(now), settlement.periods().closed_periods())
        };
        // Closed earlier but never materialized.
        for period_id in closed {
            let reward_id = UemReward::reward_id(self.network_id, period_id);
            if matches!(self.store.reward(&reward_id), Ok(None)) {
                pending.push(period_id);
            }
        }

        let mut rewards = Vec::new();
        for period_id in pending {
            match self.compute(period_id, now).await {
                Ok(Some(reward)) => rewards.push(reward),
                Ok(None) => {}
                Err(e) => warn!(period = period_id, error = %e, "reward computation failed"),
            }
        }
        rewards
    }

    /// Close `period_id` if still open and build its reward.
    ///
    /// A reward already carrying transaction hashes is returned as is.
    /// Returns `None` for a period without valid reports.
    pub async fn compute(&self, period_id: u64, now: u64) -> Result<Option<UemReward>, WomError> {
        let period = {
            let mut settlement = self.settlement.lock().await;
            let closed = settlement.periods().period(period_id).filter(|p| p.closed).cloned();
            match closed {
                Some(period) => period,
                None => settlement.close_period(period_id, now)?,
            }
        };

        let reward_id = UemReward::reward_id(self.network_id, period_id);
        let existing = self.store.reward(&reward_id)?;
        if let Some(existing) = &existing {
            if !existing.transaction_hashes.is_empty() {
                debug!(reward = %reward_id, "reward already sent, not recomputed");
                return Ok(Some(existing.clone()));
            }
        }

        let mut reports = self.latest_report_per_hub(period_id)?;
        if reports.is_empty() {
            debug!(period = period_id, "no report in period");
            return Ok(None);
        }

        let mut reward = self.build_reward(&reward_id, &period, &reports, existing, now);
        self.store.save_reward(&mut reward)?;

        for report in &mut reports {
            report.reward_id = Some(reward.id.clone());
            report.reward_amount = reward.report_rewards.get(&report.hash).cloned().unwrap_or_default();
            self.store.save_report(report)?;
            self.bus.emit(topics::HUB_REPORT_REWARD_COMPUTED, &report.hash);
        }
        self.bus.emit(topics::REWARD_COMPUTED, &reward.id);

        info!(
            reward = %reward.id,
            period = period_id,
            reports = reports.len(),
            merkle_root = %reward.merkle_root,
            "reward computed"
        );
        Ok(Some(reward))
    }

    /// Valid reports of the period, keeping only the last sent report of
    /// each hub and rejecting the others.
    fn latest_report_per_hub(&self, period_id: u64) -> Result<Vec<HubReport>, WomError> {
        let mut by_hub: HashMap<Address, Vec<HubReport>> = HashMap::new();
        for report in self.store.reports_by_period(period_id)? {
            if report.report_id > 0 && !report.status.is_invalid() {
                by_hub.entry(report.data.hub_address.clone()).or_default().push(report);
            }
        }

        let mut kept = Vec::with_capacity(by_hub.len());
        for (hub, mut reports) in by_hub {
            reports.sort_by_key(|r| (r.sent_date, r.report_id));
            let Some(latest) = reports.pop() else {
                continue;
            };
            for mut rejected in reports {
                warn!(hub = %hub, hash = %rejected.hash, "duplicate report in period rejected");
                rejected.set_status(HubReportStatus::Rejected);
                self.store.save_report(&mut rejected)?;
            }
            kept.push(latest);
        }
        kept.sort_by_key(|r| r.report_id);
        Ok(kept)
    }

    fn build_reward(
        &self,
        reward_id: &str,
        period: &RewardPeriod,
        reports: &[HubReport],
        existing: Option<UemReward>,
        now: u64,
    ) -> UemReward {
        let report_rewards: BTreeMap<String, BigUint> = reports
            .iter()
            .map(|r| {
                let amount = share_of(&period.amount, &r.fixed_reward_index, &period.fixed_global_index);
                (r.hash.clone(), amount)
            })
            .collect();
        let report_hashes: BTreeSet<String> = report_rewards.keys().cloned().collect();
        let leaves: Vec<String> = report_hashes.iter().cloned().collect();

        let (status, created_date, version) = existing
            .map(|e| (e.status, e.created_date, e.version))
            .unwrap_or((UemRewardStatus::None, now, 0));

        UemReward {
            id: reward_id.to_string(),
            period_id: period.id,
            period_type: REWARD_PERIOD_TYPE.to_string(),
            from_date: period.start,
            to_date: period.end,
            reward_token_address: self.token_address.clone(),
            reward_token_network_id: self.network_id,
            amount: period.amount.clone(),
            fixed_global_index: period.fixed_global_index.clone(),
            hub_addresses: reports.iter().map(|r| r.data.hub_address.clone()).collect(),
            hub_achievements_count: reports.iter().map(|r| r.data.achievements_count).sum(),
            hub_rewards_amount: reports.iter().map(|r| r.data.hub_reward_amount).sum(),
            merkle_root: compute_merkle_root(&leaves).unwrap_or_default(),
            report_rewards,
            report_hashes,
            transaction_hashes: BTreeSet::new(),
            status,
            created_date,
            version,
        }
    }
}
