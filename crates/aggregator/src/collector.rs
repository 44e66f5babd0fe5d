//! Report collector: verifies, checks eligibility and records signed hub
//! reports.

use std::collections::BTreeSet;
use std::sync::Arc;

use num_bigint::BigUint;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wom_core::{
    codes, Address, DocumentStore, HubReport, HubReportData, HubReportStatus, HubReportVerifiableData, WomError,
};
use wom_crypto::SignatureVerifier;
use wom_events::{topics, EventBus};
use wom_federation::is_bound;
use wom_settlement::Settlement;

use crate::locks::KeyedLocks;
use crate::service::AggregatorConfig;

/// A previous report overlapping the new one by a full day or more is refused.
const LAST_REPORT_OVERLAP_SECS: u64 = 86_400;

/// Statuses of reports that count as the hub's last report.
const LAST_REPORT_STATUSES: [HubReportStatus; 4] = [
    HubReportStatus::None,
    HubReportStatus::Sent,
    HubReportStatus::PendingReward,
    HubReportStatus::Rewarded,
];

/// Validates and ingests hub reports. Submissions of one hub, and of one
/// deed, are serialized.
pub struct ReportCollector {
    store: Arc<dyn DocumentStore>,
    settlement: Arc<Mutex<Settlement>>,
    bus: Arc<EventBus>,
    verifier: SignatureVerifier,
    hub_locks: KeyedLocks<Address>,
    deed_locks: KeyedLocks<u64>,
    supported_tokens: BTreeSet<(u64, Address)>,
    start_reward_time: u64,
    accept_outdated_reports: bool,
}

impl ReportCollector {
    pub fn new(
        config: &AggregatorConfig,
        start_reward_time: u64,
        store: Arc<dyn DocumentStore>,
        settlement: Arc<Mutex<Settlement>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            settlement,
            bus,
            verifier: SignatureVerifier::new(),
            hub_locks: KeyedLocks::new(),
            deed_locks: KeyedLocks::new(),
            supported_tokens: config.supported_tokens(),
            start_reward_time,
            accept_outdated_reports: config.accept_outdated_reports,
        }
    }

    /// Parse and submit a raw `{..., hash, signature}` JSON body.
    pub async fn submit_json(&self, raw: &str, now: u64) -> Result<HubReport, WomError> {
        let report = HubReportVerifiableData::from_json(raw)?;
        self.submit(report, now).await
    }

    /// Validate and record a signed report. Resubmitting an already stored
    /// report returns it unchanged.
    pub async fn submit(&self, report: HubReportVerifiableData, now: u64) -> Result<HubReport, WomError> {
        self.verifier.ensure_valid(&report)?;
        let hash = report.hash.to_ascii_lowercase();
        let data = report.data;

        let _hub_guard = self.hub_locks.lock(&data.hub_address).await;
        let _deed_guard = self.deed_locks.lock(&data.deed_id).await;

        // 1. Hub connected and its manager still managing the deed
        let hub = self
            .store
            .hub(&data.hub_address)?
            .ok_or_else(|| WomError::request(codes::HUB_NOT_CONNECTED))?;
        let deed_id = hub.deed_id.ok_or_else(|| WomError::request(codes::HUB_NOT_CONNECTED))?;
        let deed = self
            .store
            .deed(deed_id)?
            .filter(|deed| is_bound(&hub, deed) && deed.manager == hub.deed_manager)
            .ok_or_else(|| WomError::request(codes::HUB_MANAGER_CHANGED))?;

        // 2. Reporting dates
        self.check_report_dates(&data, &hash, hub.join_date.unwrap_or(hub.created_date))?;

        // 3. Reward token
        if !self
            .supported_tokens
            .contains(&(data.reward_token_network_id, data.reward_token_address.clone()))
        {
            return Err(WomError::authorization(codes::UNSUPPORTED_REWARD_CONTRACT));
        }

        // 4. Duplicate
        if let Some(existing) = self.store.report(&hash)? {
            debug!(hash = %hash, "report already received");
            return Ok(existing);
        }

        let mut settlement = self.settlement.lock().await;
        let accepted = settlement.add_report(&data, &hub, &deed, now)?;

        let mut stored = HubReport {
            hash: hash.clone(),
            signature: report.signature.to_ascii_lowercase(),
            data,
            sent_date: now,
            report_id: 0,
            reward_period_id: 0,
            fixed_reward_index: BigUint::default(),
            owner_fixed_index: BigUint::default(),
            tenant_fixed_index: BigUint::default(),
            last_rewarded_amount: BigUint::default(),
            owner: Address::zero(),
            tenant: Address::zero(),
            owner_percentage: 0,
            fraud: false,
            status: HubReportStatus::Sent,
            reward_id: None,
            reward_amount: BigUint::default(),
            reward_transaction_hash: None,
            error: None,
            version: 0,
        };
        accepted.apply_to(&mut stored);

        if let Err(e) = self.store.save_report(&mut stored) {
            warn!(hash = %hash, error = %e, "report not saved, rolling back");
            settlement.rollback(&accepted);
            return Err(e.into());
        }
        drop(settlement);

        info!(
            hub = %stored.data.hub_address,
            deed = stored.data.deed_id,
            report = stored.report_id,
            period = stored.reward_period_id,
            "report accepted"
        );
        self.bus.emit(topics::HUB_REPORT_SAVED, &stored.hash);
        Ok(stored)
    }

    fn check_report_dates(&self, data: &HubReportData, hash: &str, joined: u64) -> Result<(), WomError> {
        if self.accept_outdated_reports {
            return Ok(());
        }
        if data.to_date < joined {
            return Err(WomError::request(codes::REPORT_BEFORE_CONNECTION));
        }
        if data.to_date <= self.start_reward_time {
            return Err(WomError::request(codes::REPORT_BEFORE_UEM));
        }

        let last = self
            .store
            .reports_by_hub(&data.hub_address)?
            .into_iter()
            .filter(|r| r.hash != hash && LAST_REPORT_STATUSES.contains(&r.status))
            .max_by_key(|r| r.data.from_date);
        if let Some(last) = last {
            if last.data.to_date.saturating_sub(data.from_date) >= LAST_REPORT_OVERLAP_SECS {
                return Err(WomError::request(codes::REPORT_BEFORE_LAST_REWARDED));
            }
        }
        Ok(())
    }
}
