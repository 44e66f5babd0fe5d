//! Weekly reward periods.
//!
//! Reports are numbered sequentially and appended to the period in which
//! they are received. Each period accumulates the fixed indexes of its
//! reports; once the period has ended it is closed and its budget is shared
//! in proportion to each report's index.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wom_core::amount::decimal;
use wom_core::{codes, Address, Deed, Hub, HubReport, HubReportData, WomError};

use crate::index::{fixed_index, share_of, split_index, UsageCounters};
use crate::RewardConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardPeriod {
    pub id: u64,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    pub from_report_id: u64,
    pub to_report_id: u64,
    #[serde(with = "decimal")]
    pub fixed_global_index: BigUint,
    pub start: u64,
    pub end: u64,
    pub closed: bool,
}

impl RewardPeriod {
    pub fn report_count(&self) -> u64 {
        self.to_report_id + 1 - self.from_report_id
    }
}

/// Fields derived for an accepted report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedReport {
    pub report_id: u64,
    pub period_id: u64,
    pub hub: Address,
    pub deed_id: u64,
    pub from_date: u64,
    pub fixed_index: BigUint,
    pub owner_fixed_index: BigUint,
    pub tenant_fixed_index: BigUint,
    pub last_rewarded_amount: BigUint,
    pub owner: Address,
    pub tenant: Address,
    pub owner_percentage: u8,
}

impl AcceptedReport {
    /// Copy the derived fields onto the persisted report.
    pub fn apply_to(&self, report: &mut HubReport) {
        report.report_id = self.report_id;
        report.reward_period_id = self.period_id;
        report.fixed_reward_index = self.fixed_index.clone();
        report.owner_fixed_index = self.owner_fixed_index.clone();
        report.tenant_fixed_index = self.tenant_fixed_index.clone();
        report.last_rewarded_amount = self.last_rewarded_amount.clone();
        report.owner = self.owner.clone();
        report.tenant = self.tenant.clone();
        report.owner_percentage = self.owner_percentage;
    }

    fn from_stored(report: &HubReport) -> Self {
        Self {
            report_id: report.report_id,
            period_id: report.reward_period_id,
            hub: report.data.hub_address.clone(),
            deed_id: report.data.deed_id,
            from_date: report.data.from_date,
            fixed_index: report.fixed_reward_index.clone(),
            owner_fixed_index: report.owner_fixed_index.clone(),
            tenant_fixed_index: report.tenant_fixed_index.clone(),
            last_rewarded_amount: report.last_rewarded_amount.clone(),
            owner: report.owner.clone(),
            tenant: report.tenant.clone(),
            owner_percentage: report.owner_percentage,
        }
    }
}

#[derive(Default)]
struct PeriodMembers {
    hubs: BTreeSet<Address>,
    deeds: BTreeSet<u64>,
}

pub struct RewardPeriodAccumulator {
    config: RewardConfig,
    periods: BTreeMap<u64, RewardPeriod>,
    members: HashMap<u64, PeriodMembers>,
    reports: BTreeMap<u64, AcceptedReport>,
    last_report_by_hub: HashMap<Address, u64>,
    next_report_id: u64,
}

impl RewardPeriodAccumulator {
    pub fn new(config: RewardConfig) -> Self {
        Self {
            config,
            periods: BTreeMap::new(),
            members: HashMap::new(),
            reports: BTreeMap::new(),
            last_report_by_hub: HashMap::new(),
            next_report_id: 1,
        }
    }

    /// Rebuild the accumulator from persisted reports. Periods listed in
    /// `closed_periods` are marked closed.
    pub fn rebuild(config: RewardConfig, reports: &[HubReport], closed_periods: &BTreeSet<u64>) -> Self {
        let mut accumulator = Self::new(config);
        let mut ordered: Vec<&HubReport> = reports.iter().filter(|r| r.report_id > 0).collect();
        ordered.sort_by_key(|r| r.report_id);
        for report in ordered {
            accumulator.record(AcceptedReport::from_stored(report));
        }
        for id in closed_periods {
            if let Some(period) = accumulator.periods.get_mut(id) {
                period.closed = true;
            }
        }
        info!(
            reports = accumulator.reports.len(),
            periods = accumulator.periods.len(),
            "reward periods rebuilt"
        );
        accumulator
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    /// Period containing `now`. Fails before the reward start time.
    pub fn period_id(&self, now: u64) -> Result<u64, WomError> {
        now.checked_sub(self.config.start_reward_time)
            .map(|elapsed| elapsed / self.config.period_length_secs.max(1))
            .ok_or_else(|| WomError::request(codes::REPORT_BEFORE_UEM))
    }

    /// Validate a report and append it to the current period.
    ///
    /// `hub` is the hub record at submission time and `deed` the deed it is
    /// connected through.
    pub fn add_report(
        &mut self,
        data: &HubReportData,
        hub: &Hub,
        deed: &Deed,
        now: u64,
    ) -> Result<AcceptedReport, WomError> {
        // 1. Connected through the reported deed, within the binding window
        if !hub.is_binding_valid(now) || hub.deed_id != Some(data.deed_id) || deed.id != data.deed_id {
            return Err(WomError::request(codes::HUB_NOT_CONNECTED_USING_DEED));
        }

        // 2. Usage counters
        let counters = UsageCounters::from_report(data)?;

        // 3. Report window ends after joining and not in the future
        let joined = hub.join_date.unwrap_or(0);
        if data.to_date <= joined || data.to_date > now {
            return Err(WomError::request(codes::NOT_ELIGIBLE_TO_DATE));
        }

        // 4. One report per hub and per deed in a period
        let period_id = self.period_id(now)?;
        if let Some(members) = self.members.get(&period_id) {
            if members.hubs.contains(&data.hub_address) {
                return Err(WomError::request(codes::HUB_ALREADY_REPORTED));
            }
            if members.deeds.contains(&data.deed_id) {
                return Err(WomError::request(codes::DEED_ALREADY_REPORTED));
            }
        }

        // 5. Strictly increasing fromDate per hub
        let previous = self
            .last_report_by_hub
            .get(&data.hub_address)
            .and_then(|id| self.reports.get(id));
        if let Some(previous) = previous {
            if data.from_date <= previous.from_date {
                return Err(WomError::request(codes::FROM_DATE_NOT_INCREASING));
            }
        }

        // 6. Period still open. Report ids are global, so a period's id
        // range stays contiguous only if periods never go backwards.
        if self.periods.get(&period_id).is_some_and(|p| p.closed) {
            return Err(WomError::request(codes::REWARD_PERIOD_CLOSED));
        }
        if self.latest_period().is_some_and(|latest| period_id < latest) {
            return Err(WomError::request(codes::REWARD_PERIOD_OUTDATED));
        }

        let last_rewarded_amount = self.last_rewarded_amount(&data.hub_address);
        let index = fixed_index(&counters, &last_rewarded_amount, deed.max_users, deed.minting_power)
            .ok_or_else(|| WomError::request(codes::HUB_PARTICIPANTS_MANDATORY))?;
        let (owner_fixed_index, tenant_fixed_index) = split_index(&index, deed.owner_percentage);

        let accepted = AcceptedReport {
            report_id: self.next_report_id,
            period_id,
            hub: data.hub_address.clone(),
            deed_id: data.deed_id,
            from_date: data.from_date,
            fixed_index: index,
            owner_fixed_index,
            tenant_fixed_index,
            last_rewarded_amount,
            owner: deed.owner.clone(),
            tenant: deed.manager.clone(),
            owner_percentage: deed.owner_percentage,
        };
        self.record(accepted.clone());

        debug!(
            hub = %accepted.hub,
            report = accepted.report_id,
            period = period_id,
            index = %accepted.fixed_index,
            "report added to reward period"
        );
        Ok(accepted)
    }

    fn record(&mut self, report: AcceptedReport) {
        let start = self.config.start_reward_time + report.period_id * self.config.period_length_secs;
        let period = self.periods.entry(report.period_id).or_insert_with(|| RewardPeriod {
            id: report.period_id,
            amount: self.config.periodic_reward_amount.clone(),
            from_report_id: report.report_id,
            to_report_id: report.report_id,
            fixed_global_index: BigUint::zero(),
            start,
            end: start + self.config.period_length_secs,
            closed: false,
        });
        period.to_report_id = period.to_report_id.max(report.report_id);
        period.fixed_global_index += &report.fixed_index;

        let members = self.members.entry(report.period_id).or_default();
        members.hubs.insert(report.hub.clone());
        members.deeds.insert(report.deed_id);

        self.last_report_by_hub.insert(report.hub.clone(), report.report_id);
        self.next_report_id = self.next_report_id.max(report.report_id + 1);
        self.reports.insert(report.report_id, report);
    }

    /// Undo the most recently accepted report, used when persisting it fails.
    /// Returns `false` if `report_id` is not the latest report.
    pub fn rollback(&mut self, report_id: u64) -> bool {
        if report_id + 1 != self.next_report_id {
            return false;
        }
        let Some(report) = self.reports.remove(&report_id) else {
            return false;
        };
        self.next_report_id = report_id;

        let first_of_period = self
            .periods
            .get(&report.period_id)
            .is_some_and(|p| p.from_report_id == report_id);
        if first_of_period {
            self.periods.remove(&report.period_id);
            self.members.remove(&report.period_id);
        } else if let Some(period) = self.periods.get_mut(&report.period_id) {
            period.to_report_id = report_id - 1;
            period.fixed_global_index -= &report.fixed_index;
            if let Some(members) = self.members.get_mut(&report.period_id) {
                members.hubs.remove(&report.hub);
                members.deeds.remove(&report.deed_id);
            }
        }

        let previous = self
            .reports
            .values()
            .rev()
            .find(|r| r.hub == report.hub)
            .map(|r| r.report_id);
        match previous {
            Some(id) => self.last_report_by_hub.insert(report.hub.clone(), id),
            None => self.last_report_by_hub.remove(&report.hub),
        };
        debug!(report = report_id, hub = %report.hub, "report rolled back");
        true
    }

    /// Freeze an ended period and return its aggregate.
    pub fn close_period(&mut self, period_id: u64, now: u64) -> Result<RewardPeriod, WomError> {
        let period = self
            .periods
            .get_mut(&period_id)
            .ok_or_else(|| WomError::request(codes::REWARD_PERIOD_NOT_FOUND))?;
        if period.closed {
            return Err(WomError::request(codes::REWARD_PERIOD_CLOSED));
        }
        if now < period.end {
            return Err(WomError::request(codes::REWARD_PERIOD_NOT_ENDED));
        }
        period.closed = true;
        info!(
            period = period_id,
            reports = period.report_count(),
            global_index = %period.fixed_global_index,
            "reward period closed"
        );
        Ok(period.clone())
    }

    /// Ended periods not closed yet, oldest first.
    pub fn matured_periods(&self, now: u64) -> Vec<u64> {
        self.periods
            .values()
            .filter(|p| !p.closed && p.end <= now)
            .map(|p| p.id)
            .collect()
    }

    pub fn closed_periods(&self) -> Vec<u64> {
        self.periods.values().filter(|p| p.closed).map(|p| p.id).collect()
    }

    /// Highest period holding a report.
    pub fn latest_period(&self) -> Option<u64> {
        self.periods.keys().next_back().copied()
    }

    pub fn period(&self, period_id: u64) -> Option<&RewardPeriod> {
        self.periods.get(&period_id)
    }

    pub fn report(&self, report_id: u64) -> Option<&AcceptedReport> {
        self.reports.get(&report_id)
    }

    /// Reports of a period in id order.
    pub fn period_reports(&self, period_id: u64) -> Vec<&AcceptedReport> {
        match self.periods.get(&period_id) {
            Some(p) => self.reports.range(p.from_report_id..=p.to_report_id).map(|(_, r)| r).collect(),
            None => Vec::new(),
        }
    }

    /// Share of the period budget earned by a report, `None` while the
    /// period is open.
    pub fn report_reward(&self, report_id: u64) -> Option<BigUint> {
        let report = self.reports.get(&report_id)?;
        let period = self.periods.get(&report.period_id).filter(|p| p.closed)?;
        Some(share_of(&period.amount, &report.fixed_index, &period.fixed_global_index))
    }

    /// Reward of the hub's latest report, zero when it has none or its
    /// period is still open.
    pub fn last_rewarded_amount(&self, hub: &Address) -> BigUint {
        self.last_report_by_hub
            .get(hub)
            .and_then(|id| self.report_reward(*id))
            .unwrap_or_default()
    }
}
