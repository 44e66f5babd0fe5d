//! Document store seam.
//!
//! The engine needs point lookups, a few range queries and optimistic saves.
//! Every versioned record carries a `version`; a save succeeds only when the
//! stored version equals the record's version, and bumps both.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use crate::model::{
    ClaimReceipt, Deed, Hub, HubReport, HubReportStatus, Lease, Offer, TransactionStatus, UemReward,
    UemRewardStatus,
};
use crate::Address;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict on {collection}/{id}: expected {expected}, found {found}")]
    Conflict {
        collection: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence seam for all committed engine state.
pub trait DocumentStore: Send + Sync {
    fn hub(&self, address: &Address) -> StoreResult<Option<Hub>>;
    fn hubs(&self) -> StoreResult<Vec<Hub>>;
    fn deed(&self, id: u64) -> StoreResult<Option<Deed>>;
    /// Save hubs and deeds in one atomic write.
    fn save_binding(&self, hubs: &mut [Hub], deeds: &mut [Deed]) -> StoreResult<()>;

    fn report(&self, hash: &str) -> StoreResult<Option<HubReport>>;
    /// Reports of a hub ordered by `fromDate`.
    fn reports_by_hub(&self, hub: &Address) -> StoreResult<Vec<HubReport>>;
    fn reports_by_period(&self, period_id: u64) -> StoreResult<Vec<HubReport>>;
    fn reports_by_reward(&self, reward_id: &str) -> StoreResult<Vec<HubReport>>;
    fn reports_by_status(&self, statuses: &[HubReportStatus]) -> StoreResult<Vec<HubReport>>;
    fn save_report(&self, report: &mut HubReport) -> StoreResult<()>;

    fn reward(&self, id: &str) -> StoreResult<Option<UemReward>>;
    fn rewards_by_status(&self, statuses: &[UemRewardStatus]) -> StoreResult<Vec<UemReward>>;
    fn save_reward(&self, reward: &mut UemReward) -> StoreResult<()>;

    fn lease(&self, id: u64) -> StoreResult<Option<Lease>>;
    fn leases_by_deed(&self, deed_id: u64) -> StoreResult<Vec<Lease>>;
    fn leases_by_transaction_status(&self, status: TransactionStatus) -> StoreResult<Vec<Lease>>;
    fn save_lease(&self, lease: &mut Lease) -> StoreResult<()>;

    fn offer(&self, id: u64) -> StoreResult<Option<Offer>>;
    fn offers_by_transaction_status(&self, status: TransactionStatus) -> StoreResult<Vec<Offer>>;
    fn save_offer(&self, offer: &mut Offer) -> StoreResult<()>;

    fn claim_receipt(&self, transaction_hash: &str) -> StoreResult<Option<ClaimReceipt>>;
    fn claim_receipts(&self) -> StoreResult<Vec<ClaimReceipt>>;
    /// Insert a claim receipt. Returns `false` when one already exists for the hash.
    fn insert_claim_receipt(&self, receipt: &ClaimReceipt) -> StoreResult<bool>;

    fn setting(&self, name: &str) -> StoreResult<Option<String>>;
    fn save_setting(&self, name: &str, value: &str) -> StoreResult<()>;
}

trait Versioned {
    const COLLECTION: &'static str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! versioned {
    ($ty:ty, $collection:literal) => {
        impl Versioned for $ty {
            const COLLECTION: &'static str = $collection;
            fn version(&self) -> u64 {
                self.version
            }
            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

versioned!(Hub, "hubs");
versioned!(Deed, "deeds");
versioned!(HubReport, "reports");
versioned!(UemReward, "rewards");
versioned!(Lease, "leases");
versioned!(Offer, "offers");

fn check_version<K, V>(map: &BTreeMap<K, V>, key: &K, record: &V, id: impl ToString) -> StoreResult<()>
where
    K: Ord,
    V: Versioned,
{
    let found = map.get(key).map(|stored| stored.version()).unwrap_or(0);
    if found != record.version() {
        return Err(StoreError::Conflict {
            collection: V::COLLECTION,
            id: id.to_string(),
            expected: record.version(),
            found,
        });
    }
    Ok(())
}

fn put<K, V>(map: &mut BTreeMap<K, V>, key: K, record: &mut V)
where
    K: Ord,
    V: Versioned + Clone,
{
    record.set_version(record.version() + 1);
    map.insert(key, record.clone());
}

#[derive(Default)]
struct Collections {
    hubs: BTreeMap<Address, Hub>,
    deeds: BTreeMap<u64, Deed>,
    reports: BTreeMap<String, HubReport>,
    rewards: BTreeMap<String, UemReward>,
    leases: BTreeMap<u64, Lease>,
    offers: BTreeMap<u64, Offer>,
    claims: BTreeMap<String, ClaimReceipt>,
    settings: HashMap<String, String>,
}

/// In-memory [`DocumentStore`]. Can be switched offline to exercise transient
/// failure handling.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn read<R>(&self, f: impl FnOnce(&Collections) -> R) -> StoreResult<R> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let guard = self
            .inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(f(&guard))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Collections) -> StoreResult<R>) -> StoreResult<R> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let mut guard = self
            .inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        f(&mut guard)
    }
}

impl DocumentStore for MemoryStore {
    fn hub(&self, address: &Address) -> StoreResult<Option<Hub>> {
        self.read(|c| c.hubs.get(address).cloned())
    }

    fn hubs(&self) -> StoreResult<Vec<Hub>> {
        self.read(|c| c.hubs.values().cloned().collect())
    }

    fn deed(&self, id: u64) -> StoreResult<Option<Deed>> {
        self.read(|c| c.deeds.get(&id).cloned())
    }

    fn save_binding(&self, hubs: &mut [Hub], deeds: &mut [Deed]) -> StoreResult<()> {
        self.write(|c| {
            for hub in hubs.iter() {
                check_version(&c.hubs, &hub.address, hub, &hub.address)?;
            }
            for deed in deeds.iter() {
                check_version(&c.deeds, &deed.id, deed, deed.id)?;
            }
            for hub in hubs.iter_mut() {
                put(&mut c.hubs, hub.address.clone(), hub);
            }
            for deed in deeds.iter_mut() {
                put(&mut c.deeds, deed.id, deed);
            }
            Ok(())
        })
    }

    fn report(&self, hash: &str) -> StoreResult<Option<HubReport>> {
        self.read(|c| c.reports.get(hash).cloned())
    }

    fn reports_by_hub(&self, hub: &Address) -> StoreResult<Vec<HubReport>> {
        self.read(|c| {
            let mut reports: Vec<HubReport> = c
                .reports
                .values()
                .filter(|r| r.hub_address() == hub)
                .cloned()
                .collect();
            reports.sort_by_key(|r| (r.data.from_date, r.report_id));
            reports
        })
    }

    fn reports_by_period(&self, period_id: u64) -> StoreResult<Vec<HubReport>> {
        self.read(|c| {
            c.reports
                .values()
                .filter(|r| r.reward_period_id == period_id)
                .cloned()
                .collect()
        })
    }

    fn reports_by_reward(&self, reward_id: &str) -> StoreResult<Vec<HubReport>> {
        self.read(|c| {
            c.reports
                .values()
                .filter(|r| r.reward_id.as_deref() == Some(reward_id))
                .cloned()
                .collect()
        })
    }

    fn reports_by_status(&self, statuses: &[HubReportStatus]) -> StoreResult<Vec<HubReport>> {
        self.read(|c| {
            c.reports
                .values()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect()
        })
    }

    fn save_report(&self, report: &mut HubReport) -> StoreResult<()> {
        self.write(|c| {
            check_version(&c.reports, &report.hash, report, &report.hash)?;
            put(&mut c.reports, report.hash.clone(), report);
            Ok(())
        })
    }

    fn reward(&self, id: &str) -> StoreResult<Option<UemReward>> {
        self.read(|c| c.rewards.get(id).cloned())
    }

    fn rewards_by_status(&self, statuses: &[UemRewardStatus]) -> StoreResult<Vec<UemReward>> {
        self.read(|c| {
            c.rewards
                .values()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect()
        })
    }

    fn save_reward(&self, reward: &mut UemReward) -> StoreResult<()> {
        self.write(|c| {
            check_version(&c.rewards, &reward.id, reward, &reward.id)?;
            put(&mut c.rewards, reward.id.clone(), reward);
            Ok(())
        })
    }

    fn lease(&self, id: u64) -> StoreResult<Option<Lease>> {
        self.read(|c| c.leases.get(&id).cloned())
    }

    fn leases_by_deed(&self, deed_id: u64) -> StoreResult<Vec<Lease>> {
        self.read(|c| {
            c.leases
                .values()
                .filter(|l| l.deed_id == deed_id)
                .cloned()
                .collect()
        })
    }

    fn leases_by_transaction_status(&self, status: TransactionStatus) -> StoreResult<Vec<Lease>> {
        self.read(|c| {
            c.leases
                .values()
                .filter(|l| l.transaction_status == status)
                .cloned()
                .collect()
        })
    }

    fn save_lease(&self, lease: &mut Lease) -> StoreResult<()> {
        self.write(|c| {
            check_version(&c.leases, &lease.id, lease, lease.id)?;
            put(&mut c.leases, lease.id, lease);
            Ok(())
        })
    }

    fn offer(&self, id: u64) -> StoreResult<Option<Offer>> {
        self.read(|c| c.offers.get(&id).cloned())
    }

    fn offers_by_transaction_status(&self, status: TransactionStatus) -> StoreResult<Vec<Offer>> {
        self.read(|c| {
            c.offers
                .values()
                .filter(|o| o.transaction_status == status)
                .cloned()
                .collect()
        })
    }

    fn save_offer(&self, offer: &mut Offer) -> StoreResult<()> {
        self.write(|c| {
            check_version(&c.offers, &offer.id, offer, offer.id)?;
            put(&mut c.offers, offer.id, offer);
            Ok(())
        })
    }

    fn claim_receipt(&self, transaction_hash: &str) -> StoreResult<Option<ClaimReceipt>> {
        self.read(|c| c.claims.get(transaction_hash).cloned())
    }

    fn claim_receipts(&self) -> StoreResult<Vec<ClaimReceipt>> {
        self.read(|c| c.claims.values().cloned().collect())
    }

    fn insert_claim_receipt(&self, receipt: &ClaimReceipt) -> StoreResult<bool> {
        self.write(|c| {
            if c.claims.contains_key(&receipt.transaction_hash) {
                return Ok(false);
            }
            c.claims
                .insert(receipt.transaction_hash.clone(), receipt.clone());
            Ok(true)
        })
    }

    fn setting(&self, name: &str) -> StoreResult<Option<String>> {
        self.read(|c| c.settings.get(name).cloned())
    }

    fn save_setting(&self, name: &str, value: &str) -> StoreResult<()> {
        self.write(|c| {
            c.settings.insert(name.to_string(), value.to_string());
            Ok(())
        })
    }
}
