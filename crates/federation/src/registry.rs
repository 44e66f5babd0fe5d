use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tracing::{debug, info};
use wom_core::{
    codes, Address, Deed, DeedAttributes, DeedCard, DocumentStore, Hub, WomError,
};
use wom_events::{topics, EventBus};

use crate::{FederationConfig, FederationEvent};

/// Whether `hub` and `deed` are linked both ways and the deed manager owns
/// the hub.
pub fn is_bound(hub: &Hub, deed: &Deed) -> bool {
    hub.deed_id == Some(deed.id)
        && deed.hub == hub.address
        && !hub.hub_owner.is_zero()
        && deed.manager == hub.hub_owner
}

/// Copy deed attributes onto the hub and derive its `enabled` flag. The
/// binding of a leased deed ends with the lease.
fn sync_hub(hub: &mut Hub, deed: Option<&Deed>, lease_end: Option<u64>, now: u64) {
    let linked = deed.filter(|d| hub.deed_id == Some(d.id));
    if let Some(deed) = linked {
        hub.city = Some(deed.city);
        hub.card_type = Some(deed.card_type);
        hub.deed_owner = deed.owner.clone();
        hub.deed_manager = deed.manager.clone();
        hub.earner = deed.manager.clone();
    }
    hub.until_date = linked.and(lease_end);
    hub.enabled = linked.map_or(false, |deed| is_bound(hub, deed)) && hub.until_date.map_or(true, |until| now < until);
    hub.updated_date = now;
}

/// End of the lease running on the deed at `now`.
fn current_lease_end(store: &dyn DocumentStore, deed_id: u64, now: u64) -> Result<Option<u64>, WomError> {
    Ok(store
        .leases_by_deed(deed_id)?
        .iter()
        .filter(|lease| lease.is_in_progress(now))
        .map(|lease| lease.end_date)
        .max())
}

/// Records touched by one transition, written in a single store call.
struct Batch<'a> {
    store: &'a dyn DocumentStore,
    now: u64,
    hubs: BTreeMap<Address, (Option<Hub>, Hub)>,
    deeds: BTreeMap<u64, Deed>,
}

impl<'a> Batch<'a> {
    fn new(store: &'a dyn DocumentStore, now: u64) -> Self {
        Self {
            store,
            now,
            hubs: BTreeMap::new(),
            deeds: BTreeMap::new(),
        }
    }

    /// Hub record, created when unknown.
    fn hub(&mut self, address: &Address) -> Result<&mut Hub, WomError> {
        match self.hubs.entry(address.clone()) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().1),
            Entry::Vacant(entry) => {
                let stored = self.store.hub(address)?;
                let hub = stored
                    .clone()
                    .unwrap_or_else(|| Hub::new(address.clone(), self.now));
                Ok(&mut entry.insert((stored, hub)).1)
            }
        }
    }

    fn existing_hub(&mut self, address: &Address) -> Result<Option<&mut Hub>, WomError> {
        if !self.hubs.contains_key(address) {
            match self.store.hub(address)? {
                Some(hub) => {
                    self.hubs.insert(address.clone(), (Some(hub.clone()), hub));
                }
                None => return Ok(None),
            }
        }
        Ok(self.hubs.get_mut(address).map(|(_, hub)| hub))
    }

    fn deed(&mut self, id: u64) -> Result<Option<&mut Deed>, WomError> {
        if !self.deeds.contains_key(&id) {
            match self.store.deed(id)? {
                Some(deed) => {
                    self.deeds.insert(id, deed);
                }
                None => return Ok(None),
            }
        }
        Ok(self.deeds.get_mut(&id))
    }

    fn peek_deed(&self, id: u64) -> Result<Option<Deed>, WomError> {
        match self.deeds.get(&id) {
            Some(deed) => Ok(Some(deed.clone())),
            None => Ok(self.store.deed(id)?),
        }
    }

    fn put_deed(&mut self, deed: Deed) {
        self.deeds.insert(deed.id, deed);
    }

    /// Drop the hub side of a link, if it still points to `deed_id`.
    fn unlink_hub(&mut self, address: &Address, deed_id: u64) -> Result<(), WomError> {
        if let Some(hub) = self.existing_hub(address)? {
            if hub.deed_id == Some(deed_id) {
                hub.deed_id = None;
            }
        }
        Ok(())
    }

    /// Drop the deed side of a link, if it still points to `address`.
    fn unlink_deed(&mut self, deed_id: u64, address: &Address) -> Result<(), WomError> {
        if let Some(deed) = self.deed(deed_id)? {
            if deed.hub == *address {
                deed.hub = Address::zero();
            }
        }
        Ok(())
    }

    /// Link `address` to `deed`, detaching whatever either side was linked to.
    fn link(&mut self, address: &Address, deed: &mut Deed, join_date: u64) -> Result<(), WomError> {
        if !deed.hub.is_zero() && deed.hub != *address {
            let previous = deed.hub.clone();
            self.unlink_hub(&previous, deed.id)?;
        }
        let previous_deed = self.hub(address)?.deed_id.filter(|id| *id != deed.id);
        if let Some(previous_deed) = previous_deed {
            self.unlink_deed(previous_deed, address)?;
        }

        let hub = self.hub(address)?;
        hub.deed_id = Some(deed.id);
        hub.join_date.get_or_insert(join_date);
        deed.hub = address.clone();
        Ok(())
    }

    /// Re-derive every touched hub, persist everything at once, then publish.
    fn commit(mut self, bus: &EventBus) -> Result<Vec<Hub>, WomError> {
        let now = self.now;
        let addresses: Vec<Address> = self.hubs.keys().cloned().collect();
        let mut events = Vec::new();

        for address in addresses {
            let deed_id = self.hubs.get(&address).and_then(|(_, hub)| hub.deed_id);
            let (deed, lease_end) = match deed_id {
                Some(id) => (self.peek_deed(id)?, current_lease_end(self.store, id, now)?),
                None => (None, None),
            };
            let Some((before, hub)) = self.hubs.get_mut(&address) else {
                continue;
            };
            sync_hub(hub, deed.as_ref(), lease_end, now);

            let (was_enabled, was_deed) = before
                .as_ref()
                .map_or((false, None), |b| (b.enabled, b.deed_id));
            let moved = was_deed != hub.deed_id;
            if was_enabled && (!hub.enabled || moved) {
                events.push((topics::HUB_DISCONNECTED, json!({ "hub": address, "deedId": was_deed })));
            }
            if hub.enabled && (!was_enabled || moved) {
                events.push((topics::HUB_CONNECTED, json!({ "hub": address, "deedId": hub.deed_id })));
            }
            if was_enabled != hub.enabled {
                events.push((topics::HUB_STATUS_CHANGED, json!({ "hub": address, "enabled": hub.enabled })));
            }
        }

        let mut hubs: Vec<Hub> = self.hubs.into_values().map(|(_, hub)| hub).collect();
        let mut deeds: Vec<Deed> = self.deeds.into_values().collect();
        self.store.save_binding(&mut hubs, &mut deeds)?;

        for (name, payload) in events {
            bus.emit(name, &payload);
        }
        for hub in &hubs {
            bus.emit(topics::HUB_SAVED, &hub.address);
        }
        Ok(hubs)
    }
}

/// Off-chain mirror of the federation contract. Transitions are serialized
/// in-process and each persists its hubs and deeds in one atomic write.
pub struct FederationRegistry {
    config: FederationConfig,
    store: Arc<dyn DocumentStore>,
    bus: Arc<EventBus>,
    write_lock: Mutex<()>,
}

impl FederationRegistry {
    pub fn new(config: FederationConfig, store: Arc<dyn DocumentStore>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            store,
            bus,
            write_lock: Mutex::new(()),
        }
    }

    /// Create or update a deed. `auto_connect` links the deed to that hub,
    /// detaching the previous one. Without it, the currently linked hub is
    /// re-derived: it stays connected only if the (new) manager owns it.
    pub fn update_deed(
        &self,
        caller: &Address,
        attributes: &DeedAttributes,
        auto_connect: Option<&Address>,
        now: u64,
    ) -> Result<Deed, WomError> {
        if caller.is_zero() || *caller != self.config.deed_updater {
            return Err(WomError::authorization(codes::ONLY_MANAGER_CAN_UPDATE_DEED));
        }
        let _guard = self.lock()?;
        let deed = self.write_deed(attributes, auto_connect, now)?;
        info!(deed = deed.id, manager = %deed.manager, hub = %deed.hub, "deed updated");
        Ok(deed)
    }

    fn write_deed(
        &self,
        attributes: &DeedAttributes,
        auto_connect: Option<&Address>,
        now: u64,
    ) -> Result<Deed, WomError> {
        attributes.validate()?;
        let mut batch = Batch::new(self.store.as_ref(), now);
        let mut deed = match batch.deed(attributes.id)? {
            Some(deed) => {
                deed.set_attributes(attributes);
                deed.clone()
            }
            None => Deed::from_attributes(attributes),
        };

        match auto_connect.filter(|hub| !hub.is_zero() && **hub != deed.hub) {
            Some(target) => {
                batch.link(target, &mut deed, now)?;
                let hub = batch.hub(target)?;
                if hub.hub_owner.is_zero() {
                    hub.hub_owner = deed.manager.clone();
                }
            }
            None if !deed.hub.is_zero() => {
                // Pull the linked hub into the batch so it gets re-derived.
                let linked = deed.hub.clone();
                batch.existing_hub(&linked)?;
            }
            None => {}
        }

        batch.put_deed(deed.clone());
        batch.commit(&self.bus)?;
        Ok(self.store.deed(deed.id)?.unwrap_or(deed))
    }

    /// Connect `hub` through `deed_id` on behalf of the deed manager.
    pub fn connect(&self, caller: &Address, hub: &Address, deed_id: u64, now: u64) -> Result<Hub, WomError> {
        let _guard = self.lock()?;
        let mut deed = self
            .store
            .deed(deed_id)?
            .ok_or_else(|| WomError::request(codes::DEED_NOT_FOUND))?;

        if deed.manager != *caller {
            return Err(WomError::authorization(codes::NOT_DEED_MANAGER));
        }
        let leased_to_other = self
            .store
            .leases_by_deed(deed_id)?
            .iter()
            .any(|lease| lease.is_in_progress(now) && lease.tenant != *caller);
        if leased_to_other {
            return Err(WomError::authorization(codes::NO_LEASE_FOUND));
        }
        if let Some(connected) = self.connected_hub_of(&deed)? {
            if connected != *hub {
                return Err(WomError::request(codes::DEED_ALREADY_USED));
            }
        }

        let mut batch = Batch::new(self.store.as_ref(), now);
        let owner = batch.hub(hub)?.hub_owner.clone();
        if !owner.is_zero() && owner != *caller {
            return Err(WomError::authorization(codes::ONLY_HUB_OWNER));
        }

        batch.link(hub, &mut deed, now)?;
        batch.hub(hub)?.hub_owner = caller.clone();
        batch.put_deed(deed);
        let saved = batch.commit(&self.bus)?;

        info!(hub = %hub, deed = deed_id, owner = %caller, "hub connected");
        saved
            .into_iter()
            .find(|h| h.address == *hub)
            .ok_or_else(|| WomError::Anomaly(format!("hub {hub} missing after connect")))
    }

    /// Disconnect `hub`. Owner and join date are kept.
    pub fn disconnect(&self, caller: &Address, hub: &Address, now: u64) -> Result<Hub, WomError> {
        let _guard = self.lock()?;
        let mut batch = Batch::new(self.store.as_ref(), now);
        let (deed_id, owner) = match batch.existing_hub(hub)? {
            Some(record) => (record.deed_id, record.hub_owner.clone()),
            None => return Err(WomError::request(codes::HUB_DOES_NOT_EXIST)),
        };
        let Some(deed_id) = deed_id else {
            return Err(WomError::request(codes::ALREADY_DISCONNECTED));
        };
        if owner != *caller {
            return Err(WomError::authorization(codes::ONLY_HUB_OWNER));
        }

        batch.unlink_deed(deed_id, hub)?;
        batch.unlink_hub(hub, deed_id)?;
        let saved = batch.commit(&self.bus)?;

        info!(hub = %hub, deed = deed_id, "hub disconnected");
        saved
            .into_iter()
            .find(|h| h.address == *hub)
            .ok_or_else(|| WomError::Anomaly(format!("hub {hub} missing after disconnect")))
    }

    /// Hand the hub over to `new_owner`. Reconnects when the new owner
    /// manages the linked deed.
    pub fn transfer_hub_ownership(
        &self,
        caller: &Address,
        hub: &Address,
        new_owner: &Address,
        now: u64,
    ) -> Result<Hub, WomError> {
        let _guard = self.lock()?;
        let mut batch = Batch::new(self.store.as_ref(), now);
        let record = batch
            .existing_hub(hub)?
            .ok_or_else(|| WomError::request(codes::HUB_DOES_NOT_EXIST))?;
        if record.hub_owner != *caller {
            return Err(WomError::authorization(codes::ONLY_HUB_OWNER));
        }
        if new_owner.is_zero() || *new_owner == record.hub_owner {
            return Err(WomError::request(codes::INVALID_NEW_OWNER));
        }
        record.hub_owner = new_owner.clone();
        let saved = batch.commit(&self.bus)?;

        info!(hub = %hub, from = %caller, to = %new_owner, "hub ownership transferred");
        saved
            .into_iter()
            .find(|h| h.address == *hub)
            .ok_or_else(|| WomError::Anomaly(format!("hub {hub} missing after transfer")))
    }

    /// Apply a mined federation event. Every variant overwrites absolute
    /// state, so replaying an event leaves the records unchanged.
    pub fn apply_chain_state(&self, event: &FederationEvent, now: u64) -> Result<(), WomError> {
        let _guard = self.lock()?;
        match event {
            FederationEvent::DeedUpdated {
                deed_id,
                city,
                card_type,
                owner,
                manager,
                owner_percentage,
                hub,
            } => {
                let card = DeedCard::from_u8(*card_type)
                    .ok_or_else(|| WomError::Anomaly(format!("unknown card type {card_type} for deed {deed_id}")))?;
                let attributes = DeedAttributes::new(*deed_id, card, owner.clone(), manager.clone())
                    .city(*city)
                    .owner_percentage(*owner_percentage);
                self.write_deed(&attributes, Some(hub), now)?;
            }
            FederationEvent::HubConnected {
                hub,
                deed_id,
                owner,
                join_date,
            } => {
                let mut batch = Batch::new(self.store.as_ref(), now);
                let mut deed = batch
                    .deed(*deed_id)?
                    .cloned()
                    .ok_or_else(|| WomError::Anomaly(format!("hub {hub} connected to unknown deed {deed_id}")))?;
                batch.link(hub, &mut deed, *join_date)?;
                batch.hub(hub)?.hub_owner = owner.clone();
                batch.put_deed(deed);
                batch.commit(&self.bus)?;
            }
            FederationEvent::HubDisconnected { hub, deed_id } => {
                let mut batch = Batch::new(self.store.as_ref(), now);
                batch.unlink_deed(*deed_id, hub)?;
                batch.unlink_hub(hub, *deed_id)?;
                batch.commit(&self.bus)?;
            }
            FederationEvent::HubOwnershipTransferred { hub, new_owner, .. } => {
                let mut batch = Batch::new(self.store.as_ref(), now);
                batch.hub(hub)?.hub_owner = new_owner.clone();
                batch.commit(&self.bus)?;
            }
        }
        debug!(?event, "federation event applied");
        Ok(())
    }

    /// Re-derive a hub record from its linked deed.
    pub fn refresh_hub(&self, hub: &Address, now: u64) -> Result<Option<Hub>, WomError> {
        let _guard = self.lock()?;
        let mut batch = Batch::new(self.store.as_ref(), now);
        if batch.existing_hub(hub)?.is_none() {
            return Ok(None);
        }
        Ok(batch.commit(&self.bus)?.into_iter().find(|h| h.address == *hub))
    }

    pub fn get_hub(&self, hub: &Address) -> Result<Option<Hub>, WomError> {
        Ok(self.store.hub(hub)?)
    }

    pub fn get_deed(&self, deed_id: u64) -> Result<Option<Deed>, WomError> {
        Ok(self.store.deed(deed_id)?)
    }

    /// Deed the hub is connected through, `None` when not connected.
    pub fn get_connected_deed(&self, hub: &Address) -> Result<Option<u64>, WomError> {
        let Some(record) = self.store.hub(hub)? else {
            return Ok(None);
        };
        let Some(deed_id) = record.deed_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .deed(deed_id)?
            .filter(|deed| is_bound(&record, deed))
            .map(|deed| deed.id))
    }

    /// Hub connected through the deed, `None` when not connected.
    pub fn get_connected_hub(&self, deed_id: u64) -> Result<Option<Address>, WomError> {
        match self.store.deed(deed_id)? {
            Some(deed) => self.connected_hub_of(&deed),
            None => Ok(None),
        }
    }

    pub fn is_hub_connected(&self, hub: &Address) -> Result<bool, WomError> {
        Ok(self.get_connected_deed(hub)?.is_some())
    }

    pub fn is_deed_connected(&self, deed_id: u64) -> Result<bool, WomError> {
        Ok(self.get_connected_hub(deed_id)?.is_some())
    }

    pub fn get_hub_join_date(&self, hub: &Address) -> Result<Option<u64>, WomError> {
        Ok(self.store.hub(hub)?.and_then(|h| h.join_date))
    }

    fn connected_hub_of(&self, deed: &Deed) -> Result<Option<Address>, WomError> {
        if deed.hub.is_zero() {
            return Ok(None);
        }
        Ok(self
            .store
            .hub(&deed.hub)?
            .filter(|hub| is_bound(hub, deed))
            .map(|hub| hub.address))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, WomError> {
        self.write_lock
            .lock()
            .map_err(|_| WomError::Transient("federation lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wom_core::{Lease, MemoryStore, TransactionStatus};

    const NOW: u64 = 1_700_000_000;

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        registry: FederationRegistry,
        updater: Address,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        bus.init().unwrap();
        let updater = addr(0xee);
        let registry = FederationRegistry::new(
            FederationConfig {
                deed_updater: updater.clone(),
            },
            store.clone(),
            bus.clone(),
        );
        Fixture {
            store,
            bus,
            registry,
            updater,
        }
    }

    const DEED1: u64 = 1;
    const DEED2: u64 = 2;

    fn owner1() -> Address {
        addr(0x01)
    }
    fn owner2() -> Address {
        addr(0x02)
    }
    fn tenant1() -> Address {
        addr(0x11)
    }
    fn tenant2() -> Address {
        addr(0x12)
    }
    fn hub1() -> Address {
        addr(0xa1)
    }
    fn hub2() -> Address {
        addr(0xa2)
    }

    fn bridge(f: &Fixture, deed: u64, owner: Address, manager: Address, hub: Option<&Address>) -> Deed {
        f.registry
            .update_deed(
                &f.updater,
                &DeedAttributes::new(deed, DeedCard::Common, owner, manager),
                hub,
                NOW,
            )
            .unwrap()
    }

    #[test]
    fn test_update_deed_validation() {
        let f = fixture();
        let attrs = DeedAttributes::new(0, DeedCard::Common, owner1(), tenant1());
        assert_eq!(
            f.registry.update_deed(&f.updater, &attrs, None, NOW).unwrap_err().code(),
            codes::INVALID_DEED
        );
        let attrs = DeedAttributes::new(DEED1, DeedCard::Common, Address::zero(), tenant1());
        assert!(f.registry.update_deed(&f.updater, &attrs, None, NOW).is_err());
        let attrs = DeedAttributes::new(DEED1, DeedCard::Common, owner1(), Address::zero());
        assert!(f.registry.update_deed(&f.updater, &attrs, None, NOW).is_err());

        let attrs = DeedAttributes::new(DEED1, DeedCard::Common, owner1(), tenant1());
        assert_eq!(
            f.registry.update_deed(&tenant1(), &attrs, None, NOW).unwrap_err().code(),
            codes::ONLY_MANAGER_CAN_UPDATE_DEED
        );

        let deed = bridge(&f, DEED1, owner1(), tenant1(), None);
        assert!(deed.hub.is_zero());
        assert!(!f.registry.is_deed_connected(DEED1).unwrap());
    }

    #[test]
    fn test_auto_connect_and_tenant_change() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), Some(&hub1()));
        assert_eq!(f.registry.get_connected_deed(&hub1()).unwrap(), Some(DEED1));
        assert_eq!(f.registry.get_connected_hub(DEED1).unwrap(), Some(hub1()));
        assert_eq!(f.registry.get_hub_join_date(&hub1()).unwrap(), Some(NOW));
        let hub = f.registry.get_hub(&hub1()).unwrap().unwrap();
        assert_eq!(hub.hub_owner, tenant1());

        // New tenant does not own the hub: the link stays, the connection goes.
        bridge(&f, DEED1, owner1(), tenant2(), Some(&hub1()));
        assert!(!f.registry.is_hub_connected(&hub1()).unwrap());
        assert_eq!(f.registry.get_connected_deed(&hub1()).unwrap(), None);
        assert_eq!(f.registry.get_connected_hub(DEED1).unwrap(), None);
        let deed = f.registry.get_deed(DEED1).unwrap().unwrap();
        assert_eq!(deed.hub, hub1());
        let hub = f.registry.get_hub(&hub1()).unwrap().unwrap();
        assert_eq!(hub.deed_id, Some(DEED1));
        assert_eq!(hub.hub_owner, tenant1());
        assert!(!hub.enabled);

        // Handing the hub to the new tenant reconnects it.
        f.registry
            .transfer_hub_ownership(&tenant1(), &hub1(), &tenant2(), NOW + 10)
            .unwrap();
        assert_eq!(f.registry.get_connected_hub(DEED1).unwrap(), Some(hub1()));
        assert_eq!(f.registry.get_hub_join_date(&hub1()).unwrap(), Some(NOW));

        // Auto-connecting another hub detaches the first one.
        f.registry
            .update_deed(
                &f.updater,
                &DeedAttributes::new(DEED1, DeedCard::Common, owner1(), tenant2()),
                Some(&hub2()),
                NOW + 20,
            )
            .unwrap();
        assert_eq!(f.registry.get_connected_hub(DEED1).unwrap(), Some(hub2()));
        assert!(!f.registry.is_hub_connected(&hub1()).unwrap());
        assert_eq!(f.registry.get_hub_join_date(&hub2()).unwrap(), Some(NOW + 20));

        // A deed owner change leaves the connection alone.
        bridge(&f, DEED1, owner2(), tenant2(), None);
        assert_eq!(f.registry.get_connected_hub(DEED1).unwrap(), Some(hub2()));
        let hub = f.registry.get_hub(&hub2()).unwrap().unwrap();
        assert_eq!(hub.deed_owner, owner2());
    }

    #[test]
    fn test_connect_rules() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), None);

        assert_eq!(
            f.registry.connect(&owner1(), &hub1(), DEED1, NOW).unwrap_err().code(),
            codes::NOT_DEED_MANAGER
        );
        assert_eq!(
            f.registry.connect(&tenant1(), &hub1(), 99, NOW).unwrap_err().code(),
            codes::DEED_NOT_FOUND
        );

        let hub = f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap();
        assert!(hub.enabled);
        assert_eq!(hub.hub_owner, tenant1());
        assert_eq!(hub.earner, tenant1());
        assert_eq!(hub.card_type, Some(DeedCard::Common));

        assert_eq!(
            f.registry.connect(&tenant1(), &hub2(), DEED1, NOW).unwrap_err().code(),
            codes::DEED_ALREADY_USED
        );

        // A hub owned by someone else cannot be taken over.
        bridge(&f, DEED2, owner2(), tenant2(), None);
        assert_eq!(
            f.registry.connect(&tenant2(), &hub1(), DEED2, NOW).unwrap_err().code(),
            codes::ONLY_HUB_OWNER
        );
    }

    #[test]
    fn test_connect_refused_while_leased_to_other() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), None);
        let mut lease = Lease {
            id: 1,
            deed_id: DEED1,
            owner: owner1(),
            tenant: tenant2(),
            start_date: NOW - 10,
            end_date: NOW + 1_000,
            paid_months: 1,
            owner_minting_percentage: 50,
            confirmed: true,
            transaction_hash: None,
            transaction_status: TransactionStatus::Validated,
            version: 0,
        };
        f.store.save_lease(&mut lease).unwrap();
        assert_eq!(
            f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap_err().code(),
            codes::NO_LEASE_FOUND
        );
        // Expired lease no longer blocks.
        assert!(f.registry.connect(&tenant1(), &hub1(), DEED1, NOW + 1_000).is_ok());
    }

    #[test]
    fn test_moving_hub_to_another_deed() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), None);
        bridge(&f, DEED2, owner2(), tenant1(), None);
        f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap();
        f.registry.connect(&tenant1(), &hub1(), DEED2, NOW + 5).unwrap();

        assert_eq!(f.registry.get_connected_deed(&hub1()).unwrap(), Some(DEED2));
        assert!(!f.registry.is_deed_connected(DEED1).unwrap());
        assert!(f.registry.get_deed(DEED1).unwrap().unwrap().hub.is_zero());
        assert_eq!(f.registry.get_hub_join_date(&hub1()).unwrap(), Some(NOW));
    }

    #[test]
    fn test_disconnect() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), None);
        assert_eq!(
            f.registry.disconnect(&tenant1(), &hub1(), NOW).unwrap_err().code(),
            codes::HUB_DOES_NOT_EXIST
        );
        f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap();

        assert_eq!(
            f.registry.disconnect(&owner1(), &hub1(), NOW).unwrap_err().code(),
            codes::ONLY_HUB_OWNER
        );
        let hub = f.registry.disconnect(&tenant1(), &hub1(), NOW + 1).unwrap();
        assert!(!hub.enabled);
        assert_eq!(hub.deed_id, None);
        assert_eq!(hub.hub_owner, tenant1());
        assert_eq!(hub.join_date, Some(NOW));
        assert!(!f.registry.is_deed_connected(DEED1).unwrap());

        assert_eq!(
            f.registry.disconnect(&tenant1(), &hub1(), NOW + 2).unwrap_err().code(),
            codes::ALREADY_DISCONNECTED
        );

        // Reconnecting keeps the original join date.
        f.registry.connect(&tenant1(), &hub1(), DEED1, NOW + 3).unwrap();
        assert_eq!(f.registry.get_hub_join_date(&hub1()).unwrap(), Some(NOW));
    }

    #[test]
    fn test_transfer_ownership_rules() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), None);
        f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap();

        assert_eq!(
            f.registry
                .transfer_hub_ownership(&tenant2(), &hub1(), &tenant2(), NOW)
                .unwrap_err()
                .code(),
            codes::ONLY_HUB_OWNER
        );
        assert_eq!(
            f.registry
                .transfer_hub_ownership(&tenant1(), &hub1(), &Address::zero(), NOW)
                .unwrap_err()
                .code(),
            codes::INVALID_NEW_OWNER
        );
        assert_eq!(
            f.registry
                .transfer_hub_ownership(&tenant1(), &hub1(), &tenant1(), NOW)
                .unwrap_err()
                .code(),
            codes::INVALID_NEW_OWNER
        );

        // Giving the hub away from the manager disconnects it.
        f.registry
            .transfer_hub_ownership(&tenant1(), &hub1(), &tenant2(), NOW)
            .unwrap();
        assert!(!f.registry.is_hub_connected(&hub1()).unwrap());
        assert_eq!(
            f.registry
                .transfer_hub_ownership(&tenant1(), &hub1(), &owner1(), NOW)
                .unwrap_err()
                .code(),
            codes::ONLY_HUB_OWNER
        );
    }

    #[test]
    fn test_connection_events() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        bridge(&f, DEED1, owner1(), tenant1(), None);
        f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap();
        f.registry.disconnect(&tenant1(), &hub1(), NOW).unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name);
        }
        assert!(names.iter().any(|n| n == topics::HUB_CONNECTED));
        assert!(names.iter().any(|n| n == topics::HUB_DISCONNECTED));
        assert!(names.iter().filter(|n| *n == topics::HUB_SAVED).count() >= 2);
    }

    #[test]
    fn test_chain_events_are_idempotent() {
        let f = fixture();
        let events = vec![
            FederationEvent::DeedUpdated {
                deed_id: DEED1,
                city: 1,
                card_type: 2,
                owner: owner1(),
                manager: tenant1(),
                owner_percentage: 40,
                hub: Address::zero(),
            },
            FederationEvent::HubConnected {
                hub: hub1(),
                deed_id: DEED1,
                owner: tenant1(),
                join_date: NOW - 100,
            },
        ];
        for event in &events {
            f.registry.apply_chain_state(event, NOW).unwrap();
        }
        let hub_once = f.registry.get_hub(&hub1()).unwrap().unwrap();
        let deed_once = f.registry.get_deed(DEED1).unwrap().unwrap();

        for event in &events {
            f.registry.apply_chain_state(event, NOW).unwrap();
        }
        let hub_twice = f.registry.get_hub(&hub1()).unwrap().unwrap();
        let deed_twice = f.registry.get_deed(DEED1).unwrap().unwrap();

        assert_eq!(Hub { version: 0, ..hub_once.clone() }, Hub { version: 0, ..hub_twice });
        assert_eq!(Deed { version: 0, ..deed_once }, Deed { version: 0, ..deed_twice });
        assert!(hub_once.enabled);
        assert_eq!(hub_once.join_date, Some(NOW - 100));
        assert_eq!(hub_once.card_type, Some(DeedCard::Rare));

        let disconnected = FederationEvent::HubDisconnected {
            hub: hub1(),
            deed_id: DEED1,
        };
        f.registry.apply_chain_state(&disconnected, NOW).unwrap();
        f.registry.apply_chain_state(&disconnected, NOW).unwrap();
        assert!(!f.registry.is_hub_connected(&hub1()).unwrap());
        assert_eq!(f.registry.get_hub_join_date(&hub1()).unwrap(), Some(NOW - 100));
    }

    #[test]
    fn test_connected_event_for_unknown_deed_is_anomaly() {
        let f = fixture();
        let err = f
            .registry
            .apply_chain_state(
                &FederationEvent::HubConnected {
                    hub: hub1(),
                    deed_id: 42,
                    owner: tenant1(),
                    join_date: NOW,
                },
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind(), wom_core::ErrorKind::Anomaly);
    }

    #[test]
    fn test_store_failure_leaves_binding_untouched() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), None);
        f.store.set_offline(true);
        let err = f.registry.connect(&tenant1(), &hub1(), DEED1, NOW).unwrap_err();
        assert!(err.should_retry());
        f.store.set_offline(false);
        assert!(!f.registry.is_hub_connected(&hub1()).unwrap());
    }

    #[test]
    fn test_refresh_hub() {
        let f = fixture();
        assert!(f.registry.refresh_hub(&hub1(), NOW).unwrap().is_none());
        bridge(&f, DEED1, owner1(), tenant1(), Some(&hub1()));
        let hub = f.registry.refresh_hub(&hub1(), NOW + 50).unwrap().unwrap();
        assert!(hub.enabled);
        assert_eq!(hub.updated_date, NOW + 50);
    }

    #[test]
    fn test_binding_ends_with_lease() {
        let f = fixture();
        bridge(&f, DEED1, owner1(), tenant1(), Some(&hub1()));
        let hub = f.registry.get_hub(&hub1()).unwrap().unwrap();
        assert_eq!(hub.until_date, None);
        assert!(hub.is_binding_valid(NOW + 1_000_000));

        let mut lease = Lease {
            id: 1,
            deed_id: DEED1,
            owner: owner1(),
            tenant: tenant1(),
            start_date: NOW - 10,
            end_date: NOW + 1_000,
            paid_months: 1,
            owner_minting_percentage: 50,
            confirmed: true,
            transaction_hash: None,
            transaction_status: TransactionStatus::Validated,
            version: 0,
        };
        f.store.save_lease(&mut lease).unwrap();

        let hub = f.registry.refresh_hub(&hub1(), NOW).unwrap().unwrap();
        assert!(hub.enabled);
        assert_eq!(hub.until_date, Some(NOW + 1_000));
        assert!(hub.is_binding_valid(NOW + 999));
        assert!(!hub.is_binding_valid(NOW + 1_000));

        let stored = f.registry.get_hub(&hub1()).unwrap().unwrap();
        assert!(!stored.is_binding_valid(NOW + 1_000));

        // A refresh after the lease drops the window again.
        let hub = f.registry.refresh_hub(&hub1(), NOW + 1_000).unwrap().unwrap();
        assert_eq!(hub.until_date, None);
    }
}
