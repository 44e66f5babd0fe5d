//! WoM Federation
//!
//! Hub to Deed binding. The binding is a mutual link (`hub.deed_id`,
//! `deed.hub`) that counts as a connection only while the deed manager owns
//! the hub, so a tenant change silently disconnects and a later ownership
//! transfer to the new tenant reconnects without a new `connect`.

mod registry;
mod request;

pub use registry::{is_bound, FederationRegistry};
pub use request::{ConnectionRequestValidator, WomConnectionRequest, WomDisconnectionRequest};

use serde::{Deserialize, Serialize};
use wom_core::Address;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Only caller allowed to push deed attributes through `update_deed`.
    pub deed_updater: Address,
}

/// Binding fact mined on chain, applied as an absolute overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum FederationEvent {
    #[serde(rename_all = "camelCase")]
    DeedUpdated {
        deed_id: u64,
        city: u8,
        card_type: u8,
        owner: Address,
        manager: Address,
        owner_percentage: u8,
        /// Hub to auto-connect, zero for none.
        #[serde(default)]
        hub: Address,
    },
    #[serde(rename_all = "camelCase")]
    HubConnected {
        hub: Address,
        deed_id: u64,
        owner: Address,
        join_date: u64,
    },
    #[serde(rename_all = "camelCase")]
    HubDisconnected { hub: Address, deed_id: u64 },
    #[serde(rename_all = "camelCase")]
    HubOwnershipTransferred {
        hub: Address,
        previous_owner: Address,
        new_owner: Address,
    },
}
