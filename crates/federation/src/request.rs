//! Signed hub connection requests.
//!
//! Before connecting on chain, a deed manager signs a message embedding a
//! sign-in token, and the hub co-signs the same message. These checks run
//! before any binding transition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use wom_core::{codes, Address, DocumentStore, WomError};
use wom_crypto::verify_signed_message;
use wom_identity::TokenRegistry;

use crate::registry::is_bound;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WomConnectionRequest {
    /// Hub address.
    pub address: String,
    pub deed_id: u64,
    pub deed_manager_address: String,
    /// Manager signature over `raw_message`.
    pub signed_message: String,
    /// Hub signature over `raw_message`.
    pub hub_signed_message: String,
    pub raw_message: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WomDisconnectionRequest {
    pub address: String,
    pub deed_manager_address: String,
    pub signed_message: String,
    pub raw_message: String,
    pub token: String,
}

pub struct ConnectionRequestValidator {
    tokens: Arc<TokenRegistry>,
    store: Arc<dyn DocumentStore>,
}

impl ConnectionRequestValidator {
    pub fn new(tokens: Arc<TokenRegistry>, store: Arc<dyn DocumentStore>) -> Self {
        Self { tokens, store }
    }

    /// Validate a connection request. Returns `(hub, manager)` addresses; the
    /// manager becomes the hub owner.
    pub fn validate_connection(
        &self,
        request: &WomConnectionRequest,
        now: u64,
    ) -> Result<(Address, Address), WomError> {
        self.tokens.check_token(&request.token, now)?;
        let manager = self.check_signed_message(
            &request.deed_manager_address,
            &request.signed_message,
            &request.raw_message,
            &request.token,
        )?;
        let hub = self.check_signed_message(
            &request.address,
            &request.hub_signed_message,
            &request.raw_message,
            &request.token,
        )?;

        if let Some(deed) = self.store.deed(request.deed_id)? {
            if !deed.hub.is_zero() && deed.hub != hub {
                let used = self
                    .store
                    .hub(&deed.hub)?
                    .map_or(false, |other| is_bound(&other, &deed));
                if used {
                    return Err(WomError::request(codes::DEED_ALREADY_USED));
                }
            }
        }

        if let Some(existing) = self.store.hub(&hub)? {
            if !existing.hub_owner.is_zero() && existing.hub_owner != manager {
                return Err(WomError::authorization(codes::ONLY_HUB_OWNER));
            }
        }

        debug!(hub = %hub, deed = request.deed_id, "connection request validated");
        Ok((hub, manager))
    }

    /// Validate a disconnection request. Returns `(hub, manager)` addresses.
    pub fn validate_disconnection(
        &self,
        request: &WomDisconnectionRequest,
        now: u64,
    ) -> Result<(Address, Address), WomError> {
        self.tokens.check_token(&request.token, now)?;
        let manager = self.check_signed_message(
            &request.deed_manager_address,
            &request.signed_message,
            &request.raw_message,
            &request.token,
        )?;
        let hub = Address::parse(&request.address)?;
        Ok((hub, manager))
    }

    fn check_signed_message(
        &self,
        address: &str,
        signature: &str,
        raw_message: &str,
        token: &str,
    ) -> Result<Address, WomError> {
        if address.trim().is_empty() {
            return Err(WomError::authorization(codes::EMPTY_DEED_MANAGER_ADDRESS));
        }
        if signature.trim().is_empty() || raw_message.trim().is_empty() {
            return Err(WomError::authorization(codes::EMPTY_SIGNED_MESSAGE));
        }
        if !raw_message.contains(token) {
            return Err(WomError::authorization(codes::INVALID_SIGNED_MESSAGE));
        }
        let address = Address::parse(address)?;
        verify_signed_message(&address, signature, raw_message)?;
        Ok(address)
    }
}
