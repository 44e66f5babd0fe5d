//! WoM Identity
//!
//! Short-lived credentials used around hub federation: sign-in tokens that a
//! hub manager embeds in signed messages, and rate-limited verification codes
//! delivered by email.

mod authcode;
mod tokens;

pub use authcode::{AuthorizationCodeService, EmailSendCommand, CODE_CONFIRMATION_TEMPLATE};
pub use tokens::TokenRegistry;

use serde::{Deserialize, Serialize};

/// Identity component configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Maximum live sign-in tokens.
    pub max_tokens: usize,
    pub token_lifetime_secs: u64,
    pub code_validity_minutes: u64,
    /// Sends allowed for one code.
    pub max_code_sending: u32,
    /// Verification attempts allowed for one code.
    pub max_code_verification: u32,
    /// Codes a single client may request.
    pub generation_code_limit: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            token_lifetime_secs: 600,
            code_validity_minutes: 120,
            max_code_sending: 3,
            max_code_verification: 20,
            generation_code_limit: 10,
        }
    }
}
