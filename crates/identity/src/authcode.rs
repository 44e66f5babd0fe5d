//! Email verification codes.
//!
//! A code protects an opaque piece of data under a key until the user proves
//! ownership of an email address. Sending, verification and per-client
//! generation are all capped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wom_core::{codes, WomError};
use wom_events::{topics, EventBus};

use crate::IdentityConfig;

pub const CODE_CONFIRMATION_TEMPLATE: &str = "DEED_EMAIL_CODE_CONFIRMATION";
const CODE_PARAM: &str = "code";

/// Payload of the email sending command published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendCommand {
    pub email: String,
    pub template: String,
    pub parameters: HashMap<String, String>,
}

struct AuthorizationCode {
    code: u32,
    expires_at: u64,
    sent: u32,
    verifications: u32,
    data: serde_json::Value,
}

impl AuthorizationCode {
    fn is_date_valid(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct CodeState {
    codes: HashMap<String, AuthorizationCode>,
    generations: HashMap<String, u32>,
}

pub struct AuthorizationCodeService {
    config: IdentityConfig,
    bus: Arc<EventBus>,
    state: Mutex<CodeState>,
}

impl AuthorizationCodeService {
    pub fn new(config: IdentityConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            state: Mutex::new(CodeState::default()),
        }
    }

    /// Issue (or re-send) the code protecting `data` under `key` and publish
    /// the email command for `email`.
    pub fn generate_code(
        &self,
        key: &str,
        client_id: &str,
        email: &str,
        data: serde_json::Value,
        now: u64,
    ) -> Result<(), WomError> {
        let mut state = self.lock()?;

        let needs_new = state
            .codes
            .get(key)
            .map_or(true, |code| !code.is_date_valid(now));
        if needs_new {
            let code = AuthorizationCode {
                code: rand::thread_rng().gen_range(0..1_000_000),
                expires_at: now + self.config.code_validity_minutes * 60,
                sent: 0,
                verifications: 0,
                data: serde_json::Value::Null,
            };
            state.codes.insert(key.to_string(), code);
        }

        let generated = state.generations.get(client_id).copied().unwrap_or(0);
        if generated >= self.config.generation_code_limit {
            info!(client = client_id, "code generation limit reached");
            return Err(WomError::authorization(codes::CODE_GENERATION_LIMIT));
        }

        let max_sending = self.config.max_code_sending;
        let max_verification = self.config.max_code_verification;
        let code = state
            .codes
            .get_mut(key)
            .ok_or_else(|| WomError::authorization(codes::INVALID_CODE))?;
        if code.verifications >= max_verification {
            return Err(WomError::authorization(codes::CODE_VERIFICATION_LIMIT));
        }
        let sent = code.sent;
        code.sent += 1;
        if sent >= max_sending {
            return Err(WomError::authorization(codes::CODE_SENDING_LIMIT));
        }
        code.data = data;
        let value = code.code;
        state.generations.insert(client_id.to_string(), generated + 1);
        drop(state);

        let command = EmailSendCommand {
            email: email.to_string(),
            template: CODE_CONFIRMATION_TEMPLATE.to_string(),
            parameters: HashMap::from([(CODE_PARAM.to_string(), format!("{value:06}"))]),
        };
        self.bus.emit(topics::EMAIL_SEND_COMMAND, &command);
        debug!(key, "verification code sent");
        Ok(())
    }

    /// Check `code` without consuming it.
    pub fn check_validity(&self, key: &str, code: u32, now: u64) -> Result<(), WomError> {
        let mut state = self.lock()?;
        if self.is_valid_code(&mut state, key, code, false, now)? {
            Ok(())
        } else {
            Err(WomError::authorization(codes::INVALID_CODE))
        }
    }

    /// Consume a valid code and return the data it protected. The verification
    /// cap may be exceeded by exactly one attempt here.
    pub fn validate_and_get_data(&self, key: &str, code: u32, now: u64) -> Result<serde_json::Value, WomError> {
        let mut state = self.lock()?;
        if self.is_valid_code(&mut state, key, code, true, now)? {
            if let Some(entry) = state.codes.remove(key) {
                return Ok(entry.data);
            }
        }
        Err(WomError::authorization(codes::INVALID_CODE))
    }

    fn is_valid_code(
        &self,
        state: &mut CodeState,
        key: &str,
        code: u32,
        allow_top_border: bool,
        now: u64,
    ) -> Result<bool, WomError> {
        if key.trim().is_empty() {
            return Ok(false);
        }
        let Some(entry) = state.codes.get_mut(key) else {
            return Ok(false);
        };
        let max = self.config.max_code_verification;
        let attempts = entry.verifications;
        entry.verifications += 1;
        if attempts >= max && (!allow_top_border || entry.verifications > max + 1) {
            return Err(WomError::authorization(codes::CODE_VERIFICATION_LIMIT));
        }
        Ok(entry.is_date_valid(now) && entry.code == code)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CodeState>, WomError> {
        self.state
            .lock()
            .map_err(|_| WomError::Transient("authorization code lock poisoned".into()))
    }
}
