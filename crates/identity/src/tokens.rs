use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;
use wom_core::{codes, WomError};

use crate::IdentityConfig;

/// Sign-in tokens issued to hub managers before they sign a connection
/// message. A token is valid for `token_lifetime_secs` after issuance.
pub struct TokenRegistry {
    max_tokens: usize,
    lifetime_secs: u64,
    tokens: Mutex<HashMap<String, u64>>,
}

impl TokenRegistry {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            lifetime_secs: config.token_lifetime_secs,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token. When the registry is full the most recent live token is
    /// handed out again.
    pub fn generate_token(&self, now: u64) -> Result<String, WomError> {
        let mut tokens = self.lock()?;
        self.purge_expired(&mut tokens, now);

        if tokens.len() >= self.max_tokens {
            if let Some((token, _)) = tokens.iter().max_by_key(|(_, issued)| **issued) {
                debug!(live = tokens.len(), "token registry full, reusing newest token");
                return Ok(token.clone());
            }
        }

        let mut rng = rand::thread_rng();
        let token = format!("{}-{}-{}", rng.gen::<u64>(), rng.gen::<u64>(), rng.gen::<u64>());
        tokens.insert(token.clone(), now);
        Ok(token)
    }

    /// Check that `token` was issued and is still alive.
    pub fn check_token(&self, token: &str, now: u64) -> Result<(), WomError> {
        if token.trim().is_empty() {
            return Err(WomError::authorization(codes::EMPTY_TOKEN));
        }
        let mut tokens = self.lock()?;
        self.purge_expired(&mut tokens, now);
        if !tokens.contains_key(token) {
            return Err(WomError::authorization(codes::INVALID_TOKEN));
        }
        Ok(())
    }

    /// Check the token and that the signed raw message embeds it.
    pub fn check_token_in_message(&self, token: &str, raw_message: &str, now: u64) -> Result<(), WomError> {
        self.check_token(token, now)?;
        if !raw_message.contains(token) {
            return Err(WomError::authorization(codes::INVALID_SIGNED_MESSAGE));
        }
        Ok(())
    }

    pub fn live_tokens(&self, now: u64) -> usize {
        self.lock()
            .map(|mut tokens| {
                self.purge_expired(&mut tokens, now);
                tokens.len()
            })
            .unwrap_or(0)
    }

    fn purge_expired(&self, tokens: &mut HashMap<String, u64>, now: u64) {
        tokens.retain(|_, issued| now.saturating_sub(*issued) <= self.lifetime_secs);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, u64>>, WomError> {
        self.tokens
            .lock()
            .map_err(|_| WomError::Transient("token registry lock poisoned".into()))
    }
}
