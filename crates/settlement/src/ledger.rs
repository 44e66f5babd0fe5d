//! Per-recipient claim ledger.
//!
//! Deed owners and tenants accumulate the share of every closed period their
//! reports took part in. Balances are computed lazily: a cursor remembers the
//! first report not yet folded into `accumulated`, and walking stops at the
//! first report whose period is still open.

use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wom_core::amount::decimal;
use wom_core::{codes, Address, ClaimReceipt, WomError};

use crate::index::share_of;
use crate::period::{AcceptedReport, RewardPeriodAccumulator};

/// Moves reward tokens to a receiver.
pub trait TokenMover: Send + Sync {
    /// Returns the hash of the transfer transaction.
    fn transfer(&self, receiver: &Address, amount: &BigUint) -> Result<String, WomError>;
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claimed {
    pub receiver: Address,
    pub recipient: Address,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    pub transaction_hash: String,
}

impl Claimed {
    pub fn receipt(&self) -> ClaimReceipt {
        ClaimReceipt {
            transaction_hash: self.transaction_hash.clone(),
            recipient: self.recipient.clone(),
            receiver: self.receiver.clone(),
            amount: self.amount.clone(),
            block_number: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientBalance {
    pub claimed: BigUint,
    pub accumulated: BigUint,
    /// Position in the recipient's report list of the first report not yet
    /// accumulated.
    pub cursor: usize,
}

impl RecipientBalance {
    /// Zero once claims observed on chain reach what was accumulated here.
    pub fn pending(&self) -> BigUint {
        if self.claimed >= self.accumulated {
            BigUint::zero()
        } else {
            &self.accumulated - &self.claimed
        }
    }
}

#[derive(Default)]
pub struct ClaimLedger {
    balances: HashMap<Address, RecipientBalance>,
    reports_by_recipient: HashMap<Address, Vec<u64>>,
}

impl ClaimLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an accepted report to its owner and tenant. A recipient holding
    /// both roles is listed once.
    pub fn register(&mut self, report: &AcceptedReport) {
        let mut recipients = Vec::with_capacity(2);
        if report.owner == report.tenant {
            recipients.push(&report.owner);
        } else {
            if report.owner_percentage > 0 {
                recipients.push(&report.owner);
            }
            if report.owner_percentage < 100 {
                recipients.push(&report.tenant);
            }
        }
        recipients.retain(|r| !r.is_zero());
        for recipient in recipients {
            let reports = self.reports_by_recipient.entry(recipient.clone()).or_default();
            if reports.last() != Some(&report.report_id) {
                reports.push(report.report_id);
            }
        }
    }

    /// Remove a report registered last for its recipients.
    pub fn unregister(&mut self, report: &AcceptedReport) {
        for recipient in [&report.owner, &report.tenant] {
            if let Some(reports) = self.reports_by_recipient.get_mut(recipient) {
                if reports.last() == Some(&report.report_id) {
                    reports.pop();
                }
            }
        }
    }

    pub fn balance(&self, recipient: &Address) -> Option<&RecipientBalance> {
        self.balances.get(recipient)
    }

    pub fn claimed(&self, recipient: &Address) -> BigUint {
        self.balances
            .get(recipient)
            .map(|b| b.claimed.clone())
            .unwrap_or_default()
    }

    /// Accumulated minus claimed, including closed periods not folded yet.
    pub fn pending_reward_balance_of(&self, recipient: &Address, periods: &RewardPeriodAccumulator) -> BigUint {
        self.advance(recipient, periods).pending()
    }

    /// Count a claim paid outside this ledger, such as one sent straight to
    /// the reward contract. Callers dedupe by transaction hash.
    pub fn record_claim(&mut self, recipient: &Address, amount: &BigUint, periods: &RewardPeriodAccumulator) {
        let mut state = self.advance(recipient, periods);
        let pending = state.pending();
        if amount > &pending {
            warn!(
                recipient = %recipient,
                amount = %amount,
                pending = %pending,
                "recorded claim exceeds the locally accumulated rewards"
            );
        }
        state.claimed += amount;
        self.balances.insert(recipient.clone(), state);
        debug!(recipient = %recipient, amount = %amount, "external claim recorded");
    }

    /// Claim `amount` (zero for everything pending) for `recipient` and send
    /// it to `receiver`, which defaults to the recipient. Returns `None` when
    /// nothing is pending. A failed transfer leaves the ledger unchanged.
    pub fn claim(
        &mut self,
        recipient: &Address,
        amount: &BigUint,
        receiver: Option<&Address>,
        periods: &RewardPeriodAccumulator,
        mover: &dyn TokenMover,
    ) -> Result<Option<Claimed>, WomError> {
        let mut state = self.advance(recipient, periods);
        let pending = state.pending();
        if pending.is_zero() {
            debug!(recipient = %recipient, "nothing to claim");
            return Ok(None);
        }
        if amount > &pending {
            return Err(WomError::request(codes::INVALID_CLAIM_AMOUNT));
        }
        let amount = if amount.is_zero() { pending } else { amount.clone() };
        let receiver = receiver
            .filter(|r| !r.is_zero())
            .unwrap_or(recipient)
            .clone();

        let transaction_hash = match mover.transfer(&receiver, &amount) {
            Ok(hash) => hash.to_ascii_lowercase(),
            Err(e) => {
                warn!(recipient = %recipient, receiver = %receiver, error = %e, "reward transfer failed");
                return Err(e);
            }
        };
        state.claimed += &amount;
        self.balances.insert(recipient.clone(), state);

        info!(
            recipient = %recipient,
            receiver = %receiver,
            amount = %amount,
            transaction = %transaction_hash,
            "reward claimed"
        );
        Ok(Some(Claimed {
            receiver,
            recipient: recipient.clone(),
            amount,
            transaction_hash,
        }))
    }

    /// Fold every report of a closed period into a copy of the balance.
    fn advance(&self, recipient: &Address, periods: &RewardPeriodAccumulator) -> RecipientBalance {
        let mut state = self.balances.get(recipient).cloned().unwrap_or_default();
        let Some(report_ids) = self.reports_by_recipient.get(recipient) else {
            return state;
        };
        while let Some(report_id) = report_ids.get(state.cursor) {
            let Some(report) = periods.report(*report_id) else {
                break;
            };
            let Some(period) = periods.period(report.period_id).filter(|p| p.closed) else {
                break;
            };
            let mut index = BigUint::zero();
            if &report.owner == recipient {
                index += &report.owner_fixed_index;
            }
            if &report.tenant == recipient {
                index += &report.tenant_fixed_index;
            }
            state.accumulated += share_of(&period.amount, &index, &period.fixed_global_index);
            state.cursor += 1;
        }
        state
    }
}
