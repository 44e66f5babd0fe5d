//! Read access to the blockchain.
//!
//! [`ChainReader`] is the seam to an RPC client. [`InMemoryChain`] is a
//! local chain where events are mined on demand.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use wom_core::WomError;

use crate::events::ChainEvent;

/// Outcome of a transaction as seen by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOutcome {
    /// Not mined yet, or unknown to the node.
    Pending,
    /// Mined and succeeded.
    Confirmed,
    /// Mined and reverted.
    Reverted,
}

impl TransactionOutcome {
    pub fn is_mined(&self) -> bool {
        *self != Self::Pending
    }
}

/// A decoded contract event with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedEvent {
    pub block_number: u64,
    pub transaction_hash: String,
    pub event: ChainEvent,
}

#[async_trait::async_trait]
pub trait ChainReader: Send + Sync {
    /// Latest mined block.
    async fn block_number(&self) -> Result<u64, WomError>;

    /// Events mined in `from_block..=to_block`, in chain order.
    async fn events_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<MinedEvent>, WomError>;

    async fn transaction_outcome(&self, transaction_hash: &str) -> Result<TransactionOutcome, WomError>;

    /// Events emitted by a mined transaction.
    async fn transaction_events(&self, transaction_hash: &str) -> Result<Vec<ChainEvent>, WomError>;
}

#[derive(Default)]
struct ChainState {
    block_number: u64,
    events: Vec<MinedEvent>,
    outcomes: HashMap<String, TransactionOutcome>,
}

/// In-process chain. Each call to [`InMemoryChain::mine`] produces a new block.
#[derive(Default)]
pub struct InMemoryChain {
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mine `events` in one confirmed transaction. Returns the block number.
    pub fn mine(&self, transaction_hash: &str, events: Vec<ChainEvent>) -> u64 {
        let mut state = self.state();
        state.block_number += 1;
        let block_number = state.block_number;
        let transaction_hash = transaction_hash.to_ascii_lowercase();
        state
            .outcomes
            .insert(transaction_hash.clone(), TransactionOutcome::Confirmed);
        for event in events {
            state.events.push(MinedEvent {
                block_number,
                transaction_hash: transaction_hash.clone(),
                event,
            });
        }
        block_number
    }

    /// Mine a reverted transaction.
    pub fn revert(&self, transaction_hash: &str) -> u64 {
        let mut state = self.state();
        state.block_number += 1;
        state
            .outcomes
            .insert(transaction_hash.to_ascii_lowercase(), TransactionOutcome::Reverted);
        state.block_number
    }

    /// Produce empty blocks.
    pub fn advance(&self, blocks: u64) -> u64 {
        let mut state = self.state();
        state.block_number += blocks;
        state.block_number
    }
}

#[async_trait::async_trait]
impl ChainReader for InMemoryChain {
    async fn block_number(&self) -> Result<u64, WomError> {
        Ok(self.state().block_number)
    }

    async fn events_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<MinedEvent>, WomError> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect())
    }

    async fn transaction_outcome(&self, transaction_hash: &str) -> Result<TransactionOutcome, WomError> {
        Ok(self
            .state()
            .outcomes
            .get(&transaction_hash.to_ascii_lowercase())
            .copied()
            .unwrap_or(TransactionOutcome::Pending))
    }

    async fn transaction_events(&self, transaction_hash: &str) -> Result<Vec<ChainEvent>, WomError> {
        let transaction_hash = transaction_hash.to_ascii_lowercase();
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| e.transaction_hash == transaction_hash)
            .map(|e| e.event.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RewardEvent;
    use num_bigint::BigUint;
    use wom_core::Address;

    fn claim() -> ChainEvent {
        ChainEvent::Reward(RewardEvent::Claimed {
            recipient: Address::from_bytes([1; 20]),
            receiver: Address::from_bytes([1; 20]),
            amount: BigUint::from(10u32),
        })
    }

    #[tokio::test]
    async fn test_mine_and_query() {
        let chain = InMemoryChain::new();
        assert_eq!(chain.block_number().await.unwrap(), 0);
        assert_eq!(chain.mine("0xAB", vec![claim()]), 1);
        chain.advance(3);
        assert_eq!(chain.revert("0xcd"), 5);

        assert_eq!(chain.events_in_range(1, 1).await.unwrap().len(), 1);
        assert!(chain.events_in_range(2, 5).await.unwrap().is_empty());
        assert_eq!(chain.transaction_outcome("0xab").await.unwrap(), TransactionOutcome::Confirmed);
        assert_eq!(chain.transaction_outcome("0xcd").await.unwrap(), TransactionOutcome::Reverted);
        assert_eq!(chain.transaction_outcome("0xef").await.unwrap(), TransactionOutcome::Pending);
        assert!(!TransactionOutcome::Pending.is_mined());
        assert_eq!(chain.transaction_events("0xab").await.unwrap(), vec![claim()]);
    }
}
