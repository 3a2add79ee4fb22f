//! The ChainAccess port (§6): everything the rest of the relay needs to know
//! about the chain it submits to, behind a trait so the reconciliation engine
//! and admission pipeline can be exercised against a fake in tests.

pub mod abi;
pub mod provider;
pub mod relay_call;
pub mod scanner;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(#[source] anyhow::Error),

    #[error("call would revert: {0}")]
    Revert(String),

    #[error("transaction dropped from the mempool: {0:#x}")]
    Dropped(H256),
}

/// Which balance to read: the latest mined state, or state including the
/// sender's own pending transactions (needed to compute the next nonce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

#[async_trait]
pub trait ChainAccess: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError>;

    async fn gas_price(&self) -> Result<U256, ChainError>;

    fn chain_id(&self) -> u64;

    fn network_id(&self) -> u64;

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, ChainError>;

    /// Logs emitted by the relay hub / stake manager contracts, restricted to
    /// those mentioning `manager` in an indexed topic.
    async fn get_past_hub_events(
        &self,
        manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, ChainError>;

    /// Executes `tx` against the latest state without broadcasting it.
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ChainError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError>;

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, ChainError>;
}
