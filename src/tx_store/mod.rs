//! The TxStore port (§4.1): a durable associative log of submitted
//! transactions keyed by `(from, nonce)`, grounded in the teacher's
//! `database.rs` / `database/sitter.rs` persistence layer.

pub mod sqlx_store;

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cannot serialize transaction payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The reason a `StoredTransaction` was submitted, used by `isActionPending`
/// to find whether a given kind of action is already in flight for a signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerAction {
    RegisterServer,
    AddWorker,
    AuthorizeHub,
    Stake,
    Unstake,
    RelayCall,
    ValueTransfer,
    DepositWithdrawal,
    SetOwner,
}

/// An immutable record written at broadcast time (§3). A boost replaces the
/// record in place: `(from, nonce)` stays stable while `tx_hash`/`gas_price`
/// advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx_hash: H256,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub value: U256,
    pub data: Bytes,
    pub creation_block_number: u64,
    pub creation_timestamp: i64,
    pub server_action: ServerAction,
    pub mined_block_number: Option<u64>,
}

impl StoredTransaction {
    #[must_use]
    pub fn is_mined(&self) -> bool {
        self.mined_block_number.is_some()
    }
}

#[async_trait::async_trait]
pub trait TxStore: Send + Sync {
    /// Inserts a new record, or replaces the existing one for `(from, nonce)`
    /// — the path a boost takes.
    async fn put(&self, tx: &StoredTransaction) -> Result<(), TxStoreError>;

    /// All records for `from`, ordered by nonce ascending.
    async fn get_all_by_signer(&self, from: Address) -> Result<Vec<StoredTransaction>, TxStoreError>;

    /// The lowest-nonce unmined record for `from`, if any.
    async fn get_oldest_pending(
        &self,
        from: Address,
    ) -> Result<Option<StoredTransaction>, TxStoreError>;

    /// Whether an unmined record with the given action exists, optionally
    /// restricted to one signer.
    async fn is_action_pending(
        &self,
        action: ServerAction,
        signer: Option<Address>,
    ) -> Result<bool, TxStoreError>;

    /// Marks `(from, nonce)` as mined at `mined_block_number`.
    async fn mark_mined(
        &self,
        from: Address,
        nonce: u64,
        mined_block_number: u64,
    ) -> Result<(), TxStoreError>;

    /// Deletes every mined record for `from` with nonce ≤ `nonce`.
    async fn remove_txs_until_nonce(&self, from: Address, nonce: u64) -> Result<(), TxStoreError>;
}
