//! `ethers`-backed implementation of [`ChainAccess`], grounded in the
//! teacher's `write_dev` provider stack (signer middleware over a plain HTTP
//! provider, instrumented at the RPC boundary).

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Filter, Log, TransactionReceipt, H256, U256,
};
use tracing::instrument;

use super::{BlockTag, ChainAccess, ChainError};

pub struct EthersChainAccess {
    provider: Provider<Http>,
    chain_id: u64,
    network_id: u64,
    hub_contract_addresses: Vec<Address>,
}

impl EthersChainAccess {
    pub fn new(
        provider: Provider<Http>,
        chain_id: u64,
        network_id: u64,
        hub_contract_addresses: Vec<Address>,
    ) -> Self {
        Self {
            provider,
            chain_id,
            network_id,
            hub_contract_addresses,
        }
    }

    fn block_id(tag: BlockTag) -> Option<BlockId> {
        Some(BlockId::Number(match tag {
            BlockTag::Latest => BlockNumber::Latest,
            BlockTag::Pending => BlockNumber::Pending,
        }))
    }
}

#[async_trait]
impl ChainAccess for EthersChainAccess {
    #[instrument(level = "debug", skip(self))]
    async fn block_number(&self) -> Result<u64, ChainError> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|err| ChainError::Rpc(err.into()))?;
        Ok(block.as_u64())
    }

    #[instrument(level = "debug", skip(self))]
    async fn balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError> {
        self.provider
            .get_balance(address, Self::block_id(tag))
            .await
            .map_err(|err| ChainError::Rpc(err.into()))
    }

    #[instrument(level = "debug", skip(self))]
    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|err| ChainError::Rpc(err.into()))
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn network_id(&self) -> u64 {
        self.network_id
    }

    #[instrument(level = "debug", skip(self))]
    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, ChainError> {
        let count = self
            .provider
            .get_transaction_count(address, Self::block_id(tag))
            .await
            .map_err(|err| ChainError::Rpc(err.into()))?;
        Ok(count.as_u64())
    }

    #[instrument(level = "debug", skip(self, manager))]
    async fn get_past_hub_events(
        &self,
        manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(self.hub_contract_addresses.clone())
            .topic1(manager);

        self.provider
            .get_logs(&filter)
            .await
            .map_err(|err| ChainError::Rpc(err.into()))
    }

    #[instrument(level = "debug", skip(self, tx))]
    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, ChainError> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|err| ChainError::Revert(err.to_string()))
    }

    #[instrument(level = "debug", skip(self, tx))]
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ChainError> {
        self.provider
            .call(tx, None)
            .await
            .map_err(|err| ChainError::Revert(err.to_string()))
    }

    #[instrument(level = "info", skip(self, raw))]
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|err| ChainError::Rpc(err.into()))?;
        Ok(*pending)
    }

    #[instrument(level = "debug", skip(self))]
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|err| ChainError::Rpc(err.into()))
    }
}
