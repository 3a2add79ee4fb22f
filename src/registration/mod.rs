//! RegistrationManager (§4.3): drives the relay through the stake/authorize/
//! register state machine against the on-chain stake manager and hub
//! registry, reacting to past events fetched by the reconciliation loop.

use std::sync::Arc;

use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, TransactionRequest, U256};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::chain::abi::{
    GetStakeInfoCall, HubAuthorizedFilter, HubUnauthorizedFilter, OwnerSetFilter,
    RelayHubRegistryCalls, RelayServerRegisteredFilter, RelayWorkersAddedFilter, StakeAddedFilter,
    StakeManagerCalls, StakeUnlockedFilter, StakeWithdrawnFilter,
};
use crate::chain::{BlockTag, ChainAccess};
use crate::keystore::{KeyStore, SigningRole};
use crate::tx_manager::{TransactionDetails, TransactionManager, TxManagerError};
use crate::tx_store::{ServerAction, TxStore, TxStoreError};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Chain(#[from] crate::chain::ChainError),

    #[error(transparent)]
    Store(#[from] TxStoreError),

    #[error(transparent)]
    TxManager(#[from] TxManagerError),

    #[error("stake manager reports owner {actual:#x}, expected {expected:#x}")]
    UnexpectedOwner { actual: Address, expected: Address },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStage {
    Unstaked,
    StakedUnauthorized,
    StakedAuthorized,
    WorkersAdded,
    Registered,
}

/// Derived from on-chain queries, refreshed each tick (§3).
#[derive(Debug, Clone)]
pub struct RegistrationState {
    pub stage: RegistrationStage,
    pub owner: Address,
    pub stake: U256,
    pub unstake_delay: U256,
    pub withdraw_block: U256,
    pub is_hub_authorized: bool,
    pub is_worker_added: bool,
    pub withdrawal_pending: bool,
}

impl RegistrationState {
    fn fresh(owner: Address) -> Self {
        Self {
            stage: RegistrationStage::Unstaked,
            owner,
            stake: U256::zero(),
            unstake_delay: U256::zero(),
            withdraw_block: U256::zero(),
            is_hub_authorized: false,
            is_worker_added: false,
            withdrawal_pending: false,
        }
    }
}

pub struct RegistrationManager {
    chain: Arc<dyn ChainAccess>,
    tx_manager: Arc<TransactionManager>,
    keystore: Arc<KeyStore>,
    stake_manager_address: Address,
    relay_hub_address: Address,
    owner_address: Address,
    unstake_delay: U256,
    base_relay_fee: u64,
    pct_relay_fee: u64,
    url: String,
    state: tokio::sync::RwLock<RegistrationState>,
}

impl RegistrationManager {
    pub fn new(
        chain: Arc<dyn ChainAccess>,
        tx_manager: Arc<TransactionManager>,
        keystore: Arc<KeyStore>,
        stake_manager_address: Address,
        relay_hub_address: Address,
        owner_address: Address,
        unstake_delay: U256,
        base_relay_fee: u64,
        pct_relay_fee: u64,
        url: String,
    ) -> Self {
        Self {
            chain,
            tx_manager,
            keystore,
            stake_manager_address,
            relay_hub_address,
            owner_address,
            unstake_delay,
            base_relay_fee,
            pct_relay_fee,
            url,
            state: tokio::sync::RwLock::new(RegistrationState::fresh(owner_address)),
        }
    }

    /// Resolves the manager's current stake/owner from the stake manager
    /// contract so a restarted relay doesn't have to wait for a matching
    /// event to replay before it knows where it left off.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<(), RegistrationError> {
        use ethers::abi::AbiEncode;

        let manager = self.keystore.address(SigningRole::Manager);

        let data = StakeManagerCalls::GetStakeInfo(GetStakeInfoCall { relay_manager: manager })
            .encode();
        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(self.stake_manager_address.into()),
            data: Some(data.into()),
            ..Default::default()
        });
        let raw = self.chain.call(&tx).await?;

        let decoded = ethers::abi::decode(
            &[
                ethers::abi::ParamType::Uint(256),
                ethers::abi::ParamType::Uint(256),
                ethers::abi::ParamType::Uint(256),
                ethers::abi::ParamType::Address,
            ],
            &raw,
        )
        .map_err(|err| crate::chain::ChainError::Revert(err.to_string()))?;

        let stake = decoded[0].clone().into_uint().unwrap_or_default();
        let unstake_delay = decoded[1].clone().into_uint().unwrap_or_default();
        let withdraw_block = decoded[2].clone().into_uint().unwrap_or_default();
        let owner = decoded[3].clone().into_address().unwrap_or_default();

        if owner != Address::zero() && owner != self.owner_address {
            error!(actual = %owner, expected = %self.owner_address, "owner mismatch on init");
            return Err(RegistrationError::UnexpectedOwner {
                actual: owner,
                expected: self.owner_address,
            });
        }

        let mut state = self.state.write().await;
        state.stake = stake;
        state.unstake_delay = unstake_delay;
        state.withdraw_block = withdraw_block;
        if stake.is_zero() {
            state.stage = RegistrationStage::Unstaked;
        } else if state.stage == RegistrationStage::Unstaked {
            state.stage = RegistrationStage::StakedUnauthorized;
        }
        drop(state);

        info!(%manager, %stake, "registration manager initialized");
        Ok(())
    }

    pub async fn is_registered(&self) -> bool {
        let state = self.state.read().await;
        state.stage == RegistrationStage::Registered && !state.withdrawal_pending
    }

    pub async fn stage(&self) -> RegistrationStage {
        self.state.read().await.stage
    }

    /// Updates in-memory `RegistrationState` from on-chain events and emits
    /// exactly the next missing state transition as a signed transaction.
    /// Returns the hashes of any transactions submitted.
    #[instrument(skip(self, events))]
    pub async fn handle_past_events(
        &self,
        events: &[Log],
        should_register_again: bool,
    ) -> Result<Vec<ethers::types::H256>, RegistrationError> {
        self.apply_events(events).await?;

        let manager = self.keystore.address(SigningRole::Manager);
        let worker = self.keystore.address(SigningRole::Worker);
        let block = self.chain.block_number().await?;

        let stage = self.state.read().await.stage;
        let mut submitted = Vec::new();

        match stage {
            RegistrationStage::Unstaked => {
                if !self.tx_manager.is_action_pending(ServerAction::Stake, manager).await? {
                    let data = encode_stake_for_address(manager, self.unstake_delay);
                    let (hash, _) = self
                        .tx_manager
                        .send_transaction(TransactionDetails {
                            signer: manager,
                            role: SigningRole::Manager,
                            action: ServerAction::Stake,
                            to: self.stake_manager_address,
                            value: U256::zero(),
                            gas_limit: U256::from(200_000u64),
                            gas_price: self.chain.gas_price().await?,
                            data,
                            creation_block_number: block,
                        })
                        .await?;
                    submitted.push(hash);
                }
            }
            RegistrationStage::StakedUnauthorized => {
                if !self
                    .tx_manager
                    .is_action_pending(ServerAction::AuthorizeHub, manager)
                    .await?
                {
                    let data = encode_authorize_hub(manager, self.relay_hub_address);
                    let (hash, _) = self
                        .tx_manager
                        .send_transaction(TransactionDetails {
                            signer: manager,
                            role: SigningRole::Manager,
                            action: ServerAction::AuthorizeHub,
                            to: self.stake_manager_address,
                            value: U256::zero(),
                            gas_limit: U256::from(150_000u64),
                            gas_price: self.chain.gas_price().await?,
                            data,
                            creation_block_number: block,
                        })
                        .await?;
                    submitted.push(hash);
                }
            }
            RegistrationStage::StakedAuthorized => {
                if !self.tx_manager.is_action_pending(ServerAction::AddWorker, manager).await? {
                    let data = encode_add_relay_workers(vec![worker]);
                    let (hash, _) = self
                        .tx_manager
                        .send_transaction(TransactionDetails {
                            signer: manager,
                            role: SigningRole::Manager,
                            action: ServerAction::AddWorker,
                            to: self.relay_hub_address,
                            value: U256::zero(),
                            gas_limit: U256::from(150_000u64),
                            gas_price: self.chain.gas_price().await?,
                            data,
                            creation_block_number: block,
                        })
                        .await?;
                    submitted.push(hash);
                }
            }
            RegistrationStage::WorkersAdded => {
                if !self
                    .tx_manager
                    .is_action_pending(ServerAction::RegisterServer, manager)
                    .await?
                {
                    let data = encode_register_relay_server(
                        self.base_relay_fee,
                        self.pct_relay_fee,
                        &self.url,
                    );
                    let (hash, _) = self
                        .tx_manager
                        .send_transaction(TransactionDetails {
                            signer: manager,
                            role: SigningRole::Manager,
                            action: ServerAction::RegisterServer,
                            to: self.relay_hub_address,
                            value: U256::zero(),
                            gas_limit: U256::from(150_000u64),
                            gas_price: self.chain.gas_price().await?,
                            data,
                            creation_block_number: block,
                        })
                        .await?;
                    submitted.push(hash);
                }
            }
            RegistrationStage::Registered if should_register_again => {
                if !self
                    .tx_manager
                    .is_action_pending(ServerAction::RegisterServer, manager)
                    .await?
                {
                    let data = encode_register_relay_server(
                        self.base_relay_fee,
                        self.pct_relay_fee,
                        &self.url,
                    );
                    let (hash, _) = self
                        .tx_manager
                        .send_transaction(TransactionDetails {
                            signer: manager,
                            role: SigningRole::Manager,
                            action: ServerAction::RegisterServer,
                            to: self.relay_hub_address,
                            value: U256::zero(),
                            gas_limit: U256::from(150_000u64),
                            gas_price: self.chain.gas_price().await?,
                            data,
                            creation_block_number: block,
                        })
                        .await?;
                    submitted.push(hash);
                }
            }
            RegistrationStage::Registered => {}
        }

        Ok(submitted)
    }

    async fn apply_events(&self, events: &[Log]) -> Result<(), RegistrationError> {
        let mut state = self.state.write().await;

        for log in events {
            let raw = RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            };

            if let Ok(event) = StakeAddedFilter::decode_log(&raw) {
                state.stake = event.stake;
                state.unstake_delay = event.unstake_delay;
                if state.stage == RegistrationStage::Unstaked {
                    state.stage = RegistrationStage::StakedUnauthorized;
                }
            } else if let Ok(event) = HubAuthorizedFilter::decode_log(&raw) {
                let _ = event;
                state.is_hub_authorized = true;
                if state.stage == RegistrationStage::StakedUnauthorized {
                    state.stage = RegistrationStage::StakedAuthorized;
                }
            } else if let Ok(_event) = HubUnauthorizedFilter::decode_log(&raw) {
                state.is_hub_authorized = false;
                warn!("hub de-authorized, regressing registration stage");
                state.stage = RegistrationStage::StakedUnauthorized;
            } else if let Ok(_event) = RelayWorkersAddedFilter::decode_log(&raw) {
                state.is_worker_added = true;
                if state.stage == RegistrationStage::StakedAuthorized {
                    state.stage = RegistrationStage::WorkersAdded;
                }
            } else if let Ok(_event) = RelayServerRegisteredFilter::decode_log(&raw) {
                if state.stage == RegistrationStage::WorkersAdded {
                    state.stage = RegistrationStage::Registered;
                }
            } else if let Ok(event) = StakeUnlockedFilter::decode_log(&raw) {
                state.withdraw_block = event.withdraw_block;
                state.withdrawal_pending = true;
                error!("stake unlocked, relay entering terminal de-readiness");
            } else if let Ok(_event) = StakeWithdrawnFilter::decode_log(&raw) {
                state.stage = RegistrationStage::Unstaked;
                state.withdrawal_pending = false;
            } else if let Ok(event) = OwnerSetFilter::decode_log(&raw) {
                if event.owner != self.owner_address {
                    error!(actual = %event.owner, expected = %self.owner_address, "owner mismatch");
                    return Err(RegistrationError::UnexpectedOwner {
                        actual: event.owner,
                        expected: self.owner_address,
                    });
                }
                state.owner = event.owner;
            }
        }

        Ok(())
    }
}

fn encode_stake_for_address(manager: Address, unstake_delay: U256) -> Bytes {
    use ethers::abi::AbiEncode;
    StakeManagerCalls::StakeForAddress(crate::chain::abi::StakeForAddressCall {
        relay_manager: manager,
        unstake_delay,
    })
    .encode()
    .into()
}

fn encode_authorize_hub(manager: Address, hub: Address) -> Bytes {
    use ethers::abi::AbiEncode;
    StakeManagerCalls::AuthorizeHubByOwner(crate::chain::abi::AuthorizeHubByOwnerCall {
        relay_manager: manager,
        relay_hub: hub,
    })
    .encode()
    .into()
}

fn encode_add_relay_workers(workers: Vec<Address>) -> Bytes {
    use ethers::abi::AbiEncode;
    RelayHubRegistryCalls::AddRelayWorkers(crate::chain::abi::AddRelayWorkersCall {
        new_relay_workers: workers,
    })
    .encode()
    .into()
}

fn encode_register_relay_server(base_relay_fee: u64, pct_relay_fee: u64, url: &str) -> Bytes {
    use ethers::abi::AbiEncode;
    RelayHubRegistryCalls::RegisterRelayServer(crate::chain::abi::RegisterRelayServerCall {
        base_relay_fee: base_relay_fee.into(),
        pct_relay_fee: pct_relay_fee.into(),
        url: url.to_owned(),
    })
    .encode()
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_unstaked() {
        let state = RegistrationState::fresh(Address::zero());
        assert_eq!(state.stage, RegistrationStage::Unstaked);
        assert!(!state.withdrawal_pending);
    }
}
