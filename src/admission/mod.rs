//! AdmissionPipeline (§4.5): validates an inbound relay request, simulates
//! it against the hub and paymaster, and on success submits it via the
//! TransactionManager. Grounded in the teacher's `server/api_v1` handler
//! shape (deserialize request, ordered validation, `thiserror` error enum),
//! generalized from identity-commitment validation to GSN relay-call
//! validation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ethers::abi::AbiEncode;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::chain::abi::{BalanceOfCall, CalculateChargeCall, GetGasLimitsCall, PaymasterCalls, RelayHubCalls};
use crate::chain::relay_call::{self, ForwardRequest as AbiForwardRequest, RelayData as AbiRelayData, RelayRequest as AbiRelayRequest};
use crate::chain::ChainAccess;
use crate::keystore::{KeyStore, SigningRole};
use crate::reconciliation::ReconciliationLoop;
use crate::tx_manager::{TransactionDetails, TransactionManager, TxManagerError};
use crate::tx_store::{ServerAction, TxStoreError};
use crate::utils::random_delay_ms;

const GAS_RESERVE: u64 = 100_000;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("server is not ready")]
    NotReady,

    #[error("request targets hub {requested:#x}, this server serves {actual:#x}")]
    WrongHub { requested: Address, actual: Address },

    #[error("request targets worker {requested:#x}, this server's worker is {actual:#x}")]
    WrongWorker { requested: Address, actual: Address },

    #[error("gas price {offered} is below the server's current minimum {minimum}")]
    GasPriceTooLow { offered: U256, minimum: U256 },

    #[error("pct relay fee {offered} is below the configured minimum {minimum}")]
    PctFeeTooLow { offered: u64, minimum: u64 },

    #[error("base relay fee {offered} is below the configured minimum {minimum}")]
    BaseFeeTooLow { offered: u64, minimum: u64 },

    #[error("relay's next nonce {next} exceeds the request's nonce horizon {max}")]
    NonceHorizonExceeded { next: u64, max: u64 },

    #[error("paymaster acceptance budget {budget} exceeds the configured maximum {maximum}")]
    AcceptanceBudgetTooHigh { budget: U256, maximum: U256 },

    #[error("paymaster balance on hub ({balance}) is insufficient for max charge ({required})")]
    InsufficientPaymasterFunds { balance: U256, required: U256 },

    #[error("simulated relayCall was not accepted by the paymaster: {reason}")]
    PaymasterRejected { reason: String },

    #[error(transparent)]
    Chain(#[from] crate::chain::ChainError),

    #[error(transparent)]
    TxManager(#[from] TxManagerError),

    #[error(transparent)]
    Store(#[from] TxStoreError),
}

impl AdmissionError {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::WrongHub { .. } => "wrong_hub",
            Self::WrongWorker { .. } => "wrong_worker",
            Self::GasPriceTooLow { .. } => "gas_price_too_low",
            Self::PctFeeTooLow { .. } => "pct_fee_too_low",
            Self::BaseFeeTooLow { .. } => "base_fee_too_low",
            Self::NonceHorizonExceeded { .. } => "nonce_horizon_exceeded",
            Self::AcceptanceBudgetTooHigh { .. } => "acceptance_budget_too_high",
            Self::InsufficientPaymasterFunds { .. } => "insufficient_paymaster_funds",
            Self::PaymasterRejected { .. } => "paymaster_rejected",
            Self::Chain(_) => "chain_error",
            Self::TxManager(_) => "tx_manager_error",
            Self::Store(_) => "store_error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas: U256,
    pub nonce: U256,
    pub data: Bytes,
    pub valid_until_time: U256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayDataRequest {
    pub relay_worker: Address,
    pub paymaster: Address,
    pub forwarder: Address,
    pub paymaster_data: Bytes,
    pub client_id: U256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayTransactionRequest {
    pub request: ForwardRequest,
    pub relay_data: RelayDataRequest,
    pub signature: Bytes,
    pub approval_data: Bytes,
    pub gas_price: U256,
    pub pct_relay_fee: u64,
    pub base_relay_fee: u64,
    pub relay_hub_address: Address,
    pub relay_max_nonce: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayTransactionResponse {
    pub signed_tx: Bytes,
    pub tx_hash: ethers::types::H256,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingResponse {
    pub relay_worker_address: Address,
    pub relay_manager_address: Address,
    pub relay_hub_address: Address,
    pub min_gas_price: U256,
    pub max_acceptance_budget: U256,
    pub chain_id: u64,
    pub network_id: u64,
    pub ready: bool,
    pub version: &'static str,
}

struct PaymasterLimits {
    acceptance_budget: U256,
    pre_relayed_call_gas_limit: U256,
    post_relayed_call_gas_limit: U256,
}

pub struct AdmissionPipeline {
    chain: Arc<dyn ChainAccess>,
    tx_manager: Arc<TransactionManager>,
    keystore: Arc<KeyStore>,
    reconciliation: Arc<ReconciliationLoop>,
    relay_hub_address: Address,
    max_acceptance_budget: U256,
    pct_relay_fee: u64,
    base_relay_fee: u64,
    trusted_paymasters: HashSet<Address>,
    min_alerted_delay: Duration,
    max_alerted_delay: Duration,
}

impl AdmissionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainAccess>,
        tx_manager: Arc<TransactionManager>,
        keystore: Arc<KeyStore>,
        reconciliation: Arc<ReconciliationLoop>,
        relay_hub_address: Address,
        max_acceptance_budget: U256,
        pct_relay_fee: u64,
        base_relay_fee: u64,
        trusted_paymasters: Vec<Address>,
        min_alerted_delay: Duration,
        max_alerted_delay: Duration,
    ) -> Self {
        Self {
            chain,
            tx_manager,
            keystore,
            reconciliation,
            relay_hub_address,
            max_acceptance_budget,
            pct_relay_fee,
            base_relay_fee,
            trusted_paymasters: trusted_paymasters.into_iter().collect(),
            min_alerted_delay,
            max_alerted_delay,
        }
    }

    #[instrument(skip(self, request))]
    pub async fn create_relay_transaction(
        &self,
        request: RelayTransactionRequest,
    ) -> Result<RelayTransactionResponse, AdmissionError> {
        let result = self.try_create_relay_transaction(request).await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(err) => err.metric_label(),
        };
        crate::metrics::RELAY_REQUESTS
            .with_label_values(&[outcome])
            .inc();
        result
    }

    async fn try_create_relay_transaction(
        &self,
        request: RelayTransactionRequest,
    ) -> Result<RelayTransactionResponse, AdmissionError> {
        // Readiness gate.
        if !self.reconciliation.is_ready() {
            return Err(AdmissionError::NotReady);
        }

        // 2. Hub address.
        if request.relay_hub_address != self.relay_hub_address {
            return Err(AdmissionError::WrongHub {
                requested: request.relay_hub_address,
                actual: self.relay_hub_address,
            });
        }

        // 3. Worker address (case-insensitive: Address equality is already
        // case-insensitive since ethers normalizes to raw bytes).
        let worker = self.keystore.address(SigningRole::Worker);
        if request.relay_data.relay_worker != worker {
            return Err(AdmissionError::WrongWorker {
                requested: request.relay_data.relay_worker,
                actual: worker,
            });
        }

        // 4. Gas price.
        let current_gas_price = self.reconciliation.current_gas_price();
        if request.gas_price < current_gas_price {
            return Err(AdmissionError::GasPriceTooLow {
                offered: request.gas_price,
                minimum: current_gas_price,
            });
        }

        let trusted = self.trusted_paymasters.contains(&request.relay_data.paymaster);

        // 5. Fees.
        if !trusted {
            if request.pct_relay_fee < self.pct_relay_fee {
                return Err(AdmissionError::PctFeeTooLow {
                    offered: request.pct_relay_fee,
                    minimum: self.pct_relay_fee,
                });
            }
            if request.base_relay_fee < self.base_relay_fee {
                return Err(AdmissionError::BaseFeeTooLow {
                    offered: request.base_relay_fee,
                    minimum: self.base_relay_fee,
                });
            }
        }

        // 6. Nonce horizon.
        let manager = self.keystore.address(SigningRole::Manager);
        let _ = manager; // nonce horizon is evaluated against the worker's own nonce below
        let next_nonce = self.tx_manager.poll_nonce(worker).await?;
        if next_nonce > request.relay_max_nonce {
            return Err(AdmissionError::NonceHorizonExceeded {
                next: next_nonce,
                max: request.relay_max_nonce,
            });
        }

        // 7. Paymaster gas limits.
        let limits = self.query_paymaster_limits(request.relay_data.paymaster).await?;
        if !trusted && limits.acceptance_budget > self.max_acceptance_budget {
            return Err(AdmissionError::AcceptanceBudgetTooHigh {
                budget: limits.acceptance_budget,
                maximum: self.max_acceptance_budget,
            });
        }
        let acceptance_budget = if trusted { self.max_acceptance_budget } else { limits.acceptance_budget };

        // 8. Funding.
        let hub_overhead = self.hub_overhead().await?;
        let max_possible_gas = U256::from(GAS_RESERVE)
            + hub_overhead
            + limits.pre_relayed_call_gas_limit
            + request.request.gas
            + limits.post_relayed_call_gas_limit;

        let max_charge = self
            .calculate_charge(max_possible_gas, request.gas_price, request.base_relay_fee, request.pct_relay_fee)
            .await?;

        let paymaster_balance = self.hub_balance_of(request.relay_data.paymaster).await?;
        if paymaster_balance < max_charge {
            return Err(AdmissionError::InsufficientPaymasterFunds {
                balance: paymaster_balance,
                required: max_charge,
            });
        }

        // 9. View call.
        self.simulate_relay_call(&request, acceptance_budget, max_possible_gas)
            .await?;

        // Submit.
        let data = relay_call::encode_relay_call(
            acceptance_budget,
            build_abi_relay_request(&request),
            request.signature.clone(),
            request.approval_data.clone(),
            max_possible_gas,
        );

        let (tx_hash, raw) = self
            .tx_manager
            .send_transaction(TransactionDetails {
                signer: worker,
                role: SigningRole::Worker,
                action: ServerAction::RelayCall,
                to: self.relay_hub_address,
                value: U256::zero(),
                gas_limit: max_possible_gas,
                gas_price: request.gas_price,
                data,
                creation_block_number: self.chain.block_number().await.unwrap_or(0),
            })
            .await?;

        if self.reconciliation.is_alerted() {
            let delay = random_delay_ms(
                self.min_alerted_delay.as_millis() as u64,
                self.max_alerted_delay.as_millis() as u64,
            );
            tokio::time::sleep(delay).await;
        }

        Ok(RelayTransactionResponse {
            signed_tx: raw,
            tx_hash,
        })
    }

    async fn query_paymaster_limits(
        &self,
        paymaster: Address,
    ) -> Result<PaymasterLimits, AdmissionError> {
        let data = PaymasterCalls::GetGasLimits(GetGasLimitsCall {}).encode();
        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(paymaster.into()),
            data: Some(data.into()),
            ..Default::default()
        });
        let raw = self.chain.call(&tx).await?;

        let decoded = ethers::abi::decode(
            &[ethers::abi::ParamType::Tuple(vec![
                ethers::abi::ParamType::Uint(256),
                ethers::abi::ParamType::Uint(256),
                ethers::abi::ParamType::Uint(256),
                ethers::abi::ParamType::Uint(256),
            ])],
            &raw,
        )
        .map_err(|err| crate::chain::ChainError::Revert(err.to_string()))?;

        let tuple = decoded[0].clone().into_tuple().unwrap_or_default();
        let uint_at = |index: usize| {
            tuple
                .get(index)
                .and_then(|token| token.clone().into_uint())
                .unwrap_or_default()
        };

        Ok(PaymasterLimits {
            acceptance_budget: uint_at(0),
            pre_relayed_call_gas_limit: uint_at(1),
            post_relayed_call_gas_limit: uint_at(2),
        })
    }

    async fn hub_overhead(&self) -> Result<U256, crate::chain::ChainError> {
        let data = RelayHubCalls::GetHubOverhead(crate::chain::abi::GetHubOverheadCall {}).encode();
        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(self.relay_hub_address.into()),
            data: Some(data.into()),
            ..Default::default()
        });
        let raw = self.chain.call(&tx).await?;
        let decoded = ethers::abi::decode(&[ethers::abi::ParamType::Uint(256)], &raw)
            .map_err(|err| crate::chain::ChainError::Revert(err.to_string()))?;
        Ok(decoded[0].clone().into_uint().unwrap_or_default())
    }

    async fn hub_balance_of(&self, target: Address) -> Result<U256, crate::chain::ChainError> {
        let data = RelayHubCalls::BalanceOf(BalanceOfCall { target }).encode();
        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(self.relay_hub_address.into()),
            data: Some(data.into()),
            ..Default::default()
        });
        let raw = self.chain.call(&tx).await?;
        let decoded = ethers::abi::decode(&[ethers::abi::ParamType::Uint(256)], &raw)
            .map_err(|err| crate::chain::ChainError::Revert(err.to_string()))?;
        Ok(decoded[0].clone().into_uint().unwrap_or_default())
    }

    async fn calculate_charge(
        &self,
        gas_used: U256,
        gas_price: U256,
        base_relay_fee: u64,
        pct_relay_fee: u64,
    ) -> Result<U256, crate::chain::ChainError> {
        let data = RelayHubCalls::CalculateCharge(CalculateChargeCall {
            gas_used,
            gas_price,
            base_relay_fee: base_relay_fee.into(),
            pct_relay_fee: pct_relay_fee.into(),
        })
        .encode();
        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(self.relay_hub_address.into()),
            data: Some(data.into()),
            ..Default::default()
        });
        let raw = self.chain.call(&tx).await?;
        let decoded = ethers::abi::decode(&[ethers::abi::ParamType::Uint(256)], &raw)
            .map_err(|err| crate::chain::ChainError::Revert(err.to_string()))?;
        Ok(decoded[0].clone().into_uint().unwrap_or_default())
    }

    async fn simulate_relay_call(
        &self,
        request: &RelayTransactionRequest,
        acceptance_budget: U256,
        max_possible_gas: U256,
    ) -> Result<(), AdmissionError> {
        let worker = self.keystore.address(SigningRole::Worker);
        let data = relay_call::encode_relay_call(
            acceptance_budget,
            build_abi_relay_request(request),
            request.signature.clone(),
            request.approval_data.clone(),
            max_possible_gas,
        );

        let tx = TypedTransaction::Legacy(TransactionRequest {
            from: Some(worker),
            to: Some(self.relay_hub_address.into()),
            data: Some(data),
            ..Default::default()
        });

        let raw = self.chain.call(&tx).await.map_err(|err| {
            warn!(?err, "simulated relayCall failed");
            err
        })?;

        let accepted = relay_call::decode_relay_call_output(&raw)
            .map_err(|err| crate::chain::ChainError::Revert(err.to_string()))?;

        if !accepted {
            return Err(AdmissionError::PaymasterRejected {
                reason: "paymasterAccepted=false".to_owned(),
            });
        }

        Ok(())
    }
}

fn build_abi_relay_request(request: &RelayTransactionRequest) -> AbiRelayRequest {
    AbiRelayRequest {
        request: AbiForwardRequest {
            from: request.request.from,
            to: request.request.to,
            value: request.request.value,
            gas: request.request.gas,
            nonce: request.request.nonce,
            data: request.request.data.clone(),
            valid_until_time: request.request.valid_until_time,
        },
        relay_data: AbiRelayData {
            relay_worker: request.relay_data.relay_worker,
            paymaster: request.relay_data.paymaster,
            forwarder: request.relay_data.forwarder,
            paymaster_data: request.relay_data.paymaster_data.clone(),
            client_id: request.relay_data.client_id,
        },
    }
}
