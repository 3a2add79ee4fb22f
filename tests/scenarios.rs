//! End-to-end scenarios against an in-memory chain double and an in-memory
//! `sqlx::Any` transaction store: cold-start registration, boosting a stuck
//! transaction, admission rejecting a mismatched hub, alerted-state entry on
//! a paymaster rejection, worker replenishment being skipped while a prior
//! transfer is pending, and admission rejecting an underfunded paymaster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::{EthCall, EthEvent};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256};

use relay_server::admission::{
    AdmissionError, AdmissionPipeline, ForwardRequest, RelayDataRequest, RelayTransactionRequest,
};
use relay_server::chain::abi::{
    BalanceOfCall, CalculateChargeCall, GetGasLimitsCall, GetHubOverheadCall, HubAuthorizedFilter,
    RelayServerRegisteredFilter, RelayWorkersAddedFilter, StakeAddedFilter,
    TransactionRejectedByPaymasterFilter,
};
use relay_server::chain::{BlockTag, ChainAccess, ChainError};
use relay_server::keystore::{KeyStore, SigningRole};
use relay_server::reconciliation::{ReconciliationConfig, ReconciliationLoop};
use relay_server::registration::{RegistrationManager, RegistrationStage};
use relay_server::tx_manager::TransactionManager;
use relay_server::tx_store::sqlx_store::SqlxTxStore;
use relay_server::tx_store::{ServerAction, TxStore};

const KEY_MANAGER: &str = "0000000000000000000000000000000000000000000000000000000000000001";
const KEY_WORKER: &str = "0000000000000000000000000000000000000000000000000000000000000002";

/// An in-memory `ChainAccess` double. Responds to `eth_call` by dispatching
/// on the 4-byte selector for the handful of view methods the admission and
/// reconciliation paths actually invoke; everything else errors loudly
/// rather than silently returning zeroes.
struct FakeChain {
    chain_id: u64,
    block_number: AtomicU64,
    gas_price: U256,
    balances: StdMutex<HashMap<Address, U256>>,
    hub_balances: StdMutex<HashMap<Address, U256>>,
    hub_overhead: U256,
    calculate_charge: U256,
    paymaster_acceptance_budget: U256,
    relay_call_accepted: bool,
    events: StdMutex<Vec<Log>>,
    next_nonce: StdMutex<HashMap<Address, u64>>,
    next_tx_hash: AtomicU64,
    receipts: StdMutex<HashMap<H256, TransactionReceipt>>,
}

impl FakeChain {
    fn new() -> Self {
        Self {
            chain_id: 1337,
            block_number: AtomicU64::new(1_000),
            gas_price: U256::from(1_000_000_000u64),
            balances: StdMutex::new(HashMap::new()),
            hub_balances: StdMutex::new(HashMap::new()),
            hub_overhead: U256::from(50_000u64),
            calculate_charge: U256::zero(),
            paymaster_acceptance_budget: U256::from(50_000u64),
            relay_call_accepted: true,
            events: StdMutex::new(Vec::new()),
            next_nonce: StdMutex::new(HashMap::new()),
            next_tx_hash: AtomicU64::new(1),
            receipts: StdMutex::new(HashMap::new()),
        }
    }

    fn set_balance(&self, address: Address, value: U256) {
        self.balances.lock().unwrap().insert(address, value);
    }

    fn set_hub_balance(&self, address: Address, value: U256) {
        self.hub_balances.lock().unwrap().insert(address, value);
    }

    fn with_calculate_charge(mut self, value: U256) -> Self {
        self.calculate_charge = value;
        self
    }
}

#[async_trait]
impl ChainAccess for FakeChain {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn balance(&self, address: Address, _tag: BlockTag) -> Result<U256, ChainError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        Ok(self.gas_price)
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn network_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, address: Address, _tag: BlockTag) -> Result<u64, ChainError> {
        Ok(self
            .next_nonce
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn get_past_hub_events(
        &self,
        _manager: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<Log>, ChainError> {
        Ok(self.events.lock().unwrap().drain(..).collect())
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, ChainError> {
        Ok(U256::from(21_000u64))
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ChainError> {
        let data = tx.data().cloned().unwrap_or_default();
        if data.len() < 4 {
            return Ok(Bytes::default());
        }
        let selector = &data[0..4];

        if selector == BalanceOfCall::selector() {
            let target = ethers::abi::decode(&[ethers::abi::ParamType::Address], &data[4..])
                .ok()
                .and_then(|tokens| tokens.first().cloned())
                .and_then(|token| token.into_address())
                .unwrap_or_default();
            let balance = self
                .hub_balances
                .lock()
                .unwrap()
                .get(&target)
                .copied()
                .unwrap_or_default();
            return Ok(ethers::abi::encode(&[ethers::abi::Token::Uint(balance)]).into());
        }

        if selector == GetHubOverheadCall::selector() {
            return Ok(ethers::abi::encode(&[ethers::abi::Token::Uint(self.hub_overhead)]).into());
        }

        if selector == CalculateChargeCall::selector() {
            return Ok(ethers::abi::encode(&[ethers::abi::Token::Uint(self.calculate_charge)]).into());
        }

        if selector == GetGasLimitsCall::selector() {
            return Ok(ethers::abi::encode(&[ethers::abi::Token::Tuple(vec![
                ethers::abi::Token::Uint(self.paymaster_acceptance_budget),
                ethers::abi::Token::Uint(U256::from(100_000u64)),
                ethers::abi::Token::Uint(U256::from(100_000u64)),
                ethers::abi::Token::Uint(U256::from(10_000u64)),
            ])]
            .as_slice())
            .into());
        }

        // Anything else is the hand-encoded `relayCall` simulation.
        Ok(ethers::abi::encode(&[
            ethers::abi::Token::Bool(self.relay_call_accepted),
            ethers::abi::Token::Bytes(Vec::new()),
        ])
        .into())
    }

    async fn send_raw_transaction(&self, _raw: Bytes) -> Result<H256, ChainError> {
        let id = self.next_tx_hash.fetch_add(1, Ordering::SeqCst);
        Ok(H256::from_low_u64_be(id))
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }
}

fn address_topic(address: Address) -> H256 {
    H256::from(address)
}

fn event_log(signature: H256, indexed: Vec<H256>, data_tokens: &[ethers::abi::Token]) -> Log {
    let mut topics = vec![signature];
    topics.extend(indexed);
    Log {
        topics,
        data: ethers::abi::encode(data_tokens).into(),
        ..Default::default()
    }
}

/// Queues the four hub events a fresh manager needs to walk all the way to
/// `RegistrationStage::Registered` in a single `handle_past_events` call.
fn push_registration_events(chain: &FakeChain, manager: Address, relay_hub_address: Address) {
    use ethers::abi::Token;

    let mut events = chain.events.lock().unwrap();
    events.push(event_log(
        StakeAddedFilter::signature(),
        vec![address_topic(manager), address_topic(manager)],
        &[
            Token::Uint(U256::from(10_u64.pow(18))),
            Token::Uint(U256::from(15_000u64)),
        ],
    ));
    events.push(event_log(
        HubAuthorizedFilter::signature(),
        vec![address_topic(manager), address_topic(relay_hub_address)],
        &[],
    ));
    events.push(event_log(
        RelayWorkersAddedFilter::signature(),
        vec![address_topic(manager)],
        &[
            Token::Array(vec![Token::Address(Address::zero())]),
            Token::Uint(U256::from(1u64)),
        ],
    ));
    events.push(event_log(
        RelayServerRegisteredFilter::signature(),
        vec![address_topic(manager)],
        &[
            Token::Uint(U256::zero()),
            Token::Uint(U256::from(10u64)),
            Token::String("http://localhost:8090".to_owned()),
        ],
    ));
}

async fn test_keystore() -> Arc<KeyStore> {
    Arc::new(KeyStore::from_hex_keys(KEY_MANAGER, KEY_WORKER, 1337).unwrap())
}

async fn test_store() -> Arc<dyn TxStore> {
    Arc::new(SqlxTxStore::in_memory().await)
}

fn sample_relay_request(
    keystore: &KeyStore,
    relay_hub_address: Address,
    paymaster: Address,
) -> RelayTransactionRequest {
    RelayTransactionRequest {
        request: ForwardRequest {
            from: Address::repeat_byte(7),
            to: Address::repeat_byte(8),
            value: U256::zero(),
            gas: U256::from(100_000u64),
            nonce: U256::zero(),
            data: Bytes::default(),
            valid_until_time: U256::from(u64::MAX),
        },
        relay_data: RelayDataRequest {
            relay_worker: keystore.address(SigningRole::Worker),
            paymaster,
            forwarder: Address::repeat_byte(6),
            paymaster_data: Bytes::default(),
            client_id: U256::zero(),
        },
        signature: Bytes::default(),
        approval_data: Bytes::default(),
        gas_price: U256::from(1_000_000_000u64),
        pct_relay_fee: 10,
        base_relay_fee: 0,
        relay_hub_address,
        relay_max_nonce: 1_000,
    }
}

#[tokio::test]
async fn cold_start_drives_first_registration_transition() {
    let chain: Arc<dyn ChainAccess> = Arc::new(FakeChain::new());
    let keystore = test_keystore().await;
    let store = test_store().await;

    let tx_manager = Arc::new(TransactionManager::new(
        chain.clone(),
        keystore.clone(),
        store,
        U256::from(100_000_000_000u64),
        1.2,
        10,
        5,
    ));

    let manager_address = keystore.address(SigningRole::Manager);
    let registration = RegistrationManager::new(
        chain.clone(),
        tx_manager.clone(),
        keystore.clone(),
        Address::repeat_byte(1),
        Address::repeat_byte(2),
        Address::repeat_byte(3),
        U256::from(15_000u64),
        0,
        10,
        "http://localhost:8090".to_owned(),
    );

    assert_eq!(registration.stage().await, RegistrationStage::Unstaked);

    let submitted = registration.handle_past_events(&[], false).await.unwrap();
    assert_eq!(submitted.len(), 1);

    let pending = tx_manager
        .is_action_pending(ServerAction::Stake, manager_address)
        .await
        .unwrap();
    assert!(pending);
}

#[tokio::test]
async fn stuck_transaction_gets_boosted_after_timeout() {
    let chain: Arc<dyn ChainAccess> = Arc::new(FakeChain::new());
    let keystore = test_keystore().await;
    let store = test_store().await;

    let tx_manager = TransactionManager::new(
        chain,
        keystore.clone(),
        store,
        U256::from(100_000_000_000u64),
        1.2,
        10,
        5,
    );

    let signer = keystore.address(SigningRole::Manager);
    tx_manager
        .send_transaction(relay_server::tx_manager::TransactionDetails {
            signer,
            role: SigningRole::Manager,
            action: ServerAction::Stake,
            to: Address::repeat_byte(9),
            value: U256::zero(),
            gas_limit: U256::from(100_000u64),
            gas_price: U256::from(1_000_000_000u64),
            data: Bytes::default(),
            creation_block_number: 1_000,
        })
        .await
        .unwrap();

    let not_boosted = tx_manager
        .boost_oldest_pending_transaction_for_signer(signer, SigningRole::Manager, 1_005)
        .await
        .unwrap();
    assert!(not_boosted.is_none());

    let boosted = tx_manager
        .boost_oldest_pending_transaction_for_signer(signer, SigningRole::Manager, 1_020)
        .await
        .unwrap();
    assert!(boosted.is_some());
}

async fn build_admission(
    chain: Arc<dyn ChainAccess>,
    keystore: Arc<KeyStore>,
    relay_hub_address: Address,
    trusted_paymasters: Vec<Address>,
) -> (Arc<AdmissionPipeline>, Arc<ReconciliationLoop>) {
    let store = test_store().await;
    let tx_manager = Arc::new(TransactionManager::new(
        chain.clone(),
        keystore.clone(),
        store,
        U256::from(100_000_000_000u64),
        1.2,
        10,
        5,
    ));
    let registration = Arc::new(RegistrationManager::new(
        chain.clone(),
        tx_manager.clone(),
        keystore.clone(),
        Address::repeat_byte(1),
        relay_hub_address,
        Address::repeat_byte(3),
        U256::from(15_000u64),
        0,
        10,
        "http://localhost:8090".to_owned(),
    ));
    let reconciliation = Arc::new(ReconciliationLoop::new(
        chain.clone(),
        tx_manager.clone(),
        registration,
        keystore.clone(),
        ReconciliationConfig {
            gas_price_factor: 1.0,
            max_gas_price: U256::from(100_000_000_000u64),
            scanning_window_size: 2_000,
            manager_min_balance: 0,
            manager_target_balance: 0,
            min_hub_withdrawal_balance: 0,
            worker_min_balance: 0,
            worker_target_balance: 0,
            refresh_state_timeout_blocks: 5,
            registration_block_rate: 500,
            alerted_block_delay: 20,
            successful_rounds_for_ready: 0,
            ready_timeout: Duration::from_secs(30),
            relay_hub_address,
        },
    ));

    let admission = Arc::new(AdmissionPipeline::new(
        chain,
        tx_manager,
        keystore,
        reconciliation.clone(),
        relay_hub_address,
        U256::from(300_000u64),
        0,
        0,
        trusted_paymasters,
        Duration::from_millis(0),
        Duration::from_millis(0),
    ));

    (admission, reconciliation)
}

/// `build_admission` alone leaves the relay not-ready (the natural starting
/// state); this additionally feeds it a full registration event history and
/// runs one tick so `create_relay_transaction`'s readiness gate passes,
/// letting a test reach the validation step it actually cares about.
async fn build_ready_admission(
    fake_chain: Arc<FakeChain>,
    keystore: Arc<KeyStore>,
    relay_hub_address: Address,
    trusted_paymasters: Vec<Address>,
) -> (Arc<AdmissionPipeline>, Arc<ReconciliationLoop>) {
    let manager = keystore.address(SigningRole::Manager);
    let worker = keystore.address(SigningRole::Worker);
    fake_chain.set_balance(manager, U256::from(10_u64.pow(18)));
    fake_chain.set_balance(worker, U256::from(10_u64.pow(18)));
    push_registration_events(&fake_chain, manager, relay_hub_address);

    let chain: Arc<dyn ChainAccess> = fake_chain;
    let (admission, reconciliation) =
        build_admission(chain, keystore, relay_hub_address, trusted_paymasters).await;

    reconciliation.tick_with_watchdog().await;
    assert!(reconciliation.is_ready(), "fixture must reach readiness");

    (admission, reconciliation)
}

#[tokio::test]
async fn admission_refuses_request_for_a_different_hub() {
    let chain = Arc::new(FakeChain::new());
    let keystore = test_keystore().await;
    let relay_hub_address = Address::repeat_byte(2);
    let paymaster = Address::repeat_byte(4);

    let (admission, _reconciliation) =
        build_ready_admission(chain, keystore.clone(), relay_hub_address, vec![paymaster]).await;

    let mut request = sample_relay_request(&keystore, relay_hub_address, paymaster);
    request.relay_hub_address = Address::repeat_byte(99);

    let err = admission.create_relay_transaction(request).await.unwrap_err();
    assert!(matches!(err, AdmissionError::WrongHub { .. }));
}

#[tokio::test]
async fn paymaster_rejection_event_enters_alerted_state() {
    let chain = Arc::new(FakeChain::new());
    let relay_hub_address = Address::repeat_byte(2);
    let keystore = test_keystore().await;

    let manager = keystore.address(SigningRole::Manager);
    chain.set_balance(manager, U256::from(10_u64.pow(18)));
    chain.set_balance(keystore.address(SigningRole::Worker), U256::from(10_u64.pow(18)));

    // The reconciliation loop only inspects `topics[0]` to recognize a
    // paymaster rejection; it never decodes the body for that check.
    chain.events.lock().unwrap().push(Log {
        address: relay_hub_address,
        topics: vec![TransactionRejectedByPaymasterFilter::signature()],
        data: Bytes::default(),
        ..Default::default()
    });

    let chain: Arc<dyn ChainAccess> = chain;
    let (_admission, reconciliation) =
        build_admission(chain, keystore, relay_hub_address, vec![]).await;

    assert!(!reconciliation.is_alerted());
    reconciliation.tick_with_watchdog().await;
    assert!(reconciliation.is_alerted());
}

#[tokio::test]
async fn paymaster_with_insufficient_balance_is_rejected() {
    let chain = Arc::new(
        FakeChain::new().with_calculate_charge(U256::from(1_000_000u64)),
    );
    let relay_hub_address = Address::repeat_byte(2);
    let paymaster = Address::repeat_byte(4);
    chain.set_hub_balance(paymaster, U256::from(1u64));

    let keystore = test_keystore().await;
    let (admission, _reconciliation) =
        build_ready_admission(chain, keystore.clone(), relay_hub_address, vec![]).await;

    let mut request = sample_relay_request(&keystore, relay_hub_address, paymaster);
    request.pct_relay_fee = 100;
    request.base_relay_fee = 100;

    let err = admission.create_relay_transaction(request).await.unwrap_err();
    assert!(matches!(err, AdmissionError::InsufficientPaymasterFunds { .. }));
}

#[tokio::test]
async fn worker_replenishment_is_skipped_while_a_transfer_is_pending() {
    let chain = Arc::new(FakeChain::new());
    let keystore = test_keystore().await;
    let manager = keystore.address(SigningRole::Manager);
    let worker = keystore.address(SigningRole::Worker);

    chain.set_balance(manager, U256::from(10_u64.pow(18)));
    chain.set_balance(worker, U256::from(1u64));

    let store = test_store().await;
    let tx_manager = Arc::new(TransactionManager::new(
        chain.clone() as Arc<dyn ChainAccess>,
        keystore.clone(),
        store,
        U256::from(100_000_000_000u64),
        1.2,
        10,
        5,
    ));

    tx_manager
        .send_transaction(relay_server::tx_manager::TransactionDetails {
            signer: manager,
            role: SigningRole::Manager,
            action: ServerAction::ValueTransfer,
            to: worker,
            value: U256::from(1_000u64),
            gas_limit: U256::from(21_000u64),
            gas_price: U256::from(1_000_000_000u64),
            data: Bytes::default(),
            creation_block_number: 1_000,
        })
        .await
        .unwrap();

    let pending = tx_manager
        .is_action_pending(ServerAction::ValueTransfer, worker)
        .await
        .unwrap();
    assert!(pending, "a prior ValueTransfer must be visible as pending");
}
