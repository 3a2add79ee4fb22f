//! ReconciliationLoop (§4.4): the periodic tick that scans new blocks,
//! drives registration, boosts/prunes transactions, replenishes the worker,
//! and gates the externally visible READY flag. Grounded in the teacher's
//! `task_monitor.rs` periodic-tick shape, generalized to the relay's
//! multi-step tick contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::abi::AbiEncode;
use ethers::contract::EthEvent;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, U256};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::amount_required::AmountRequired;
use crate::chain::abi::{RelayHubCalls, WithdrawCall};
use crate::chain::{BlockTag, ChainAccess};
use crate::chain::scanner::BlockScanner;
use crate::keystore::{KeyStore, SigningRole};
use crate::metrics;
use crate::registration::RegistrationManager;
use crate::tx_manager::{TransactionDetails, TransactionManager};
use crate::tx_store::ServerAction;

pub struct ReconciliationConfig {
    pub gas_price_factor: f64,
    pub max_gas_price: U256,
    pub scanning_window_size: u64,
    pub manager_min_balance: u64,
    pub manager_target_balance: u64,
    pub min_hub_withdrawal_balance: u64,
    pub worker_min_balance: u64,
    pub worker_target_balance: u64,
    pub refresh_state_timeout_blocks: u64,
    pub registration_block_rate: u64,
    pub alerted_block_delay: u64,
    pub successful_rounds_for_ready: u32,
    pub ready_timeout: Duration,
    pub relay_hub_address: Address,
}

pub struct ReconciliationLoop {
    chain: Arc<dyn ChainAccess>,
    tx_manager: Arc<TransactionManager>,
    registration: Arc<RegistrationManager>,
    keystore: Arc<KeyStore>,
    config: ReconciliationConfig,

    in_progress: Mutex<()>,
    last_scanned_block: AtomicU64,
    last_refresh_block: AtomicU64,
    last_relay_event_block: AtomicU64,
    ready: AtomicBool,
    successful_rounds: std::sync::atomic::AtomicU32,
    alerted: AtomicBool,
    alerted_block: AtomicU64,
    gas_price: AtomicU64,
    manager_balance: Mutex<AmountRequired>,
}

impl ReconciliationLoop {
    pub fn new(
        chain: Arc<dyn ChainAccess>,
        tx_manager: Arc<TransactionManager>,
        registration: Arc<RegistrationManager>,
        keystore: Arc<KeyStore>,
        config: ReconciliationConfig,
    ) -> Self {
        let manager_min_balance = config.manager_min_balance;
        Self {
            chain,
            tx_manager,
            registration,
            keystore,
            config,
            in_progress: Mutex::new(()),
            last_scanned_block: AtomicU64::new(0),
            last_refresh_block: AtomicU64::new(0),
            last_relay_event_block: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            successful_rounds: std::sync::atomic::AtomicU32::new(0),
            alerted: AtomicBool::new(false),
            alerted_block: AtomicU64::new(0),
            gas_price: AtomicU64::new(0),
            manager_balance: Mutex::new(AmountRequired::new(
                "manager eth balance",
                manager_min_balance,
            )),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self.successful_rounds.load(Ordering::SeqCst)
                >= self.config.successful_rounds_for_ready
    }

    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::SeqCst)
    }

    pub fn current_gas_price(&self) -> U256 {
        U256::from(self.gas_price.load(Ordering::SeqCst))
    }

    fn set_ready(&self, ready: bool) {
        if ready {
            self.ready.store(true, Ordering::SeqCst);
            let rounds = self.successful_rounds.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::SUCCESSFUL_ROUNDS.set(f64::from(rounds));
        } else {
            self.ready.store(false, Ordering::SeqCst);
            self.successful_rounds.store(0, Ordering::SeqCst);
            metrics::SUCCESSFUL_ROUNDS.set(0.0);
        }
        metrics::READY.set(if self.is_ready() { 1.0 } else { 0.0 });
    }

    /// Runs a watchdog-guarded tick: if the tick does not complete within
    /// `readyTimeout`, flips the server to not-ready and resets the
    /// success-rounds counter, but does *not* abort the in-flight tick — a
    /// forced cancellation mid-broadcast could corrupt nonce bookkeeping.
    #[instrument(skip(self))]
    pub async fn tick_with_watchdog(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.tick().await });

        match tokio::time::timeout(self.config.ready_timeout, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => {
                error!(?error, "reconciliation tick failed");
                self.set_ready(false);
            }
            Ok(Err(join_error)) => {
                error!(?join_error, "reconciliation tick task panicked");
                self.set_ready(false);
            }
            Err(_elapsed) => {
                warn!("reconciliation tick exceeded readyTimeout; marking not-ready");
                self.set_ready(false);
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.in_progress.try_lock() else {
            info!("tick already in progress, skipping");
            return Ok(());
        };

        let timer = metrics::TICK_LATENCY.start_timer();
        let result = self.tick_inner().await;
        timer.observe_duration();
        result
    }

    async fn tick_inner(&self) -> anyhow::Result<()> {
        // Step 2: observe the latest block.
        let block = self.chain.block_number().await?;
        let last_scanned = self.last_scanned_block.load(Ordering::SeqCst);
        if block <= last_scanned && last_scanned != 0 {
            return Ok(());
        }

        // Step 3: skip the expensive refresh while already ready and recent.
        let last_refresh = self.last_refresh_block.load(Ordering::SeqCst);
        let skip_refresh =
            block.saturating_sub(last_refresh) < self.config.refresh_state_timeout_blocks
                && self.is_ready();

        if !skip_refresh {
            // Step 4: refresh gas price.
            let network_gas_price = self.chain.gas_price().await?;
            let gas_price = U256::from(
                (network_gas_price.as_u128() as f64 * self.config.gas_price_factor) as u128,
            );
            if gas_price.is_zero() {
                anyhow::bail!("refreshed gas price is zero");
            }
            self.gas_price
                .store(gas_price.as_u64().min(u64::MAX), Ordering::SeqCst);

            // Step 5: refresh manager balance.
            let manager = self.keystore.address(SigningRole::Manager);
            let manager_eth_balance = self.chain.balance(manager, BlockTag::Latest).await?;
            {
                let mut balance = self.manager_balance.lock().await;
                balance.set(manager_eth_balance.as_u64().min(u64::MAX));
                if !balance.is_satisfied() {
                    self.set_ready(false);
                    return Ok(());
                }
            }

            // Step 6: fetch hub events and feed the registration manager.
            let should_register_again = block.saturating_sub(
                self.last_relay_event_block.load(Ordering::SeqCst),
            ) >= self.config.registration_block_rate;

            let scanner = BlockScanner::new(self.chain.as_ref(), self.config.scanning_window_size);
            let events = scanner.scan(manager, last_scanned + 1, block).await?;

            if !events.is_empty() {
                self.last_relay_event_block.store(block, Ordering::SeqCst);
            }

            self.registration
                .handle_past_events(&events, should_register_again)
                .await?;

            // Step 11: alerted state on paymaster rejection events.
            for log in &events {
                if log
                    .topics
                    .first()
                    .is_some_and(|topic| *topic == crate::chain::abi::TransactionRejectedByPaymasterFilter::signature())
                {
                    self.alerted.store(true, Ordering::SeqCst);
                    self.alerted_block.store(block, Ordering::SeqCst);
                    warn!(block, "entering alerted state: paymaster rejected a transaction");
                }
            }

            // Step 7: boost/prune transactions.
            let worker = self.keystore.address(SigningRole::Worker);
            self.tx_manager
                .remove_confirmed_transactions(manager, block)
                .await?;
            self.tx_manager
                .remove_confirmed_transactions(worker, block)
                .await?;
            if let Err(error) = self
                .tx_manager
                .boost_oldest_pending_transaction_for_signer(manager, SigningRole::Manager, block)
                .await
            {
                warn!(?error, "boost failed for manager, continuing tick");
            }
            if let Err(error) = self
                .tx_manager
                .boost_oldest_pending_transaction_for_signer(worker, SigningRole::Worker, block)
                .await
            {
                warn!(?error, "boost failed for worker, continuing tick");
            }

            // Step 8: replenishment.
            self.replenish(manager, worker, manager_eth_balance).await?;

            self.last_refresh_block.store(block, Ordering::SeqCst);
        }

        self.last_scanned_block.store(block, Ordering::SeqCst);

        // Step 9: readiness.
        let worker = self.keystore.address(SigningRole::Worker);
        let worker_balance = self.chain.balance(worker, BlockTag::Latest).await?;
        let registered = self.registration.is_registered().await;
        let ready = registered && worker_balance.as_u64() >= self.config.worker_min_balance;
        self.set_ready(ready);

        // Step 10: clear stale alerted state.
        if self.alerted.load(Ordering::SeqCst) {
            let alerted_block = self.alerted_block.load(Ordering::SeqCst);
            if alerted_block + self.config.alerted_block_delay < block {
                self.alerted.store(false, Ordering::SeqCst);
                info!("alerted state cleared");
            }
        }

        Ok(())
    }

    /// Replenishment (§4.6): withdraw hub balance to the manager when the
    /// manager is running low and the hub holds enough to make it worth it,
    /// then top up the worker from the manager if the worker fell below its
    /// floor.
    async fn replenish(
        &self,
        manager: Address,
        worker: Address,
        mut manager_eth_balance: U256,
    ) -> anyhow::Result<()> {
        let manager_hub_balance = self.hub_balance_of(manager).await?;

        if manager_eth_balance.as_u64() < self.config.manager_target_balance
            && manager_hub_balance.as_u64() >= self.config.min_hub_withdrawal_balance
            && !self
                .tx_manager_is_action_pending(ServerAction::DepositWithdrawal, manager)
                .await?
        {
            let data = RelayHubCalls::Withdraw(WithdrawCall {
                amount: manager_hub_balance,
                dest: manager,
            })
            .encode()
            .into();

            self.tx_manager
                .send_transaction(TransactionDetails {
                    signer: manager,
                    role: SigningRole::Manager,
                    action: ServerAction::DepositWithdrawal,
                    to: self.config.relay_hub_address,
                    value: U256::zero(),
                    gas_limit: U256::from(100_000u64),
                    gas_price: self.current_gas_price(),
                    data,
                    creation_block_number: self.last_scanned_block.load(Ordering::SeqCst),
                })
                .await?;

            manager_eth_balance = self.chain.balance(manager, BlockTag::Latest).await?;
        }

        let worker_balance = self.chain.balance(worker, BlockTag::Latest).await?;
        if worker_balance.as_u64() < self.config.worker_min_balance
            && !self
                .tx_manager_is_action_pending(ServerAction::ValueTransfer, worker)
                .await?
        {
            let refill = self.config.worker_target_balance - worker_balance.as_u64();
            let headroom = manager_eth_balance.as_u64().saturating_sub(self.config.manager_min_balance);

            if refill < headroom {
                self.tx_manager
                    .send_transaction(TransactionDetails {
                        signer: manager,
                        role: SigningRole::Manager,
                        action: ServerAction::ValueTransfer,
                        to: worker,
                        value: U256::from(refill),
                        gas_limit: U256::from(21_000u64),
                        gas_price: self.current_gas_price(),
                        data: Default::default(),
                        creation_block_number: self.last_scanned_block.load(Ordering::SeqCst),
                    })
                    .await?;
            } else {
                error!(
                    worker_balance = worker_balance.as_u64(),
                    required = refill,
                    "funding needed: manager cannot cover worker replenishment"
                );
            }
        }

        Ok(())
    }

    async fn tx_manager_is_action_pending(
        &self,
        action: ServerAction,
        signer: Address,
    ) -> anyhow::Result<bool> {
        Ok(self.tx_manager.is_action_pending(action, signer).await?)
    }

    async fn hub_balance_of(&self, target: Address) -> anyhow::Result<U256> {
        let data = RelayHubCalls::BalanceOf(crate::chain::abi::BalanceOfCall { target }).encode();
        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(self.config.relay_hub_address.into()),
            data: Some(data.into()),
            ..Default::default()
        });
        let raw = self.chain.call(&tx).await?;
        let decoded = ethers::abi::decode(&[ethers::abi::ParamType::Uint(256)], &raw)?;
        Ok(decoded[0].clone().into_uint().unwrap_or_default())
    }
}
