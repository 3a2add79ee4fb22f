//! Server facade (§4.10): owns every component behind an `Arc`, constructs
//! them in dependency order, and drives the process lifecycle. Grounded in
//! the teacher's `App` struct and `App::new` construction sequence.

use std::convert::TryFrom;
use std::sync::Arc;

use ethers::providers::{Http, Provider};
use ethers::types::U256;
use tracing::{info, instrument};

use crate::admission::AdmissionPipeline;
use crate::chain::provider::EthersChainAccess;
use crate::chain::ChainAccess;
use crate::config::Config;
use crate::keystore::KeyStore;
use crate::reconciliation::{ReconciliationConfig, ReconciliationLoop};
use crate::registration::RegistrationManager;
use crate::shutdown::Shutdown;
use crate::tx_manager::TransactionManager;
use crate::tx_store::sqlx_store::SqlxTxStore;
use crate::tx_store::TxStore;
use crate::utils::spawn_or_abort;

pub struct App {
    pub chain: Arc<dyn ChainAccess>,
    pub keystore: Arc<KeyStore>,
    pub store: Arc<dyn TxStore>,
    pub tx_manager: Arc<TransactionManager>,
    pub registration: Arc<RegistrationManager>,
    pub reconciliation: Arc<ReconciliationLoop>,
    pub admission: Arc<AdmissionPipeline>,
    pub config: Config,
}

impl App {
    /// # Errors
    ///
    /// Returns `Err` if the RPC provider cannot be constructed, the signing
    /// keys are malformed, or the transaction store cannot connect/migrate.
    #[instrument(name = "App::new", skip(config), level = "debug")]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(config.chain.rpc_url.as_str())?;
        let chain: Arc<dyn ChainAccess> = Arc::new(EthersChainAccess::new(
            provider,
            config.chain.chain_id,
            config.chain.network_id,
            vec![
                config.contracts.relay_hub_address,
                config.contracts.stake_manager_address,
            ],
        ));

        let keystore = Arc::new(KeyStore::from_hex_keys(
            &config.keys.manager_signing_key,
            &config.keys.worker_signing_key,
            config.chain.chain_id,
        )?);

        let store: Arc<dyn TxStore> = Arc::new(SqlxTxStore::connect(&config.database).await?);

        let max_gas_price = U256::from(config.economics.max_gas_price);

        let tx_manager = Arc::new(TransactionManager::new(
            chain.clone(),
            keystore.clone(),
            store.clone(),
            max_gas_price,
            config.cadence.retry_gas_price_factor,
            config.cadence.pending_transaction_timeout,
            config.cadence.confirmations_needed,
        ));

        let registration = Arc::new(RegistrationManager::new(
            chain.clone(),
            tx_manager.clone(),
            keystore.clone(),
            config.contracts.stake_manager_address,
            config.contracts.relay_hub_address,
            config.contracts.owner_address,
            U256::from(config.economics.unstake_delay_blocks),
            config.economics.base_relay_fee,
            config.economics.pct_relay_fee,
            config.server.public_url.clone(),
        ));
        registration.init().await?;

        let reconciliation = Arc::new(ReconciliationLoop::new(
            chain.clone(),
            tx_manager.clone(),
            registration.clone(),
            keystore.clone(),
            ReconciliationConfig {
                gas_price_factor: config.economics.gas_price_factor,
                max_gas_price,
                scanning_window_size: config.chain.scanning_window_size,
                manager_min_balance: config.balances.manager_min_balance,
                manager_target_balance: config.balances.manager_target_balance,
                min_hub_withdrawal_balance: config.balances.min_hub_withdrawal_balance,
                worker_min_balance: config.balances.worker_min_balance,
                worker_target_balance: config.balances.worker_target_balance,
                refresh_state_timeout_blocks: config.cadence.refresh_state_timeout_blocks,
                registration_block_rate: config.cadence.registration_block_rate,
                alerted_block_delay: config.alert.alerted_block_delay,
                successful_rounds_for_ready: config.cadence.successful_rounds_for_ready,
                ready_timeout: config.cadence.ready_timeout,
                relay_hub_address: config.contracts.relay_hub_address,
            },
        ));

        let admission = Arc::new(AdmissionPipeline::new(
            chain.clone(),
            tx_manager.clone(),
            keystore.clone(),
            reconciliation.clone(),
            config.contracts.relay_hub_address,
            U256::from(config.economics.max_acceptance_budget),
            config.economics.pct_relay_fee,
            config.economics.base_relay_fee,
            config.contracts.trusted_paymasters.clone(),
            config.alert.min_alerted_delay,
            config.alert.max_alerted_delay,
        ));

        Ok(Self {
            chain,
            keystore,
            store,
            tx_manager,
            registration,
            reconciliation,
            admission,
            config,
        })
    }

    /// Spawns the periodic reconciliation ticker. The task aborts the
    /// process on an unrecoverable error, since a relay that can no longer
    /// reconcile its own state can't be trusted to keep submitting
    /// transactions either.
    pub fn spawn_reconciliation_ticker(self: &Arc<Self>, shutdown: Arc<Shutdown>) {
        let app = self.clone();
        let interval = app.config.cadence.check_interval;

        spawn_or_abort(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        app.reconciliation.tick_with_watchdog().await;
                    }
                    () = shutdown.await_shutdown() => {
                        info!("reconciliation ticker stopping on shutdown");
                        break;
                    }
                }
            }
            Ok(())
        });
    }
}
