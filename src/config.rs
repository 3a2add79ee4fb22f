//! Layered configuration: an optional TOML file overridden by `RELAY__`-prefixed
//! environment variables, following the same `config` crate wiring the rest of
//! this codebase's ancestry uses.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ethers::types::Address;
use serde::{Deserialize, Serialize};

pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    pub contracts: ContractsConfig,
    pub keys: KeysConfig,
    pub economics: EconomicsConfig,
    pub balances: BalancesConfig,
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub flags: FlagsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint for the chain this relay submits to.
    pub rpc_url: url::Url,

    /// Chain id used to sign transactions; must match what `rpc_url` reports.
    pub chain_id: u64,

    /// Network id reported to clients via the ping endpoint.
    #[serde(default = "default::network_id")]
    pub network_id: u64,

    /// Block window size used when paginating `eth_getLogs` calls.
    #[serde(default = "default::scanning_window_size")]
    pub scanning_window_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractsConfig {
    pub relay_hub_address: Address,
    pub stake_manager_address: Address,
    pub owner_address: Address,
    #[serde(default)]
    pub trusted_paymasters: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Private key used to sign manager transactions (stake/register/fund).
    pub manager_signing_key: String,

    /// Private key used to sign relayed calls.
    pub worker_signing_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicsConfig {
    #[serde(default = "default::gas_price_factor")]
    pub gas_price_factor: f64,
    #[serde(default)]
    pub pct_relay_fee: u64,
    #[serde(default)]
    pub base_relay_fee: u64,
    #[serde(default = "default::max_acceptance_budget")]
    pub max_acceptance_budget: u64,
    #[serde(default = "default::max_gas_price")]
    pub max_gas_price: u64,

    /// Blocks the stake manager holds a withdrawal after `unlockStake`
    /// before `withdrawStake` is permitted, passed to `stakeForAddress`.
    #[serde(default = "default::unstake_delay_blocks")]
    pub unstake_delay_blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancesConfig {
    pub manager_min_balance: u64,
    pub manager_target_balance: u64,
    pub min_hub_withdrawal_balance: u64,
    pub worker_min_balance: u64,
    pub worker_target_balance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::check_interval")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::ready_timeout")]
    pub ready_timeout: Duration,

    #[serde(default = "default::refresh_state_timeout_blocks")]
    pub refresh_state_timeout_blocks: u64,

    #[serde(default = "default::registration_block_rate")]
    pub registration_block_rate: u64,

    #[serde(default = "default::confirmations_needed")]
    pub confirmations_needed: u64,

    #[serde(default = "default::pending_transaction_timeout")]
    pub pending_transaction_timeout: u64,

    #[serde(default = "default::retry_gas_price_factor")]
    pub retry_gas_price_factor: f64,

    #[serde(default = "default::successful_rounds_for_ready")]
    pub successful_rounds_for_ready: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default::alerted_block_delay")]
    pub alerted_block_delay: u64,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::min_alerted_delay")]
    pub min_alerted_delay: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::max_alerted_delay")]
    pub max_alerted_delay: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            alerted_block_delay: default::alerted_block_delay(),
            min_alerted_delay: default::min_alerted_delay(),
            max_alerted_delay: default::max_alerted_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite::memory:`, `sqlite:relay.db`, or a `postgres://` url.
    pub database_url: String,

    #[serde(default = "default::database_migrate")]
    pub database_migrate: bool,

    #[serde(default = "default::database_max_connections")]
    pub database_max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_address: SocketAddr,

    /// URL advertised to clients and registered on-chain as this relay's
    /// address; usually differs from `listen_address` behind NAT/ingress.
    pub public_url: String,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::serve_timeout")]
    pub serve_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagsConfig {
    #[serde(default)]
    pub dev_mode: bool,
}

pub mod default {
    use std::time::Duration;

    pub fn network_id() -> u64 {
        1
    }

    pub fn scanning_window_size() -> u64 {
        2000
    }

    pub fn gas_price_factor() -> f64 {
        1.2
    }

    pub fn max_acceptance_budget() -> u64 {
        300_000
    }

    pub fn max_gas_price() -> u64 {
        100_000_000_000
    }

    pub fn unstake_delay_blocks() -> u64 {
        15_000
    }

    pub fn check_interval() -> Duration {
        Duration::from_secs(10)
    }

    pub fn ready_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn refresh_state_timeout_blocks() -> u64 {
        5
    }

    pub fn registration_block_rate() -> u64 {
        500
    }

    pub fn confirmations_needed() -> u64 {
        12
    }

    pub fn pending_transaction_timeout() -> u64 {
        30
    }

    pub fn retry_gas_price_factor() -> f64 {
        1.2
    }

    pub fn successful_rounds_for_ready() -> u32 {
        3
    }

    pub fn alerted_block_delay() -> u64 {
        20
    }

    pub fn min_alerted_delay() -> Duration {
        Duration::from_secs(0)
    }

    pub fn max_alerted_delay() -> Duration {
        Duration::from_secs(10)
    }

    pub fn database_migrate() -> bool {
        true
    }

    pub fn database_max_connections() -> u32 {
        10
    }

    pub fn serve_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_TOML: &str = indoc::indoc! {r#"
        [chain]
        rpc_url = "http://localhost:8545"
        chain_id = 1337

        [contracts]
        relay_hub_address = "0x0000000000000000000000000000000000000001"
        stake_manager_address = "0x0000000000000000000000000000000000000002"
        owner_address = "0x0000000000000000000000000000000000000003"

        [keys]
        manager_signing_key = "0x0000000000000000000000000000000000000000000000000000000000000001"
        worker_signing_key = "0x0000000000000000000000000000000000000000000000000000000000000002"

        [economics]

        [balances]
        manager_min_balance = 100
        manager_target_balance = 200
        min_hub_withdrawal_balance = 50
        worker_min_balance = 10
        worker_target_balance = 20

        [cadence]

        [database]
        database_url = "sqlite::memory:"

        [server]
        listen_address = "0.0.0.0:8090"
        public_url = "http://localhost:8090"
    "#};

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = toml::from_str(MINIMAL_TOML).unwrap();
        assert_eq!(config.chain.chain_id, 1337);
        assert_eq!(config.cadence.confirmations_needed, 12);
        assert_eq!(config.economics.gas_price_factor, 1.2);
        assert!(!config.flags.dev_mode);
    }
}
