//! `sqlx::Any`-backed `TxStore`, grounded in the teacher's `database.rs`
//! connection/migration bootstrap and `database/sitter.rs` insert pattern.
//! Big-endian integers (`U256`, addresses, hashes, calldata) are stored as
//! hex text: `sqlx::Any` has no portable arbitrary-precision integer type,
//! and hex text compares and migrates identically across SQLite and
//! Postgres.

use std::str::FromStr;

use ethers::types::{Address, Bytes, H256, U256};
use sqlx::any::{Any, AnyKind, AnyPoolOptions};
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::{Executor, Pool, Row};
use tracing::{info, instrument, warn};

use super::{ServerAction, StoredTransaction, TxStore, TxStoreError};
use crate::config::DatabaseConfig;

static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

pub struct SqlxTxStore {
    pool: Pool<Any>,
}

impl SqlxTxStore {
    #[instrument(skip_all, fields(url = %config.database_url))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, TxStoreError> {
        if config.database_migrate && !Any::database_exists(&config.database_url).await? {
            info!(url = %config.database_url, "creating database");
            Any::create_database(&config.database_url).await?;
        }

        let pool = AnyPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await?;

        if config.database_migrate {
            info!("running migrations");
            MIGRATOR.run(&pool).await.map_err(|err| {
                TxStoreError::Database(sqlx::Error::Migrate(Box::new(err)))
            })?;
        }

        Ok(Self { pool })
    }

    /// An ephemeral `sqlite::memory:` store, migrated and ready to use.
    /// Handy for tests and local experimentation; not used by `App::new`.
    pub async fn in_memory() -> Self {
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite pool");
        MIGRATOR.run(&pool).await.expect("run migrations");
        Self { pool }
    }
}

fn encode_u256(value: U256) -> String {
    format!("{value:#066x}")
}

fn decode_u256(raw: &str) -> Result<U256, TxStoreError> {
    U256::from_str(raw).map_err(|err| TxStoreError::Database(sqlx::Error::ColumnDecode {
        index: "value".to_owned(),
        source: Box::new(err),
    }))
}

fn row_to_stored_transaction(row: &sqlx::any::AnyRow) -> Result<StoredTransaction, TxStoreError> {
    let server_action_raw: String = row.try_get("server_action")?;
    let server_action = match server_action_raw.as_str() {
        "REGISTER_SERVER" => ServerAction::RegisterServer,
        "ADD_WORKER" => ServerAction::AddWorker,
        "AUTHORIZE_HUB" => ServerAction::AuthorizeHub,
        "STAKE" => ServerAction::Stake,
        "UNSTAKE" => ServerAction::Unstake,
        "RELAY_CALL" => ServerAction::RelayCall,
        "VALUE_TRANSFER" => ServerAction::ValueTransfer,
        "DEPOSIT_WITHDRAWAL" => ServerAction::DepositWithdrawal,
        "SET_OWNER" => ServerAction::SetOwner,
        other => {
            return Err(TxStoreError::Database(sqlx::Error::Decode(
                format!("unknown server_action {other}").into(),
            )))
        }
    };

    let from: String = row.try_get("from_address")?;
    let to: String = row.try_get("to_address")?;
    let tx_hash: String = row.try_get("tx_hash")?;
    let data: String = row.try_get("data")?;
    let gas_price: String = row.try_get("gas_price")?;
    let gas_limit: String = row.try_get("gas_limit")?;
    let value: String = row.try_get("value")?;
    let nonce: i64 = row.try_get("nonce")?;
    let creation_block_number: i64 = row.try_get("creation_block_number")?;
    let creation_timestamp: i64 = row.try_get("creation_timestamp")?;
    let mined_block_number: Option<i64> = row.try_get("mined_block_number")?;

    Ok(StoredTransaction {
        tx_hash: tx_hash
            .parse()
            .map_err(|_| TxStoreError::Database(sqlx::Error::Decode("bad tx_hash".into())))?,
        from: from
            .parse()
            .map_err(|_| TxStoreError::Database(sqlx::Error::Decode("bad from_address".into())))?,
        to: to
            .parse()
            .map_err(|_| TxStoreError::Database(sqlx::Error::Decode("bad to_address".into())))?,
        nonce: nonce as u64,
        gas_price: decode_u256(&gas_price)?,
        gas_limit: decode_u256(&gas_limit)?,
        value: decode_u256(&value)?,
        data: Bytes::from(
            hex::decode(data.trim_start_matches("0x"))
                .map_err(|_| TxStoreError::Database(sqlx::Error::Decode("bad data".into())))?,
        ),
        creation_block_number: creation_block_number as u64,
        creation_timestamp,
        server_action,
        mined_block_number: mined_block_number.map(|block| block as u64),
    })
}

fn server_action_str(action: ServerAction) -> &'static str {
    match action {
        ServerAction::RegisterServer => "REGISTER_SERVER",
        ServerAction::AddWorker => "ADD_WORKER",
        ServerAction::AuthorizeHub => "AUTHORIZE_HUB",
        ServerAction::Stake => "STAKE",
        ServerAction::Unstake => "UNSTAKE",
        ServerAction::RelayCall => "RELAY_CALL",
        ServerAction::ValueTransfer => "VALUE_TRANSFER",
        ServerAction::DepositWithdrawal => "DEPOSIT_WITHDRAWAL",
        ServerAction::SetOwner => "SET_OWNER",
    }
}

#[async_trait::async_trait]
impl TxStore for SqlxTxStore {
    #[instrument(skip(self, tx), fields(from = %tx.from, nonce = tx.nonce))]
    async fn put(&self, tx: &StoredTransaction) -> Result<(), TxStoreError> {
        sqlx::query::<Any>(
            r#"
            INSERT INTO stored_transactions
                (from_address, nonce, tx_hash, to_address, gas_price, gas_limit,
                 value, data, creation_block_number, creation_timestamp,
                 server_action, mined_block_number)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL)
            ON CONFLICT (from_address, nonce) DO UPDATE SET
                tx_hash = excluded.tx_hash,
                gas_price = excluded.gas_price,
                gas_limit = excluded.gas_limit
            "#,
        )
        .bind(format!("{:#x}", tx.from))
        .bind(tx.nonce as i64)
        .bind(format!("{:#x}", tx.tx_hash))
        .bind(format!("{:#x}", tx.to))
        .bind(encode_u256(tx.gas_price))
        .bind(encode_u256(tx.gas_limit))
        .bind(encode_u256(tx.value))
        .bind(format!("0x{}", hex::encode(tx.data.as_ref())))
        .bind(tx.creation_block_number as i64)
        .bind(tx.creation_timestamp)
        .bind(server_action_str(tx.server_action))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_all_by_signer(&self, from: Address) -> Result<Vec<StoredTransaction>, TxStoreError> {
        let rows = self
            .pool
            .fetch_all(
                sqlx::query::<Any>(
                    "SELECT * FROM stored_transactions WHERE from_address = $1 ORDER BY nonce ASC",
                )
                .bind(format!("{from:#x}")),
            )
            .await?;

        rows.iter().map(row_to_stored_transaction).collect()
    }

    #[instrument(skip(self))]
    async fn get_oldest_pending(
        &self,
        from: Address,
    ) -> Result<Option<StoredTransaction>, TxStoreError> {
        let row = self
            .pool
            .fetch_optional(
                sqlx::query::<Any>(
                    r#"
                    SELECT * FROM stored_transactions
                    WHERE from_address = $1 AND mined_block_number IS NULL
                    ORDER BY nonce ASC
                    LIMIT 1
                    "#,
                )
                .bind(format!("{from:#x}")),
            )
            .await?;

        row.as_ref().map(row_to_stored_transaction).transpose()
    }

    #[instrument(skip(self))]
    async fn is_action_pending(
        &self,
        action: ServerAction,
        signer: Option<Address>,
    ) -> Result<bool, TxStoreError> {
        let row = match signer {
            Some(signer) => {
                self.pool
                    .fetch_optional(
                        sqlx::query::<Any>(
                            r#"
                            SELECT 1 as present FROM stored_transactions
                            WHERE server_action = $1 AND mined_block_number IS NULL
                                AND from_address = $2
                            LIMIT 1
                            "#,
                        )
                        .bind(server_action_str(action))
                        .bind(format!("{signer:#x}")),
                    )
                    .await?
            }
            None => {
                self.pool
                    .fetch_optional(
                        sqlx::query::<Any>(
                            r#"
                            SELECT 1 as present FROM stored_transactions
                            WHERE server_action = $1 AND mined_block_number IS NULL
                            LIMIT 1
                            "#,
                        )
                        .bind(server_action_str(action)),
                    )
                    .await?
            }
        };

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn mark_mined(
        &self,
        from: Address,
        nonce: u64,
        mined_block_number: u64,
    ) -> Result<(), TxStoreError> {
        sqlx::query::<Any>(
            r#"
            UPDATE stored_transactions
            SET mined_block_number = $1
            WHERE from_address = $2 AND nonce = $3
            "#,
        )
        .bind(mined_block_number as i64)
        .bind(format!("{from:#x}"))
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_txs_until_nonce(&self, from: Address, nonce: u64) -> Result<(), TxStoreError> {
        let result = sqlx::query::<Any>(
            r#"
            DELETE FROM stored_transactions
            WHERE from_address = $1 AND nonce <= $2 AND mined_block_number IS NOT NULL
            "#,
        )
        .bind(format!("{from:#x}"))
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(%from, nonce, "no confirmed rows to prune");
        }

        Ok(())
    }
}

#[allow(dead_code)]
fn assert_any_kind_supported(kind: AnyKind) -> bool {
    matches!(kind, AnyKind::Sqlite | AnyKind::Postgres)
}
