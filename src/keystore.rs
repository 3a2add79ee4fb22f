//! The KeyStore port (§6): holds the manager and worker signing keys the
//! relay uses for on-chain writes, grounded in the teacher's `write_dev`
//! construction of a `LocalWallet` from a configured private key.

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("invalid private key: {0}")]
    InvalidKey(#[source] anyhow::Error),

    #[error("unknown signing role")]
    UnknownRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningRole {
    Manager,
    Worker,
}

/// The relay's two on-chain identities. The manager owns the stake and
/// authorizes the hub; the worker is the address that actually submits
/// `relayCall` transactions and is disposable per the GSN design (a
/// compromised worker key costs an attacker nothing beyond its own balance).
pub struct KeyStore {
    manager: LocalWallet,
    worker: LocalWallet,
}

impl KeyStore {
    pub fn from_hex_keys(
        manager_key: &str,
        worker_key: &str,
        chain_id: u64,
    ) -> Result<Self, KeyStoreError> {
        let manager: LocalWallet = manager_key
            .parse()
            .map_err(|err: ethers::signers::WalletError| KeyStoreError::InvalidKey(err.into()))?;
        let worker: LocalWallet = worker_key
            .parse()
            .map_err(|err: ethers::signers::WalletError| KeyStoreError::InvalidKey(err.into()))?;

        Ok(Self {
            manager: manager.with_chain_id(chain_id),
            worker: worker.with_chain_id(chain_id),
        })
    }

    pub fn address(&self, role: SigningRole) -> Address {
        match role {
            SigningRole::Manager => self.manager.address(),
            SigningRole::Worker => self.worker.address(),
        }
    }

    fn wallet(&self, role: SigningRole) -> &LocalWallet {
        match role {
            SigningRole::Manager => &self.manager,
            SigningRole::Worker => &self.worker,
        }
    }

    pub async fn sign_hash(
        &self,
        role: SigningRole,
        hash: ethers::types::H256,
    ) -> Result<Signature, KeyStoreError> {
        self.wallet(role)
            .sign_hash(hash)
            .map_err(|err| KeyStoreError::InvalidKey(err.into()))
    }

    pub async fn sign_transaction(
        &self,
        role: SigningRole,
        tx: &ethers::types::transaction::eip2718::TypedTransaction,
    ) -> Result<Signature, KeyStoreError> {
        self.wallet(role)
            .sign_transaction(tx)
            .await
            .map_err(|err| KeyStoreError::InvalidKey(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_B: &str = "0000000000000000000000000000000000000000000000000000000000000002";

    #[test]
    fn manager_and_worker_addresses_differ() {
        let store = KeyStore::from_hex_keys(KEY_A, KEY_B, 1337).unwrap();
        assert_ne!(
            store.address(SigningRole::Manager),
            store.address(SigningRole::Worker)
        );
    }

    #[test]
    fn rejects_malformed_key() {
        let err = KeyStore::from_hex_keys("not-a-key", KEY_B, 1337).unwrap_err();
        assert!(matches!(err, KeyStoreError::InvalidKey(_)));
    }
}
