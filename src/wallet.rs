//! Contracts for the wallet and keystore.
//!
//! A [Wallet] can unlock accounts; an unlocked [Account] signs state hashes.
//! Concrete keystores live outside this crate and are injected when a
//! session is constructed, so tests can supply deterministic stubs.

use std::sync::Arc;

use thiserror::Error;

use crate::codec::types::{Address, Hash, Signature};
use crate::idprovider::Peer;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("account not found in wallet: {0}")]
    UnknownAccount(String),
    #[error("unlocking account {addr} failed: {reason}")]
    Unlock { addr: String, reason: String },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("keystore error: {0}")]
    Keystore(String),
}

/// An unlocked account that can sign channel state hashes.
pub trait Account: Send + Sync {
    fn address(&self) -> Address;
    fn sign(&self, msg: Hash) -> Signature;
}

/// A collection of accounts guarded by a keystore.
pub trait Wallet: Send + Sync {
    /// Unlocks the account for `addr` and keeps it unlocked until
    /// [Wallet::lock_all] is called.
    fn unlock(&self, addr: &Address) -> Result<Arc<dyn Account>, WalletError>;

    /// Locks every account unlocked through this wallet.
    fn lock_all(&self);
}

/// Creates wallets and parses addresses for one kind of keystore.
pub trait WalletBackend: Send + Sync {
    fn parse_addr(&self, s: &str) -> Result<Address, WalletError>;

    fn open_wallet(
        &self,
        keystore_path: &str,
        password: &str,
    ) -> Result<Arc<dyn Wallet>, WalletError>;
}

/// An address paired with the wallet able to unlock it.
#[derive(Clone)]
pub struct Credential {
    pub addr: Address,
    pub wallet: Arc<dyn Wallet>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("addr", &self.addr).finish()
    }
}

/// The local identity of a session: who we are to peers, plus the on-chain
/// and off-chain credentials used to settle and to sign states.
#[derive(Debug, Clone)]
pub struct User {
    pub peer: Peer,
    pub on_chain: Credential,
    pub off_chain: Credential,
}

impl User {
    /// Locks both wallets; called when the owning session closes.
    pub fn lock_all(&self) {
        self.on_chain.wallet.lock_all();
        self.off_chain.wallet.lock_all();
    }
}
