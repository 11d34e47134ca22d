//! Contract for the blockchain backend.
//!
//! The node never talks to a chain directly; it goes through [ChainBackend],
//! which covers contract validation, funding, dispute registration and
//! withdrawal. Real backends live outside this crate; tests use a stub that
//! settles instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::state::{Params, State, Transaction};
use crate::channel::PartIdx;
use crate::codec::types::{Address, Hash};
use crate::wallet::Credential;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid {kind} contract at {addr}")]
    InvalidContract { kind: &'static str, addr: String },
    #[error("chain connection failed: {0}")]
    Connection(String),
    #[error("on-chain transaction failed: {0}")]
    Tx(String),
    #[error("chain call failed: {0}")]
    Call(String),
}

/// Funding request for a freshly signed channel.
#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Params,
    pub state: State,
    pub idx: PartIdx,
}

/// Register or withdraw request carrying the latest signed transaction.
#[derive(Debug, Clone)]
pub struct AdjudicatorReq {
    pub params: Params,
    pub tx: Transaction,
    pub idx: PartIdx,
}

/// Event emitted by the adjudicator contract for a watched channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjudicatorEvent {
    /// A state was registered on-chain; the challenge period is running.
    Registered { channel_id: Hash, version: u64 },
    /// A registered dispute was progressed on-chain; carries the progressed
    /// state so watchers can adopt it.
    Progressed { channel_id: Hash, state: State },
}

impl AdjudicatorEvent {
    pub fn channel_id(&self) -> Hash {
        match self {
            AdjudicatorEvent::Registered { channel_id, .. }
            | AdjudicatorEvent::Progressed { channel_id, .. } => *channel_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            AdjudicatorEvent::Registered { version, .. } => *version,
            AdjudicatorEvent::Progressed { state, .. } => state.version(),
        }
    }
}

/// Operations the channel runtime needs from a blockchain node.
///
/// All methods may suspend for the duration of an on-chain interaction;
/// callers bound them with the deadlines from the session's timeout
/// configuration.
#[async_trait]
pub trait ChainBackend: Send + Sync + 'static {
    /// Checks the adjudicator contract's code at the given address.
    async fn validate_adjudicator(&self, adjudicator: Address) -> Result<(), ChainError>;

    /// Checks the ETH asset holder and its internal adjudicator reference.
    async fn validate_asset_eth(
        &self,
        adjudicator: Address,
        asset_eth: Address,
    ) -> Result<(), ChainError>;

    /// Checks an ERC-20 asset holder, its adjudicator and token references,
    /// and reads the token's symbol and decimals.
    async fn validate_asset_erc20(
        &self,
        adjudicator: Address,
        token: Address,
        asset: Address,
    ) -> Result<(String, u8), ChainError>;

    /// Deposits our share of the initial allocation and waits until the
    /// channel is fully funded by all participants.
    async fn fund(&self, req: FundingReq) -> Result<(), ChainError>;

    /// Registers the given signed state with the adjudicator.
    async fn register(&self, req: AdjudicatorReq) -> Result<(), ChainError>;

    /// Withdraws our share after the channel was concluded on-chain. For a
    /// final state this settles immediately; otherwise the challenge period
    /// must have elapsed.
    async fn withdraw(&self, req: AdjudicatorReq) -> Result<(), ChainError>;

    /// Subscribes to adjudicator events concerning one channel. The stream
    /// ends when the backend shuts down.
    fn subscribe(&self, channel_id: Hash) -> mpsc::Receiver<AdjudicatorEvent>;
}

/// Connects chain backends for one kind of blockchain node.
///
/// Injected at session construction together with the wallet and comm
/// backends, so a session never hard-codes a chain implementation.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        conn_timeout: Duration,
        on_chain_tx_timeout: Duration,
        on_chain: Credential,
    ) -> Result<Arc<dyn ChainBackend>, ChainError>;
}
