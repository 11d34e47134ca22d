//! Node for two-party off-chain payment channels.
//!
//! A user opens a [session](session::Session), exchanges signed state
//! updates with a counterparty over an authenticated bus, and settles net
//! balances on-chain through an adjudicator contract. External clients
//! drive this through the [api::PaymentApi] facade; the blockchain, the
//! transport and the keystore are abstract collaborators injected at
//! construction ([session::Backends]).

pub mod api;
pub mod chain;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod currency;
pub mod error;
pub mod idprovider;
pub mod node;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod sig;
pub mod wallet;
pub mod wire;

pub use codec::types::{Address, Hash};
pub use error::{Error, Result};
pub use node::Node;
pub use session::{BalanceInfo, ChInfo, Session};
