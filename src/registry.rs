//! Registry of validated on-chain contracts, keyed by currency symbol.
//!
//! Construction validates the adjudicator and the ETH asset holder through
//! the chain backend; a registry therefore never hands out an unvalidated
//! address. The symbol <-> asset relation over the registered set is
//! bijective.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::chain::{ChainBackend, ChainError};
use crate::codec::types::Address;
use crate::currency;
use crate::error::{Error, Result};

pub struct ContractRegistry {
    chain: Arc<dyn ChainBackend>,
    adjudicator: Address,
    asset_eth: Address,
    // Registered ERC-20 assets; ETH is implicit and kept out of this map.
    assets: RwLock<HashMap<String, Address>>,
}

impl std::fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractRegistry")
            .field("adjudicator", &self.adjudicator)
            .field("asset_eth", &self.asset_eth)
            .field("assets", &*self.assets.read())
            .finish()
    }
}

impl ContractRegistry {
    /// Validates the adjudicator and ETH asset holder and builds the
    /// registry. Validation failure is fatal to session construction.
    pub async fn new(
        chain: Arc<dyn ChainBackend>,
        adjudicator: Address,
        asset_eth: Address,
    ) -> std::result::Result<Self, ChainError> {
        chain.validate_adjudicator(adjudicator).await?;
        chain.validate_asset_eth(adjudicator, asset_eth).await?;

        Ok(Self {
            chain,
            adjudicator,
            asset_eth,
            assets: RwLock::new(HashMap::new()),
        })
    }

    /// Registers an ERC-20 asset holder. The token's symbol and decimals are
    /// read on-chain; the asset contract's adjudicator and token references
    /// are verified against the passed addresses.
    pub async fn register_asset_erc20(
        &self,
        token: Address,
        asset: Address,
    ) -> Result<(String, u8)> {
        if let Some(symbol) = self.symbol(&asset) {
            return Err(Error::ResourceExists {
                kind: "asset",
                id: format!("{} (registered as {symbol})", asset.hex()),
            });
        }

        let (symbol, decimals) = self
            .chain
            .validate_asset_erc20(self.adjudicator, token, asset)
            .await?;

        let mut assets = self.assets.write();
        if symbol == currency::ETH || assets.contains_key(&symbol) {
            return Err(Error::ResourceExists {
                kind: "currency symbol",
                id: symbol,
            });
        }
        // The asset could have been registered concurrently while the chain
        // reads were in flight.
        if assets.values().any(|a| *a == asset) {
            return Err(Error::ResourceExists {
                kind: "asset",
                id: asset.hex(),
            });
        }
        assets.insert(symbol.clone(), asset);
        Ok((symbol, decimals))
    }

    pub fn adjudicator(&self) -> Address {
        self.adjudicator
    }

    pub fn asset_eth(&self) -> Address {
        self.asset_eth
    }

    /// All registered assets by symbol, including ETH.
    pub fn assets(&self) -> HashMap<String, Address> {
        let mut all: HashMap<String, Address> = self.assets.read().clone();
        all.insert(currency::ETH.to_string(), self.asset_eth);
        all
    }

    pub fn asset(&self, symbol: &str) -> Option<Address> {
        if symbol == currency::ETH {
            return Some(self.asset_eth);
        }
        self.assets.read().get(symbol).copied()
    }

    pub fn symbol(&self, asset: &Address) -> Option<String> {
        if *asset == self.asset_eth {
            return Some(currency::ETH.to_string());
        }
        self.assets
            .read()
            .iter()
            .find(|(_, a)| *a == asset)
            .map(|(symbol, _)| symbol.clone())
    }
}
