//! Alias directory mapping human-readable names to peer identities.
//!
//! Backed by a single YAML file with one entry per alias. Writes rewrite the
//! whole file through a temp-file-plus-rename so a crash can never leave a
//! half-written directory behind. The reserved alias `self` always resolves
//! to the local user and cannot be pointed at anyone else.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::types::Address;

/// The alias under which every session knows its own user.
pub const OWN_ALIAS: &str = "self";

/// One known peer: identity plus how to reach it off-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub alias: String,
    pub off_chain_addr: Address,
    pub comm_type: String,
    pub comm_addr: String,
}

#[derive(Debug, Error)]
pub enum IdProviderError {
    #[error("peer alias already exists: {0}")]
    AliasExists(String),
    #[error("unknown peer alias: {0}")]
    UnknownAlias(String),
    #[error("id provider file corrupted: {0}")]
    Corrupted(String),
    #[error("id provider io error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk representation of one peer; addresses are hex strings so the file
/// stays hand-editable.
#[derive(Debug, Serialize, Deserialize)]
struct PeerEntry {
    off_chain_address: String,
    comm_type: String,
    comm_address: String,
}

/// File-backed alias -> [Peer] store. Handles are safe to share.
#[derive(Debug)]
pub struct IdProvider {
    path: PathBuf,
    peers: RwLock<BTreeMap<String, Peer>>,
}

impl IdProvider {
    /// Loads the directory at `path`, creating an empty one if absent.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, IdProviderError> {
        let path = path.into();
        let peers = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let entries: BTreeMap<String, PeerEntry> = serde_yaml::from_str(&raw)
                .map_err(|e| IdProviderError::Corrupted(e.to_string()))?;
            entries
                .into_iter()
                .map(|(alias, entry)| {
                    let peer = entry.into_peer(&alias)?;
                    Ok((alias, peer))
                })
                .collect::<Result<_, IdProviderError>>()?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            peers: RwLock::new(peers),
        })
    }

    pub fn read_by_alias(&self, alias: &str) -> Result<Peer, IdProviderError> {
        self.peers
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| IdProviderError::UnknownAlias(alias.into()))
    }

    pub fn read_by_off_chain_addr(&self, addr: &Address) -> Option<Peer> {
        self.peers
            .read()
            .values()
            .find(|p| p.off_chain_addr == *addr)
            .cloned()
    }

    /// Registers a peer under `alias`.
    ///
    /// Re-registering the identical peer is a no-op; registering a different
    /// peer under a taken alias (including `self`) fails.
    pub fn write(&self, alias: &str, peer: Peer) -> Result<(), IdProviderError> {
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(alias) {
            if *existing == peer {
                return Ok(());
            }
            return Err(IdProviderError::AliasExists(alias.into()));
        }
        peers.insert(alias.to_string(), peer);
        self.flush(&peers)
    }

    pub fn delete(&self, alias: &str) -> Result<(), IdProviderError> {
        let mut peers = self.peers.write();
        if peers.remove(alias).is_none() {
            return Err(IdProviderError::UnknownAlias(alias.into()));
        }
        self.flush(&peers)
    }

    /// Serializes the directory and atomically replaces the backing file.
    fn flush(&self, peers: &BTreeMap<String, Peer>) -> Result<(), IdProviderError> {
        let entries: BTreeMap<&String, PeerEntry> = peers
            .iter()
            .map(|(alias, peer)| (alias, PeerEntry::from_peer(peer)))
            .collect();
        let raw = serde_yaml::to_string(&entries)
            .map_err(|e| IdProviderError::Corrupted(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PeerEntry {
    fn from_peer(peer: &Peer) -> Self {
        Self {
            off_chain_address: peer.off_chain_addr.hex(),
            comm_type: peer.comm_type.clone(),
            comm_address: peer.comm_addr.clone(),
        }
    }

    fn into_peer(self, alias: &str) -> Result<Peer, IdProviderError> {
        let off_chain_addr = Address::from_hex(&self.off_chain_address).ok_or_else(|| {
            IdProviderError::Corrupted(format!(
                "bad off-chain address for alias {alias}: {}",
                self.off_chain_address
            ))
        })?;
        Ok(Peer {
            alias: alias.to_string(),
            off_chain_addr,
            comm_type: self.comm_type,
            comm_addr: self.comm_address,
        })
    }
}
