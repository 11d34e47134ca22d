//! Node and session configuration.
//!
//! Config files are YAML; durations are plain seconds so files stay
//! hand-editable. Address fields are strings parsed through the wallet
//! backend at construction time.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Process-wide configuration of the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub chain_url: String,
    /// Default adjudicator address offered to sessions.
    pub adjudicator: String,
    /// Default ETH asset holder address offered to sessions.
    pub asset: String,
    pub log_level: String,
    pub log_file: String,
    pub comm_types: Vec<String>,
    pub id_provider_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub keystore_path: String,
    pub password_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub on_chain_addr: String,
    pub on_chain_wallet: WalletConfig,
    pub off_chain_addr: String,
    pub off_chain_wallet: WalletConfig,
    pub comm_addr: String,
    pub comm_type: String,
}

/// Per-session configuration, usually one file per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub user: UserConfig,
    pub chain_url: String,
    pub chain_conn_timeout_secs: u64,
    pub on_chain_tx_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub peer_reconn_timeout_secs: u64,
    pub adjudicator: String,
    pub asset: String,
    pub database_dir: String,
    pub id_provider_type: String,
    pub id_provider_url: String,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("parsing {}: {e}", path.display())))
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("parsing {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)
            .map_err(|e| Error::InvalidConfig(format!("encoding config: {e}")))?;
        fs::write(path, raw).map_err(|e| Error::InvalidConfig(format!("writing config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> SessionConfig {
        SessionConfig {
            user: UserConfig {
                on_chain_addr: "0101010101010101010101010101010101010101".into(),
                on_chain_wallet: WalletConfig {
                    keystore_path: "/tmp/keystore".into(),
                    password_file: "/tmp/password".into(),
                },
                off_chain_addr: "0202020202020202020202020202020202020202".into(),
                off_chain_wallet: WalletConfig {
                    keystore_path: "/tmp/keystore".into(),
                    password_file: "/tmp/password".into(),
                },
                comm_addr: "127.0.0.1:5751".into(),
                comm_type: "tcp".into(),
            },
            chain_url: "ws://127.0.0.1:8545".into(),
            chain_conn_timeout_secs: 30,
            on_chain_tx_timeout_secs: 60,
            response_timeout_secs: 10,
            peer_reconn_timeout_secs: 20,
            adjudicator: "0303030303030303030303030303030303030303".into(),
            asset: "0404040404040404040404040404040404040404".into(),
            database_dir: "/tmp/db".into(),
            id_provider_type: "yaml".into(),
            id_provider_url: "/tmp/peers.yaml".into(),
        }
    }

    #[test]
    fn session_config_round_trips_through_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        let cfg = sample();
        cfg.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.user.comm_type, "tcp");
        assert_eq!(loaded.response_timeout_secs, 10);
        assert_eq!(loaded.id_provider_type, "yaml");
    }

    #[test]
    fn missing_file_is_invalid_config() {
        let err = SessionConfig::load(Path::new("/nonexistent/session.yaml")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn malformed_file_is_invalid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "user: [").unwrap();
        assert!(matches!(
            SessionConfig::load(&path),
            Err(Error::InvalidConfig(_))
        ));
    }
}
