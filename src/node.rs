//! Process-wide owner of sessions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{NodeConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::session::{Backends, ChInfo, Session};

pub struct Node {
    cfg: NodeConfig,
    backends: Backends,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Validates the default contract addresses and creates the node.
    pub fn new(cfg: NodeConfig, backends: Backends) -> Result<Arc<Self>> {
        backends
            .wallet
            .parse_addr(&cfg.adjudicator)
            .map_err(|e| Error::InvalidConfig(format!("default adjudicator address: {e}")))?;
        backends
            .wallet
            .parse_addr(&cfg.asset)
            .map_err(|e| Error::InvalidConfig(format!("default asset address: {e}")))?;

        Ok(Arc::new(Node {
            cfg,
            backends,
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    /// Current UTC time in unix seconds, as per the node's system clock.
    pub fn time(&self) -> i64 {
        debug!("received request: node.time");
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn get_config(&self) -> &NodeConfig {
        debug!("received request: node.get_config");
        &self.cfg
    }

    /// The set of app APIs this node serves.
    pub fn help(&self) -> Vec<String> {
        vec!["payment".to_string()]
    }

    /// Opens a session from the given config file and registers it under
    /// its ID. Returns the ID together with the channels restored from
    /// persistence.
    pub async fn open_session(&self, config_file: &str) -> Result<(String, Vec<ChInfo>)> {
        info!(config_file, "received request: node.open_session");
        let cfg = SessionConfig::load(Path::new(config_file))?;
        let session = Session::new(cfg, &self.backends).await?;

        let id = session.id().to_string();
        let restored = session.get_chs_info().await;
        // IDs hash the off-chain address with the opening timestamp, so two
        // sessions can never collide here.
        self.sessions.lock().insert(id.clone(), session);

        info!(session = %id, "session opened successfully");
        Ok((id, restored))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "session id",
                id: session_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_unix_seconds() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert!(now > 1_500_000_000);
    }
}
