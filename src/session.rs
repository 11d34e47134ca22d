//! Wallet-scoped runtime container for one user's channels.
//!
//! A session owns its channel client, its live channels and the inbound
//! proposal machinery. Inbound events from the client are dispatched on
//! fresh tasks; the session mutex only guards the in-memory maps and is
//! never held across I/O.

pub mod channel;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::channel::app::{App, AppRegistry};
use crate::channel::machine::{Machine, Phase};
use crate::client::{ChClient, ClientEvent};
use crate::codec::types::{Address, Hash};
use crate::currency::{self, Parser};
use crate::error::{Error, Result};
use crate::idprovider::{IdProvider, IdProviderError, Peer, OWN_ALIAS};
use crate::wire::messages::{ProposalMsg, UpdateRejMsg};
use crate::persistence::{Store, StoredChannel};
use crate::registry::ContractRegistry;
use crate::wallet::{Credential, User, WalletBackend};
use crate::wire::{CommBackend, Frame, Identity};

pub use self::channel::{ChCloseNotif, ChUpdateNotif, ChUpdateNotifier, Channel};
use self::channel::ChStatus;

use crate::chain::ChainProvider;
use crate::config::SessionConfig;

/// Most cached proposal/close notifications per session.
const MAX_CACHED_NOTIFS: usize = 128;

/// Currency amounts per participant, index-aligned with `parts`.
///
/// After [canonicalized], the entry for [OWN_ALIAS] sits at index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceInfo {
    pub currency: String,
    pub parts: Vec<String>,
    pub bals: Vec<String>,
}

/// Returns a copy of `bal_info` with the entry for [OWN_ALIAS] moved to
/// index 0, aliases and amounts swapped in lockstep. Unchanged when no own
/// entry exists.
pub fn canonicalized(bal_info: &BalanceInfo) -> BalanceInfo {
    let mut out = bal_info.clone();
    if let Some(own_idx) = out.parts.iter().position(|p| p == OWN_ALIAS) {
        out.parts.swap(0, own_idx);
        out.bals.swap(0, own_idx);
    }
    out
}

/// Snapshot of one channel for the API surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChInfo {
    pub channel_id: String,
    pub bal_info: BalanceInfo,
    pub version: u64,
}

/// Notification about an inbound channel proposal awaiting a response.
#[derive(Debug, Clone)]
pub struct ChProposalNotif {
    pub proposal_id: String,
    pub opening_bal_info: BalanceInfo,
    pub challenge_dur_secs: u64,
    /// Unix seconds after which responding is futile.
    pub expiry: i64,
}

pub type ChProposalNotifier = Box<dyn Fn(ChProposalNotif) + Send + Sync>;
pub type ChCloseNotifier = Box<dyn Fn(ChCloseNotif) + Send + Sync>;

/// Deadlines for the session's operations, derived from the configured
/// on-chain transaction and response timeouts.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub on_chain_tx: Duration,
    pub response: Duration,
}

impl TimeoutConfig {
    /// Headroom added to every composed deadline.
    const MARGIN: Duration = Duration::from_secs(5);

    fn challenge(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    pub fn propose_ch(&self, challenge_secs: u64) -> Duration {
        self.on_chain_tx + 2 * self.response + Self::challenge(challenge_secs) + Self::MARGIN
    }

    pub fn resp_ch_proposal_accept(&self, challenge_secs: u64) -> Duration {
        self.on_chain_tx + self.response + Self::challenge(challenge_secs) + Self::MARGIN
    }

    pub fn resp_ch_proposal_reject(&self) -> Duration {
        self.response
    }

    pub fn ch_update(&self, challenge_secs: u64) -> Duration {
        2 * self.response + Self::challenge(challenge_secs) + Self::MARGIN
    }

    pub fn close_ch(&self, challenge_secs: u64) -> Duration {
        self.on_chain_tx + self.response + Self::challenge(challenge_secs) + Self::MARGIN
    }
}

/// External collaborators injected at construction; tests supply stubs.
#[derive(Clone)]
pub struct Backends {
    pub wallet: Arc<dyn WalletBackend>,
    pub chain: Arc<dyn ChainProvider>,
    pub comm: Arc<dyn CommBackend>,
}

struct ChProposalResponderEntry {
    proposal: ProposalMsg,
    from: Identity,
    parts: Vec<String>,
    app: App,
    parser: Parser,
    notif: ChProposalNotif,
}

struct SessionShared {
    is_open: bool,
    chs: HashMap<Hash, Arc<Channel>>,
    proposal_responders: HashMap<String, ChProposalResponderEntry>,
    proposal_notifier: Option<ChProposalNotifier>,
    proposal_cache: VecDeque<ChProposalNotif>,
    close_notifier: Option<ChCloseNotifier>,
    close_cache: VecDeque<ChCloseNotif>,
}

pub struct Session {
    id: String,
    user: User,
    timeout_cfg: TimeoutConfig,
    client: Arc<ChClient>,
    id_provider: Arc<IdProvider>,
    registry: Arc<ContractRegistry>,
    apps: Arc<AppRegistry>,
    shared: Mutex<SessionShared>,
    weak_self: Mutex<Weak<Session>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

/// The session ID binds the user's off-chain address to the opening time,
/// so the same user opening two sessions gets distinct IDs.
fn calc_session_id(off_chain_addr: &Address) -> String {
    let mut hasher = Sha256::new();
    hasher.update(off_chain_addr.0);
    hasher.update(utc_timestamp_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn utc_timestamp_string() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_default()
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn map_idprovider_err(err: IdProviderError) -> Error {
    match err {
        IdProviderError::AliasExists(alias) => Error::ResourceExists {
            kind: "peer alias",
            id: alias,
        },
        IdProviderError::UnknownAlias(alias) => Error::ResourceNotFound {
            kind: "peer alias",
            id: alias,
        },
        other => Error::InvalidConfig(other.to_string()),
    }
}

/// Resolves aliases to peers, reporting the exact missing or repeated
/// aliases. The own alias must be present.
fn retrieve_parts(aliases: &[String], id_provider: &IdProvider) -> Result<Vec<Peer>> {
    let mut parts = Vec::with_capacity(aliases.len());
    let mut missing = Vec::new();
    let mut repeated = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut found_own = false;

    for alias in aliases {
        if alias == OWN_ALIAS {
            found_own = true;
        }
        if !seen.insert(alias.clone()) {
            repeated.push(alias.clone());
        }
        match id_provider.read_by_alias(alias) {
            Ok(peer) => parts.push(peer),
            Err(_) => missing.push(alias.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(Error::ResourceNotFound {
            kind: "peer alias",
            id: missing.join(", "),
        });
    }
    if !repeated.is_empty() {
        return Err(Error::ResourceExists {
            kind: "peer alias",
            id: repeated.join(", "),
        });
    }
    if !found_own {
        return Err(Error::ResourceNotFound {
            kind: "self entry in aliases",
            id: OWN_ALIAS.to_string(),
        });
    }
    Ok(parts)
}

impl Session {
    /// Builds a session from its configuration: unlocks the user, validates
    /// contracts, opens the store and the bus, restores persisted channels
    /// and starts consuming inbound events.
    pub async fn new(cfg: SessionConfig, backends: &Backends) -> Result<Arc<Self>> {
        if cfg.user.comm_type != "tcp" {
            return Err(Error::Unsupported {
                feature: "comm type",
                got: cfg.user.comm_type.clone(),
            });
        }
        if cfg.id_provider_type != "yaml" {
            return Err(Error::Unsupported {
                feature: "id provider type",
                got: cfg.id_provider_type.clone(),
            });
        }

        let invalid = |e: crate::wallet::WalletError| Error::InvalidConfig(e.to_string());
        let on_chain_addr = backends.wallet.parse_addr(&cfg.user.on_chain_addr).map_err(invalid)?;
        let off_chain_addr = backends.wallet.parse_addr(&cfg.user.off_chain_addr).map_err(invalid)?;
        let adjudicator = backends.wallet.parse_addr(&cfg.adjudicator).map_err(invalid)?;
        let asset_eth = backends.wallet.parse_addr(&cfg.asset).map_err(invalid)?;

        let on_chain_wallet = backends
            .wallet
            .open_wallet(&cfg.user.on_chain_wallet.keystore_path, &cfg.user.on_chain_wallet.password_file)
            .map_err(invalid)?;
        let off_chain_wallet = backends
            .wallet
            .open_wallet(&cfg.user.off_chain_wallet.keystore_path, &cfg.user.off_chain_wallet.password_file)
            .map_err(invalid)?;
        on_chain_wallet.unlock(&on_chain_addr).map_err(invalid)?;
        let off_chain_acc = off_chain_wallet.unlock(&off_chain_addr).map_err(invalid)?;

        let own_peer = Peer {
            alias: OWN_ALIAS.to_string(),
            off_chain_addr,
            comm_type: cfg.user.comm_type.clone(),
            comm_addr: cfg.user.comm_addr.clone(),
        };
        let user = User {
            peer: own_peer.clone(),
            on_chain: Credential {
                addr: on_chain_addr,
                wallet: on_chain_wallet,
            },
            off_chain: Credential {
                addr: off_chain_addr,
                wallet: off_chain_wallet,
            },
        };

        let id_provider = Arc::new(
            IdProvider::new(&cfg.id_provider_url).map_err(|e| Error::InvalidConfig(e.to_string()))?,
        );
        match id_provider.write(OWN_ALIAS, own_peer) {
            Ok(()) | Err(IdProviderError::AliasExists(_)) => {}
            Err(e) => return Err(Error::InvalidConfig(e.to_string())),
        }

        let chain = backends
            .chain
            .connect(
                &cfg.chain_url,
                Duration::from_secs(cfg.chain_conn_timeout_secs),
                Duration::from_secs(cfg.on_chain_tx_timeout_secs),
                user.on_chain.clone(),
            )
            .await?;
        let registry = Arc::new(ContractRegistry::new(Arc::clone(&chain), adjudicator, asset_eth).await?);

        let store = Arc::new(Store::open(std::path::Path::new(&cfg.database_dir))?);

        let (bus, incoming) = backends
            .comm
            .new_bus(off_chain_addr, &cfg.user.comm_addr)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let (client, events) = ChClient::new(bus, incoming, chain, off_chain_acc, store);

        let timeout_cfg = TimeoutConfig {
            on_chain_tx: Duration::from_secs(cfg.on_chain_tx_timeout_secs),
            response: Duration::from_secs(cfg.response_timeout_secs),
        };

        let session = Arc::new(Session {
            id: calc_session_id(&off_chain_addr),
            user,
            timeout_cfg,
            client,
            id_provider,
            registry,
            apps: Arc::new(AppRegistry::new()),
            shared: Mutex::new(SessionShared {
                is_open: true,
                chs: HashMap::new(),
                proposal_responders: HashMap::new(),
                proposal_notifier: None,
                proposal_cache: VecDeque::new(),
                close_notifier: None,
                close_cache: VecDeque::new(),
            }),
            weak_self: Mutex::new(Weak::new()),
            event_task: Mutex::new(None),
        });
        *session.weak_self.lock() = Arc::downgrade(&session);

        session.restore_channels().await?;
        Self::spawn_event_loop(&session, events);

        info!(session = %session.id, "session opened");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.shared.lock().is_open {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    // ---- contacts -------------------------------------------------------

    pub fn add_contact(&self, peer: Peer) -> Result<()> {
        self.ensure_open()?;
        let alias = peer.alias.clone();
        self.id_provider
            .write(&alias, peer)
            .map_err(map_idprovider_err)
    }

    pub fn get_contact(&self, alias: &str) -> Result<Peer> {
        self.ensure_open()?;
        self.id_provider.read_by_alias(alias).map_err(map_idprovider_err)
    }

    // ---- opening channels ----------------------------------------------

    /// Opens a channel with the given opening balances and challenge
    /// duration. Blocks until the channel is funded or the proposal fails.
    pub async fn open_ch(
        &self,
        opening_bals: &BalanceInfo,
        app_def: Option<Address>,
        challenge_dur_secs: u64,
    ) -> Result<ChInfo> {
        self.ensure_open()?;

        let opening_bals = canonicalized(opening_bals);
        let parts = retrieve_parts(&opening_bals.parts, &self.id_provider)?;
        if parts.len() != 2 {
            return Err(Error::InvalidArgument {
                name: "participants",
                value: format!("expected 2, got {}", parts.len()),
            });
        }
        self.register_parts(&parts);

        let parser = currency::parser(&opening_bals.currency).ok_or(Error::Unsupported {
            feature: "currency",
            got: opening_bals.currency.clone(),
        })?;
        let asset = self.registry.asset(&opening_bals.currency).ok_or(Error::Unsupported {
            feature: "currency",
            got: opening_bals.currency.clone(),
        })?;
        let mut bals = Vec::with_capacity(opening_bals.bals.len());
        for amount in &opening_bals.bals {
            bals.push(parser.parse(amount).map_err(|e| Error::InvalidArgument {
                name: "amount",
                value: e.to_string(),
            })?);
        }

        let app = self.apps.resolve(app_def).ok_or(Error::Unsupported {
            feature: "app",
            got: app_def.map(|a| a.hex()).unwrap_or_default(),
        })?;

        let peer = parts
            .iter()
            .find(|p| p.alias != OWN_ALIAS)
            .ok_or(Error::ResourceNotFound {
                kind: "self entry in aliases",
                id: OWN_ALIAS.to_string(),
            })?
            .clone();

        let mut prop = self.client.make_proposal(challenge_dur_secs, asset, bals);
        prop.app = app_def.map(|def| crate::channel::state::AppField {
            def,
            data: Vec::new(),
        });
        let proposal_id = prop.proposal_id()?;

        let deadline = self.timeout_cfg.propose_ch(challenge_dur_secs);
        let machine = match timeout(
            deadline,
            self.client.propose_channel(prop, peer.off_chain_addr, app),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                self.client.abandon_proposal_slot(proposal_id);
                return Err(Error::PeerNotResponding("channel proposal"));
            }
        };

        let ch = self.add_channel(machine, opening_bals.currency.clone(), parser, opening_bals.parts.clone(), peer.off_chain_addr);
        Ok(ch.get_info().await)
    }

    fn register_parts(&self, parts: &[Peer]) {
        for peer in parts {
            if peer.alias != OWN_ALIAS {
                self.client.register(peer.off_chain_addr, &peer.comm_addr);
            }
        }
    }

    /// Wraps a machine into a live [Channel] and adds it to the session.
    fn add_channel(
        &self,
        machine: Machine,
        currency: String,
        parser: Parser,
        parts: Vec<String>,
        peer: Identity,
    ) -> Arc<Channel> {
        let ch_id = machine.channel_id();
        let weak = self.weak_self.lock().clone();
        let on_close: self::channel::CloseHook = Box::new(move |notif: ChCloseNotif| {
            if let Some(session) = weak.upgrade() {
                session.on_channel_close(notif);
            }
        });

        let ch = Channel::new(
            machine,
            currency,
            parser,
            parts,
            self.timeout_cfg,
            Arc::clone(&self.client),
            peer,
            on_close,
        );
        self.shared.lock().chs.insert(ch_id, Arc::clone(&ch));
        ch
    }

    /// Removes a closed channel and fans the close notification out to the
    /// subscriber, caching it otherwise.
    fn on_channel_close(&self, notif: ChCloseNotif) {
        let mut shared = self.shared.lock();
        if let Some(ch_id) = Hash::from_hex(&notif.closing_info.channel_id) {
            shared.chs.remove(&ch_id);
        }
        match &shared.close_notifier {
            Some(notifier) => notifier(notif),
            None => {
                if shared.close_cache.len() == MAX_CACHED_NOTIFS {
                    warn!(session = %self.id, "close notification cache full, dropping oldest");
                    shared.close_cache.pop_front();
                }
                shared.close_cache.push_back(notif);
            }
        }
    }

    // ---- inbound proposals ---------------------------------------------

    /// Handles an inbound channel proposal: canonicalizes the alias list by
    /// reverse-looking-up each participant, rejects proposals from unknown
    /// peers outright, and surfaces a notification otherwise.
    async fn handle_proposal(&self, from: Identity, msg: ProposalMsg) {
        let expiry = now_secs() + self.timeout_cfg.response.as_secs() as i64;
        let proposal_id = match msg.proposal_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(session = %self.id, %e, "undigestible proposal");
                return;
            }
        };

        if !self.shared.lock().is_open {
            warn!(session = %self.id, "proposal arrived on a closed session");
            return;
        }

        // Aliases for [proposer, self]; the proposer must be a known peer.
        let proposer = match self.id_provider.read_by_off_chain_addr(&msg.participant) {
            Some(peer) => peer,
            None => {
                info!(session = %self.id, addr = %msg.participant.hex(), "proposal from unknown peer");
                self.client
                    .reject_proposal(from, proposal_id, "peer not found in session idProvider")
                    .await;
                return;
            }
        };
        let parts = vec![proposer.alias.clone(), OWN_ALIAS.to_string()];

        let currency = match self.registry.symbol(&msg.asset) {
            Some(symbol) => symbol,
            None => {
                info!(session = %self.id, asset = %msg.asset.hex(), "proposal for unknown asset");
                self.client
                    .reject_proposal(from, proposal_id, "unknown asset contract")
                    .await;
                return;
            }
        };
        let parser = match currency::parser(&currency) {
            Some(parser) => parser,
            None => {
                self.client
                    .reject_proposal(from, proposal_id, "unsupported currency")
                    .await;
                return;
            }
        };

        let app = match self.apps.resolve(msg.app.as_ref().map(|a| a.def)) {
            Some(app) => app,
            None => {
                self.client
                    .reject_proposal(from, proposal_id, "unknown app definition")
                    .await;
                return;
            }
        };

        let notif = ChProposalNotif {
            proposal_id: proposal_id.hex(),
            opening_bal_info: BalanceInfo {
                currency,
                parts: parts.clone(),
                bals: msg.init_bals.iter().map(|b| parser.format(*b)).collect(),
            },
            challenge_dur_secs: msg.challenge_duration,
            expiry,
        };
        let entry = ChProposalResponderEntry {
            proposal: msg,
            from,
            parts,
            app,
            parser,
            notif: notif.clone(),
        };

        let mut shared = self.shared.lock();
        shared.proposal_responders.insert(notif.proposal_id.clone(), entry);
        match &shared.proposal_notifier {
            Some(notifier) => notifier(notif),
            None => {
                if shared.proposal_cache.len() == MAX_CACHED_NOTIFS {
                    warn!(session = %self.id, "proposal notification cache full, dropping oldest");
                    shared.proposal_cache.pop_front();
                }
                shared.proposal_cache.push_back(notif);
            }
        }
    }

    /// At most one proposal subscriber; cached notifications are flushed in
    /// arrival order.
    pub fn sub_ch_proposals(&self, notifier: ChProposalNotifier) -> Result<()> {
        self.ensure_open()?;
        let mut shared = self.shared.lock();
        if shared.proposal_notifier.is_some() {
            return Err(Error::ResourceExists {
                kind: "subscription",
                id: self.id.clone(),
            });
        }
        for notif in shared.proposal_cache.drain(..) {
            notifier(notif);
        }
        shared.proposal_notifier = Some(notifier);
        Ok(())
    }

    pub fn unsub_ch_proposals(&self) -> Result<()> {
        self.ensure_open()?;
        if self.shared.lock().proposal_notifier.take().is_none() {
            return Err(Error::ResourceNotFound {
                kind: "subscription",
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    pub fn sub_ch_closes(&self, notifier: ChCloseNotifier) -> Result<()> {
        self.ensure_open()?;
        let mut shared = self.shared.lock();
        if shared.close_notifier.is_some() {
            return Err(Error::ResourceExists {
                kind: "subscription",
                id: self.id.clone(),
            });
        }
        for notif in shared.close_cache.drain(..) {
            notifier(notif);
        }
        shared.close_notifier = Some(notifier);
        Ok(())
    }

    pub fn unsub_ch_closes(&self) -> Result<()> {
        self.ensure_open()?;
        if self.shared.lock().close_notifier.take().is_none() {
            return Err(Error::ResourceNotFound {
                kind: "subscription",
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Responds to a pending proposal. Accepting runs the responder's half
    /// of the opening protocol and returns the new channel's info.
    pub async fn respond_ch_proposal(
        &self,
        proposal_id: &str,
        accept: bool,
    ) -> Result<Option<ChInfo>> {
        self.ensure_open()?;

        let entry = self
            .shared
            .lock()
            .proposal_responders
            .remove(proposal_id)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "proposal id",
                id: proposal_id.to_string(),
            })?;

        if entry.notif.expiry < now_secs() {
            info!(session = %self.id, proposal_id, "response after expiry");
            return Err(Error::TimedOut {
                operation: "responding to channel proposal".into(),
            });
        }

        if accept {
            let deadline = self
                .timeout_cfg
                .resp_ch_proposal_accept(entry.proposal.challenge_duration);
            let machine = match timeout(
                deadline,
                self.client.accept_proposal(&entry.proposal, entry.from, entry.app),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(Error::PeerNotResponding("channel proposal acceptance")),
            };

            let currency = entry.notif.opening_bal_info.currency.clone();
            let ch = self.add_channel(machine, currency, entry.parser, entry.parts, entry.from);
            Ok(Some(ch.get_info().await))
        } else {
            let deadline = self.timeout_cfg.resp_ch_proposal_reject();
            let id = entry
                .proposal
                .proposal_id()
                .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
            let _ = timeout(
                deadline,
                self.client.reject_proposal(entry.from, id, "rejected by user"),
            )
            .await;
            Ok(None)
        }
    }

    // ---- channel access -------------------------------------------------

    pub async fn get_chs_info(&self) -> Vec<ChInfo> {
        let chs: Vec<Arc<Channel>> = self.shared.lock().chs.values().cloned().collect();
        let mut infos = Vec::with_capacity(chs.len());
        for ch in chs {
            infos.push(ch.get_info().await);
        }
        infos
    }

    pub fn get_ch(&self, ch_id: &str) -> Result<Arc<Channel>> {
        let parsed = Hash::from_hex(ch_id);
        let shared = self.shared.lock();
        parsed
            .and_then(|id| shared.chs.get(&id).cloned())
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "channel id",
                id: ch_id.to_string(),
            })
    }

    // ---- closing --------------------------------------------------------

    /// Closes the session. Refuses without `force` while channels are open;
    /// with `force`, open channels are abandoned to their persisted state.
    /// Returns the channels that were open at close time.
    pub async fn close(&self, force: bool) -> Result<Vec<ChInfo>> {
        self.ensure_open()?;

        // Quiesce every channel before judging its phase. The session lock
        // is not held while acquiring channel locks.
        let chs: Vec<Arc<Channel>> = self.shared.lock().chs.values().cloned().collect();
        let mut guards = Vec::with_capacity(chs.len());
        for ch in &chs {
            guards.push(ch.lock_shared_owned().await);
        }

        let mut unexpected = Vec::new();
        let mut open_chs = Vec::new();
        for (ch, guard) in chs.iter().zip(&guards) {
            let phase = guard.phase();
            if phase != Phase::Acting && phase != Phase::Withdrawn {
                unexpected.push(ch.id_str());
            }
            if guard.status == ChStatus::Open {
                open_chs.push(ch.info_locked(guard));
            }
        }

        if !unexpected.is_empty() {
            drop(guards);
            error!(session = %self.id, ?unexpected, "channels in unexpected phase during session close");
            return Err(Error::ProtocolFatal(format!(
                "channels in unexpected phase during session close: {}",
                unexpected.join(", ")
            )));
        }
        if !force && !open_chs.is_empty() {
            drop(guards);
            return Err(Error::HasOpenChannels(open_chs));
        }

        self.shared.lock().is_open = false;
        drop(guards);

        self.user.lock_all();
        self.client.close().await;
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        info!(session = %self.id, "session closed");
        Ok(open_chs)
    }

    // ---- restore --------------------------------------------------------

    /// Restores persisted channels: only those in phase `Acting` whose
    /// peers all resolve in the ID provider are reattached; the rest are
    /// dropped with a log line. Parents are restored before their children.
    async fn restore_channels(&self) -> Result<()> {
        let records: Vec<StoredChannel> = self
            .client
            .store()
            .enumerate()
            .collect::<std::result::Result<_, _>>()?;

        // Children may be enumerated before their parents; keep deferring
        // until a pass makes no progress.
        let mut restored: std::collections::HashSet<Hash> = std::collections::HashSet::new();
        let mut pending: Vec<StoredChannel> = records;
        loop {
            let mut deferred = Vec::new();
            let mut progress = false;
            for record in pending {
                let ch_id = record.current.state.channel_id();
                match record.parent {
                    Some(parent) if !restored.contains(&parent) => {
                        deferred.push(record);
                        continue;
                    }
                    _ => {}
                }
                progress = true;
                if self.restore_one(record).await {
                    restored.insert(ch_id);
                }
            }
            if deferred.is_empty() || !progress {
                for record in &deferred {
                    debug!(
                        session = %self.id,
                        channel = %record.current.state.channel_id().hex(),
                        "dropping channel with unrestored parent"
                    );
                }
                break;
            }
            pending = deferred;
        }
        Ok(())
    }

    /// Restores a single record; returns whether it was reattached.
    async fn restore_one(&self, record: StoredChannel) -> bool {
        let ch_id = record.current.state.channel_id();
        debug!(session = %self.id, channel = %ch_id.hex(), phase = %record.phase, "found channel in persistence");

        if record.phase != Phase::Acting {
            info!(session = %self.id, channel = %ch_id.hex(), phase = %record.phase, "not restoring channel outside acting phase");
            return false;
        }

        let mut parts = Vec::with_capacity(record.params.participants.len());
        let mut peer_addr = None;
        for addr in &record.params.participants {
            if *addr == self.user.peer.off_chain_addr {
                parts.push(OWN_ALIAS.to_string());
                continue;
            }
            match self.id_provider.read_by_off_chain_addr(addr) {
                Some(peer) => {
                    self.client.register(peer.off_chain_addr, &peer.comm_addr);
                    peer_addr = Some(peer.off_chain_addr);
                    parts.push(peer.alias);
                }
                None => {
                    info!(
                        session = %self.id,
                        channel = %ch_id.hex(),
                        addr = %addr.hex(),
                        "unknown peer address in persisted channel, will not be restored"
                    );
                    return false;
                }
            }
        }
        let Some(peer_addr) = peer_addr else {
            return false;
        };

        let Some(app) = self.apps.resolve(record.params.app_def) else {
            info!(session = %self.id, channel = %ch_id.hex(), "unknown app in persisted channel, will not be restored");
            return false;
        };

        let asset = record.current.state.allocation.asset;
        let Some(currency) = self.registry.symbol(&asset) else {
            info!(session = %self.id, channel = %ch_id.hex(), "unknown asset in persisted channel, will not be restored");
            return false;
        };
        let Some(parser) = currency::parser(&currency) else {
            return false;
        };

        // A staging transaction from before the crash can never complete;
        // the peer gave up on it when its response window expired.
        if record.staging.is_some() {
            info!(session = %self.id, channel = %ch_id.hex(), "dropping in-flight staging transaction from before restart");
            if let Err(e) = self.client.store().drop_staging(&ch_id) {
                warn!(session = %self.id, channel = %ch_id.hex(), %e, "clearing stale staging failed");
            }
        }
        let machine = Machine::restore(
            record.params,
            record.own_idx,
            app,
            record.phase,
            record.current,
            None,
        );
        let ch = self.add_channel(machine, currency, parser, parts, peer_addr);
        ch.send_sync().await;
        debug!(session = %self.id, channel = %ch_id.hex(), "restored channel from persistence");
        true
    }

    // ---- event dispatch -------------------------------------------------

    /// Consumes client events; every handler runs on its own task so the
    /// loop (and with it the bus) can never be wedged by a single channel.
    fn spawn_event_loop(session: &Arc<Self>, mut events: mpsc::Receiver<ClientEvent>) {
        let weak = Arc::downgrade(session);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else { break };
                match event {
                    ClientEvent::Proposal { from, msg } => {
                        tokio::spawn(async move {
                            session.handle_proposal(from, msg).await;
                        });
                    }
                    ClientEvent::Update { from, msg } => {
                        let ch = session.find_channel(msg.state.channel_id());
                        match ch {
                            Some(ch) => {
                                tokio::spawn(async move {
                                    ch.handle_update(from, msg).await;
                                });
                            }
                            None => {
                                info!(
                                    session = %session.id,
                                    channel = %msg.state.channel_id().hex(),
                                    "update for unknown channel"
                                );
                                let client = Arc::clone(&session.client);
                                tokio::spawn(async move {
                                    let rej = UpdateRejMsg {
                                        channel_id: msg.state.channel_id(),
                                        version: msg.state.version(),
                                        reason: "unknown channel for this session".into(),
                                    };
                                    if let Err(e) =
                                        client.send(&from, Frame::ChannelUpdateRej(rej)).await
                                    {
                                        debug!(%e, "rejecting update for unknown channel failed");
                                    }
                                });
                            }
                        }
                    }
                    ClientEvent::Sync { from: _, msg } => {
                        if let Some(ch) = session.find_channel(msg.channel_id) {
                            tokio::spawn(async move {
                                ch.handle_sync(msg).await;
                            });
                        }
                    }
                }
            }
        });
        *session.event_task.lock() = Some(task);
    }

    fn find_channel(&self, ch_id: Hash) -> Option<Arc<Channel>> {
        self.shared.lock().chs.get(&ch_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bal_info(parts: &[&str], bals: &[&str]) -> BalanceInfo {
        BalanceInfo {
            currency: currency::ETH.into(),
            parts: parts.iter().map(|s| s.to_string()).collect(),
            bals: bals.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn canonicalized_moves_self_to_front() {
        let input = bal_info(&["bob", "self"], &["1.0", "2.0"]);
        let out = canonicalized(&input);
        assert_eq!(out.parts, vec!["self", "bob"]);
        assert_eq!(out.bals, vec!["2.0", "1.0"]);
        // Pure: the input is untouched.
        assert_eq!(input.parts, vec!["bob", "self"]);
    }

    #[test]
    fn canonicalized_without_self_is_identity() {
        let input = bal_info(&["alice", "bob"], &["1", "2"]);
        assert_eq!(canonicalized(&input), input);
    }

    #[test]
    fn canonicalized_self_already_first() {
        let input = bal_info(&["self", "bob"], &["1", "2"]);
        assert_eq!(canonicalized(&input), input);
    }

    #[test]
    fn session_ids_are_distinct_per_call() {
        let addr = Address([7; 20]);
        let a = calc_session_id(&addr);
        let b = calc_session_id(&addr);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn retrieve_parts_reports_missing_and_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let provider = IdProvider::new(dir.path().join("peers.yaml")).unwrap();
        provider
            .write(
                OWN_ALIAS,
                Peer {
                    alias: OWN_ALIAS.into(),
                    off_chain_addr: Address([1; 20]),
                    comm_type: "tcp".into(),
                    comm_addr: "127.0.0.1:5751".into(),
                },
            )
            .unwrap();
        provider
            .write(
                "bob",
                Peer {
                    alias: "bob".into(),
                    off_chain_addr: Address([2; 20]),
                    comm_type: "tcp".into(),
                    comm_addr: "127.0.0.1:5752".into(),
                },
            )
            .unwrap();

        let parts =
            retrieve_parts(&[OWN_ALIAS.to_string(), "bob".to_string()], &provider).unwrap();
        assert_eq!(parts.len(), 2);

        let err = retrieve_parts(&[OWN_ALIAS.to_string(), "carol".to_string()], &provider)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceNotFound { kind: "peer alias", ref id } if id == "carol"
        ));

        let err = retrieve_parts(
            &[OWN_ALIAS.to_string(), "bob".to_string(), "bob".to_string()],
            &provider,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceExists { kind: "peer alias", ref id } if id == "bob"
        ));

        let err = retrieve_parts(&["bob".to_string()], &provider).unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceNotFound { kind: "self entry in aliases", .. }
        ));
    }

    #[test]
    fn timeout_composition() {
        let cfg = TimeoutConfig {
            on_chain_tx: Duration::from_secs(10),
            response: Duration::from_secs(5),
        };
        assert_eq!(cfg.propose_ch(7), Duration::from_secs(10 + 10 + 7 + 5));
        assert_eq!(
            cfg.resp_ch_proposal_accept(7),
            Duration::from_secs(10 + 5 + 7 + 5)
        );
        assert_eq!(cfg.resp_ch_proposal_reject(), Duration::from_secs(5));
        assert_eq!(cfg.ch_update(7), Duration::from_secs(10 + 7 + 5));
        assert_eq!(cfg.close_ch(7), Duration::from_secs(10 + 5 + 7 + 5));
    }
}
