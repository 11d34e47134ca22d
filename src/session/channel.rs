//! A live payment channel inside a session.
//!
//! Wraps the state machine with peer I/O: sending and responding to
//! updates, the update-notification subscription, cooperative close and the
//! dispute path, plus the background watcher for adjudicator events. All
//! operations serialize on the channel's own mutex, which is held for the
//! duration of the call including peer I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{BalanceInfo, ChInfo, TimeoutConfig};
use crate::chain::{AdjudicatorEvent, AdjudicatorReq};
use crate::channel::machine::{Machine, Phase};
use crate::channel::PartIdx;
use crate::client::ChClient;
use crate::codec::types::Hash;
use crate::currency::Parser;
use crate::error::{Error, Result};
use crate::wire::messages::{SyncMsg, UpdateAccMsg, UpdateMsg, UpdateRejMsg};
use crate::persistence::TxSlot;
use crate::wire::{Frame, Identity};

/// Most cached update notifications per channel; beyond this the oldest is
/// dropped.
const MAX_CACHED_NOTIFS: usize = 128;

/// Notification about an inbound channel update awaiting a response.
#[derive(Debug, Clone)]
pub struct ChUpdateNotif {
    pub update_id: String,
    pub current_bal_info: BalanceInfo,
    pub proposed_bal_info: BalanceInfo,
    pub is_final: bool,
    /// Unix seconds after which responding is futile.
    pub expiry: i64,
}

/// Notification that a channel reached its end of life.
#[derive(Debug, Clone)]
pub struct ChCloseNotif {
    pub closing_info: ChInfo,
    pub error: Option<String>,
}

pub type ChUpdateNotifier = Box<dyn Fn(ChUpdateNotif) + Send + Sync>;

/// Invoked exactly once when the channel closes, cooperatively or through a
/// dispute. The session uses it to drop the channel and fan out the close
/// notification.
pub type CloseHook = Box<dyn Fn(ChCloseNotif) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChStatus {
    Open,
    Closed,
}

struct UpdateResponderEntry {
    update: UpdateMsg,
    peer: Identity,
    expiry: i64,
}

pub(crate) struct ChannelShared {
    pub(crate) machine: Machine,
    pub(crate) status: ChStatus,
    update_notifier: Option<ChUpdateNotifier>,
    update_cache: VecDeque<ChUpdateNotif>,
    responders: HashMap<String, UpdateResponderEntry>,
}

impl ChannelShared {
    pub(crate) fn phase(&self) -> Phase {
        self.machine.phase()
    }

    /// Live dispatch if a subscriber is attached, bounded caching otherwise.
    fn notify(&mut self, id: &Hash, notif: ChUpdateNotif) {
        match &self.update_notifier {
            Some(notifier) => notifier(notif),
            None => {
                if self.update_cache.len() == MAX_CACHED_NOTIFS {
                    warn!(channel = %id.hex(), "update notification cache full, dropping oldest");
                    self.update_cache.pop_front();
                }
                self.update_cache.push_back(notif);
            }
        }
    }
}

pub struct Channel {
    id: Hash,
    currency: String,
    parser: Parser,
    /// Peer aliases, index-aligned with the channel participants.
    parts: Vec<String>,
    challenge_dur_secs: u64,
    timeout_cfg: TimeoutConfig,
    client: Arc<ChClient>,
    peer: Identity,
    on_close: CloseHook,
    shared: Arc<Mutex<ChannelShared>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("parts", &self.parts)
            .finish_non_exhaustive()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Update IDs combine channel and version so they stay unique per session.
fn update_id(ch_id: &Hash, version: u64) -> String {
    format!("{}_{}", ch_id.hex(), version)
}

impl Channel {
    pub(crate) fn new(
        machine: Machine,
        currency: String,
        parser: Parser,
        parts: Vec<String>,
        timeout_cfg: TimeoutConfig,
        client: Arc<ChClient>,
        peer: Identity,
        on_close: CloseHook,
    ) -> Arc<Self> {
        let id = machine.channel_id();
        let challenge_dur_secs = machine.params().challenge_duration;
        let channel = Arc::new(Channel {
            id,
            currency,
            parser,
            parts,
            challenge_dur_secs,
            timeout_cfg,
            client,
            peer,
            on_close,
            shared: Arc::new(Mutex::new(ChannelShared {
                machine,
                status: ChStatus::Open,
                update_notifier: None,
                update_cache: VecDeque::new(),
                responders: HashMap::new(),
            })),
        });
        Self::spawn_watcher(&channel);
        channel
    }

    pub fn id(&self) -> Hash {
        self.id
    }

    pub fn id_str(&self) -> String {
        self.id.hex()
    }

    pub(crate) async fn lock_shared_owned(&self) -> OwnedMutexGuard<ChannelShared> {
        Arc::clone(&self.shared).lock_owned().await
    }

    fn bal_info(&self, balances: &[crate::codec::types::U256]) -> BalanceInfo {
        BalanceInfo {
            currency: self.currency.clone(),
            parts: self.parts.clone(),
            bals: balances.iter().map(|b| self.parser.format(*b)).collect(),
        }
    }

    pub(crate) fn info_locked(&self, shared: &ChannelShared) -> ChInfo {
        ChInfo {
            channel_id: self.id.hex(),
            bal_info: self.bal_info(&shared.machine.current().state.allocation.balances),
            version: shared.machine.version(),
        }
    }

    pub async fn get_info(&self) -> ChInfo {
        let shared = self.shared.lock().await;
        self.info_locked(&shared)
    }

    /// BalanceInfo view of the committed allocation.
    pub async fn get_balance_info(&self) -> BalanceInfo {
        let shared = self.shared.lock().await;
        self.bal_info(&shared.machine.current().state.allocation.balances)
    }

    /// Proposes paying `amount` to `payee_alias` and waits for the peer's
    /// signature. On success the new state is committed on both sides.
    pub async fn send_update(&self, payee_alias: &str, amount: &str) -> Result<ChInfo> {
        let mut shared = self.shared.lock().await;
        self.ensure_open(&shared)?;

        let payee = self
            .parts
            .iter()
            .position(|alias| alias == payee_alias)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "peer alias",
                id: payee_alias.to_string(),
            })?;
        let amount = self
            .parser
            .parse(amount)
            .map_err(|e| Error::InvalidArgument {
                name: "amount",
                value: e.to_string(),
            })?;

        let own_idx = shared.machine.own_idx();
        let mut next = shared.machine.current().state.make_next_state();
        next.allocation
            .transfer(own_idx, payee, amount)
            .map_err(|e| Error::InvalidArgument {
                name: "amount",
                value: e.to_string(),
            })?;

        self.propose_state(&mut shared, next).await?;
        Ok(self.info_locked(&shared))
    }

    /// Runs one proposer-side update round: stage, sign, send, await the
    /// peer's signature, commit.
    async fn propose_state(
        &self,
        shared: &mut ChannelShared,
        next: crate::channel::state::State,
    ) -> Result<()> {
        let own_idx = shared.machine.own_idx();
        let version = next.version();

        shared
            .machine
            .stage(next, own_idx)
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        let sig = shared
            .machine
            .sign_staging(self.client.account().as_ref())
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;

        let staging = shared.machine.staging().expect("just staged");
        self.client
            .store()
            .put_transaction(&self.id, staging, TxSlot::Staging)?;
        let state = staging.state.clone();

        let reply = self.client.expect_update_acc(self.id, version);
        self.client
            .send(
                &self.peer,
                Frame::ChannelUpdate(UpdateMsg {
                    state,
                    actor_idx: own_idx as u16,
                    sig,
                }),
            )
            .await?;

        let deadline = self.timeout_cfg.ch_update(self.challenge_dur_secs);
        let reply = match timeout(deadline, reply).await {
            Ok(reply) => ChClient::recv_update_reply(reply).await?,
            Err(_) => {
                self.client.abandon_update_slot(self.id, version);
                self.discard_staging(shared)?;
                return Err(Error::PeerNotResponding("channel update"));
            }
        };

        match reply {
            Ok(acc) => match self.commit_accepted(shared, 1 - own_idx, acc) {
                Ok(()) => Ok(()),
                // The peer acknowledged with something we cannot verify;
                // this channel is no longer safe to use.
                Err(e) => Err(self.fault(shared, e.to_string())),
            },
            Err(reason) => {
                self.discard_staging(shared)?;
                Err(Error::PeerRejected { reason })
            }
        }
    }

    /// Terminates a channel whose peer violated the protocol. Faults only
    /// this channel, never the session.
    fn fault(&self, shared: &mut ChannelShared, reason: String) -> Error {
        warn!(channel = %self.id.hex(), %reason, "channel faulted");
        self.finish_close(shared, Some(reason.clone()));
        Error::ProtocolFatal(reason)
    }

    fn commit_accepted(
        &self,
        shared: &mut ChannelShared,
        signer_idx: PartIdx,
        acc: UpdateAccMsg,
    ) -> Result<()> {
        shared
            .machine
            .add_staging_sig(signer_idx, acc.sig)
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        let committed = shared
            .machine
            .commit_staging()
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        self.client
            .store()
            .put_transaction(&self.id, committed, TxSlot::Current)?;
        debug!(channel = %self.id.hex(), version = shared.machine.version(), "update committed");
        Ok(())
    }

    fn discard_staging(&self, shared: &mut ChannelShared) -> Result<()> {
        shared.machine.discard_staging();
        self.client.store().drop_staging(&self.id)?;
        Ok(())
    }

    /// Handles an inbound update from the peer: validates the transition,
    /// stores a responder keyed by update ID, surfaces a notification.
    /// Invalid updates are rejected immediately and never surface.
    pub async fn handle_update(&self, from: Identity, msg: UpdateMsg) {
        let expiry = now_secs() + self.timeout_cfg.response.as_secs() as i64;
        let mut shared = self.shared.lock().await;

        if shared.status != ChStatus::Open {
            self.reject_update(&from, &msg, "channel is closed").await;
            return;
        }

        let actor = msg.actor_idx as PartIdx;
        let current_bals = shared.machine.current().state.allocation.balances.clone();
        if let Err(e) = shared.machine.stage(msg.state.clone(), actor) {
            info!(channel = %self.id.hex(), %e, "rejecting invalid inbound update");
            self.reject_update(&from, &msg, &e.to_string()).await;
            return;
        }
        if let Err(e) = shared.machine.add_staging_sig(actor, msg.sig) {
            info!(channel = %self.id.hex(), %e, "rejecting inbound update with bad signature");
            shared.machine.discard_staging();
            self.reject_update(&from, &msg, &e.to_string()).await;
            return;
        }
        if let Err(e) = self
            .client
            .store()
            .put_transaction(&self.id, shared.machine.staging().expect("just staged"), TxSlot::Staging)
        {
            warn!(channel = %self.id.hex(), %e, "persisting staging transaction failed");
        }

        let id = update_id(&self.id, msg.state.version());
        let notif = ChUpdateNotif {
            update_id: id.clone(),
            current_bal_info: self.bal_info(&current_bals),
            proposed_bal_info: self.bal_info(&msg.state.allocation.balances),
            is_final: msg.state.is_final,
            expiry,
        };
        shared.responders.insert(
            id,
            UpdateResponderEntry {
                update: msg,
                peer: from,
                expiry,
            },
        );
        shared.notify(&self.id, notif);
    }

    async fn reject_update(&self, peer: &Identity, msg: &UpdateMsg, reason: &str) {
        let rej = UpdateRejMsg {
            channel_id: msg.state.channel_id(),
            version: msg.state.version(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.client.send(peer, Frame::ChannelUpdateRej(rej)).await {
            warn!(channel = %self.id.hex(), %e, "sending update rejection failed");
        }
    }

    /// Accepts or rejects a pending inbound update. Expired updates can no
    /// longer be accepted.
    pub async fn respond_update(&self, update_id: &str, accept: bool) -> Result<ChInfo> {
        let mut shared = self.shared.lock().await;
        self.ensure_open(&shared)?;

        let entry = shared
            .responders
            .remove(update_id)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "update id",
                id: update_id.to_string(),
            })?;
        if entry.expiry < now_secs() {
            self.discard_staging(&mut shared)?;
            return Err(Error::TimedOut {
                operation: "responding to channel update".into(),
            });
        }

        if accept {
            let sig = shared
                .machine
                .sign_staging(self.client.account().as_ref())
                .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
            let committed = shared
                .machine
                .commit_staging()
                .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
            self.client
                .store()
                .put_transaction(&self.id, committed, TxSlot::Current)?;

            let was_final = shared.machine.current().state.is_final;
            self.client
                .send(
                    &entry.peer,
                    Frame::ChannelUpdateAcc(UpdateAccMsg {
                        channel_id: self.id,
                        version: entry.update.state.version(),
                        sig,
                    }),
                )
                .await?;

            // A co-signed final state means the peer is settling; our side
            // of the settlement happens in the watcher once the peer
            // registers, so only report the committed state here.
            if was_final {
                debug!(channel = %self.id.hex(), "final state co-signed");
            }
            Ok(self.info_locked(&shared))
        } else {
            self.discard_staging(&mut shared)?;
            let rej = UpdateRejMsg {
                channel_id: self.id,
                version: entry.update.state.version(),
                reason: "rejected by user".into(),
            };
            self.client
                .send(&entry.peer, Frame::ChannelUpdateRej(rej))
                .await?;
            Ok(self.info_locked(&shared))
        }
    }

    /// At most one update subscriber; cached notifications are flushed in
    /// arrival order.
    pub async fn subscribe_updates(&self, notifier: ChUpdateNotifier) -> Result<()> {
        let mut shared = self.shared.lock().await;
        self.ensure_open(&shared)?;
        if shared.update_notifier.is_some() {
            return Err(Error::ResourceExists {
                kind: "subscription",
                id: self.id.hex(),
            });
        }
        for notif in shared.update_cache.drain(..) {
            notifier(notif);
        }
        shared.update_notifier = Some(notifier);
        Ok(())
    }

    pub async fn unsubscribe_updates(&self) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.update_notifier.take().is_none() {
            return Err(Error::ResourceNotFound {
                kind: "subscription",
                id: self.id.hex(),
            });
        }
        Ok(())
    }

    /// Closes the channel: proposes a final state; if the peer co-signs,
    /// settles it, otherwise registers the latest signed state and waits
    /// out the challenge period. Ends in phase `Withdrawn` either way.
    pub async fn close(&self) -> Result<ChInfo> {
        let mut shared = self.shared.lock().await;
        self.ensure_open(&shared)?;
        if shared.machine.phase() != Phase::Acting {
            return Err(Error::ProtocolFatal(format!(
                "cannot close channel in phase {}",
                shared.machine.phase()
            )));
        }

        let mut final_state = shared.machine.current().state.make_next_state();
        final_state.is_final = true;

        match self.propose_state(&mut shared, final_state).await {
            Ok(()) => {}
            Err(Error::PeerRejected { reason }) => {
                info!(channel = %self.id.hex(), %reason, "peer refused final state, settling with latest signed state");
            }
            Err(Error::PeerNotResponding(_)) => {
                info!(channel = %self.id.hex(), "peer silent on final state, settling with latest signed state");
            }
            Err(e) => return Err(e),
        }

        self.settle(&mut shared).await?;
        let info = self.info_locked(&shared);
        self.finish_close(&mut shared, None);
        Ok(info)
    }

    /// Registers the latest signed state, waits out the challenge period
    /// and withdraws.
    async fn settle(&self, shared: &mut ChannelShared) -> Result<()> {
        let req = AdjudicatorReq {
            params: shared.machine.params().clone(),
            tx: shared.machine.current().clone(),
            idx: shared.machine.own_idx(),
        };

        // Enter the register phases only once the call went through, so a
        // chain failure leaves the channel in `Acting` and usable.
        self.client.chain().register(req.clone()).await?;
        shared
            .machine
            .set_phase(Phase::Registering)
            .and_then(|_| shared.machine.set_phase(Phase::Registered))
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;

        // The adjudicator only releases funds once the challenge duration
        // has elapsed, co-signed final states included.
        tokio::time::sleep(Duration::from_secs(self.challenge_dur_secs)).await;

        shared
            .machine
            .set_phase(Phase::Withdrawing)
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        self.client.chain().withdraw(req).await?;
        shared
            .machine
            .set_phase(Phase::Withdrawn)
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        self.client.store().put_phase(&self.id, Phase::Withdrawn)?;
        info!(channel = %self.id.hex(), "channel withdrawn");
        Ok(())
    }

    /// Marks the channel closed and fires the close hook exactly once.
    fn finish_close(&self, shared: &mut ChannelShared, error: Option<String>) {
        if shared.status == ChStatus::Closed {
            return;
        }
        shared.status = ChStatus::Closed;
        (self.on_close)(ChCloseNotif {
            closing_info: self.info_locked(shared),
            error,
        });
    }

    /// Adopts a newer fully signed transaction offered during post-restart
    /// sync.
    pub async fn handle_sync(&self, msg: SyncMsg) {
        let mut shared = self.shared.lock().await;
        match shared.machine.adopt_synced(msg.current) {
            Ok(true) => {
                let current = shared.machine.current().clone();
                if let Err(e) = self
                    .client
                    .store()
                    .put_transaction(&self.id, &current, TxSlot::Current)
                {
                    warn!(channel = %self.id.hex(), %e, "persisting synced transaction failed");
                }
                info!(channel = %self.id.hex(), version = shared.machine.version(), "adopted synced state");
            }
            Ok(false) => {}
            Err(e) => warn!(channel = %self.id.hex(), %e, "rejecting channel sync"),
        }
    }

    /// Sends our latest transaction to the peer after a restart.
    pub async fn send_sync(&self) {
        let current = {
            let shared = self.shared.lock().await;
            shared.machine.current().clone()
        };
        let msg = SyncMsg {
            channel_id: self.id,
            current,
        };
        if let Err(e) = self.client.send(&self.peer, Frame::ChannelSync(msg)).await {
            debug!(channel = %self.id.hex(), %e, "channel sync send failed");
        }
    }

    fn ensure_open(&self, shared: &ChannelShared) -> Result<()> {
        if shared.status != ChStatus::Open {
            return Err(Error::ResourceNotFound {
                kind: "channel",
                id: self.id.hex(),
            });
        }
        Ok(())
    }

    /// Watches adjudicator events while the channel lives. A registered
    /// event starts settlement: our latest state is published if it is
    /// newer, the challenge period is waited out while on-chain
    /// progressions are adopted, then the funds are withdrawn.
    fn spawn_watcher(channel: &Arc<Self>) {
        let mut events = channel.client.chain().subscribe(channel.id);
        let challenge = Duration::from_secs(channel.challenge_dur_secs);
        let channel = Arc::downgrade(channel);
        tokio::spawn(async move {
            // Wait for a dispute to reach the chain.
            let registered_version = loop {
                match events.recv().await {
                    Some(AdjudicatorEvent::Registered { version, .. }) => break version,
                    Some(AdjudicatorEvent::Progressed { .. }) => {}
                    None => return,
                }
            };
            {
                let Some(channel) = channel.upgrade() else { return };
                if !channel.on_registered(registered_version).await {
                    return;
                }
            }

            // Challenge period: the registered state can still be
            // progressed on-chain; each progression updates the machine.
            let deadline = tokio::time::sleep(challenge);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.recv() => match event {
                        Some(AdjudicatorEvent::Progressed { state, .. }) => {
                            let Some(channel) = channel.upgrade() else { return };
                            channel.on_progressed(state).await;
                        }
                        Some(AdjudicatorEvent::Registered { .. }) => {}
                        None => {
                            deadline.as_mut().await;
                            break;
                        }
                    },
                }
            }

            let Some(channel) = channel.upgrade() else { return };
            channel.withdraw_settled().await;
        });
    }

    /// Reacts to a state reaching the adjudicator: publishes our own state
    /// when it is newer than the registered one and enters the registered
    /// phases. Returns whether this watcher carries the settlement through;
    /// a channel that is already settling itself (or closed) declines.
    async fn on_registered(&self, registered_version: u64) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.status != ChStatus::Open || shared.machine.phase() != Phase::Acting {
            return false;
        }
        info!(
            channel = %self.id.hex(),
            registered_version,
            "peer registered a state, settling"
        );

        let result = async {
            if shared.machine.version() > registered_version {
                // Publish our newer state before the challenge runs out.
                self.client
                    .chain()
                    .register(AdjudicatorReq {
                        params: shared.machine.params().clone(),
                        tx: shared.machine.current().clone(),
                        idx: shared.machine.own_idx(),
                    })
                    .await?;
            }
            shared
                .machine
                .set_phase(Phase::Registering)
                .and_then(|_| shared.machine.set_phase(Phase::Registered))
                .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.id.hex(), %e, "entering dispute failed");
                self.finish_close(&mut shared, Some(e.to_string()));
                false
            }
        }
    }

    /// Adopts a state the adjudicator progressed on-chain, advancing the
    /// machine's version and phase.
    async fn on_progressed(&self, state: crate::channel::state::State) {
        let mut shared = self.shared.lock().await;
        if shared.status != ChStatus::Open {
            return;
        }
        match shared.machine.adopt_progressed(state) {
            Ok(true) => {
                let current = shared.machine.current().clone();
                if let Err(e) = self
                    .client
                    .store()
                    .put_transaction(&self.id, &current, TxSlot::Current)
                {
                    warn!(channel = %self.id.hex(), %e, "persisting progressed state failed");
                }
                info!(
                    channel = %self.id.hex(),
                    version = shared.machine.version(),
                    "dispute progressed on-chain"
                );
            }
            Ok(false) => {}
            Err(e) => warn!(channel = %self.id.hex(), %e, "ignoring invalid progression event"),
        }
    }

    /// Withdraws once the challenge period has elapsed and closes the
    /// channel.
    async fn withdraw_settled(&self) {
        let mut shared = self.shared.lock().await;
        if shared.status != ChStatus::Open {
            return;
        }

        let result = async {
            shared
                .machine
                .set_phase(Phase::Withdrawing)
                .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
            self.client
                .chain()
                .withdraw(AdjudicatorReq {
                    params: shared.machine.params().clone(),
                    tx: shared.machine.current().clone(),
                    idx: shared.machine.own_idx(),
                })
                .await?;
            shared
                .machine
                .set_phase(Phase::Withdrawn)
                .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
            self.client.store().put_phase(&self.id, Phase::Withdrawn)?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(channel = %self.id.hex(), "channel withdrawn");
                self.finish_close(&mut shared, None);
            }
            Err(e) => {
                warn!(channel = %self.id.hex(), %e, "withdrawing after dispute failed");
                self.finish_close(&mut shared, Some(e.to_string()));
            }
        }
    }
}
