//! The off-chain channel client.
//!
//! [ChClient] owns the bus, the chain backend, the off-chain signing
//! account and the persistence store for one session. A dispatch task turns
//! inbound frames into typed events for the session (proposals, updates,
//! sync) or into replies for a pending request; request/response pairs are
//! matched through reply slots keyed by proposal ID or channel ID and
//! version. Handlers never call back into the bus from the dispatch task
//! itself, so a slow peer cannot wedge the loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::chain::{ChainBackend, FundingReq};
use crate::channel::app::App;
use crate::channel::machine::{Machine, Phase};
use crate::channel::state::{Allocation, Params, State};
use crate::channel::PartIdx;
use crate::codec::types::{Hash, NonceShare, U256};
use crate::error::{Error, Result};
use crate::wire::messages::{ProposalAccMsg, ProposalMsg, ProposalRejMsg, SyncMsg, UpdateAccMsg};
use crate::persistence::{Store, TxSlot};
use crate::wallet::Account;
use crate::wire::{Bus, Frame, Identity, Inbound};

/// Capacity of the typed event queue towards the session.
const EVENT_QUEUE_CAPACITY: usize = 32;

/// Acknowledgements kept around when they arrive before the matching reply
/// slot was registered (both sides sign the initial state concurrently).
const MAX_STRAY_ACKS: usize = 64;

/// Inbound protocol events the session consumes.
#[derive(Debug)]
pub enum ClientEvent {
    Proposal { from: Identity, msg: ProposalMsg },
    Update { from: Identity, msg: crate::wire::messages::UpdateMsg },
    Sync { from: Identity, msg: SyncMsg },
}

type ProposalReply = std::result::Result<ProposalAccMsg, String>;
type UpdateReply = std::result::Result<UpdateAccMsg, String>;

#[derive(Default)]
struct Pending {
    proposals: HashMap<Hash, oneshot::Sender<ProposalReply>>,
    updates: HashMap<(Hash, u64), oneshot::Sender<UpdateReply>>,
    stray_acks: HashMap<(Hash, u64), UpdateAccMsg>,
}

pub struct ChClient {
    bus: Arc<dyn Bus>,
    chain: Arc<dyn ChainBackend>,
    account: Arc<dyn Account>,
    store: Arc<Store>,
    pending: Mutex<Pending>,
    shutdown_tx: watch::Sender<bool>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChClient")
            .field("account", &self.account.address())
            .finish_non_exhaustive()
    }
}

impl ChClient {
    /// Wires the client to a bus and starts the dispatch task. Returns the
    /// client and the event stream the session must consume.
    pub fn new(
        bus: Arc<dyn Bus>,
        incoming: mpsc::Receiver<Inbound>,
        chain: Arc<dyn ChainBackend>,
        account: Arc<dyn Account>,
        store: Arc<Store>,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = Arc::new(ChClient {
            bus,
            chain,
            account,
            store,
            pending: Mutex::new(Pending::default()),
            shutdown_tx,
            dispatch_task: Mutex::new(None),
        });

        // The dispatch task only holds a weak handle; when the session and
        // its channels go away, the client (and with it the store) is
        // released even if the task is still parked on the bus.
        let task = tokio::spawn(Self::dispatch(
            Arc::downgrade(&client),
            incoming,
            events_tx,
            shutdown_rx,
        ));
        *client.dispatch_task.lock() = Some(task);

        (client, events_rx)
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn chain(&self) -> &Arc<dyn ChainBackend> {
        &self.chain
    }

    pub fn account(&self) -> &Arc<dyn Account> {
        &self.account
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn register(&self, off_chain_addr: Identity, comm_addr: &str) {
        self.bus.register(off_chain_addr, comm_addr);
    }

    /// Routes inbound frames until the bus closes or shutdown is signalled.
    async fn dispatch(
        client: std::sync::Weak<ChClient>,
        mut incoming: mpsc::Receiver<Inbound>,
        events: mpsc::Sender<ClientEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.changed() => break,
                inbound = incoming.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            let Some(client) = client.upgrade() else { break };
            let Inbound { from, frame } = inbound;
            trace!(?from, frame_type = frame.frame_type(), "inbound frame");

            match frame {
                Frame::Ping { .. } => {
                    // Reply off the dispatch task so a blocked peer cannot
                    // stall frame routing.
                    let bus = Arc::clone(&client.bus);
                    tokio::spawn(async move {
                        if let Err(e) = bus.send(&from, Frame::pong()).await {
                            debug!(?from, %e, "pong failed");
                        }
                    });
                }
                Frame::Pong { created_ns } => {
                    trace!(?from, created_ns, "pong");
                }
                Frame::Shutdown { reason } => {
                    info!(?from, %reason, "peer shut down connection");
                }
                Frame::ChannelProposal(msg) => {
                    if events
                        .send(ClientEvent::Proposal { from, msg })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Frame::ChannelProposalAcc(msg) => {
                    client.fulfill_proposal(msg.proposal_id, Ok(msg));
                }
                Frame::ChannelProposalRej(msg) => {
                    client.fulfill_proposal(msg.proposal_id, Err(msg.reason));
                }
                Frame::ChannelUpdate(msg) => {
                    if events.send(ClientEvent::Update { from, msg }).await.is_err() {
                        break;
                    }
                }
                Frame::ChannelUpdateAcc(msg) => {
                    client.fulfill_update((msg.channel_id, msg.version), Ok(msg));
                }
                Frame::ChannelUpdateRej(msg) => {
                    client.fulfill_update((msg.channel_id, msg.version), Err(msg.reason));
                }
                Frame::ChannelSync(msg) => {
                    if events.send(ClientEvent::Sync { from, msg }).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("dispatch loop ended");
    }

    fn fulfill_proposal(&self, id: Hash, reply: ProposalReply) {
        let slot = self.pending.lock().proposals.remove(&id);
        match slot {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(proposal = %id.hex(), "proposal reply arrived after caller gave up");
                }
            }
            None => warn!(proposal = %id.hex(), "reply for unknown proposal"),
        }
    }

    fn fulfill_update(&self, key: (Hash, u64), reply: UpdateReply) {
        let mut pending = self.pending.lock();
        match pending.updates.remove(&key) {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(channel = %key.0.hex(), version = key.1, "update reply arrived late");
                }
            }
            None => match reply {
                // Initial-state acks can legitimately arrive before the slot
                // exists; keep them for the expectant.
                Ok(acc) if pending.stray_acks.len() < MAX_STRAY_ACKS => {
                    pending.stray_acks.insert(key, acc);
                }
                _ => warn!(channel = %key.0.hex(), version = key.1, "reply for unknown update"),
            },
        }
    }

    /// Registers a reply slot for an update acknowledgement. Checks the
    /// stray-ack stash first so a racing peer is not lost.
    pub fn expect_update_acc(&self, ch_id: Hash, version: u64) -> oneshot::Receiver<UpdateReply> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if let Some(acc) = pending.stray_acks.remove(&(ch_id, version)) {
            let _ = tx.send(Ok(acc));
        } else {
            pending.updates.insert((ch_id, version), tx);
        }
        rx
    }

    fn expect_proposal_acc(&self, id: Hash) -> oneshot::Receiver<ProposalReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().proposals.insert(id, tx);
        rx
    }

    pub fn abandon_update_slot(&self, ch_id: Hash, version: u64) {
        self.pending.lock().updates.remove(&(ch_id, version));
    }

    /// Forgets a proposal reply slot after the caller's deadline fired.
    pub fn abandon_proposal_slot(&self, id: Hash) {
        self.pending.lock().proposals.remove(&id);
    }

    pub async fn send(&self, recipient: &Identity, frame: Frame) -> Result<()> {
        self.bus
            .send(recipient, frame)
            .await
            .map_err(|e| Error::ProtocolFatal(e.to_string()))
    }

    /// Builds a proposal message with a fresh nonce share.
    pub fn make_proposal(
        &self,
        challenge_duration: u64,
        asset: crate::codec::types::Address,
        init_bals: Vec<U256>,
    ) -> ProposalMsg {
        ProposalMsg {
            challenge_duration,
            nonce_share: rand::thread_rng().gen(),
            asset,
            init_bals,
            app: None,
            parent: None,
            participant: self.account.address(),
        }
    }

    /// Proposes a channel to `peer` and runs the full opening protocol:
    /// proposal, acceptance, initial-state signing, funding. Returns the
    /// machine in phase `Acting`.
    ///
    /// The caller bounds the whole call with the `propose_ch` deadline.
    pub async fn propose_channel(
        &self,
        prop: ProposalMsg,
        peer: Identity,
        app: App,
    ) -> Result<Machine> {
        let proposal_id = prop.proposal_id()?;
        let reply = self.expect_proposal_acc(proposal_id);

        self.send(&peer, Frame::ChannelProposal(prop.clone())).await?;
        debug!(proposal = %proposal_id.hex(), "channel proposed");

        let acc = match Self::recv(reply).await? {
            Ok(acc) => acc,
            Err(reason) => return Err(Error::PeerRejected { reason }),
        };

        let params = Params {
            challenge_duration: prop.challenge_duration,
            nonce: combine_nonce_shares(&[prop.nonce_share, acc.nonce_share]),
            participants: vec![prop.participant, acc.participant],
            app_def: prop.app.as_ref().map(|a| a.def),
            parent: prop.parent,
        };
        let init_state = State::new(&params, Allocation::new(prop.asset, prop.init_bals))?;

        self.open_channel(params, 0, init_state, app, peer).await
    }

    /// Accepts an inbound proposal and runs the responder's half of the
    /// opening protocol. Returns the machine in phase `Acting`.
    pub async fn accept_proposal(
        &self,
        prop: &ProposalMsg,
        proposer: Identity,
        app: App,
    ) -> Result<Machine> {
        let proposal_id = prop.proposal_id()?;
        let acc = ProposalAccMsg {
            proposal_id,
            nonce_share: rand::thread_rng().gen(),
            participant: self.account.address(),
        };

        let params = Params {
            challenge_duration: prop.challenge_duration,
            nonce: combine_nonce_shares(&[prop.nonce_share, acc.nonce_share]),
            participants: vec![prop.participant, acc.participant],
            app_def: prop.app.as_ref().map(|a| a.def),
            parent: prop.parent,
        };
        let init_state = State::new(&params, Allocation::new(prop.asset, prop.init_bals.clone()))?;

        self.send(&proposer, Frame::ChannelProposalAcc(acc)).await?;

        self.open_channel(params, 1, init_state, app, proposer).await
    }

    /// Rejects an inbound proposal; failures are logged, not propagated.
    pub async fn reject_proposal(&self, proposer: Identity, proposal_id: Hash, reason: &str) {
        let msg = ProposalRejMsg {
            proposal_id,
            reason: reason.to_string(),
        };
        if let Err(e) = self.send(&proposer, Frame::ChannelProposalRej(msg)).await {
            warn!(proposal = %proposal_id.hex(), %e, "sending proposal rejection failed");
        }
    }

    /// Shared tail of the opening protocol: persist, exchange initial
    /// signatures, fund on-chain, activate.
    async fn open_channel(
        &self,
        params: Params,
        own_idx: PartIdx,
        init_state: State,
        app: App,
        peer: Identity,
    ) -> Result<Machine> {
        let mut machine = Machine::new(params.clone(), own_idx, init_state, app)
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        let ch_id = machine.channel_id();

        self.store.put_channel(&params, own_idx, machine.current())?;

        // Register the slot before sending our own signature: the peer may
        // answer faster than we get back to awaiting.
        let reply = self.expect_update_acc(ch_id, 0);

        let sig = machine
            .sign_init(self.account.as_ref())
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        self.send(
            &peer,
            Frame::ChannelUpdateAcc(UpdateAccMsg {
                channel_id: ch_id,
                version: 0,
                sig,
            }),
        )
        .await?;

        let peer_acc = match Self::recv(reply).await? {
            Ok(acc) => acc,
            Err(reason) => {
                self.store.remove_channel(&ch_id)?;
                return Err(Error::PeerRejected { reason });
            }
        };
        let peer_idx = 1 - own_idx;
        machine
            .add_init_sig(peer_idx, peer_acc.sig)
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        machine
            .mark_funding()
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        self.store
            .put_transaction(&ch_id, machine.current(), TxSlot::Current)?;

        self.chain
            .fund(FundingReq {
                params,
                state: machine.current().state.clone(),
                idx: own_idx,
            })
            .await?;

        machine
            .mark_active()
            .map_err(|e| Error::ProtocolFatal(e.to_string()))?;
        self.store.put_phase(&ch_id, Phase::Acting)?;

        info!(channel = %ch_id.hex(), "channel open");
        Ok(machine)
    }

    async fn recv<T>(reply: oneshot::Receiver<std::result::Result<T, String>>) -> Result<std::result::Result<T, String>> {
        reply.await.map_err(|_| Error::SessionClosed)
    }

    /// Waits for an update reply slot, mapping closure to session shutdown.
    pub async fn recv_update_reply(
        reply: oneshot::Receiver<UpdateReply>,
    ) -> Result<std::result::Result<UpdateAccMsg, String>> {
        Self::recv(reply).await
    }

    /// Shuts down the dispatch task and the bus, cancelling every pending
    /// request.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.bus.close().await;

        // Dropping the reply slots wakes every waiter with SessionClosed.
        {
            let mut pending = self.pending.lock();
            pending.proposals.clear();
            pending.updates.clear();
            pending.stray_acks.clear();
        }

        let task = self.dispatch_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Combines the participants' nonce shares into the channel nonce,
/// proposer's share first.
pub fn combine_nonce_shares(shares: &[NonceShare]) -> U256 {
    let mut hasher = Sha256::new();
    for share in shares {
        hasher.update(share.0);
    }
    U256::from_big_endian(&hasher.finalize())
}
