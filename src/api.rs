//! Payment-channel API facade.
//!
//! Thin typed surface over the node, its sessions and their channels:
//! unary operations return `Result` (transports render `Err` as an error
//! message payload), server-streaming subscriptions hand out a receiver
//! whose stream ends normally on unsubscribe. At most one proposal and one
//! close subscription per session, one update subscription per channel;
//! the registry is keyed accordingly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::idprovider::Peer;
use crate::node::Node;
use crate::session::{
    BalanceInfo, ChCloseNotif, ChInfo, ChProposalNotif, ChUpdateNotif,
};

/// Buffered notifications per subscription stream; beyond this the newest
/// notification is dropped with a warning.
const STREAM_CAPACITY: usize = 64;

/// One payment channel as rendered on the API surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayChInfo {
    pub channel_id: String,
    pub bal_info: BalanceInfo,
    pub version: String,
}

impl From<ChInfo> for PayChInfo {
    fn from(info: ChInfo) -> Self {
        PayChInfo {
            channel_id: info.channel_id,
            bal_info: info.bal_info,
            version: info.version.to_string(),
        }
    }
}

/// Notification on the channel-close stream.
#[derive(Debug, Clone)]
pub struct PayChCloseNotif {
    pub closing_state: PayChInfo,
    pub error: Option<String>,
}

impl From<ChCloseNotif> for PayChCloseNotif {
    fn from(notif: ChCloseNotif) -> Self {
        PayChCloseNotif {
            closing_state: notif.closing_info.into(),
            error: notif.error,
        }
    }
}

#[derive(Default)]
struct Subs {
    proposals: HashMap<String, mpsc::Sender<ChProposalNotif>>,
    closes: HashMap<String, mpsc::Sender<PayChCloseNotif>>,
    updates: HashMap<(String, String), mpsc::Sender<ChUpdateNotif>>,
}

pub struct PaymentApi {
    node: Arc<Node>,
    subs: Mutex<Subs>,
}

impl PaymentApi {
    pub fn new(node: Arc<Node>) -> Self {
        PaymentApi {
            node,
            subs: Mutex::new(Subs::default()),
        }
    }

    // ---- node-level -----------------------------------------------------

    pub fn get_config(&self) -> NodeConfig {
        self.node.get_config().clone()
    }

    pub fn time(&self) -> i64 {
        self.node.time()
    }

    pub fn help(&self) -> Vec<String> {
        self.node.help()
    }

    pub async fn open_session(&self, config_file: &str) -> Result<(String, Vec<PayChInfo>)> {
        let (id, restored) = self.node.open_session(config_file).await?;
        Ok((id, restored.into_iter().map(Into::into).collect()))
    }

    /// Closes the session and tears down all of its streams.
    pub async fn close_session(&self, session_id: &str, force: bool) -> Result<Vec<PayChInfo>> {
        let session = self.node.get_session(session_id)?;
        let open = session.close(force).await?;

        let mut subs = self.subs.lock();
        subs.proposals.remove(session_id);
        subs.closes.remove(session_id);
        subs.updates.retain(|(sid, _), _| sid != session_id);

        Ok(open.into_iter().map(Into::into).collect())
    }

    // ---- contacts -------------------------------------------------------

    pub fn add_contact(&self, session_id: &str, peer: Peer) -> Result<()> {
        self.node.get_session(session_id)?.add_contact(peer)
    }

    pub fn get_contact(&self, session_id: &str, alias: &str) -> Result<Peer> {
        self.node.get_session(session_id)?.get_contact(alias)
    }

    // ---- channels -------------------------------------------------------

    pub async fn open_pay_ch(
        &self,
        session_id: &str,
        opening_bal_info: &BalanceInfo,
        challenge_dur_secs: u64,
    ) -> Result<PayChInfo> {
        let session = self.node.get_session(session_id)?;
        let info = session.open_ch(opening_bal_info, None, challenge_dur_secs).await?;
        Ok(info.into())
    }

    pub async fn get_pay_chs(&self, session_id: &str) -> Result<Vec<PayChInfo>> {
        let session = self.node.get_session(session_id)?;
        Ok(session
            .get_chs_info()
            .await
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub async fn respond_pay_ch_proposal(
        &self,
        session_id: &str,
        proposal_id: &str,
        accept: bool,
    ) -> Result<Option<PayChInfo>> {
        let session = self.node.get_session(session_id)?;
        Ok(session
            .respond_ch_proposal(proposal_id, accept)
            .await?
            .map(Into::into))
    }

    pub async fn send_pay_ch_update(
        &self,
        session_id: &str,
        channel_id: &str,
        payee: &str,
        amount: &str,
    ) -> Result<PayChInfo> {
        let ch = self.node.get_session(session_id)?.get_ch(channel_id)?;
        Ok(ch.send_update(payee, amount).await?.into())
    }

    pub async fn respond_pay_ch_update(
        &self,
        session_id: &str,
        channel_id: &str,
        update_id: &str,
        accept: bool,
    ) -> Result<PayChInfo> {
        let ch = self.node.get_session(session_id)?.get_ch(channel_id)?;
        Ok(ch.respond_update(update_id, accept).await?.into())
    }

    pub async fn get_pay_ch_balance(
        &self,
        session_id: &str,
        channel_id: &str,
    ) -> Result<(BalanceInfo, String)> {
        let ch = self.node.get_session(session_id)?.get_ch(channel_id)?;
        let info = ch.get_info().await;
        Ok((info.bal_info, info.version.to_string()))
    }

    pub async fn close_pay_ch(&self, session_id: &str, channel_id: &str) -> Result<PayChInfo> {
        let ch = self.node.get_session(session_id)?.get_ch(channel_id)?;
        Ok(ch.close().await?.into())
    }

    // ---- streaming subscriptions ---------------------------------------

    /// Subscribes to channel proposals. The returned stream ends normally
    /// when [PaymentApi::unsub_pay_ch_proposals] is called.
    pub fn sub_pay_ch_proposals(
        &self,
        session_id: &str,
    ) -> Result<mpsc::Receiver<ChProposalNotif>> {
        let session = self.node.get_session(session_id)?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

        let forward = tx.clone();
        let sid = session_id.to_string();
        session.sub_ch_proposals(Box::new(move |notif| {
            if forward.try_send(notif).is_err() {
                warn!(session = %sid, "proposal stream full or gone, dropping notification");
            }
        }))?;

        self.subs
            .lock()
            .proposals
            .insert(session_id.to_string(), tx);
        Ok(rx)
    }

    /// Ends the proposal stream; the server side sees a normal end of
    /// stream, not an error.
    pub fn unsub_pay_ch_proposals(&self, session_id: &str) -> Result<()> {
        let session = self.node.get_session(session_id)?;
        session.unsub_ch_proposals()?;
        self.subs.lock().proposals.remove(session_id);
        Ok(())
    }

    pub fn sub_pay_ch_closes(&self, session_id: &str) -> Result<mpsc::Receiver<PayChCloseNotif>> {
        let session = self.node.get_session(session_id)?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

        let forward = tx.clone();
        let sid = session_id.to_string();
        session.sub_ch_closes(Box::new(move |notif| {
            if forward.try_send(notif.into()).is_err() {
                warn!(session = %sid, "close stream full or gone, dropping notification");
            }
        }))?;

        self.subs.lock().closes.insert(session_id.to_string(), tx);
        Ok(rx)
    }

    pub fn unsub_pay_ch_closes(&self, session_id: &str) -> Result<()> {
        let session = self.node.get_session(session_id)?;
        session.unsub_ch_closes()?;
        self.subs.lock().closes.remove(session_id);
        Ok(())
    }

    pub async fn sub_pay_ch_updates(
        &self,
        session_id: &str,
        channel_id: &str,
    ) -> Result<mpsc::Receiver<ChUpdateNotif>> {
        let ch = self.node.get_session(session_id)?.get_ch(channel_id)?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

        let forward = tx.clone();
        let cid = channel_id.to_string();
        ch.subscribe_updates(Box::new(move |notif| {
            if forward.try_send(notif).is_err() {
                warn!(channel = %cid, "update stream full or gone, dropping notification");
            }
        }))
        .await?;

        self.subs
            .lock()
            .updates
            .insert((session_id.to_string(), channel_id.to_string()), tx);
        Ok(rx)
    }

    pub async fn unsub_pay_ch_updates(&self, session_id: &str, channel_id: &str) -> Result<()> {
        let ch = self.node.get_session(session_id)?.get_ch(channel_id)?;
        ch.unsubscribe_updates().await?;
        self.subs
            .lock()
            .updates
            .remove(&(session_id.to_string(), channel_id.to_string()));
        Ok(())
    }
}

/// Renders an error the way unary responses carry it.
pub fn error_message(err: &Error) -> String {
    err.to_string()
}
