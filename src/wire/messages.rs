//! Channel-protocol messages exchanged between participants.
//!
//! These are the payloads of the framed wire protocol in [super]. Each
//! message has a fixed binary layout through [crate::codec]; decoders
//! reject unknown discriminants and leftover bytes.

use crate::channel::state::{AppField, State, Transaction};
use crate::codec::{self, Decode, Encode, Reader, WriteExt, Writer};
use crate::codec::types::{Address, Hash, NonceShare, Signature, U256};

const PROPOSAL_DOMAIN: &str = "paynode/proposal/v1";

/// Proposal for a new two-party ledger channel.
///
/// Carries the proposer's identity, nonce share and the opening balances,
/// proposer first. The responder's identity and nonce share arrive with the
/// acceptance message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalMsg {
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    pub asset: Address,
    pub init_bals: Vec<U256>,
    pub app: Option<AppField>,
    pub parent: Option<Hash>,
    pub participant: Address,
}

impl ProposalMsg {
    /// Digest identifying this proposal until the channel ID exists.
    pub fn proposal_id(&self) -> codec::Result<Hash> {
        codec::to_hash(PROPOSAL_DOMAIN, self)
    }
}

impl Encode for ProposalMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_u64(self.challenge_duration);
        w.write(&self.nonce_share.0);
        w.put_address(&self.asset);
        let count = u16::try_from(self.init_bals.len())
            .map_err(|_| codec::Error::LengthOverflow(self.init_bals.len()))?;
        w.put_u16(count);
        for b in &self.init_bals {
            w.put_u256(b);
        }
        w.put_bool(self.app.is_some());
        if let Some(app) = &self.app {
            w.put_address(&app.def);
            w.put_bytes(&app.data)?;
        }
        w.put_bool(self.parent.is_some());
        if let Some(parent) = &self.parent {
            w.put_hash(parent);
        }
        w.put_address(&self.participant);
        Ok(())
    }
}

impl Decode for ProposalMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        let challenge_duration = r.u64()?;
        let nonce_share = r.bytes32()?;
        let asset = r.address()?;
        let count = r.u16()? as usize;
        let mut init_bals = Vec::with_capacity(count);
        for _ in 0..count {
            init_bals.push(r.u256()?);
        }
        let app = if r.bool()? {
            Some(AppField {
                def: r.address()?,
                data: r.bytes()?,
            })
        } else {
            None
        };
        let parent = if r.bool()? { Some(r.hash()?) } else { None };
        let participant = r.address()?;
        Ok(ProposalMsg {
            challenge_duration,
            nonce_share,
            asset,
            init_bals,
            app,
            parent,
            participant,
        })
    }
}

/// Sent by the responder when it accepts a proposed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalAccMsg {
    pub proposal_id: Hash,
    pub nonce_share: NonceShare,
    pub participant: Address,
}

impl Encode for ProposalAccMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_hash(&self.proposal_id);
        w.write(&self.nonce_share.0);
        w.put_address(&self.participant);
        Ok(())
    }
}

impl Decode for ProposalAccMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        Ok(ProposalAccMsg {
            proposal_id: r.hash()?,
            nonce_share: r.bytes32()?,
            participant: r.address()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRejMsg {
    pub proposal_id: Hash,
    pub reason: String,
}

impl Encode for ProposalRejMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_hash(&self.proposal_id);
        w.put_str(&self.reason)
    }
}

impl Decode for ProposalRejMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        Ok(ProposalRejMsg {
            proposal_id: r.hash()?,
            reason: r.string()?,
        })
    }
}

/// A proposed state update, signed by the proposing actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMsg {
    pub state: State,
    pub actor_idx: u16,
    pub sig: Signature,
}

impl Encode for UpdateMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        self.state.encode(w)?;
        w.put_u16(self.actor_idx);
        w.put_signature(&self.sig);
        Ok(())
    }
}

impl Decode for UpdateMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        Ok(UpdateMsg {
            state: State::decode(r)?,
            actor_idx: r.u16()?,
            sig: r.signature()?,
        })
    }
}

/// Acceptance of a proposed update (also used for the initial state during
/// channel opening, with version 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAccMsg {
    pub channel_id: Hash,
    pub version: u64,
    pub sig: Signature,
}

impl Encode for UpdateAccMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_hash(&self.channel_id);
        w.put_u64(self.version);
        w.put_signature(&self.sig);
        Ok(())
    }
}

impl Decode for UpdateAccMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        Ok(UpdateAccMsg {
            channel_id: r.hash()?,
            version: r.u64()?,
            sig: r.signature()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRejMsg {
    pub channel_id: Hash,
    pub version: u64,
    pub reason: String,
}

impl Encode for UpdateRejMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_hash(&self.channel_id);
        w.put_u64(self.version);
        w.put_str(&self.reason)
    }
}

impl Decode for UpdateRejMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        Ok(UpdateRejMsg {
            channel_id: r.hash()?,
            version: r.u64()?,
            reason: r.string()?,
        })
    }
}

/// Latest fully signed transaction, exchanged when a restored channel
/// reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMsg {
    pub channel_id: Hash,
    pub current: Transaction,
}

impl Encode for Transaction {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        self.state.encode(w)?;
        let count = u16::try_from(self.sigs.len())
            .map_err(|_| codec::Error::LengthOverflow(self.sigs.len()))?;
        w.put_u16(count);
        for sig in &self.sigs {
            w.put_bool(sig.is_some());
            if let Some(sig) = sig {
                w.put_signature(sig);
            }
        }
        Ok(())
    }
}

impl Decode for Transaction {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        let state = State::decode(r)?;
        let count = r.u16()? as usize;
        let mut sigs = Vec::with_capacity(count);
        for _ in 0..count {
            sigs.push(if r.bool()? {
                Some(r.signature()?)
            } else {
                None
            });
        }
        Ok(Transaction { state, sigs })
    }
}

impl Encode for SyncMsg {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_hash(&self.channel_id);
        self.current.encode(w)
    }
}

impl Decode for SyncMsg {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        Ok(SyncMsg {
            channel_id: r.hash()?,
            current: Transaction::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::{Allocation, Params};

    fn proposal() -> ProposalMsg {
        ProposalMsg {
            challenge_duration: 10,
            nonce_share: NonceShare([5; 32]),
            asset: Address([0xEE; 20]),
            init_bals: vec![U256::from(100u8), U256::from(100u8)],
            app: None,
            parent: None,
            participant: Address([1; 20]),
        }
    }

    #[test]
    fn proposal_round_trip() {
        let msg = proposal();
        let buf = codec::to_vec(&msg).unwrap();
        assert_eq!(codec::from_slice::<ProposalMsg>(&buf).unwrap(), msg);
    }

    #[test]
    fn proposal_id_commits_to_content() {
        let msg = proposal();
        let mut other = proposal();
        other.nonce_share = NonceShare([6; 32]);
        assert_ne!(msg.proposal_id().unwrap(), other.proposal_id().unwrap());
    }

    #[test]
    fn transaction_round_trip_with_partial_signatures() {
        let params = Params {
            challenge_duration: 10,
            nonce: U256::one(),
            participants: vec![Address([1; 20]), Address([2; 20])],
            app_def: None,
            parent: None,
        };
        let state = State::new(
            &params,
            Allocation::new(Address([0xEE; 20]), vec![U256::one(), U256::one()]),
        )
        .unwrap();
        let mut tx = Transaction::new(state, 2);
        tx.sigs[1] = Some(Signature([9; 65]));

        let buf = codec::to_vec(&tx).unwrap();
        assert_eq!(codec::from_slice::<Transaction>(&buf).unwrap(), tx);
    }

    #[test]
    fn update_acc_rejects_trailing_bytes() {
        let msg = UpdateAccMsg {
            channel_id: Hash([1; 32]),
            version: 4,
            sig: Signature([2; 65]),
        };
        let mut buf = codec::to_vec(&msg).unwrap();
        buf.push(0);
        assert!(codec::from_slice::<UpdateAccMsg>(&buf).is_err());
    }
}
