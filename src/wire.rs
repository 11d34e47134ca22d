//! Wire protocol framing and the message bus contract.
//!
//! Every message travels as one frame: a 2-byte type tag, a 4-byte payload
//! length, then the payload in the canonical encoding. Decoders reject
//! unknown tags, length mismatches and trailing bytes. The transport that
//! carries frames between peers is abstract ([Bus]); peers are addressed by
//! their off-chain address.

pub mod messages;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::{self, Decode, Encode, Reader, WriteExt};
use crate::codec::types::Address;
use self::messages::{
    ProposalAccMsg, ProposalMsg, ProposalRejMsg, SyncMsg, UpdateAccMsg, UpdateMsg, UpdateRejMsg,
};

/// Peers are identified on the bus by their off-chain address.
pub type Identity = Address;

const TAG_PING: u16 = 0x0001;
const TAG_PONG: u16 = 0x0002;
const TAG_SHUTDOWN: u16 = 0x0003;
const TAG_CH_PROPOSAL: u16 = 0x0010;
const TAG_CH_PROPOSAL_ACC: u16 = 0x0011;
const TAG_CH_PROPOSAL_REJ: u16 = 0x0012;
const TAG_CH_UPDATE: u16 = 0x0020;
const TAG_CH_UPDATE_ACC: u16 = 0x0021;
const TAG_CH_UPDATE_REJ: u16 = 0x0022;
const TAG_CH_SYNC: u16 = 0x0030;

const FRAME_HEADER_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame decode failed: {0}")]
    Decode(#[from] codec::Error),
    #[error("unknown frame type {0:#06x}")]
    UnknownType(u16),
    #[error("frame length mismatch: header says {declared}, buffer holds {got}")]
    LengthMismatch { declared: usize, got: usize },
    #[error("frame too short for header")]
    Truncated,
    #[error("no comm address registered for {0:?}")]
    UnknownRecipient(Address),
    #[error("bus is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness probe carrying the send time.
    Ping { created_ns: i64 },
    /// Response to [Frame::Ping], echoing nothing but its own send time.
    Pong { created_ns: i64 },
    /// Orderly connection shutdown.
    Shutdown { reason: String },
    ChannelProposal(ProposalMsg),
    ChannelProposalAcc(ProposalAccMsg),
    ChannelProposalRej(ProposalRejMsg),
    ChannelUpdate(UpdateMsg),
    ChannelUpdateAcc(UpdateAccMsg),
    ChannelUpdateRej(UpdateRejMsg),
    ChannelSync(SyncMsg),
}

/// Wall-clock nanoseconds since the epoch.
///
/// Deliberately not monotonic: the value is compared across processes, so it
/// must not carry any process-local clock component.
pub fn now_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

impl Frame {
    pub fn ping() -> Self {
        Frame::Ping {
            created_ns: now_nanos(),
        }
    }

    pub fn pong() -> Self {
        Frame::Pong {
            created_ns: now_nanos(),
        }
    }

    pub fn frame_type(&self) -> u16 {
        match self {
            Frame::Ping { .. } => TAG_PING,
            Frame::Pong { .. } => TAG_PONG,
            Frame::Shutdown { .. } => TAG_SHUTDOWN,
            Frame::ChannelProposal(_) => TAG_CH_PROPOSAL,
            Frame::ChannelProposalAcc(_) => TAG_CH_PROPOSAL_ACC,
            Frame::ChannelProposalRej(_) => TAG_CH_PROPOSAL_REJ,
            Frame::ChannelUpdate(_) => TAG_CH_UPDATE,
            Frame::ChannelUpdateAcc(_) => TAG_CH_UPDATE_ACC,
            Frame::ChannelUpdateRej(_) => TAG_CH_UPDATE_REJ,
            Frame::ChannelSync(_) => TAG_CH_SYNC,
        }
    }

    /// Encodes the frame as tag ‖ length ‖ payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut payload = Vec::new();
        match self {
            Frame::Ping { created_ns } | Frame::Pong { created_ns } => {
                payload.put_i64(*created_ns);
            }
            Frame::Shutdown { reason } => payload.put_str(reason)?,
            Frame::ChannelProposal(m) => m.encode(&mut payload)?,
            Frame::ChannelProposalAcc(m) => m.encode(&mut payload)?,
            Frame::ChannelProposalRej(m) => m.encode(&mut payload)?,
            Frame::ChannelUpdate(m) => m.encode(&mut payload)?,
            Frame::ChannelUpdateAcc(m) => m.encode(&mut payload)?,
            Frame::ChannelUpdateRej(m) => m.encode(&mut payload)?,
            Frame::ChannelSync(m) => m.encode(&mut payload)?,
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u16(self.frame_type());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes exactly one frame from `buf`; the buffer must contain the
    /// whole frame and nothing else.
    pub fn from_bytes(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let tag = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let declared = u32::from_be_bytes(buf[2..6].try_into().unwrap()) as usize;
        let payload = &buf[FRAME_HEADER_LEN..];
        if payload.len() != declared {
            return Err(WireError::LengthMismatch {
                declared,
                got: payload.len(),
            });
        }

        let mut r = Reader::new(payload);
        let frame = match tag {
            TAG_PING => Frame::Ping {
                created_ns: r.i64()?,
            },
            TAG_PONG => Frame::Pong {
                created_ns: r.i64()?,
            },
            TAG_SHUTDOWN => Frame::Shutdown {
                reason: r.string()?,
            },
            TAG_CH_PROPOSAL => Frame::ChannelProposal(ProposalMsg::decode(&mut r)?),
            TAG_CH_PROPOSAL_ACC => Frame::ChannelProposalAcc(ProposalAccMsg::decode(&mut r)?),
            TAG_CH_PROPOSAL_REJ => Frame::ChannelProposalRej(ProposalRejMsg::decode(&mut r)?),
            TAG_CH_UPDATE => Frame::ChannelUpdate(UpdateMsg::decode(&mut r)?),
            TAG_CH_UPDATE_ACC => Frame::ChannelUpdateAcc(UpdateAccMsg::decode(&mut r)?),
            TAG_CH_UPDATE_REJ => Frame::ChannelUpdateRej(UpdateRejMsg::decode(&mut r)?),
            TAG_CH_SYNC => Frame::ChannelSync(SyncMsg::decode(&mut r)?),
            other => return Err(WireError::UnknownType(other)),
        };
        r.finish()?;
        Ok(frame)
    }
}

/// A frame received from a peer.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: Identity,
    pub frame: Frame,
}

/// Maps off-chain addresses to transport addresses before dialing.
pub trait Registerer: Send + Sync {
    fn register(&self, off_chain_addr: Address, comm_addr: &str);
}

/// Authenticated, framed transport between peers.
///
/// Implementations own the dialer/listener pair; inbound frames surface on
/// the receiver handed out at construction by the [CommBackend].
#[async_trait]
pub trait Bus: Registerer {
    async fn send(&self, recipient: &Identity, frame: Frame) -> Result<(), WireError>;

    /// Shuts down listener and connections; pending sends fail with
    /// [WireError::Closed] and the inbound stream ends.
    async fn close(&self);
}

/// Creates buses for one kind of transport (e.g. tcp).
pub trait CommBackend: Send + Sync {
    fn new_bus(
        &self,
        own: Identity,
        listen_addr: &str,
    ) -> Result<(std::sync::Arc<dyn Bus>, mpsc::Receiver<Inbound>), WireError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::types::{Hash, Signature};

    #[test]
    fn control_frames_round_trip() {
        for frame in [
            Frame::ping(),
            Frame::pong(),
            Frame::Shutdown {
                reason: "node going down".into(),
            },
        ] {
            let buf = frame.to_bytes().unwrap();
            assert_eq!(Frame::from_bytes(&buf).unwrap(), frame);
        }
    }

    #[test]
    fn ping_timestamp_is_fixed_width() {
        let frame = Frame::Ping { created_ns: 1 };
        let buf = frame.to_bytes().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 8);
        // Big-endian: the value 1 sits in the last byte.
        assert_eq!(buf[FRAME_HEADER_LEN + 7], 1);
    }

    #[test]
    fn channel_frames_round_trip() {
        let frame = Frame::ChannelUpdateAcc(UpdateAccMsg {
            channel_id: Hash([1; 32]),
            version: 7,
            sig: Signature([2; 65]),
        });
        let buf = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&buf).unwrap(), frame);

        let frame = Frame::ChannelUpdateRej(UpdateRejMsg {
            channel_id: Hash([3; 32]),
            version: 8,
            reason: "rejected by user".into(),
        });
        let buf = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&buf).unwrap(), frame);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = Frame::ping().to_bytes().unwrap();
        buf[0] = 0x7F;
        buf[1] = 0x7F;
        assert!(matches!(
            Frame::from_bytes(&buf),
            Err(WireError::UnknownType(0x7F7F))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut buf = Frame::ping().to_bytes().unwrap();
        buf.push(0);
        assert!(matches!(
            Frame::from_bytes(&buf),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_length_lie() {
        let mut buf = Frame::Shutdown {
            reason: "x".into(),
        }
        .to_bytes()
        .unwrap();
        // Inflate the declared length without providing the bytes.
        buf[5] += 1;
        assert!(matches!(
            Frame::from_bytes(&buf),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            Frame::from_bytes(&[0, 1, 0]),
            Err(WireError::Truncated)
        ));
    }
}
