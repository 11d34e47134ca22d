use thiserror::Error;

use crate::chain::ChainError;
use crate::persistence::StoreError;
use crate::session::ChInfo;

/// API-facing errors.
///
/// Every operation on the node, a session or a channel reports one of these
/// kinds; transports render the message of the error variant verbatim.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{kind} not found: {id}")]
    ResourceNotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    ResourceExists { kind: &'static str, id: String },

    #[error("unsupported {feature}: {got}")]
    Unsupported { feature: &'static str, got: String },

    #[error("invalid argument {name}: {value}")]
    InvalidArgument { name: &'static str, value: String },

    #[error("channel proposal rejected: {reason}")]
    PeerRejected { reason: String },

    #[error("peer not responding: no response for {0}")]
    PeerNotResponding(&'static str),

    #[error("{operation} timed out")]
    TimedOut { operation: String },

    #[error("protocol fault: {0}")]
    ProtocolFatal(String),

    #[error("chain backend error: {0}")]
    Chain(#[from] ChainError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("session is closed")]
    SessionClosed,

    #[error("session has open channels")]
    HasOpenChannels(Vec<ChInfo>),
}

impl From<crate::codec::Error> for Error {
    fn from(e: crate::codec::Error) -> Self {
        Error::ProtocolFatal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_resource() {
        let err = Error::ResourceNotFound {
            kind: "session id",
            id: "deadbeef".into(),
        };
        assert_eq!(err.to_string(), "session id not found: deadbeef");

        let err = Error::Unsupported {
            feature: "comm type",
            got: "carrier-pigeon".into(),
        };
        assert_eq!(err.to_string(), "unsupported comm type: carrier-pigeon");
    }
}
