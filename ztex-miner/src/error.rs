//! Crate-level error type and failure classification.

use crate::codec::CodecError;
use crate::rpc::RpcError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("USB: {0}")]
    Usb(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Device identity or firmware version does not match the protocol.
    #[error("{0}")]
    Firmware(String),

    /// Miner descriptor could not be interpreted.
    #[error("invalid descriptor: {0}")]
    Descriptor(String),

    #[error("{0}")]
    Other(String),
}

/// How a session reacts to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Job-server connectivity; counts toward the endpoint's error threshold.
    Transport,

    /// Malformed job-server reply; the endpoint cools down for a fixed time.
    Protocol,

    /// Anything else; the session is disabled.
    Fatal,
}

impl Error {
    pub fn class(&self) -> FailureClass {
        match self {
            Error::Rpc(RpcError::Transport(_)) => FailureClass::Transport,
            Error::Rpc(RpcError::Protocol(_)) => FailureClass::Protocol,
            // Work payloads that fail to decode came from the job server
            Error::Codec(_) => FailureClass::Protocol,
            Error::Usb(_) | Error::Firmware(_) | Error::Descriptor(_) | Error::Other(_) => {
                FailureClass::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes() {
        assert_eq!(
            Error::from(RpcError::Transport("timed out".into())).class(),
            FailureClass::Transport
        );
        assert_eq!(
            Error::from(RpcError::Protocol("missing data".into())).class(),
            FailureClass::Protocol
        );
        assert_eq!(
            Error::from(TransportError::Disconnected).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            Error::Firmware("not a ZTEX device".into()).class(),
            FailureClass::Fatal
        );
    }
}
