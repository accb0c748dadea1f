//! Error kinds shared across the RPC boundary.
//!
//! Every daemon operation fails with one of these kinds; replies carry the
//! kind itself so callers can branch on it. `create_tunnel` in particular
//! must recognize a peer's `IpInUse` to retry with a fresh overlay pair.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed bind address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed segment URL
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Unrecognized segment command
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Segment id already registered
    #[error("segment {0} already exists")]
    IdAlreadyExists(String),

    /// Segment id not registered
    #[error("segment {0} not found")]
    IdNotFound(String),

    /// Overlay IP already reserved
    #[error("ip {0} is in use")]
    IpInUse(String),

    /// UDP encap port pool exhausted
    #[error("no ports available")]
    NoPortsAvailable,

    /// Network namespace could not be resolved
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Container runtime operation failed
    #[error("container failed: {0}")]
    ContainerFailed(String),

    /// Could not reach the peer daemon
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Peer refused the request (bad PSK or malformed frame)
    #[error("peer rejected request: {0}")]
    PeerRejected(String),

    /// Kernel netlink/XFRM operation failed
    #[error("kernel operation failed: {0}")]
    KernelOpFailed(String),

    /// No tunnel registered for the given peer
    #[error("no tunnel to {0}")]
    TunnelNotFound(String),

    /// Forwarded echo reply did not match the payload
    #[error("incorrect response from echo")]
    EchoMismatch,

    /// Head and tail resolve to the same endpoint
    #[error("cannot proxy to self")]
    SelfProxy,
}

impl ErrorKind {
    /// Whether the tunnel handshake may recover by redrawing the overlay pair.
    pub fn is_ip_in_use(&self) -> bool {
        matches!(self, ErrorKind::IpInUse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_in_use_is_recoverable() {
        assert!(ErrorKind::IpInUse("100.65.0.1".into()).is_ip_in_use());
        assert!(!ErrorKind::NoPortsAvailable.is_ip_in_use());
    }

    #[test]
    fn test_display_carries_detail() {
        let e = ErrorKind::TunnelNotFound("10.0.0.2".into());
        assert!(e.to_string().contains("10.0.0.2"));
    }

    #[test]
    fn test_kind_survives_cbor() {
        let e = ErrorKind::IpInUse("100.65.0.3".into());
        let bytes = serde_cbor::to_vec(&e).unwrap();
        let back: ErrorKind = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, e);
        assert!(back.is_ip_in_use());
    }
}
