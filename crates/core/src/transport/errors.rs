use thiserror::Error;

use crate::types::PeerId;

use super::ConnectionId;

// Errors surfaced by the peer-connection primitive
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    #[error("data channel error: {0}")]
    DataChannel(String),
}
