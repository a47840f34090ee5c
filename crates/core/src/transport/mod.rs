//! Boundary to the peer-connection primitive.
//!
//! The engine does not implement session negotiation or media/data
//! transport itself. It drives an implementation of [`PeerTransport`], which
//! exposes exactly what the lifecycle controller needs: connections,
//! offers/answers, descriptions, ICE candidates and data channels, plus a
//! stream of [`TransportEvent`]s.
//!
//! [`in_memory`] provides a loopback implementation used by the test-suite
//! and the `simulate` command.

use std::{fmt, future::Future};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    message::{IceCandidate, SessionDescription},
    types::PeerId,
};

mod errors;
pub mod in_memory;

pub use errors::TransportError;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Handle to one peer connection created by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Handle to a data channel living on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataChannelId(pub u64);

impl fmt::Display for DataChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// Connection states reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Label of the single data channel opened per link.
pub const DATA_CHANNEL_LABEL: &str = "orgmesh";

/// Events the transport reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged {
        peer: PeerId,
        connection: ConnectionId,
        state: TransportState,
    },
    IceCandidateGenerated {
        peer: PeerId,
        connection: ConnectionId,
        candidate: IceCandidate,
    },
    DataChannelReceived {
        peer: PeerId,
        connection: ConnectionId,
        channel: DataChannelId,
    },
    DataChannelMessage {
        peer: PeerId,
        connection: ConnectionId,
        payload: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            TransportEvent::StateChanged { peer, .. }
            | TransportEvent::IceCandidateGenerated { peer, .. }
            | TransportEvent::DataChannelReceived { peer, .. }
            | TransportEvent::DataChannelMessage { peer, .. } => peer,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportEvent::StateChanged { connection, .. }
            | TransportEvent::IceCandidateGenerated { connection, .. }
            | TransportEvent::DataChannelReceived { connection, .. }
            | TransportEvent::DataChannelMessage { connection, .. } => *connection,
        }
    }
}

pub type TransportEventReceiver = mpsc::Receiver<TransportEvent>;

/// Capabilities required from the peer-connection primitive.
pub trait PeerTransport: Send + Sync + 'static {
    fn create_connection(
        &self,
        peer: &PeerId,
    ) -> impl Future<Output = TransportResult<ConnectionId>> + Send;

    fn close_connection(&self, connection: ConnectionId) -> impl Future<Output = ()> + Send;

    fn create_offer(
        &self,
        connection: ConnectionId,
        ice_restart: bool,
    ) -> impl Future<Output = TransportResult<SessionDescription>> + Send;

    fn create_answer(
        &self,
        connection: ConnectionId,
    ) -> impl Future<Output = TransportResult<SessionDescription>> + Send;

    fn set_local_description(
        &self,
        connection: ConnectionId,
        description: SessionDescription,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    fn set_remote_description(
        &self,
        connection: ConnectionId,
        description: SessionDescription,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    fn add_ice_candidate(
        &self,
        connection: ConnectionId,
        candidate: IceCandidate,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    fn open_data_channel(
        &self,
        connection: ConnectionId,
        label: &str,
    ) -> impl Future<Output = TransportResult<DataChannelId>> + Send;

    fn send_data(
        &self,
        connection: ConnectionId,
        channel: DataChannelId,
        payload: Vec<u8>,
    ) -> impl Future<Output = TransportResult<()>> + Send;
}
