//! Loopback implementation of [`PeerTransport`] for tests and simulation.
//!
//! Every device gets an endpoint on a shared [`InMemoryNetwork`]. Session
//! descriptions carry the id of the connection that produced them, so when an
//! offerer applies the remote answer the two connections are linked and both
//! sides observe `Connected`. Faults are injected through the network handle:
//! [`InMemoryNetwork::drop_link`] tears an established link down and
//! [`InMemoryNetwork::set_unreachable`] makes every negotiation with a device
//! end in `Failed`.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ConnectionId, DataChannelId, PeerTransport, TransportError, TransportEvent,
    TransportEventReceiver, TransportResult, TransportState,
};
use crate::{
    message::{IceCandidate, SdpKind, SessionDescription},
    types::PeerId,
};

const EVENT_BUFFER: usize = 1024;

/// Counters for what went through the network, handy in assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub connections_created: u64,
    pub links_established: u64,
    pub negotiations_failed: u64,
    pub frames_delivered: u64,
    pub events_dropped: u64,
}

#[derive(Debug)]
struct Connection {
    owner: PeerId,
    remote: PeerId,
    state: TransportState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Connection on the other side, learnt from the remote description.
    counterpart: Option<ConnectionId>,
    linked: bool,
    channel: Option<DataChannelId>,
    applied_candidates: Vec<IceCandidate>,
    generation: u64,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
    connections: HashMap<ConnectionId, Connection>,
    unreachable: HashSet<PeerId>,
    stats: NetworkStats,
}

type Outbox = Vec<(PeerId, TransportEvent)>;

impl NetworkState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection(&mut self, id: ConnectionId) -> TransportResult<&mut Connection> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        if conn.state == TransportState::Closed {
            return Err(TransportError::Closed(id));
        }
        Ok(conn)
    }

    fn set_state(&mut self, id: ConnectionId, state: TransportState, outbox: &mut Outbox) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.state = state;
            outbox.push((
                conn.owner.clone(),
                TransportEvent::StateChanged {
                    peer: conn.remote.clone(),
                    connection: id,
                    state,
                },
            ));
        }
    }

    fn unlink(&mut self, id: ConnectionId, outbox: &mut Outbox) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let was_linked = std::mem::replace(&mut conn.linked, false);
        let counterpart = conn.counterpart;
        if was_linked {
            self.set_state(id, TransportState::Disconnected, outbox);
        }
        if let Some(other) = counterpart {
            if let Some(remote) = self.connections.get_mut(&other) {
                if remote.linked && remote.counterpart == Some(id) {
                    remote.linked = false;
                    if remote.state != TransportState::Closed {
                        self.set_state(other, TransportState::Disconnected, outbox);
                    }
                }
            }
        }
    }

    /// Called when the offerer applies the answer produced by `answerer`.
    fn link(&mut self, offerer: ConnectionId, answerer: ConnectionId, outbox: &mut Outbox) {
        let (offer_owner, answer_owner) = match (
            self.connections.get(&offerer),
            self.connections.get(&answerer),
        ) {
            (Some(a), Some(b)) if b.state != TransportState::Closed => {
                (a.owner.clone(), b.owner.clone())
            }
            _ => {
                self.stats.negotiations_failed += 1;
                self.set_state(offerer, TransportState::Failed, outbox);
                return;
            }
        };

        if self.unreachable.contains(&offer_owner) || self.unreachable.contains(&answer_owner) {
            self.stats.negotiations_failed += 1;
            for id in [offerer, answerer] {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.linked = false;
                }
                self.set_state(id, TransportState::Failed, outbox);
            }
            return;
        }

        for (id, other) in [(offerer, answerer), (answerer, offerer)] {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.counterpart = Some(other);
                conn.linked = true;
            }
            self.set_state(id, TransportState::Connected, outbox);
        }
        self.stats.links_established += 1;

        let needs_channel = self
            .connections
            .get(&answerer)
            .is_some_and(|c| c.channel.is_none());
        if needs_channel {
            let channel = DataChannelId(self.next_id());
            if let Some(conn) = self.connections.get_mut(&answerer) {
                conn.channel = Some(channel);
                outbox.push((
                    conn.owner.clone(),
                    TransportEvent::DataChannelReceived {
                        peer: conn.remote.clone(),
                        connection: answerer,
                        channel,
                    },
                ));
            }
        }
    }

    fn deliver(&mut self, outbox: Outbox) {
        for (owner, event) in outbox {
            let Some(sender) = self.endpoints.get(&owner) else {
                continue;
            };
            if sender.try_send(event).is_err() {
                self.stats.events_dropped += 1;
                tracing::warn!(peer = %owner, "Transport event dropped, endpoint queue full or closed");
            }
        }
    }
}

/// Shared medium every [`InMemoryTransport`] endpoint is attached to.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `peer` to the network. Re-attaching replaces the previous
    /// event receiver.
    pub fn endpoint(&self, peer: PeerId) -> (InMemoryTransport, TransportEventReceiver) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.state.lock().endpoints.insert(peer.clone(), tx);
        (
            InMemoryTransport {
                owner: peer,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Tears down every established link between `a` and `b`.
    pub fn drop_link(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        let ids: Vec<_> = state
            .connections
            .iter()
            .filter(|(_, c)| c.linked && &c.owner == a && &c.remote == b)
            .map(|(id, _)| *id)
            .collect();
        let mut outbox = Vec::new();
        for id in ids {
            state.unlink(id, &mut outbox);
        }
        tracing::debug!(%a, %b, "Dropped in-memory link");
        state.deliver(outbox);
    }

    /// Makes every negotiation involving `peer` fail (or succeed again).
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(peer.clone());
            let ids: Vec<_> = state
                .connections
                .iter()
                .filter(|(_, c)| c.linked && (&c.owner == peer || &c.remote == peer))
                .map(|(id, _)| *id)
                .collect();
            let mut outbox = Vec::new();
            for id in ids {
                state.unlink(id, &mut outbox);
            }
            state.deliver(outbox);
        } else {
            state.unreachable.remove(peer);
        }
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state
            .lock()
            .connections
            .values()
            .any(|c| c.linked && &c.owner == a && &c.remote == b)
    }

    /// Candidates applied on the most recent connection `owner` holds towards `remote`.
    pub fn applied_candidates(&self, owner: &PeerId, remote: &PeerId) -> Vec<IceCandidate> {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| &c.owner == owner && &c.remote == remote)
            .max_by_key(|c| c.generation)
            .map(|c| c.applied_candidates.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> NetworkStats {
        self.state.lock().stats.clone()
    }
}

/// One device's view of the [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryTransport {
    owner: PeerId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    fn describe(kind: SdpKind, connection: ConnectionId, owner: &PeerId, restart: bool) -> SessionDescription {
        let sdp = format!(
            "v=0\r\no={owner} {} 0 IN IP4 127.0.0.1\r\na=x-conn:{}\r\na=x-ice-restart:{}\r\n",
            connection.0, connection.0, restart as u8
        );
        SessionDescription { kind, sdp }
    }

    fn connection_of(description: &SessionDescription) -> TransportResult<ConnectionId> {
        description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix("a=x-conn:"))
            .and_then(|id| id.trim().parse().ok())
            .map(ConnectionId)
            .ok_or_else(|| TransportError::Negotiation("malformed session description".into()))
    }
}

impl PeerTransport for InMemoryTransport {
    async fn create_connection(&self, peer: &PeerId) -> TransportResult<ConnectionId> {
        let mut state = self.network.state.lock();
        let id = ConnectionId(state.next_id());
        let generation = id.0;
        state.connections.insert(
            id,
            Connection {
                owner: self.owner.clone(),
                remote: peer.clone(),
                state: TransportState::New,
                local_description: None,
                remote_description: None,
                counterpart: None,
                linked: false,
                channel: None,
                applied_candidates: Vec::new(),
                generation,
            },
        );
        state.stats.connections_created += 1;
        tracing::trace!(owner = %self.owner, %peer, connection = %id, "Connection created");
        Ok(id)
    }

    async fn close_connection(&self, connection: ConnectionId) {
        let mut state = self.network.state.lock();
        let mut outbox = Vec::new();
        let counterpart = match state.connections.get_mut(&connection) {
            Some(conn) if conn.state != TransportState::Closed => {
                conn.state = TransportState::Closed;
                std::mem::replace(&mut conn.linked, false)
                    .then_some(conn.counterpart)
                    .flatten()
            }
            _ => return,
        };
        if let Some(other) = counterpart {
            if let Some(remote) = state.connections.get_mut(&other) {
                remote.linked = false;
            }
            state.set_state(other, TransportState::Disconnected, &mut outbox);
        }
        state.deliver(outbox);
    }

    async fn create_offer(
        &self,
        connection: ConnectionId,
        ice_restart: bool,
    ) -> TransportResult<SessionDescription> {
        let mut state = self.network.state.lock();
        state.connection(connection)?;
        Ok(Self::describe(SdpKind::Offer, connection, &self.owner, ice_restart))
    }

    async fn create_answer(&self, connection: ConnectionId) -> TransportResult<SessionDescription> {
        let mut state = self.network.state.lock();
        let conn = state.connection(connection)?;
        match &conn.remote_description {
            Some(remote) if remote.kind == SdpKind::Offer => {
                Ok(Self::describe(SdpKind::Answer, connection, &self.owner, false))
            }
            _ => Err(TransportError::Negotiation(
                "cannot answer without a remote offer".into(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        connection: ConnectionId,
        description: SessionDescription,
    ) -> TransportResult<()> {
        let mut state = self.network.state.lock();
        let conn = state.connection(connection)?;
        let remote = conn.remote.clone();
        conn.local_description = Some(description);
        let first = conn.state == TransportState::New;
        let mut outbox = Vec::new();
        if first {
            state.set_state(connection, TransportState::Connecting, &mut outbox);
        }
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 {} 9 typ host",
                connection.0, self.owner
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        outbox.push((
            self.owner.clone(),
            TransportEvent::IceCandidateGenerated {
                peer: remote,
                connection,
                candidate,
            },
        ));
        state.deliver(outbox);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        connection: ConnectionId,
        description: SessionDescription,
    ) -> TransportResult<()> {
        let counterpart = Self::connection_of(&description)?;
        let mut state = self.network.state.lock();
        let kind = description.kind;
        let conn = state.connection(connection)?;
        if kind == SdpKind::Answer && conn.local_description.is_none() {
            return Err(TransportError::Negotiation(
                "answer applied without a local offer".into(),
            ));
        }
        conn.remote_description = Some(description);
        conn.counterpart = Some(counterpart);
        let mut outbox = Vec::new();
        if kind == SdpKind::Answer {
            state.link(connection, counterpart, &mut outbox);
        }
        state.deliver(outbox);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        connection: ConnectionId,
        candidate: IceCandidate,
    ) -> TransportResult<()> {
        let mut state = self.network.state.lock();
        let conn = state.connection(connection)?;
        if conn.remote_description.is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".into(),
            ));
        }
        if candidate.candidate.contains("invalid") {
            return Err(TransportError::CandidateRejected(candidate.candidate));
        }
        conn.applied_candidates.push(candidate);
        Ok(())
    }

    async fn open_data_channel(
        &self,
        connection: ConnectionId,
        label: &str,
    ) -> TransportResult<DataChannelId> {
        let mut state = self.network.state.lock();
        if let Some(existing) = state.connection(connection)?.channel {
            return Ok(existing);
        }
        let channel = DataChannelId(state.next_id());
        state.connection(connection)?.channel = Some(channel);
        tracing::trace!(owner = %self.owner, connection = %connection, %label, "Data channel opened");
        Ok(channel)
    }

    async fn send_data(
        &self,
        connection: ConnectionId,
        channel: DataChannelId,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        let mut state = self.network.state.lock();
        let conn = state.connection(connection)?;
        if conn.channel != Some(channel) {
            return Err(TransportError::DataChannel(format!(
                "{channel} does not belong to {connection}"
            )));
        }
        if !conn.linked {
            return Err(TransportError::Closed(connection));
        }
        let Some(other) = conn.counterpart else {
            return Err(TransportError::Closed(connection));
        };
        let (owner, remote) = match state.connections.get(&other) {
            Some(c) if c.linked => (c.owner.clone(), c.remote.clone()),
            _ => return Err(TransportError::Closed(connection)),
        };
        state.stats.frames_delivered += 1;
        state.deliver(vec![(
            owner,
            TransportEvent::DataChannelMessage {
                peer: remote,
                connection: other,
                payload,
            },
        )]);
        Ok(())
    }
}
