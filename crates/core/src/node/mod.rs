//! The node: one event loop wiring every component together.
//!
//! [`Node`] is assembled from a transport, a persistent store and optional
//! relay/address-probe collaborators, then started with [`Node::start`]. The
//! loop owns the mesh and admin coordinators and routes work to one
//! [`connection`] actor per peer. Callers interact with it through the
//! cloneable [`NodeHandle`] and observe it through [`NodeEvent`]s.

use std::{
    collections::BTreeSet,
    net::IpAddr,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    crypto::{MessageSealer, NoopSealer},
    ip_monitor::{AddressProbe, IpChangeMonitor},
    mesh::{self, MeshPhase, MeshState},
    message::{LocationUpdate, Registration, SignalEnvelope, SignalPayload},
    reconnect::{FailureReason, ReconnectPolicy, ReconnectionManager},
    registry::{PeerRecord, PeerRegistry, PeerStatus},
    signaling::{RelayConnector, RelayLink, SignalCodec, SignalingError, SignalingRelay},
    store::{PeerStore, StoreBackend, StoreError},
    transport::{PeerTransport, TransportError, TransportEventReceiver},
    types::{LocalIdentity, PeerId},
    util::backoff::ExponentialBackoff,
};

pub(crate) mod connection;
mod event_loop;

const COMMAND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Timing and policy knobs of a running node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Admin of the organization, when known ahead of its first presence.
    pub admin_id: Option<PeerId>,
    pub negotiation_timeout: Duration,
    /// How long a client waits for the admin to re-offer after its own IP changed.
    pub client_ip_grace: Duration,
    pub heartbeat_interval: Duration,
    pub admin_timeout: Duration,
    pub liveness_interval: Duration,
    pub cleanup_interval: Duration,
    pub admin_purge_after: Duration,
    pub primary_silence: Duration,
    pub relay_backoff: ExponentialBackoff,
    pub reconnect: ReconnectPolicy,
    pub capabilities: BTreeSet<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            admin_id: None,
            negotiation_timeout: Duration::from_secs(15),
            client_ip_grace: Duration::from_secs(10),
            heartbeat_interval: mesh::HEARTBEAT_INTERVAL,
            admin_timeout: mesh::ADMIN_TIMEOUT,
            liveness_interval: mesh::LIVENESS_CHECK_INTERVAL,
            cleanup_interval: Duration::from_secs(60),
            admin_purge_after: mesh::admin::ADMIN_PURGE_AFTER,
            primary_silence: mesh::admin::PRIMARY_SILENCE,
            relay_backoff: RelayLink::DEFAULT_BACKOFF,
            reconnect: ReconnectPolicy::default(),
            capabilities: BTreeSet::from(["location".to_owned()]),
        }
    }
}

/// Observable happenings, delivered to every [`NodeHandle::subscribe`]r.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    PeerStatusChanged {
        peer: PeerId,
        status: PeerStatus,
    },
    ReconnectionScheduled {
        peer: PeerId,
        reason: FailureReason,
        attempt: u32,
        delay: Duration,
    },
    PeerPermanentlyFailed {
        peer: PeerId,
        reason: FailureReason,
        attempts: u32,
    },
    IpChanged {
        old: IpAddr,
        new: IpAddr,
    },
    AdminAbsent,
    TemporaryRelayElected {
        relay: PeerId,
        local: bool,
    },
    TemporaryRelayDemoted {
        relay: PeerId,
        local: bool,
    },
    AdminRestored,
    PrimaryAdminChanged {
        previous: Option<PeerId>,
        primary: Option<PeerId>,
    },
    LocationReceived(LocationUpdate),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node event loop is not running")]
    ChannelClosed,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<T> From<mpsc::error::SendError<T>> for NodeError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        NodeError::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for NodeError {
    fn from(_: oneshot::error::RecvError) -> Self {
        NodeError::ChannelClosed
    }
}

/// Mesh view returned by [`NodeHandle::mesh_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSnapshot {
    pub phase: MeshPhase,
    #[serde(flatten)]
    pub state: MeshState,
}

pub(crate) enum NodeCommand {
    Open {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    ForceReconnect {
        peer: Option<PeerId>,
    },
    BroadcastLocation {
        update: LocationUpdate,
        reply: oneshot::Sender<Result<usize, NodeError>>,
    },
    MeshState(oneshot::Sender<MeshSnapshot>),
    PrimaryAdmin(oneshot::Sender<Option<PeerId>>),
    ClearStoredState(oneshot::Sender<Result<(), NodeError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    identity: Arc<LocalIdentity>,
    commands: mpsc::Sender<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
    registry: PeerRegistry,
    reconnection: Arc<Mutex<ReconnectionManager>>,
}

impl NodeHandle {
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Starts negotiating a link to `peer`, with this device offering.
    pub async fn open_connection(&self, peer: PeerId) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(NodeCommand::Open { peer, reply }).await?;
        rx.await?
    }

    /// Drops all backoff state and renegotiates immediately, either with one
    /// peer or with every known peer.
    pub async fn force_reconnect(&self, peer: Option<PeerId>) -> Result<(), NodeError> {
        self.commands
            .send(NodeCommand::ForceReconnect { peer })
            .await?;
        Ok(())
    }

    /// Sends a location report to every directly linked peer; returns how
    /// many received it.
    pub async fn broadcast_location(
        &self,
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
    ) -> Result<usize, NodeError> {
        let update = LocationUpdate {
            peer_id: self.identity.id.clone(),
            latitude,
            longitude,
            accuracy,
            timestamp: crate::util::envelope_millis(),
        };
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::BroadcastLocation { update, reply })
            .await?;
        rx.await?
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.snapshot()
    }

    pub fn peer_status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.registry.status(peer)
    }

    /// Attempt number of the reconnection sequence running for `peer`, if any.
    pub fn active_attempt(&self, peer: &PeerId) -> Option<u32> {
        self.reconnection.lock().current(peer).map(|a| a.attempt)
    }

    pub fn is_permanently_failed(&self, peer: &PeerId) -> bool {
        self.reconnection.lock().is_permanently_failed(peer)
    }

    pub async fn mesh_state(&self) -> Result<MeshSnapshot, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(NodeCommand::MeshState(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn primary_admin(&self) -> Result<Option<PeerId>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(NodeCommand::PrimaryAdmin(reply)).await?;
        Ok(rx.await?)
    }

    /// Deletes the persisted state of this organization.
    pub async fn clear_stored_state(&self) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::ClearStoredState(reply))
            .await?;
        rx.await?
    }

    /// Cancels timers, closes every link and stops the loop. Persisted state is kept.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(NodeCommand::Shutdown(reply)).await?;
        Ok(rx.await?)
    }
}

/// A configured, not yet running node.
pub struct Node<T, B> {
    identity: Arc<LocalIdentity>,
    config: NodeConfig,
    transport: Arc<T>,
    transport_events: TransportEventReceiver,
    store: PeerStore<B>,
    sealer: Arc<dyn MessageSealer>,
    relay: Option<(RelayLink, mpsc::Receiver<SignalEnvelope>)>,
    ip_monitor: Option<IpChangeMonitor>,
    events: broadcast::Sender<NodeEvent>,
}

impl<T: PeerTransport, B: StoreBackend> Node<T, B> {
    pub fn new(
        identity: LocalIdentity,
        config: NodeConfig,
        transport: T,
        transport_events: TransportEventReceiver,
        store: PeerStore<B>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            identity: Arc::new(identity),
            config,
            transport: Arc::new(transport),
            transport_events,
            store,
            sealer: Arc::new(NoopSealer),
            relay: None,
            ip_monitor: None,
            events,
        }
    }

    /// Seals data-channel frames with `sealer`.
    pub fn with_sealer(mut self, sealer: Arc<dyn MessageSealer>) -> Self {
        self.sealer = sealer;
        self
    }

    /// Connects to the fallback relay. The link starts immediately and keeps
    /// reconnecting for the lifetime of the node.
    pub fn with_relay<C: RelayConnector>(mut self, connector: C) -> Self {
        let registration = SignalEnvelope::new(
            self.identity.id.clone(),
            self.identity.organization_id.clone(),
            SignalPayload::Register(Registration {
                name: self.identity.name.clone(),
                role: self.identity.role,
            }),
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let link = RelayLink::spawn(
            connector,
            registration,
            self.config.relay_backoff.clone(),
            inbound_tx,
        );
        self.relay = Some((link, inbound_rx));
        self
    }

    /// Watches the public address with `probe`.
    pub fn with_address_probe<P: AddressProbe>(mut self, probe: P, interval: Duration) -> Self {
        let mut monitor = IpChangeMonitor::new(interval);
        monitor.start(probe);
        self.ip_monitor = Some(monitor);
        self
    }

    /// Subscribes before the node starts, so nothing emitted at startup is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn start(self) -> NodeHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let registry = PeerRegistry::new();
        let reconnection = Arc::new(Mutex::new(ReconnectionManager::new(
            self.config.reconnect.clone(),
        )));
        let (relay_link, relay_inbound) = match self.relay {
            Some((link, inbound)) => (Some(link), Some(inbound)),
            None => (None, None),
        };
        let signaling = SignalingRelay::new(
            self.transport.clone(),
            registry.clone(),
            SignalCodec::new(self.sealer),
            relay_link.as_ref().map(RelayLink::sender),
        );
        let mut known_admins = BTreeSet::new();
        if self.identity.role.is_admin() {
            known_admins.insert(self.identity.id.clone());
        }
        if let Some(admin) = &self.config.admin_id {
            known_admins.insert(admin.clone());
        }
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let config = Arc::new(self.config);

        let ctx = Arc::new(connection::PeerContext {
            identity: self.identity.clone(),
            config: config.clone(),
            transport: self.transport,
            registry: registry.clone(),
            reconnection: reconnection.clone(),
            store: self.store,
            signaling,
            events: self.events.clone(),
            reports: reports_tx,
            known_admins: Arc::new(RwLock::new(known_admins)),
            ip_unstable: Arc::new(AtomicBool::new(false)),
        });

        let ip_changes = self.ip_monitor.as_ref().map(IpChangeMonitor::subscribe);
        let event_loop = event_loop::EventLoop::new(
            ctx,
            event_loop::Inputs {
                transport_events: self.transport_events,
                relay_inbound,
                commands: commands_rx,
                reports: reports_rx,
                ip_changes,
            },
            relay_link,
            self.ip_monitor,
        );
        tracing::info!(
            peer = %self.identity.id,
            org = %self.identity.organization_id,
            role = %self.identity.role,
            "Starting node"
        );
        tokio::spawn(event_loop.run());

        NodeHandle {
            identity: self.identity,
            commands: commands_tx,
            events: self.events,
            registry,
            reconnection,
        }
    }
}
