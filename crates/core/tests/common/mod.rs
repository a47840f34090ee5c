#![allow(dead_code)]

use std::{future::Future, time::Duration};

use orgmesh::{
    registry::PeerStatus,
    signaling::memory::MemoryRelayHub,
    store::{MemoryBackend, PeerStore, StoreBackend},
    transport::in_memory::{InMemoryNetwork, InMemoryTransport},
    types::{LocalIdentity, OrganizationId, PeerId, Role},
    Node, NodeConfig, NodeEvent, NodeHandle,
};
use tokio::sync::broadcast::{self, error::RecvError};

pub const ORG: &str = "acme";
pub const ADMIN: &str = "admin";

/// Upper bound for anything the mesh is expected to do; tests run on paused
/// time so this costs nothing.
pub const WAIT: Duration = Duration::from_secs(180);

/// A shared in-memory network and relay that test nodes attach to.
#[derive(Clone, Default)]
pub struct TestMesh {
    pub network: InMemoryNetwork,
    pub hub: MemoryRelayHub,
}

impl TestMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(id: &str, role: Role) -> LocalIdentity {
        LocalIdentity {
            id: id.into(),
            name: id.to_owned(),
            organization_id: OrganizationId::new(ORG),
            organization_name: "Acme".to_owned(),
            role,
        }
    }

    pub fn config() -> NodeConfig {
        NodeConfig {
            admin_id: Some(PeerId::new(ADMIN)),
            ..NodeConfig::default()
        }
    }

    pub fn node<B: StoreBackend>(
        &self,
        id: &str,
        role: Role,
        store: PeerStore<B>,
    ) -> Node<InMemoryTransport, B> {
        let (transport, events) = self.network.endpoint(id.into());
        Node::new(Self::identity(id, role), Self::config(), transport, events, store)
            .with_relay(self.hub.connector())
    }

    pub fn start(&self, id: &str, role: Role) -> NodeHandle {
        self.node(id, role, PeerStore::new(MemoryBackend::new()))
            .start()
    }

    /// Waits until every id in `peers` is registered with the relay.
    pub async fn registered(&self, peers: &[&str]) {
        let expected: Vec<PeerId> = peers.iter().map(|p| PeerId::new(*p)).collect();
        eventually(|| {
            let registered = self.hub.registered_peers();
            expected.iter().all(|p| registered.contains(p))
        })
        .await;
    }
}

pub fn org() -> OrganizationId {
    OrganizationId::new(ORG)
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Next event matching `pred`, skipping everything else.
pub async fn wait_for(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut pred: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    within("node event", async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
}

/// Everything already queued on `events`.
pub fn drain(events: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within("condition", async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
}

pub async fn connected(node: &NodeHandle, peer: &str) {
    let peer = PeerId::new(peer);
    eventually(|| node.peer_status(&peer) == Some(PeerStatus::Connected)).await
}

pub fn reconnections(events: &[NodeEvent]) -> Vec<(PeerId, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            NodeEvent::ReconnectionScheduled { peer, attempt, .. } => {
                Some((peer.clone(), *attempt))
            }
            _ => None,
        })
        .collect()
}
