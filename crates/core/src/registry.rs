//! In-memory view of every peer this device is talking to.
//!
//! The registry is the single source of truth for "is this peer connected".
//! Each entry is only mutated by the actor that owns the peer; the mesh and
//! admin components read it.

use std::{collections::BTreeMap, fmt, net::IpAddr, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    transport::{ConnectionId, DataChannelId},
    types::{OrganizationId, PeerId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl PeerStatus {
    /// Allowed moves: connecting→connected, connected→disconnected,
    /// disconnected→connecting, and connecting→disconnected for attempts that
    /// never came up. Staying in place is always allowed.
    pub fn can_transition_to(self, next: PeerStatus) -> bool {
        use PeerStatus::*;
        self == next
            || matches!(
                (self, next),
                (Connecting, Connected) | (Connected, Disconnected) | (Disconnected, Connecting)
                    | (Connecting, Disconnected)
            )
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Connecting => f.write_str("connecting"),
            PeerStatus::Connected => f.write_str("connected"),
            PeerStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub name: String,
    pub organization_id: OrganizationId,
    pub is_admin: bool,
    pub connection: Option<ConnectionId>,
    pub data_channel: Option<DataChannelId>,
    pub status: PeerStatus,
    pub last_seen: DateTime<Utc>,
    pub last_ip: Option<IpAddr>,
}

impl PeerRecord {
    pub fn new(id: PeerId, organization_id: OrganizationId) -> Self {
        Self {
            name: id.to_string(),
            id,
            organization_id,
            is_admin: false,
            connection: None,
            data_channel: None,
            status: PeerStatus::Connecting,
            last_seen: Utc::now(),
            last_ip: None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("invalid status transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: PeerId,
        from: PeerStatus,
        to: PeerStatus,
    },
}

#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<BTreeMap<PeerId, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record unless one already exists; returns the current record.
    pub fn get_or_insert(&self, record: PeerRecord) -> PeerRecord {
        self.peers
            .write()
            .entry(record.id.clone())
            .or_insert(record)
            .clone()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.read().get(peer).map(|r| r.status)
    }

    /// Moves `peer` to `next`, returning the previous status.
    pub fn transition(&self, peer: &PeerId, next: PeerStatus) -> Result<PeerStatus, RegistryError> {
        let mut peers = self.peers.write();
        let record = peers
            .get_mut(peer)
            .ok_or_else(|| RegistryError::UnknownPeer(peer.clone()))?;
        let previous = record.status;
        if !previous.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                peer: peer.clone(),
                from: previous,
                to: next,
            });
        }
        record.status = next;
        if next == PeerStatus::Connected {
            record.last_seen = Utc::now();
        }
        if previous != next {
            tracing::debug!(%peer, from = %previous, to = %next, "Peer status changed");
        }
        Ok(previous)
    }

    /// Applies `f` to the record of `peer`, if present.
    pub fn update<R>(&self, peer: &PeerId, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        self.peers.write().get_mut(peer).map(f)
    }

    pub fn touch(&self, peer: &PeerId) {
        self.update(peer, |record| record.last_seen = Utc::now());
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.write().remove(peer)
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn connected(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|r| r.status == PeerStatus::Connected)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.status(peer) == Some(PeerStatus::Connected)
    }

    /// Open data channel of a connected peer, if any.
    pub fn data_channel(&self, peer: &PeerId) -> Option<(ConnectionId, DataChannelId)> {
        let peers = self.peers.read();
        let record = peers.get(peer)?;
        if record.status != PeerStatus::Connected {
            return None;
        }
        Some((record.connection?, record.data_channel?))
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(peer: &str) -> (PeerRegistry, PeerId) {
        let registry = PeerRegistry::new();
        let id = PeerId::new(peer);
        registry.get_or_insert(PeerRecord::new(id.clone(), "org".into()));
        (registry, id)
    }

    #[test]
    fn lifecycle_transitions_are_accepted() {
        let (registry, id) = registry_with("client-1");
        assert_eq!(registry.status(&id), Some(PeerStatus::Connecting));
        registry.transition(&id, PeerStatus::Connected).unwrap();
        registry.transition(&id, PeerStatus::Disconnected).unwrap();
        registry.transition(&id, PeerStatus::Connecting).unwrap();
        registry.transition(&id, PeerStatus::Connected).unwrap();
        assert!(registry.is_connected(&id));
    }

    #[test]
    fn connected_to_connecting_is_rejected() {
        let (registry, id) = registry_with("client-1");
        registry.transition(&id, PeerStatus::Connected).unwrap();
        let err = registry.transition(&id, PeerStatus::Connecting).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                peer: id.clone(),
                from: PeerStatus::Connected,
                to: PeerStatus::Connecting,
            }
        );
        assert_eq!(registry.status(&id), Some(PeerStatus::Connected));
    }

    #[test]
    fn disconnected_cannot_jump_to_connected() {
        let (registry, id) = registry_with("client-1");
        registry.transition(&id, PeerStatus::Disconnected).unwrap();
        assert!(registry.transition(&id, PeerStatus::Connected).is_err());
    }

    #[test]
    fn data_channel_only_reported_while_connected() {
        let (registry, id) = registry_with("client-1");
        registry.update(&id, |r| {
            r.connection = Some(ConnectionId(1));
            r.data_channel = Some(DataChannelId(2));
        });
        assert!(registry.data_channel(&id).is_none());
        registry.transition(&id, PeerStatus::Connected).unwrap();
        assert_eq!(
            registry.data_channel(&id),
            Some((ConnectionId(1), DataChannelId(2)))
        );
    }

    #[test]
    fn get_or_insert_keeps_existing_record() {
        let (registry, id) = registry_with("client-1");
        registry.transition(&id, PeerStatus::Connected).unwrap();
        let record = registry.get_or_insert(PeerRecord::new(id.clone(), "org".into()));
        assert_eq!(record.status, PeerStatus::Connected);
        assert_eq!(registry.len(), 1);
    }
}
