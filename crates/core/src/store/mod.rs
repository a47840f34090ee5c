//! Durable record of the peers an organization has seen.
//!
//! One [`ServerState`] is kept per organization. The store shadows the
//! in-memory registry: every successful connection and every failed attempt
//! is written through, and the record is read once at startup to resume
//! links without user action.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    message::SessionDescription,
    types::{OrganizationId, PeerId},
};

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Peers with more failed attempts than this are evicted.
pub const MAX_STORED_ATTEMPTS: u32 = 5;

/// Peers not connected for longer than this are dropped on load.
pub fn retention() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode stored state: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPeer {
    pub id: PeerId,
    pub name: String,
    pub organization_id: OrganizationId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_connected: DateTime<Utc>,
    pub connection_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_offer: Option<SessionDescription>,
}

impl StoredPeer {
    pub fn new(id: PeerId, name: impl Into<String>, organization_id: OrganizationId) -> Self {
        Self {
            id,
            name: name.into(),
            organization_id,
            last_connected: Utc::now(),
            connection_attempts: 0,
            last_offer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub admin_id: Option<PeerId>,
    #[serde(default)]
    pub last_server_offer: Option<SessionDescription>,
    #[serde(default)]
    pub clients: Vec<StoredPeer>,
    #[serde(default)]
    pub is_active: bool,
}

impl ServerState {
    pub fn new(organization_id: OrganizationId, organization_name: impl Into<String>) -> Self {
        Self {
            organization_id,
            organization_name: organization_name.into(),
            admin_id: None,
            last_server_offer: None,
            clients: Vec::new(),
            is_active: false,
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<&StoredPeer> {
        self.clients.iter().find(|p| &p.id == id)
    }
}

/// Where serialized [`ServerState`] records live.
pub trait StoreBackend: Send + Sync + 'static {
    fn read(
        &self,
        organization: &OrganizationId,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    fn write(
        &self,
        organization: &OrganizationId,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(
        &self,
        organization: &OrganizationId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub struct PeerStore<B> {
    backend: Arc<B>,
    write_lock: Arc<Mutex<()>>,
}

impl<B> Clone for PeerStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

impl<B: StoreBackend> PeerStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Loads the record of `organization`, dropping stale and exhausted peers.
    ///
    /// Corrupt records load as `None`.
    pub async fn load(&self, organization: &OrganizationId) -> Result<Option<ServerState>, StoreError> {
        let Some(mut state) = self.read_raw(organization).await? else {
            return Ok(None);
        };
        let dropped = retain_live(&mut state);
        if dropped > 0 {
            tracing::debug!(org = %organization, dropped, "Dropped stale peers from stored state");
        }
        Ok(Some(state))
    }

    /// Rewrites the record without stale and exhausted peers; returns how many were dropped.
    pub async fn prune(&self, organization: &OrganizationId) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut state) = self.read_raw(organization).await? else {
            return Ok(0);
        };
        let dropped = retain_live(&mut state);
        if dropped > 0 {
            self.write_raw(&state).await?;
        }
        Ok(dropped)
    }

    pub async fn save(&self, state: &ServerState) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_raw(state).await
    }

    /// Inserts or replaces `peer`. A peer over the attempt ceiling is evicted instead.
    pub async fn upsert_peer(&self, peer: StoredPeer) -> Result<(), StoreError> {
        let organization = peer.organization_id.clone();
        self.modify(&organization, |state| {
            state.clients.retain(|p| p.id != peer.id);
            if peer.connection_attempts > MAX_STORED_ATTEMPTS {
                tracing::info!(peer = %peer.id, attempts = peer.connection_attempts, "Evicting stored peer");
            } else {
                state.clients.push(peer);
            }
        })
        .await
    }

    /// Applies `f` to the stored record of `peer`, creating it from `template` when absent.
    pub async fn update_peer(
        &self,
        template: StoredPeer,
        f: impl FnOnce(&mut StoredPeer) + Send,
    ) -> Result<(), StoreError> {
        let organization = template.organization_id.clone();
        self.modify(&organization, |state| {
            let mut peer = match state.clients.iter().position(|p| p.id == template.id) {
                Some(index) => state.clients.remove(index),
                None => template,
            };
            f(&mut peer);
            if peer.connection_attempts > MAX_STORED_ATTEMPTS {
                tracing::info!(peer = %peer.id, attempts = peer.connection_attempts, "Evicting stored peer");
            } else {
                state.clients.push(peer);
            }
        })
        .await
    }

    pub async fn remove_peer(&self, organization: &OrganizationId, peer: &PeerId) -> Result<(), StoreError> {
        self.modify(organization, |state| state.clients.retain(|p| &p.id != peer))
            .await
    }

    pub async fn set_active(&self, organization: &OrganizationId, active: bool) -> Result<(), StoreError> {
        self.modify(organization, |state| state.is_active = active).await
    }

    /// Records the offer this device last sent as admin.
    pub async fn set_server_offer(
        &self,
        organization: &OrganizationId,
        offer: SessionDescription,
    ) -> Result<(), StoreError> {
        self.modify(organization, |state| state.last_server_offer = Some(offer))
            .await
    }

    /// Creates the record if missing and refreshes its identity fields.
    pub async fn ensure(
        &self,
        organization: &OrganizationId,
        organization_name: &str,
        admin_id: Option<PeerId>,
    ) -> Result<(), StoreError> {
        self.modify(organization, |state| {
            if !organization_name.is_empty() {
                state.organization_name = organization_name.to_owned();
            }
            if admin_id.is_some() {
                state.admin_id = admin_id;
            }
        })
        .await
    }

    pub async fn clear(&self, organization: &OrganizationId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.backend.delete(organization).await
    }

    async fn modify<R: Send>(
        &self,
        organization: &OrganizationId,
        f: impl FnOnce(&mut ServerState) -> R + Send,
    ) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .read_raw(organization)
            .await?
            .unwrap_or_else(|| ServerState::new(organization.clone(), ""));
        let out = f(&mut state);
        self.write_raw(&state).await?;
        Ok(out)
    }

    async fn read_raw(&self, organization: &OrganizationId) -> Result<Option<ServerState>, StoreError> {
        let Some(bytes) = self.backend.read(organization).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ServerState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(error) => {
                tracing::warn!(org = %organization, %error, "Stored state is corrupt, starting fresh");
                Ok(None)
            }
        }
    }

    async fn write_raw(&self, state: &ServerState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.backend.write(&state.organization_id, bytes).await
    }
}

fn retain_live(state: &mut ServerState) -> usize {
    let cutoff = Utc::now() - retention();
    let before = state.clients.len();
    state.clients.retain(|peer| {
        peer.last_connected >= cutoff && peer.connection_attempts <= MAX_STORED_ATTEMPTS
    });
    before - state.clients.len()
}
