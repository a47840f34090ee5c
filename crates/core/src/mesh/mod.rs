//! Mesh coordination while the admin is away.
//!
//! Every non-admin device tracks admin heartbeats. When none arrives for
//! [`ADMIN_TIMEOUT`] the device considers the admin absent and elects a
//! temporary relay from the topology it learnt through presence messages.
//! Each device runs the same deterministic election on its own snapshot;
//! two partitions may elect different relays, which is accepted.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::types::{OrganizationId, PeerId};

pub mod admin;

pub use admin::{AdminDevice, MultiAdminSync, PrimaryChange};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(15);
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeshPhase {
    Normal,
    AdminAbsent,
    TemporaryRelay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshState {
    pub has_active_admin: bool,
    pub temporary_relay_id: Option<PeerId>,
    pub connected_devices: BTreeSet<PeerId>,
    pub topology: BTreeMap<PeerId, BTreeSet<PeerId>>,
}

impl Default for MeshState {
    fn default() -> Self {
        Self {
            has_active_admin: true,
            temporary_relay_id: None,
            connected_devices: BTreeSet::new(),
            topology: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    AdminAbsent,
    TemporaryRelayElected { relay: PeerId },
    TemporaryRelayDemoted { relay: PeerId },
    AdminRestored,
}

/// Picks the relay: most connections wins, ties go to the smallest id.
pub fn elect(candidates: &BTreeMap<PeerId, usize>) -> Option<PeerId> {
    // BTreeMap iterates ids in ascending order, so the first maximum is the smallest id
    let mut best: Option<(&PeerId, usize)> = None;
    for (id, &connections) in candidates {
        if best.map_or(true, |(_, most)| connections > most) {
            best = Some((id, connections));
        }
    }
    best.map(|(id, _)| id.clone())
}

#[derive(Debug)]
pub struct MeshCoordinator {
    local: PeerId,
    local_is_admin: bool,
    organization: Option<OrganizationId>,
    admin_timeout: Duration,
    phase: MeshPhase,
    state: MeshState,
    last_admin_heartbeat: Option<Instant>,
    admins: BTreeSet<PeerId>,
    heard: HashMap<PeerId, Instant>,
}

impl MeshCoordinator {
    pub fn new(local: PeerId, local_is_admin: bool, admin_timeout: Duration) -> Self {
        Self {
            local,
            local_is_admin,
            organization: None,
            admin_timeout,
            phase: MeshPhase::Normal,
            state: MeshState::default(),
            last_admin_heartbeat: None,
            admins: BTreeSet::new(),
            heard: HashMap::new(),
        }
    }

    /// Begins watching the admin of `organization`. The admin gets a full
    /// timeout to show up before it is considered absent.
    pub fn start_coordination(&mut self, organization: OrganizationId, now: Instant) {
        tracing::debug!(org = %organization, local = %self.local, "Mesh coordination started");
        self.organization = Some(organization);
        self.phase = MeshPhase::Normal;
        self.state.has_active_admin = true;
        self.state.temporary_relay_id = None;
        self.last_admin_heartbeat = Some(now);
    }

    pub fn phase(&self) -> MeshPhase {
        self.phase
    }

    pub fn state(&self) -> &MeshState {
        &self.state
    }

    pub fn is_local_relay(&self) -> bool {
        self.state.temporary_relay_id.as_ref() == Some(&self.local)
    }

    /// Records a presence row. Admin rows are kept for topology but never
    /// become relay candidates.
    pub fn update_topology(
        &mut self,
        peer: PeerId,
        is_admin: bool,
        connected: BTreeSet<PeerId>,
        now: Instant,
    ) {
        if is_admin {
            self.admins.insert(peer.clone());
        }
        self.heard.insert(peer.clone(), now);
        self.state.topology.insert(peer, connected);
    }

    /// Refreshes the local row from the registry.
    pub fn set_local_connections(&mut self, connected: BTreeSet<PeerId>) {
        self.state.connected_devices = connected.clone();
        self.state.topology.insert(self.local.clone(), connected);
    }

    pub fn on_admin_heartbeat(&mut self, now: Instant) -> Vec<MeshEvent> {
        self.last_admin_heartbeat = Some(now);
        if self.phase == MeshPhase::Normal {
            return Vec::new();
        }
        self.on_admin_return()
    }

    /// Runs on every liveness tick.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<MeshEvent> {
        if self.local_is_admin || self.organization.is_none() {
            return Vec::new();
        }
        self.prune(now);
        let mut events = Vec::new();
        if self.phase == MeshPhase::Normal {
            let silent = self
                .last_admin_heartbeat
                .map_or(true, |last| now.saturating_duration_since(last) >= self.admin_timeout);
            if !silent {
                return events;
            }
            events.extend(self.on_admin_timeout());
        }
        if self.phase == MeshPhase::AdminAbsent {
            events.extend(self.elect_temporary_relay());
        }
        events
    }

    pub fn on_admin_timeout(&mut self) -> Option<MeshEvent> {
        if self.phase != MeshPhase::Normal {
            return None;
        }
        tracing::warn!(local = %self.local, "Admin heartbeat timed out");
        self.phase = MeshPhase::AdminAbsent;
        self.state.has_active_admin = false;
        Some(MeshEvent::AdminAbsent)
    }

    /// Elects a relay among the known non-admin devices. No-op while a relay
    /// is active or the admin is present.
    pub fn elect_temporary_relay(&mut self) -> Option<MeshEvent> {
        if self.state.has_active_admin || self.state.temporary_relay_id.is_some() {
            return None;
        }
        let candidates = self.candidates();
        let relay = elect(&candidates)?;
        tracing::info!(%relay, local = %self.local, candidates = candidates.len(), "Temporary relay elected");
        self.state.temporary_relay_id = Some(relay.clone());
        // the other devices stay admin-absent and follow the relay
        if relay == self.local {
            self.phase = MeshPhase::TemporaryRelay;
        }
        Some(MeshEvent::TemporaryRelayElected { relay })
    }

    pub fn on_admin_return(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        if let Some(relay) = self.state.temporary_relay_id.take() {
            tracing::info!(%relay, "Admin returned, demoting temporary relay");
            events.push(MeshEvent::TemporaryRelayDemoted { relay });
        }
        if !self.state.has_active_admin {
            events.push(MeshEvent::AdminRestored);
        }
        self.state.has_active_admin = true;
        self.phase = MeshPhase::Normal;
        events
    }

    fn candidates(&self) -> BTreeMap<PeerId, usize> {
        let mut candidates: BTreeMap<PeerId, usize> = self
            .state
            .topology
            .iter()
            .filter(|(id, _)| !self.admins.contains(*id))
            .map(|(id, links)| {
                let live = links.iter().filter(|l| !self.admins.contains(*l)).count();
                (id.clone(), live)
            })
            .collect();
        if !self.local_is_admin {
            let local_links = self
                .state
                .connected_devices
                .iter()
                .filter(|l| !self.admins.contains(*l))
                .count();
            candidates.insert(self.local.clone(), local_links);
        }
        candidates
    }

    /// Forgets rows of devices not heard from for two timeouts.
    fn prune(&mut self, now: Instant) {
        let horizon = self.admin_timeout * 2;
        let stale: Vec<PeerId> = self
            .heard
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > horizon)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.heard.remove(&id);
            self.state.topology.remove(&id);
            tracing::debug!(peer = %id, "Dropped stale topology row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<PeerId> {
        ids.iter().map(|id| PeerId::new(*id)).collect()
    }

    fn coordinator(local: &str) -> (MeshCoordinator, Instant) {
        let now = Instant::now();
        let mut mesh = MeshCoordinator::new(local.into(), false, ADMIN_TIMEOUT);
        mesh.start_coordination("org".into(), now);
        (mesh, now)
    }

    #[test]
    fn election_prefers_connections_then_smallest_id() {
        let mut candidates = BTreeMap::new();
        candidates.insert(PeerId::new("c"), 2);
        candidates.insert(PeerId::new("b"), 3);
        candidates.insert(PeerId::new("a"), 3);
        assert_eq!(elect(&candidates), Some("a".into()));
        candidates.insert(PeerId::new("d"), 4);
        assert_eq!(elect(&candidates), Some("d".into()));
        assert_eq!(elect(&BTreeMap::new()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn election_is_identical_for_identical_snapshots() {
        let rows = [
            ("client-b", set(&["client-c"])),
            ("client-c", set(&["client-b"])),
            ("client-d", set(&[])),
        ];
        let mut elected = Vec::new();
        for local in ["client-a", "client-b", "client-c"] {
            let (mut mesh, now) = coordinator(local);
            mesh.update_topology("client-a".into(), false, set(&[]), now);
            for (peer, links) in &rows {
                mesh.update_topology((*peer).into(), false, links.clone(), now);
            }
            let local_row = mesh.state().topology.get(&PeerId::new(local)).cloned();
            mesh.set_local_connections(local_row.unwrap_or_default());
            mesh.check_liveness(now + ADMIN_TIMEOUT);
            elected.push(mesh.state().temporary_relay_id.clone());
        }
        assert!(elected.iter().all(|r| r == &Some(PeerId::new("client-b"))));
    }

    #[tokio::test(start_paused = true)]
    async fn admin_timeout_then_return() {
        let (mut mesh, now) = coordinator("client-1");
        mesh.update_topology("admin".into(), true, set(&["client-1", "client-2"]), now);
        mesh.update_topology("client-2".into(), false, set(&["admin"]), now);
        mesh.set_local_connections(set(&["admin"]));

        assert!(mesh.check_liveness(now + Duration::from_secs(14)).is_empty());
        let events = mesh.check_liveness(now + ADMIN_TIMEOUT);
        assert_eq!(
            events,
            vec![
                MeshEvent::AdminAbsent,
                MeshEvent::TemporaryRelayElected {
                    relay: "client-1".into()
                }
            ]
        );
        assert_eq!(mesh.phase(), MeshPhase::TemporaryRelay);
        assert!(mesh.is_local_relay());
        assert!(!mesh.state().has_active_admin);

        // a second election while a relay is active does nothing
        assert_eq!(mesh.elect_temporary_relay(), None);

        let events = mesh.on_admin_heartbeat(now + Duration::from_secs(20));
        assert_eq!(
            events,
            vec![
                MeshEvent::TemporaryRelayDemoted {
                    relay: "client-1".into()
                },
                MeshEvent::AdminRestored
            ]
        );
        assert!(mesh.state().has_active_admin);
        assert_eq!(mesh.state().temporary_relay_id, None);
        assert_eq!(mesh.phase(), MeshPhase::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_admin_present() {
        let (mut mesh, now) = coordinator("client-1");
        for tick in 1..=10u64 {
            let at = now + HEARTBEAT_INTERVAL * tick as u32;
            mesh.on_admin_heartbeat(at);
            assert!(mesh.check_liveness(at + Duration::from_secs(1)).is_empty());
        }
        assert_eq!(mesh.phase(), MeshPhase::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn admin_devices_never_elect() {
        let now = Instant::now();
        let mut mesh = MeshCoordinator::new("admin".into(), true, ADMIN_TIMEOUT);
        mesh.start_coordination("org".into(), now);
        assert!(mesh.check_liveness(now + Duration::from_secs(60)).is_empty());
        assert!(mesh.state().has_active_admin);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_rows_are_not_candidates() {
        let (mut mesh, now) = coordinator("client-z");
        mesh.update_topology("client-a".into(), false, set(&[]), now);
        let later = now + ADMIN_TIMEOUT * 3;
        mesh.check_liveness(later);
        assert_eq!(mesh.state().temporary_relay_id, Some("client-z".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn members_stay_admin_absent_under_a_relay() {
        let (mut mesh, now) = coordinator("client-2");
        mesh.update_topology("client-1".into(), false, set(&["client-3"]), now);
        mesh.update_topology("client-3".into(), false, set(&["client-1"]), now);
        mesh.set_local_connections(set(&[]));

        let events = mesh.check_liveness(now + ADMIN_TIMEOUT);
        assert_eq!(
            events,
            vec![
                MeshEvent::AdminAbsent,
                MeshEvent::TemporaryRelayElected {
                    relay: "client-1".into()
                }
            ]
        );
        assert_eq!(mesh.phase(), MeshPhase::AdminAbsent);
        assert!(!mesh.is_local_relay());
        // later liveness checks keep the elected relay
        assert!(mesh.check_liveness(now + ADMIN_TIMEOUT * 2).is_empty());
        assert_eq!(mesh.state().temporary_relay_id, Some("client-1".into()));

        let events = mesh.on_admin_heartbeat(now + ADMIN_TIMEOUT * 2);
        assert_eq!(
            events,
            vec![
                MeshEvent::TemporaryRelayDemoted {
                    relay: "client-1".into()
                },
                MeshEvent::AdminRestored
            ]
        );
        assert_eq!(mesh.phase(), MeshPhase::Normal);
    }
}
