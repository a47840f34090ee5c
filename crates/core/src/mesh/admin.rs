//! Primary election among admin-capable devices.
//!
//! Admins announce themselves with presence heartbeats. The primary is the
//! lexicographically smallest id among admins heard recently; it is
//! re-evaluated whenever an admin joins, leaves or goes silent.

use std::{collections::BTreeMap, collections::BTreeSet, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::types::PeerId;

pub const ADMIN_PURGE_AFTER: Duration = Duration::from_secs(30);
pub const PRIMARY_SILENCE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDevice {
    pub id: PeerId,
    #[serde(skip)]
    pub last_seen: Instant,
    pub is_primary: bool,
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryChange {
    pub previous: Option<PeerId>,
    pub primary: Option<PeerId>,
}

#[derive(Debug)]
pub struct MultiAdminSync {
    local: Option<PeerId>,
    admins: BTreeMap<PeerId, AdminDevice>,
    primary: Option<PeerId>,
    purge_after: Duration,
    primary_silence: Duration,
}

impl Default for MultiAdminSync {
    fn default() -> Self {
        Self::new(ADMIN_PURGE_AFTER, PRIMARY_SILENCE)
    }
}

impl MultiAdminSync {
    pub fn new(purge_after: Duration, primary_silence: Duration) -> Self {
        Self {
            local: None,
            admins: BTreeMap::new(),
            primary: None,
            purge_after,
            primary_silence,
        }
    }

    pub fn primary(&self) -> Option<&PeerId> {
        self.primary.as_ref()
    }

    pub fn is_local_primary(&self) -> bool {
        self.local.is_some() && self.local == self.primary
    }

    pub fn admins(&self) -> Vec<AdminDevice> {
        self.admins.values().cloned().collect()
    }

    pub fn register_as_admin(
        &mut self,
        id: PeerId,
        capabilities: BTreeSet<String>,
        now: Instant,
    ) -> Option<PrimaryChange> {
        tracing::debug!(admin = %id, "Registered local device as admin");
        self.local = Some(id.clone());
        self.on_admin_presence(id, capabilities, now)
    }

    /// An admin announced itself, possibly for the first time.
    pub fn on_admin_presence(
        &mut self,
        id: PeerId,
        capabilities: BTreeSet<String>,
        now: Instant,
    ) -> Option<PrimaryChange> {
        match self.admins.get_mut(&id) {
            Some(device) => {
                device.last_seen = now;
                device.capabilities = capabilities;
                // an admin back from silence may outrank the current primary
                self.promote_new_primary(now)
            }
            None => {
                tracing::info!(admin = %id, "Admin joined");
                self.admins.insert(
                    id.clone(),
                    AdminDevice {
                        id,
                        last_seen: now,
                        is_primary: false,
                        capabilities,
                    },
                );
                self.promote_new_primary(now)
            }
        }
    }

    pub fn on_admin_heartbeat(&mut self, id: &PeerId, now: Instant) -> Option<PrimaryChange> {
        match self.admins.get_mut(id) {
            Some(device) => {
                device.last_seen = now;
                self.promote_new_primary(now)
            }
            None => self.on_admin_presence(id.clone(), BTreeSet::new(), now),
        }
    }

    /// Periodic check: purge long-silent admins and re-elect the primary.
    pub fn tick(&mut self, now: Instant) -> Option<PrimaryChange> {
        if let Some(local) = &self.local {
            if let Some(device) = self.admins.get_mut(local) {
                device.last_seen = now;
            }
        }

        let purge_after = self.purge_after;
        self.admins.retain(|id, device| {
            let keep = now.saturating_duration_since(device.last_seen) <= purge_after;
            if !keep {
                tracing::info!(admin = %id, "Purging silent admin");
            }
            keep
        });

        let primary_silent = self.primary.as_ref().map_or(false, |primary| {
            self.admins.get(primary).map_or(true, |device| {
                now.saturating_duration_since(device.last_seen) > self.primary_silence
            })
        });
        if primary_silent {
            tracing::warn!(primary = ?self.primary, "Primary admin silent, re-electing");
        }
        self.promote_new_primary(now)
    }

    /// Elects the smallest id among admins heard within the silence window.
    pub fn promote_new_primary(&mut self, now: Instant) -> Option<PrimaryChange> {
        let silence = self.primary_silence;
        let next = self
            .admins
            .values()
            .filter(|d| now.saturating_duration_since(d.last_seen) <= silence)
            .map(|d| d.id.clone())
            .next();
        for device in self.admins.values_mut() {
            device.is_primary = Some(&device.id) == next.as_ref();
        }
        if next == self.primary {
            return None;
        }
        let previous = std::mem::replace(&mut self.primary, next.clone());
        tracing::info!(previous = ?previous, primary = ?next, "Primary admin changed");
        Some(PrimaryChange {
            previous,
            primary: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(previous: Option<&str>, primary: Option<&str>) -> Option<PrimaryChange> {
        Some(PrimaryChange {
            previous: previous.map(PeerId::new),
            primary: primary.map(PeerId::new),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn smallest_id_becomes_primary() {
        let now = Instant::now();
        let mut sync = MultiAdminSync::default();
        assert_eq!(
            sync.register_as_admin("admin-b".into(), BTreeSet::new(), now),
            change(None, Some("admin-b"))
        );
        assert!(sync.is_local_primary());
        assert_eq!(
            sync.on_admin_presence("admin-a".into(), BTreeSet::new(), now),
            change(Some("admin-b"), Some("admin-a"))
        );
        assert!(!sync.is_local_primary());
        assert_eq!(sync.on_admin_presence("admin-c".into(), BTreeSet::new(), now), None);
        let primaries: Vec<_> = sync.admins().into_iter().filter(|d| d.is_primary).collect();
        assert_eq!(primaries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_primary_is_replaced_then_purged() {
        let start = Instant::now();
        let mut sync = MultiAdminSync::default();
        sync.register_as_admin("admin-b".into(), BTreeSet::new(), start);
        sync.on_admin_presence("admin-a".into(), BTreeSet::new(), start);
        assert_eq!(sync.primary(), Some(&PeerId::new("admin-a")));

        // admin-a keeps quiet, local admin-b ticks every 5 s
        let mut changed = None;
        for step in 1..=4u32 {
            let now = start + Duration::from_secs(5) * step;
            if let Some(c) = sync.tick(now) {
                changed = Some((step, c));
            }
        }
        let (step, c) = changed.unwrap();
        assert_eq!(step, 4);
        assert_eq!(c.primary, Some("admin-b".into()));
        // still known until the purge window elapses
        assert_eq!(sync.admins().len(), 2);

        sync.tick(start + Duration::from_secs(31));
        assert_eq!(sync.admins().len(), 1);
        assert_eq!(sync.primary(), Some(&PeerId::new("admin-b")));
    }

    #[tokio::test(start_paused = true)]
    async fn returning_admin_regains_primary() {
        let start = Instant::now();
        let mut sync = MultiAdminSync::default();
        sync.register_as_admin("admin-b".into(), BTreeSet::new(), start);
        sync.on_admin_presence("admin-a".into(), BTreeSet::new(), start);

        // admin-a is silent past the primary window but not long enough to be purged
        for secs in [5, 10, 15, 20] {
            sync.tick(start + Duration::from_secs(secs));
        }
        assert_eq!(sync.primary(), Some(&PeerId::new("admin-b")));

        let back = start + Duration::from_secs(22);
        assert_eq!(
            sync.on_admin_heartbeat(&"admin-a".into(), back),
            change(Some("admin-b"), Some("admin-a"))
        );
        for step in 1..=8u32 {
            let now = back + Duration::from_secs(5) * step;
            sync.on_admin_heartbeat(&"admin-a".into(), now);
            assert_eq!(sync.tick(now), None);
            assert_eq!(sync.primary(), Some(&PeerId::new("admin-a")));
        }
        let primaries: Vec<_> = sync.admins().into_iter().filter(|d| d.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, PeerId::new("admin-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_from_unknown_admin_registers_it() {
        let now = Instant::now();
        let mut sync = MultiAdminSync::default();
        assert_eq!(
            sync.on_admin_heartbeat(&"admin-x".into(), now),
            change(None, Some("admin-x"))
        );
        assert_eq!(sync.on_admin_heartbeat(&"admin-x".into(), now), None);
    }
}
