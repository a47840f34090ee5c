//! In-process relay server used by tests and `orgmesh simulate`.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{RelayConnector, RelaySession, SignalingError};
use crate::{
    message::{SignalEnvelope, SignalPayload},
    types::{OrganizationId, PeerId},
};

struct Registered {
    organization: OrganizationId,
    session: u64,
    sender: mpsc::UnboundedSender<SignalEnvelope>,
}

#[derive(Default)]
struct HubState {
    next_session: u64,
    offline: bool,
    pending: HashMap<u64, mpsc::UnboundedSender<SignalEnvelope>>,
    registered: HashMap<PeerId, Registered>,
    routed: u64,
}

impl HubState {
    fn route(&mut self, session: u64, envelope: SignalEnvelope) {
        if let SignalPayload::Register(_) = &envelope.payload {
            let sender = match self.pending.remove(&session) {
                Some(sender) => sender,
                None => match self
                    .registered
                    .values()
                    .find(|r| r.session == session)
                {
                    Some(existing) => existing.sender.clone(),
                    None => return,
                },
            };
            self.registered.retain(|_, r| r.session != session);
            tracing::debug!(peer = %envelope.from_id, org = %envelope.organization_id, "Relay registration");
            self.registered.insert(
                envelope.from_id.clone(),
                Registered {
                    organization: envelope.organization_id.clone(),
                    session,
                    sender,
                },
            );
            return;
        }

        match &envelope.to_id {
            Some(target) => match self.registered.get(target) {
                Some(r) if r.organization == envelope.organization_id => {
                    if r.sender.send(envelope).is_ok() {
                        self.routed += 1;
                    }
                }
                _ => {
                    tracing::trace!(%target, kind = envelope.payload.kind(), "Relay target unknown, dropping");
                }
            },
            None => {
                for (peer, r) in &self.registered {
                    if r.organization == envelope.organization_id
                        && *peer != envelope.from_id
                        && r.sender.send(envelope.clone()).is_ok()
                    {
                        self.routed += 1;
                    }
                }
            }
        }
    }
}

/// Routes envelopes between registered sessions: by `toId`, or to every
/// other member of the sender's organization when it is absent.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryRelayConnector {
        MemoryRelayConnector { hub: self.clone() }
    }

    /// Taking the hub offline refuses new sessions and closes existing ones.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.offline = !online;
        if !online {
            state.pending.clear();
            state.registered.clear();
        }
    }

    pub fn registered_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.state.lock().registered.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn routed(&self) -> u64 {
        self.state.lock().routed
    }
}

#[derive(Clone)]
pub struct MemoryRelayConnector {
    hub: MemoryRelayHub,
}

impl RelayConnector for MemoryRelayConnector {
    type Session = MemoryRelaySession;

    async fn connect(&self) -> Result<MemoryRelaySession, SignalingError> {
        let mut state = self.hub.state.lock();
        if state.offline {
            return Err(SignalingError::RelayUnavailable("relay offline".into()));
        }
        state.next_session += 1;
        let session = state.next_session;
        let (tx, rx) = mpsc::unbounded_channel();
        state.pending.insert(session, tx);
        Ok(MemoryRelaySession {
            hub: self.hub.clone(),
            session,
            incoming: rx,
        })
    }
}

pub struct MemoryRelaySession {
    hub: MemoryRelayHub,
    session: u64,
    incoming: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl RelaySession for MemoryRelaySession {
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        // same JSON a real relay would see
        let wire = serde_json::to_string(envelope)?;
        let envelope: SignalEnvelope = serde_json::from_str(&wire)?;
        let mut state = self.hub.state.lock();
        if state.offline {
            return Err(SignalingError::RelayUnavailable("relay offline".into()));
        }
        state.route(self.session, envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<SignalEnvelope, SignalingError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn disconnect(self) {}
}

impl Drop for MemoryRelaySession {
    // a dropped session leaves the hub like a closed socket would
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        state.pending.remove(&self.session);
        state.registered.retain(|_, r| r.session != self.session);
    }
}
