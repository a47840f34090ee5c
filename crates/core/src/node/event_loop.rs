//! The node's main loop.
//!
//! All inputs (transport events, relay traffic, handle commands, address
//! changes and timers) are multiplexed here. Per-peer work is forwarded to the
//! peer actors; cross-peer decisions (who to link with, relay election,
//! primary admin, location forwarding) are taken here.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    pin::Pin,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc},
    time::{interval, Instant, MissedTickBehavior, Sleep},
};

use super::{
    connection::{self, ActorReport, PeerCommand, PeerContext},
    MeshSnapshot, NodeCommand, NodeEvent,
};
use crate::{
    ip_monitor::{IpChange, IpChangeMonitor},
    mesh::{MeshCoordinator, MeshEvent, MultiAdminSync, PrimaryChange},
    message::{ChannelMessage, IpChangedData, LocationUpdate, Presence, SignalEnvelope, SignalPayload},
    reconnect::FailureReason,
    signaling::{RecentBroadcasts, RelayLink, SignalingError},
    store::StoreBackend,
    transport::{PeerTransport, TransportEvent, TransportEventReceiver},
    types::PeerId,
};

const RECENT_LOCATIONS: usize = 512;
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) struct Inputs {
    pub transport_events: TransportEventReceiver,
    pub relay_inbound: Option<mpsc::Receiver<SignalEnvelope>>,
    pub commands: mpsc::Receiver<NodeCommand>,
    pub reports: mpsc::UnboundedReceiver<ActorReport>,
    pub ip_changes: Option<broadcast::Receiver<IpChange>>,
}

struct ActorHandle {
    inbox: mpsc::Sender<PeerCommand>,
    actor_id: u64,
}

/// Whether a command for a peer without a running actor starts one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spawn {
    Never,
    UnlessFailed,
    Always,
}

pub(super) struct EventLoop<T, B> {
    ctx: Arc<PeerContext<T, B>>,
    inputs: Inputs,
    relay_link: Option<RelayLink>,
    ip_monitor: Option<IpChangeMonitor>,
    actors: HashMap<PeerId, ActorHandle>,
    next_actor_id: u64,
    mesh: MeshCoordinator,
    admins: MultiAdminSync,
    recent: RecentBroadcasts,
    recent_locations: VecDeque<(PeerId, i64)>,
    client_grace: Option<Pin<Box<Sleep>>>,
}

impl<T: PeerTransport, B: StoreBackend> EventLoop<T, B> {
    pub fn new(
        ctx: Arc<PeerContext<T, B>>,
        inputs: Inputs,
        relay_link: Option<RelayLink>,
        ip_monitor: Option<IpChangeMonitor>,
    ) -> Self {
        let mesh = MeshCoordinator::new(
            ctx.identity.id.clone(),
            ctx.identity.role.is_admin(),
            ctx.config.admin_timeout,
        );
        let admins = MultiAdminSync::new(ctx.config.admin_purge_after, ctx.config.primary_silence);
        Self {
            ctx,
            inputs,
            relay_link,
            ip_monitor,
            actors: HashMap::new(),
            next_actor_id: 0,
            mesh,
            admins,
            recent: RecentBroadcasts::default(),
            recent_locations: VecDeque::with_capacity(RECENT_LOCATIONS),
            client_grace: None,
        }
    }

    pub async fn run(mut self) {
        self.startup().await;

        let mut presence = interval(self.ctx.config.heartbeat_interval);
        presence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut liveness = interval(self.ctx.config.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = interval(self.ctx.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.inputs.commands.recv() => match command {
                    Some(NodeCommand::Shutdown(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(event) = self.inputs.transport_events.recv() => self.on_transport_event(event).await,
                envelope = next_inbound(&mut self.inputs.relay_inbound) => self.on_envelope(envelope).await,
                Some(report) = self.inputs.reports.recv() => self.on_report(report),
                change = next_ip_change(&mut self.inputs.ip_changes) => self.on_ip_change(change).await,
                _ = grace_elapsed(&mut self.client_grace) => self.on_client_grace_expired().await,
                _ = presence.tick() => self.on_presence_tick().await,
                _ = liveness.tick() => {
                    let events = self.mesh.check_liveness(Instant::now());
                    self.apply_mesh_events(events).await;
                }
                _ = cleanup.tick() => self.on_cleanup_tick().await,
            }
        }
    }

    async fn startup(&mut self) {
        let identity = self.ctx.identity.clone();
        let organization = &identity.organization_id;
        let stored = match self.ctx.store.load(organization).await {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(org = %organization, %error, "Failed to load stored state");
                None
            }
        };
        if let Some(state) = stored {
            if let Some(admin) = &state.admin_id {
                if *admin != identity.id {
                    self.ctx.known_admins.write().insert(admin.clone());
                }
            }
            if state.is_active && !state.clients.is_empty() {
                tracing::info!(org = %organization, peers = state.clients.len(), "Resuming stored peers");
                for stored in state.clients {
                    if stored.id == identity.id {
                        continue;
                    }
                    self.dispatch(
                        &stored.id,
                        PeerCommand::Resume {
                            last_offer: stored.last_offer,
                        },
                        Spawn::Always,
                    )
                    .await;
                    let name = stored.name;
                    self.ctx.registry.update(&stored.id, |r| r.name = name);
                }
            }
        }

        let admin_id = if identity.role.is_admin() {
            Some(identity.id.clone())
        } else {
            self.ctx.config.admin_id.clone()
        };
        let activated = async {
            self.ctx
                .store
                .ensure(organization, &identity.organization_name, admin_id)
                .await?;
            self.ctx.store.set_active(organization, true).await
        };
        if let Err(error) = activated.await {
            tracing::warn!(org = %organization, %error, "Failed to mark stored state active");
        }

        let now = Instant::now();
        self.mesh.start_coordination(organization.clone(), now);
        if identity.role.is_admin() {
            let change = self.admins.register_as_admin(
                identity.id.clone(),
                self.ctx.config.capabilities.clone(),
                now,
            );
            self.emit_primary_change(change);
        }
    }

    async fn on_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Open { peer, reply } => {
                let result = if peer == self.ctx.identity.id {
                    Err(super::NodeError::UnknownPeer(peer))
                } else {
                    self.dispatch(&peer, PeerCommand::Open, Spawn::Always).await;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            NodeCommand::ForceReconnect { peer } => {
                let peers = match peer {
                    Some(peer) => vec![peer],
                    None => {
                        let mut all: BTreeSet<PeerId> = self.actors.keys().cloned().collect();
                        all.extend(self.ctx.registry.ids());
                        // given-up peers have no actor left and may be gone from the registry
                        all.extend(self.ctx.reconnection.lock().permanently_failed().cloned());
                        all.into_iter().collect()
                    }
                };
                for peer in peers {
                    self.dispatch(&peer, PeerCommand::ForceReconnect, Spawn::Always)
                        .await;
                }
            }
            NodeCommand::BroadcastLocation { update, reply } => {
                let result = self
                    .ctx
                    .signaling
                    .send_location(update, None)
                    .await
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            NodeCommand::MeshState(reply) => {
                let _ = reply.send(MeshSnapshot {
                    phase: self.mesh.phase(),
                    state: self.mesh.state().clone(),
                });
            }
            NodeCommand::PrimaryAdmin(reply) => {
                let _ = reply.send(self.admins.primary().cloned());
            }
            NodeCommand::ClearStoredState(reply) => {
                let result = self
                    .ctx
                    .store
                    .clear(&self.ctx.identity.organization_id)
                    .await
                    .map_err(Into::into);
                tracing::info!(org = %self.ctx.identity.organization_id, "Cleared stored state");
                let _ = reply.send(result);
            }
            // handled by the loop itself
            NodeCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DataChannelMessage { peer, payload, .. } => {
                self.ctx.registry.touch(&peer);
                match self.ctx.signaling.codec().decode_frame(&payload) {
                    Ok(ChannelMessage::Signal(envelope)) => self.on_envelope(envelope).await,
                    Ok(ChannelMessage::Location(update)) => self.on_location(update).await,
                    Err(error) => tracing::warn!(%peer, %error, "Undecodable data channel frame"),
                }
            }
            event => {
                let peer = event.peer().clone();
                self.dispatch(&peer, PeerCommand::Transport(event), Spawn::Never)
                    .await;
            }
        }
    }

    async fn on_envelope(&mut self, envelope: SignalEnvelope) {
        let identity = &self.ctx.identity;
        if !envelope.is_for(&identity.id, &identity.organization_id) {
            return;
        }
        if !self.recent.first_sighting(&envelope) {
            tracing::trace!(from = %envelope.from_id, kind = envelope.payload.kind(), "Duplicate broadcast");
            return;
        }
        let from = envelope.from_id;
        tracing::trace!(%from, kind = envelope.payload.kind(), "Signal received");
        match envelope.payload {
            SignalPayload::NewOffer(offer) => {
                if self.ctx.is_admin(&from) && self.client_grace.take().is_some() {
                    tracing::debug!(admin = %from, "Admin re-offered within the grace period");
                }
                self.dispatch(&from, PeerCommand::RemoteOffer(offer), Spawn::Always)
                    .await;
            }
            SignalPayload::NewAnswer(answer) => {
                self.dispatch(&from, PeerCommand::RemoteAnswer(answer), Spawn::Never)
                    .await;
            }
            SignalPayload::IceCandidate(candidate) => {
                self.dispatch(&from, PeerCommand::RemoteCandidate(candidate), Spawn::UnlessFailed)
                    .await;
            }
            SignalPayload::IpChanged(change) => self.on_peer_ip_changed(from, change).await,
            SignalPayload::ReconnectionRequest(request) => {
                if !self.actors.contains_key(&from) && !self.should_link(&from, false) {
                    tracing::debug!(%from, "Reconnection request from a peer we do not link with");
                    return;
                }
                self.dispatch(
                    &from,
                    PeerCommand::ReconnectionRequest(request.reason),
                    Spawn::UnlessFailed,
                )
                .await;
            }
            SignalPayload::Presence(presence) => self.on_presence(from, presence).await,
            // consumed by the relay server
            SignalPayload::Register(_) => {}
        }
    }

    async fn on_peer_ip_changed(&mut self, from: PeerId, change: IpChangedData) {
        tracing::info!(peer = %from, old = ?change.old_ip, new = %change.new_ip, "Peer address changed");
        self.ctx
            .registry
            .update(&from, |r| r.last_ip = Some(change.new_ip));
        if self.actors.contains_key(&from) && self.ctx.is_offerer_towards(&from) {
            self.dispatch(
                &from,
                PeerCommand::Renegotiate {
                    reason: FailureReason::IpChange,
                    restart: true,
                },
                Spawn::Never,
            )
            .await;
        }
    }

    async fn on_presence(&mut self, from: PeerId, presence: Presence) {
        let now = Instant::now();
        let is_admin = presence.role.is_admin();
        let name = presence.name.clone();
        self.ctx.registry.update(&from, |r| {
            r.name = name;
            r.is_admin = is_admin;
            r.last_seen = Utc::now();
        });
        if is_admin {
            self.ctx.known_admins.write().insert(from.clone());
            let change = self
                .admins
                .on_admin_presence(from.clone(), presence.capabilities.clone(), now);
            self.emit_primary_change(change);
            let events = self.mesh.on_admin_heartbeat(now);
            self.apply_mesh_events(events).await;
        }
        self.mesh
            .update_topology(from.clone(), is_admin, presence.connected, now);
        self.maybe_open(&from, presence.relaying).await;
    }

    /// Links are kept between the admin and every client, and between the
    /// temporary relay and everybody else.
    fn should_link(&self, peer: &PeerId, peer_relaying: bool) -> bool {
        self.ctx.identity.role.is_admin()
            || self.ctx.is_admin(peer)
            || self.mesh.is_local_relay()
            || peer_relaying
            || self.mesh.state().temporary_relay_id.as_ref() == Some(peer)
    }

    /// Opens a link to `peer` when this side is the offerer and none exists yet.
    async fn maybe_open(&mut self, peer: &PeerId, peer_relaying: bool) {
        if self.actors.contains_key(peer)
            || self.ctx.registry.contains(peer)
            || self.ctx.reconnection.lock().is_permanently_failed(peer)
        {
            return;
        }
        if !self.ctx.is_offerer_towards(peer) || !self.should_link(peer, peer_relaying) {
            return;
        }
        tracing::debug!(%peer, "Opening link");
        self.dispatch(peer, PeerCommand::Open, Spawn::Always).await;
    }

    async fn on_location(&mut self, update: LocationUpdate) {
        if update.peer_id == self.ctx.identity.id {
            return;
        }
        let key = (update.peer_id.clone(), update.timestamp);
        if self.recent_locations.contains(&key) {
            return;
        }
        if self.recent_locations.len() == RECENT_LOCATIONS {
            self.recent_locations.pop_front();
        }
        self.recent_locations.push_back(key);
        self.ctx.emit(NodeEvent::LocationReceived(update.clone()));

        if self.admins.is_local_primary() || self.mesh.is_local_relay() {
            let source = update.peer_id.clone();
            match self.ctx.signaling.send_location(update, Some(&source)).await {
                Ok(forwarded) => tracing::trace!(%source, forwarded, "Forwarded location"),
                Err(error) => tracing::debug!(%source, %error, "Failed to forward location"),
            }
        }
    }

    async fn on_ip_change(&mut self, change: IpChange) {
        tracing::info!(old = %change.old, new = %change.new, "Local address changed");
        self.ctx.emit(NodeEvent::IpChanged {
            old: change.old,
            new: change.new,
        });
        let notice = self.ctx.envelope(SignalPayload::IpChanged(IpChangedData {
            old_ip: Some(change.old),
            new_ip: change.new,
        }));
        self.broadcast(notice).await;

        let mut offered = Vec::new();
        for peer in self.ctx.registry.ids() {
            if self.ctx.is_offerer_towards(&peer) {
                offered.push(peer);
            }
        }
        for peer in offered {
            self.dispatch(
                &peer,
                PeerCommand::Renegotiate {
                    reason: FailureReason::IpChange,
                    restart: true,
                },
                Spawn::Never,
            )
            .await;
        }
        if !self.ctx.identity.role.is_admin() {
            // links we answer on wait for the other side to re-offer first
            self.ctx.ip_unstable.store(true, Ordering::Release);
            self.client_grace = Some(Box::pin(tokio::time::sleep(
                self.ctx.config.client_ip_grace,
            )));
        }
    }

    async fn on_client_grace_expired(&mut self) {
        self.client_grace = None;
        if !self.ctx.ip_unstable.load(Ordering::Acquire) {
            return;
        }
        tracing::info!("No offer after address change, reconnecting ourselves");
        for peer in self.ctx.registry.ids() {
            if self.ctx.is_offerer_towards(&peer) {
                continue;
            }
            self.dispatch(
                &peer,
                PeerCommand::Renegotiate {
                    reason: FailureReason::IpChange,
                    restart: true,
                },
                Spawn::Never,
            )
            .await;
        }
    }

    async fn on_presence_tick(&mut self) {
        let connected: BTreeSet<PeerId> = self.ctx.registry.connected().into_iter().collect();
        self.mesh.set_local_connections(connected.clone());
        let presence = self.ctx.envelope(SignalPayload::Presence(Presence {
            name: self.ctx.identity.name.clone(),
            role: self.ctx.identity.role,
            connected,
            capabilities: self.ctx.config.capabilities.clone(),
            relaying: self.mesh.is_local_relay(),
        }));
        self.broadcast(presence).await;

        let change = self.admins.tick(Instant::now());
        self.emit_primary_change(change);
    }

    async fn on_cleanup_tick(&mut self) {
        let orphaned: Vec<PeerId> = self
            .ctx
            .registry
            .ids()
            .into_iter()
            .filter(|peer| !self.actors.contains_key(peer))
            .collect();
        for peer in orphaned {
            tracing::debug!(%peer, "Removing orphaned registry entry");
            self.ctx.registry.remove(&peer);
        }
        match self.ctx.store.prune(&self.ctx.identity.organization_id).await {
            Ok(0) => {}
            Ok(dropped) => tracing::info!(dropped, "Pruned stale stored peers"),
            Err(error) => tracing::warn!(%error, "Stored state cleanup failed"),
        }
    }

    async fn apply_mesh_events(&mut self, events: Vec<MeshEvent>) {
        let local = self.ctx.identity.id.clone();
        for event in events {
            match event {
                MeshEvent::AdminAbsent => self.ctx.emit(NodeEvent::AdminAbsent),
                MeshEvent::TemporaryRelayElected { relay } => {
                    self.ctx.emit(NodeEvent::TemporaryRelayElected {
                        local: relay == local,
                        relay,
                    });
                    let devices: Vec<PeerId> = self
                        .mesh
                        .state()
                        .topology
                        .keys()
                        .filter(|peer| **peer != local && !self.ctx.is_admin(peer))
                        .cloned()
                        .collect();
                    for peer in devices {
                        self.maybe_open(&peer, false).await;
                    }
                }
                MeshEvent::TemporaryRelayDemoted { relay } => {
                    let was_local = relay == local;
                    self.ctx.emit(NodeEvent::TemporaryRelayDemoted {
                        relay: relay.clone(),
                        local: was_local,
                    });
                    let links: Vec<PeerId> = self
                        .ctx
                        .registry
                        .snapshot()
                        .into_iter()
                        .filter(|r| !self.ctx.is_admin(&r.id) && (was_local || r.id == relay))
                        .map(|r| r.id)
                        .collect();
                    for peer in links {
                        tracing::debug!(%peer, "Closing relay-mode link");
                        self.dispatch(&peer, PeerCommand::Close, Spawn::Never).await;
                    }
                }
                MeshEvent::AdminRestored => self.ctx.emit(NodeEvent::AdminRestored),
            }
        }
    }

    fn emit_primary_change(&self, change: Option<PrimaryChange>) {
        if let Some(PrimaryChange { previous, primary }) = change {
            self.ctx
                .emit(NodeEvent::PrimaryAdminChanged { previous, primary });
        }
    }

    async fn broadcast(&self, envelope: SignalEnvelope) {
        let kind = envelope.payload.kind();
        match self.ctx.signaling.send(envelope).await {
            Ok(()) => {}
            Err(SignalingError::RelayUnavailable(reason)) => {
                tracing::trace!(kind, %reason, "Broadcast had no route");
            }
            Err(error) => tracing::warn!(kind, %error, "Broadcast failed"),
        }
    }

    /// Forwards `command` to the actor of `peer`, starting one when allowed.
    async fn dispatch(&mut self, peer: &PeerId, command: PeerCommand, spawn: Spawn) {
        let command = match self.actors.get(peer).map(|a| a.inbox.clone()) {
            Some(inbox) => match inbox.send(command).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => {
                    self.actors.remove(peer);
                    command
                }
            },
            None => command,
        };
        let allowed = match spawn {
            Spawn::Never => false,
            Spawn::UnlessFailed => !self.ctx.reconnection.lock().is_permanently_failed(peer),
            Spawn::Always => true,
        };
        if !allowed {
            tracing::trace!(%peer, "No actor for peer, command dropped");
            return;
        }
        self.next_actor_id += 1;
        let actor_id = self.next_actor_id;
        let inbox = connection::spawn(self.ctx.clone(), peer.clone(), actor_id);
        if inbox.send(command).await.is_err() {
            tracing::warn!(%peer, "Peer actor exited before its first command");
            return;
        }
        self.actors
            .insert(peer.clone(), ActorHandle { inbox, actor_id });
    }

    fn on_report(&mut self, report: ActorReport) {
        let ActorReport::Stopped { peer, actor_id } = report;
        if self
            .actors
            .get(&peer)
            .is_some_and(|actor| actor.actor_id == actor_id)
        {
            self.actors.remove(&peer);
        }
    }

    async fn teardown(&mut self) {
        tracing::info!(peer = %self.ctx.identity.id, actors = self.actors.len(), "Shutting down node");
        self.client_grace = None;
        if let Some(monitor) = self.ip_monitor.as_mut() {
            monitor.stop();
        }
        let actors: Vec<ActorHandle> = self.actors.drain().map(|(_, actor)| actor).collect();
        let mut stopping = HashSet::new();
        for actor in actors {
            if actor.inbox.send(PeerCommand::Close).await.is_ok() {
                stopping.insert(actor.actor_id);
            }
        }
        let deadline = Instant::now() + TEARDOWN_TIMEOUT;
        while !stopping.is_empty() {
            match tokio::time::timeout_at(deadline, self.inputs.reports.recv()).await {
                Ok(Some(ActorReport::Stopped { actor_id, .. })) => {
                    stopping.remove(&actor_id);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(remaining = stopping.len(), "Peer actors did not stop in time");
                    break;
                }
            }
        }
        self.ctx.registry.clear();
        self.ctx.reconnection.lock().clear();
        self.relay_link = None;
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::Receiver<SignalEnvelope>>) -> SignalEnvelope {
    let Some(receiver) = inbound.as_mut() else {
        return std::future::pending().await;
    };
    if let Some(envelope) = receiver.recv().await {
        return envelope;
    }
    tracing::debug!("Relay inbound channel closed");
    *inbound = None;
    std::future::pending().await
}

async fn next_ip_change(changes: &mut Option<broadcast::Receiver<IpChange>>) -> IpChange {
    let Some(receiver) = changes.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(change) => return change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed address change notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    *changes = None;
    std::future::pending().await
}

async fn grace_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
