//! Per-peer connection actor.
//!
//! Every remote device the node talks to is driven by one [`PeerActor`]. The
//! actor owns the negotiation state of its link: the current connection
//! handle, the buffer of remote ICE candidates that arrived before the remote
//! description, and the retry and deadline timers. It is the only writer of
//! its peer's registry entry; the node loop only routes commands to it.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};

use super::{NodeConfig, NodeError, NodeEvent};
use crate::{
    message::{
        IceCandidate, OfferData, ReconnectionRequestData, SessionDescription, SignalEnvelope,
        SignalPayload,
    },
    reconnect::{FailureReason, PermanentFailure, ReconnectionManager},
    registry::{PeerRecord, PeerRegistry, PeerStatus},
    signaling::SignalingRelay,
    store::{PeerStore, StoreBackend, StoredPeer},
    transport::{
        ConnectionId, PeerTransport, TransportEvent, TransportState, DATA_CHANNEL_LABEL,
    },
    types::{LocalIdentity, PeerId},
    util::TaskGuard,
};

const INBOX_BUFFER: usize = 64;

/// State shared by the node loop and every peer actor.
pub(crate) struct PeerContext<T, B> {
    pub identity: Arc<LocalIdentity>,
    pub config: Arc<NodeConfig>,
    pub transport: Arc<T>,
    pub registry: PeerRegistry,
    pub reconnection: Arc<Mutex<ReconnectionManager>>,
    pub store: PeerStore<B>,
    pub signaling: SignalingRelay<T>,
    pub events: broadcast::Sender<NodeEvent>,
    pub reports: mpsc::UnboundedSender<ActorReport>,
    pub known_admins: Arc<RwLock<BTreeSet<PeerId>>>,
    /// Set while this device's own address changed and links are not back yet.
    pub ip_unstable: Arc<AtomicBool>,
}

impl<T: PeerTransport, B: StoreBackend> PeerContext<T, B> {
    pub fn is_admin(&self, peer: &PeerId) -> bool {
        self.known_admins.read().contains(peer)
            || self.registry.get(peer).is_some_and(|r| r.is_admin)
    }

    pub fn is_offerer_towards(&self, peer: &PeerId) -> bool {
        self.identity.is_offerer_towards(peer, self.is_admin(peer))
    }

    pub fn emit(&self, event: NodeEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Moves `peer` to `status`, emitting an event when it actually changed.
    pub fn set_status(&self, peer: &PeerId, status: PeerStatus) {
        match self.registry.transition(peer, status) {
            Ok(previous) if previous != status => self.emit(NodeEvent::PeerStatusChanged {
                peer: peer.clone(),
                status,
            }),
            Ok(_) => {}
            Err(error) => tracing::debug!(%error, "Status transition skipped"),
        }
    }

    pub fn envelope(&self, payload: SignalPayload) -> SignalEnvelope {
        SignalEnvelope::new(
            self.identity.id.clone(),
            self.identity.organization_id.clone(),
            payload,
        )
    }

    fn stored_template(&self, peer: &PeerId) -> StoredPeer {
        let name = self
            .registry
            .get(peer)
            .map_or_else(|| peer.to_string(), |r| r.name);
        StoredPeer::new(peer.clone(), name, self.identity.organization_id.clone())
    }
}

pub(crate) enum PeerCommand {
    /// Offer a fresh connection.
    Open,
    RemoteOffer(OfferData),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    ReconnectionRequest(FailureReason),
    Transport(TransportEvent),
    /// Start a reconnection pass right away, counted as an attempt.
    Renegotiate { reason: FailureReason, restart: bool },
    /// Pick up a peer persisted before a restart.
    Resume { last_offer: Option<SessionDescription> },
    ForceReconnect,
    RetryFired(u64),
    DeadlineExpired(u64),
    Close,
}

pub(crate) enum ActorReport {
    Stopped { peer: PeerId, actor_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Spawns the actor for `peer` and returns its inbox.
pub(crate) fn spawn<T: PeerTransport, B: StoreBackend>(
    ctx: Arc<PeerContext<T, B>>,
    peer: PeerId,
    actor_id: u64,
) -> mpsc::Sender<PeerCommand> {
    let (tx, rx) = mpsc::channel(INBOX_BUFFER);
    let inserted = !ctx.registry.contains(&peer);
    let mut record = PeerRecord::new(peer.clone(), ctx.identity.organization_id.clone());
    record.is_admin = ctx.known_admins.read().contains(&peer);
    ctx.registry.get_or_insert(record);
    if inserted {
        ctx.emit(NodeEvent::PeerStatusChanged {
            peer: peer.clone(),
            status: PeerStatus::Connecting,
        });
    }
    let actor = PeerActor {
        ctx,
        peer,
        actor_id,
        inbox: rx,
        timers: tx.downgrade(),
        connection: None,
        remote_set: false,
        pending_candidates: VecDeque::new(),
        retry: None,
        retry_seq: 0,
        deadline: None,
        deadline_seq: 0,
        last_offer: None,
        reason: FailureReason::ConnectionLost,
    };
    tokio::spawn(actor.run());
    tx
}

pub(crate) struct PeerActor<T, B> {
    ctx: Arc<PeerContext<T, B>>,
    peer: PeerId,
    actor_id: u64,
    inbox: mpsc::Receiver<PeerCommand>,
    timers: mpsc::WeakSender<PeerCommand>,
    connection: Option<ConnectionId>,
    remote_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    retry: Option<TaskGuard>,
    retry_seq: u64,
    deadline: Option<TaskGuard>,
    deadline_seq: u64,
    last_offer: Option<SessionDescription>,
    reason: FailureReason,
}

impl<T: PeerTransport, B: StoreBackend> PeerActor<T, B> {
    async fn run(mut self) {
        tracing::debug!(peer = %self.peer, actor = self.actor_id, "Peer actor started");
        while let Some(command) = self.inbox.recv().await {
            let flow = match self.handle(command).await {
                Ok(flow) => flow,
                Err(error) => {
                    tracing::warn!(peer = %self.peer, %error, "Negotiation step failed");
                    self.recover().await
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }
        self.cancel_timers();
        tracing::debug!(peer = %self.peer, actor = self.actor_id, "Peer actor stopped");
        let _ = self.ctx.reports.send(ActorReport::Stopped {
            peer: self.peer.clone(),
            actor_id: self.actor_id,
        });
    }

    async fn handle(&mut self, command: PeerCommand) -> Result<Flow, NodeError> {
        match command {
            PeerCommand::Open => {
                if self.ctx.registry.is_connected(&self.peer) {
                    return Ok(Flow::Continue);
                }
                self.ctx.reconnection.lock().reset(&self.peer);
                self.start_offer(false).await?;
            }
            PeerCommand::RemoteOffer(offer) => self.apply_remote_offer(offer).await?,
            PeerCommand::RemoteAnswer(answer) => self.apply_remote_answer(answer).await?,
            PeerCommand::RemoteCandidate(candidate) => {
                self.queue_or_apply_candidate(candidate).await
            }
            PeerCommand::ReconnectionRequest(reason) => self.on_reconnection_request(reason).await?,
            PeerCommand::Transport(event) => return self.on_transport_event(event).await,
            PeerCommand::Renegotiate { reason, restart } => {
                self.renegotiate(reason, restart).await?
            }
            PeerCommand::Resume { last_offer } => {
                tracing::debug!(peer = %self.peer, has_offer = last_offer.is_some(), "Resuming stored peer");
                if self.last_offer.is_none() {
                    self.last_offer = last_offer;
                }
                self.renegotiate(FailureReason::ConnectionLost, false).await?
            }
            PeerCommand::ForceReconnect => {
                tracing::info!(peer = %self.peer, "Forcing reconnection");
                self.cancel_timers();
                self.ctx.reconnection.lock().reset(&self.peer);
                self.renegotiate(FailureReason::ConnectionLost, false).await?;
            }
            PeerCommand::RetryFired(seq) => {
                if seq != self.retry_seq || self.retry.take().is_none() {
                    return Ok(Flow::Continue);
                }
                self.retry_now().await?;
            }
            PeerCommand::DeadlineExpired(seq) => {
                if seq != self.deadline_seq || self.deadline.take().is_none() {
                    return Ok(Flow::Continue);
                }
                if self.ctx.registry.is_connected(&self.peer) {
                    return Ok(Flow::Continue);
                }
                tracing::debug!(peer = %self.peer, reason = %self.reason, "Negotiation deadline expired");
                self.ctx.set_status(&self.peer, PeerStatus::Disconnected);
                return Ok(self.handle_failure(self.reason).await);
            }
            PeerCommand::Close => {
                self.close().await;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// A step failed half way; make sure something will try again.
    async fn recover(&mut self) -> Flow {
        if self.retry.is_some() || self.deadline.is_some() {
            return Flow::Continue;
        }
        if self.ctx.registry.is_connected(&self.peer) {
            return Flow::Continue;
        }
        self.ctx.set_status(&self.peer, PeerStatus::Disconnected);
        self.handle_failure(self.reason).await
    }

    /// Drops the current connection and creates a new one.
    async fn fresh_connection(&mut self) -> Result<ConnectionId, NodeError> {
        if let Some(old) = self.connection.take() {
            self.ctx.transport.close_connection(old).await;
        }
        let connection = self.ctx.transport.create_connection(&self.peer).await?;
        self.connection = Some(connection);
        self.remote_set = false;
        self.ctx.registry.update(&self.peer, |r| {
            r.connection = Some(connection);
            r.data_channel = None;
        });
        Ok(connection)
    }

    /// Puts the registry entry into `connecting`. An ICE restart on a link
    /// that never dropped keeps it `connected`.
    fn enter_connecting(&self, restart: bool) {
        match self.ctx.registry.status(&self.peer) {
            Some(PeerStatus::Connected) if restart => {}
            Some(PeerStatus::Connected) => {
                self.ctx.set_status(&self.peer, PeerStatus::Disconnected);
                self.ctx.set_status(&self.peer, PeerStatus::Connecting);
            }
            Some(PeerStatus::Disconnected) => {
                self.ctx.set_status(&self.peer, PeerStatus::Connecting)
            }
            _ => {}
        }
    }

    async fn start_offer(&mut self, restart: bool) -> Result<(), NodeError> {
        let connection = match self.connection {
            Some(connection) if restart => connection,
            _ => self.fresh_connection().await?,
        };
        self.enter_connecting(restart);
        self.remote_set = false;
        self.pending_candidates.clear();

        let channel = self
            .ctx
            .transport
            .open_data_channel(connection, DATA_CHANNEL_LABEL)
            .await?;
        self.ctx.registry.update(&self.peer, |r| {
            r.connection = Some(connection);
            r.data_channel = Some(channel);
        });
        let offer = self.ctx.transport.create_offer(connection, restart).await?;
        self.ctx
            .transport
            .set_local_description(connection, offer.clone())
            .await?;
        self.last_offer = Some(offer.clone());
        self.arm_deadline();

        tracing::debug!(peer = %self.peer, %connection, restart, "Sending offer");
        let envelope = self
            .ctx
            .envelope(SignalPayload::NewOffer(OfferData {
                description: offer.clone(),
                ice_restart: restart,
            }))
            .to(self.peer.clone());
        self.ctx.signaling.send(envelope).await?;

        if self.ctx.identity.role.is_admin() {
            if let Err(error) = self
                .ctx
                .store
                .set_server_offer(&self.ctx.identity.organization_id, offer)
                .await
            {
                tracing::warn!(%error, "Failed to persist server offer");
            }
        }
        Ok(())
    }

    async fn apply_remote_offer(&mut self, offer: OfferData) -> Result<(), NodeError> {
        {
            let mut reconnection = self.ctx.reconnection.lock();
            if reconnection.is_permanently_failed(&self.peer) {
                tracing::info!(peer = %self.peer, "Fresh offer from failed peer, resuming");
                reconnection.reset(&self.peer);
            }
        }
        self.retry = None;

        let connection = match self.connection {
            Some(connection) if offer.ice_restart => connection,
            _ => self.fresh_connection().await?,
        };
        self.enter_connecting(offer.ice_restart);
        self.ctx
            .transport
            .set_remote_description(connection, offer.description)
            .await?;
        self.remote_set = true;
        self.flush_candidates(connection).await;

        let answer = self.ctx.transport.create_answer(connection).await?;
        self.ctx
            .transport
            .set_local_description(connection, answer.clone())
            .await?;
        if !self.ctx.registry.is_connected(&self.peer) {
            self.arm_deadline();
        }
        tracing::debug!(peer = %self.peer, %connection, "Sending answer");
        let envelope = self
            .ctx
            .envelope(SignalPayload::NewAnswer(answer))
            .to(self.peer.clone());
        self.ctx.signaling.send(envelope).await?;
        Ok(())
    }

    async fn apply_remote_answer(&mut self, answer: SessionDescription) -> Result<(), NodeError> {
        let Some(connection) = self.connection else {
            tracing::debug!(peer = %self.peer, "Answer without a pending offer, ignoring");
            return Ok(());
        };
        self.ctx
            .transport
            .set_remote_description(connection, answer)
            .await?;
        self.remote_set = true;
        self.flush_candidates(connection).await;
        if self.ctx.registry.is_connected(&self.peer) {
            self.on_connected().await;
        }
        Ok(())
    }

    async fn queue_or_apply_candidate(&mut self, candidate: IceCandidate) {
        match self.connection {
            Some(connection) if self.remote_set => self.apply_candidate(connection, candidate).await,
            _ => {
                tracing::trace!(peer = %self.peer, queued = self.pending_candidates.len() + 1, "Buffering early candidate");
                self.pending_candidates.push_back(candidate);
            }
        }
    }

    async fn flush_candidates(&mut self, connection: ConnectionId) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(connection, candidate).await;
        }
    }

    async fn apply_candidate(&self, connection: ConnectionId, candidate: IceCandidate) {
        if let Err(error) = self
            .ctx
            .transport
            .add_ice_candidate(connection, candidate)
            .await
        {
            tracing::debug!(peer = %self.peer, %error, "Skipping candidate");
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Result<Flow, NodeError> {
        if Some(event.connection()) != self.connection {
            tracing::trace!(peer = %self.peer, connection = %event.connection(), "Event for stale connection");
            return Ok(Flow::Continue);
        }
        match event {
            TransportEvent::StateChanged { state, .. } => match state {
                TransportState::Connected => self.on_connected().await,
                TransportState::Disconnected => {
                    return Ok(self.on_link_failure(FailureReason::ConnectionLost).await)
                }
                TransportState::Failed => {
                    return Ok(self.on_link_failure(FailureReason::IceFailed).await)
                }
                TransportState::New | TransportState::Connecting | TransportState::Closed => {}
            },
            TransportEvent::IceCandidateGenerated { candidate, .. } => {
                let envelope = self
                    .ctx
                    .envelope(SignalPayload::IceCandidate(candidate))
                    .to(self.peer.clone());
                self.ctx.signaling.send(envelope).await?;
            }
            TransportEvent::DataChannelReceived { channel, .. } => {
                self.ctx
                    .registry
                    .update(&self.peer, |r| r.data_channel = Some(channel));
            }
            TransportEvent::DataChannelMessage { .. } => {}
        }
        Ok(Flow::Continue)
    }

    async fn on_connected(&mut self) {
        self.cancel_timers();
        if self.ctx.registry.status(&self.peer) == Some(PeerStatus::Disconnected) {
            self.ctx.set_status(&self.peer, PeerStatus::Connecting);
        }
        self.ctx.set_status(&self.peer, PeerStatus::Connected);
        self.ctx.reconnection.lock().mark_success(&self.peer);
        self.ctx.ip_unstable.store(false, Ordering::Release);

        let last_offer = self.last_offer.clone();
        let result = self
            .ctx
            .store
            .update_peer(self.ctx.stored_template(&self.peer), move |stored| {
                stored.connection_attempts = 0;
                stored.last_connected = chrono::Utc::now();
                if last_offer.is_some() {
                    stored.last_offer = last_offer;
                }
            })
            .await;
        if let Err(error) = result {
            tracing::warn!(peer = %self.peer, %error, "Failed to record connection");
        }
        tracing::info!(peer = %self.peer, "Peer connected");
    }

    async fn on_link_failure(&mut self, reason: FailureReason) -> Flow {
        if self.retry.is_some() {
            return Flow::Continue;
        }
        tracing::info!(peer = %self.peer, %reason, "Link failed");
        self.deadline = None;
        self.ctx.set_status(&self.peer, PeerStatus::Disconnected);
        self.handle_failure(reason).await
    }

    /// Counts a failed attempt and either schedules the next one or gives up.
    async fn handle_failure(&mut self, reason: FailureReason) -> Flow {
        self.reason = reason;
        let result = self
            .ctx
            .store
            .update_peer(self.ctx.stored_template(&self.peer), |stored| {
                stored.connection_attempts += 1
            })
            .await;
        if let Err(error) = result {
            tracing::warn!(peer = %self.peer, %error, "Failed to record attempt");
        }

        enum Decision {
            GiveUp(PermanentFailure),
            Retry { attempt: u32, delay: Duration },
            Idle,
        }
        let decision = {
            let mut reconnection = self.ctx.reconnection.lock();
            match reconnection.mark_failure(&self.peer) {
                Some(failure) => Decision::GiveUp(failure),
                None if reconnection.should_retry(&self.peer, reason) => {
                    let attempt = reconnection.begin_attempt(&self.peer, reason);
                    let delay = reconnection.delay_for(reason, attempt);
                    Decision::Retry { attempt, delay }
                }
                None => Decision::Idle,
            }
        };

        match decision {
            Decision::GiveUp(failure) => {
                if let Some(connection) = self.connection.take() {
                    self.ctx.transport.close_connection(connection).await;
                }
                self.ctx.registry.remove(&self.peer);
                self.ctx.emit(NodeEvent::PeerPermanentlyFailed {
                    peer: failure.peer,
                    reason: failure.reason,
                    attempts: failure.attempts,
                });
                Flow::Stop
            }
            Decision::Retry { attempt, delay } => {
                tracing::info!(
                    peer = %self.peer,
                    %reason,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnection"
                );
                self.ctx.emit(NodeEvent::ReconnectionScheduled {
                    peer: self.peer.clone(),
                    reason,
                    attempt,
                    delay,
                });
                self.retry_seq += 1;
                self.retry = Some(self.schedule(delay, PeerCommand::RetryFired(self.retry_seq)));
                Flow::Continue
            }
            Decision::Idle => Flow::Continue,
        }
    }

    /// The backoff timer fired: the offerer restarts ICE, the other side asks for it.
    async fn retry_now(&mut self) -> Result<(), NodeError> {
        if self.ctx.reconnection.lock().is_permanently_failed(&self.peer) {
            return Ok(());
        }
        if self.ctx.is_offerer_towards(&self.peer) {
            self.start_offer(true).await
        } else {
            self.request_reconnection().await
        }
    }

    async fn request_reconnection(&mut self) -> Result<(), NodeError> {
        self.enter_connecting(true);
        self.arm_deadline();
        tracing::debug!(peer = %self.peer, reason = %self.reason, "Requesting reconnection");
        let envelope = self
            .ctx
            .envelope(SignalPayload::ReconnectionRequest(ReconnectionRequestData {
                reason: self.reason,
            }))
            .to(self.peer.clone());
        self.ctx.signaling.send(envelope).await?;
        Ok(())
    }

    async fn renegotiate(&mut self, reason: FailureReason, restart: bool) -> Result<(), NodeError> {
        self.retry = None;
        self.reason = reason;
        let attempt = self.ctx.reconnection.lock().begin_attempt(&self.peer, reason);
        self.ctx.emit(NodeEvent::ReconnectionScheduled {
            peer: self.peer.clone(),
            reason,
            attempt,
            delay: Duration::ZERO,
        });
        if self.ctx.is_offerer_towards(&self.peer) {
            self.start_offer(restart).await
        } else {
            self.request_reconnection().await
        }
    }

    async fn on_reconnection_request(&mut self, reason: FailureReason) -> Result<(), NodeError> {
        if self.ctx.reconnection.lock().is_permanently_failed(&self.peer)
            || self.retry.is_some()
            || self.deadline.is_some()
        {
            tracing::trace!(peer = %self.peer, "Reconnection request ignored, attempt in progress");
            return Ok(());
        }
        if !self.ctx.is_offerer_towards(&self.peer) {
            tracing::debug!(peer = %self.peer, "Reconnection request from the offering side, ignoring");
            return Ok(());
        }
        self.reason = reason;
        self.ctx.reconnection.lock().begin_attempt(&self.peer, reason);
        self.start_offer(true).await
    }

    async fn close(&mut self) {
        self.cancel_timers();
        if let Some(connection) = self.connection.take() {
            self.ctx.transport.close_connection(connection).await;
        }
        self.ctx.registry.remove(&self.peer);
        self.ctx.reconnection.lock().reset(&self.peer);
        tracing::debug!(peer = %self.peer, "Link closed");
    }

    fn arm_deadline(&mut self) {
        self.deadline_seq += 1;
        self.deadline = Some(self.schedule(
            self.ctx.config.negotiation_timeout,
            PeerCommand::DeadlineExpired(self.deadline_seq),
        ));
    }

    fn cancel_timers(&mut self) {
        self.retry = None;
        self.deadline = None;
    }

    fn schedule(&self, delay: Duration, command: PeerCommand) -> TaskGuard {
        let timers = self.timers.clone();
        TaskGuard::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inbox) = timers.upgrade() {
                let _ = inbox.send(command).await;
            }
        })
    }
}
