//! Session-control message routing.
//!
//! Envelopes addressed to a single peer travel over that peer's open data
//! channel when there is one and fall back to the relay otherwise.
//! Broadcasts go out on every open data channel and once through the relay,
//! so receivers drop the second copy with [`RecentBroadcasts`].

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    crypto::{MessageSealer, NoopSealer, SealError},
    message::{ChannelMessage, LocationUpdate, SignalEnvelope},
    registry::PeerRegistry,
    transport::{ConnectionId, DataChannelId, PeerTransport, TransportError},
    types::PeerId,
};

pub mod memory;
pub mod relay;
pub mod websocket;

pub use relay::{RelayConnector, RelayLink, RelaySession};

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("failed to (de)serialize signaling message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Sealing(#[from] SealError),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Frames data-channel messages, sealing them with the injected capability.
#[derive(Debug, Clone)]
pub struct SignalCodec {
    sealer: Arc<dyn MessageSealer>,
}

impl Default for SignalCodec {
    fn default() -> Self {
        Self::new(Arc::new(NoopSealer))
    }
}

impl SignalCodec {
    pub fn new(sealer: Arc<dyn MessageSealer>) -> Self {
        Self { sealer }
    }

    pub fn encode_frame(&self, message: &ChannelMessage) -> Result<Vec<u8>, SignalingError> {
        let json = serde_json::to_vec(message)?;
        Ok(self.sealer.seal(&json)?)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<ChannelMessage, SignalingError> {
        let json = self.sealer.open(frame)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Outbound side of signaling shared by the node loop and every peer actor.
pub struct SignalingRelay<T> {
    transport: Arc<T>,
    registry: PeerRegistry,
    codec: SignalCodec,
    relay: Option<mpsc::Sender<SignalEnvelope>>,
}

impl<T> Clone for SignalingRelay<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            codec: self.codec.clone(),
            relay: self.relay.clone(),
        }
    }
}

impl<T: PeerTransport> SignalingRelay<T> {
    pub fn new(
        transport: Arc<T>,
        registry: PeerRegistry,
        codec: SignalCodec,
        relay: Option<mpsc::Sender<SignalEnvelope>>,
    ) -> Self {
        Self {
            transport,
            registry,
            codec,
            relay,
        }
    }

    pub fn codec(&self) -> &SignalCodec {
        &self.codec
    }

    /// Routes `envelope` to its target, or to everybody when it has none.
    pub async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let Some(target) = envelope.to_id.clone() else {
            return self.broadcast(envelope).await;
        };
        if let Some((connection, channel)) = self.registry.data_channel(&target) {
            let frame = self.codec.encode_frame(&ChannelMessage::Signal(envelope.clone()))?;
            match self.transport.send_data(connection, channel, frame).await {
                Ok(()) => {
                    tracing::trace!(peer = %target, kind = envelope.payload.kind(), "Signal sent over data channel");
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(peer = %target, %error, "Data channel send failed, using relay");
                }
            }
        }
        self.send_via_relay(envelope)
    }

    async fn broadcast(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let channels = self.open_channels();
        if !channels.is_empty() {
            let frame = self.codec.encode_frame(&ChannelMessage::Signal(envelope.clone()))?;
            self.fan_out(&channels, &frame).await;
        }
        match self.send_via_relay(envelope) {
            Err(SignalingError::RelayUnavailable(_)) if !channels.is_empty() => Ok(()),
            other => other,
        }
    }

    /// Sends a location report on every open data channel except the one to
    /// `except`. Location updates never go through the relay.
    pub async fn send_location(
        &self,
        update: LocationUpdate,
        except: Option<&PeerId>,
    ) -> Result<usize, SignalingError> {
        let mut channels = self.open_channels();
        channels.retain(|(peer, _, _)| Some(peer) != except);
        let frame = self.codec.encode_frame(&ChannelMessage::Location(update))?;
        Ok(self.fan_out(&channels, &frame).await)
    }

    fn open_channels(&self) -> Vec<(PeerId, ConnectionId, DataChannelId)> {
        self.registry
            .connected()
            .into_iter()
            .filter_map(|peer| {
                let (connection, channel) = self.registry.data_channel(&peer)?;
                Some((peer, connection, channel))
            })
            .collect()
    }

    async fn fan_out(&self, channels: &[(PeerId, ConnectionId, DataChannelId)], frame: &[u8]) -> usize {
        let mut delivered = 0;
        for (peer, connection, channel) in channels {
            match self
                .transport
                .send_data(*connection, *channel, frame.to_vec())
                .await
            {
                Ok(()) => delivered += 1,
                Err(error) => tracing::debug!(%peer, %error, "Data channel send failed"),
            }
        }
        delivered
    }

    fn send_via_relay(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let Some(relay) = &self.relay else {
            return Err(SignalingError::RelayUnavailable(
                "no relay configured".into(),
            ));
        };
        match relay.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                tracing::warn!(kind = envelope.payload.kind(), "Relay queue full, dropping signal");
                Err(SignalingError::RelayUnavailable("relay queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalingError::ChannelClosed),
        }
    }
}

/// Remembers recently seen broadcasts so the copy arriving over the second
/// path is dropped.
#[derive(Debug)]
pub struct RecentBroadcasts {
    seen: VecDeque<(PeerId, i64, &'static str)>,
    capacity: usize,
}

impl Default for RecentBroadcasts {
    fn default() -> Self {
        Self::with_capacity(512)
    }
}

impl RecentBroadcasts {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True the first time a broadcast is observed. Unicast envelopes always pass.
    pub fn first_sighting(&mut self, envelope: &SignalEnvelope) -> bool {
        if !envelope.is_broadcast() {
            return true;
        }
        let key = (
            envelope.from_id.clone(),
            envelope.timestamp,
            envelope.payload.kind(),
        );
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen.len() == self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(key);
        true
    }
}
