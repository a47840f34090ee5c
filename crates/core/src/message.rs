//! Wire messages exchanged between devices.
//!
//! Signaling uses a common JSON envelope
//! `{ type, data, fromId, toId?, organizationId, timestamp }`. A missing
//! `toId` addresses every known peer of the organization.

use std::{collections::BTreeSet, net::IpAddr};

use serde::{Deserialize, Serialize};

use crate::{
    reconnect::FailureReason,
    types::{OrganizationId, PeerId, Role},
    util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description produced by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferData {
    pub description: SessionDescription,
    #[serde(default)]
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpChangedData {
    #[serde(default)]
    pub old_ip: Option<IpAddr>,
    pub new_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionRequestData {
    pub reason: FailureReason,
}

/// Periodic liveness announcement.
///
/// From admin-capable devices this doubles as the admin heartbeat; every
/// device includes its current direct links so others can rebuild the mesh
/// topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub connected: BTreeSet<PeerId>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Set while the sender acts as temporary relay.
    #[serde(default)]
    pub relaying: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalPayload {
    NewOffer(OfferData),
    NewAnswer(SessionDescription),
    IceCandidate(IceCandidate),
    IpChanged(IpChangedData),
    ReconnectionRequest(ReconnectionRequestData),
    Presence(Presence),
    Register(Registration),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::NewOffer(_) => "new-offer",
            SignalPayload::NewAnswer(_) => "new-answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
            SignalPayload::IpChanged(_) => "ip-changed",
            SignalPayload::ReconnectionRequest(_) => "reconnection-request",
            SignalPayload::Presence(_) => "presence",
            SignalPayload::Register(_) => "register",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub from_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<PeerId>,
    pub organization_id: OrganizationId,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl SignalEnvelope {
    /// A broadcast envelope stamped with the current time.
    pub fn new(from: PeerId, organization: OrganizationId, payload: SignalPayload) -> Self {
        Self {
            payload,
            from_id: from,
            to_id: None,
            organization_id: organization,
            timestamp: util::envelope_millis(),
        }
    }

    pub fn to(mut self, target: PeerId) -> Self {
        self.to_id = Some(target);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_id.is_none()
    }

    /// Whether `local` should consume this envelope.
    pub fn is_for(&self, local: &PeerId, organization: &OrganizationId) -> bool {
        &self.organization_id == organization
            && &self.from_id != local
            && self.to_id.as_ref().map_or(true, |to| to == local)
    }
}

/// Periodic location report, the application payload carried by the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub peer_id: PeerId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: i64,
}

/// Frames carried over an open data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Signal(SignalEnvelope),
    Location(LocationUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_documented_field_names() {
        let envelope = SignalEnvelope {
            payload: SignalPayload::IceCandidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host")),
            from_id: "admin".into(),
            to_id: Some("client-1".into()),
            organization_id: "org-1".into(),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["fromId"], "admin");
        assert_eq!(json["toId"], "client-1");
        assert_eq!(json["organizationId"], "org-1");
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(
            json["data"]["candidate"],
            "candidate:1 1 udp 1 10.0.0.1 9 typ host"
        );
    }

    #[test]
    fn broadcast_envelope_omits_target() {
        let envelope = SignalEnvelope::new(
            "admin".into(),
            "org-1".into(),
            SignalPayload::Register(Registration {
                name: "Front desk".into(),
                role: Role::Admin,
            }),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("toId").is_none());
        assert_eq!(json["type"], "register");
        assert_eq!(json["data"]["role"], "admin");
    }

    #[test]
    fn parses_offer_from_foreign_encoder() {
        let raw = r#"{
            "type": "new-offer",
            "data": { "description": { "type": "offer", "sdp": "v=0" }, "iceRestart": true },
            "fromId": "admin",
            "organizationId": "org-1",
            "timestamp": 5
        }"#;
        let envelope: SignalEnvelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.is_broadcast());
        match envelope.payload {
            SignalPayload::NewOffer(offer) => {
                assert!(offer.ice_restart);
                assert_eq!(offer.description, SessionDescription::offer("v=0"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn addressing_rules() {
        let org: OrganizationId = "org-1".into();
        let me: PeerId = "client-1".into();
        let base = SignalEnvelope::new(
            "admin".into(),
            org.clone(),
            SignalPayload::ReconnectionRequest(ReconnectionRequestData {
                reason: FailureReason::IceFailed,
            }),
        );
        assert!(base.is_for(&me, &org));
        assert!(base.clone().to(me.clone()).is_for(&me, &org));
        assert!(!base.clone().to("client-2".into()).is_for(&me, &org));
        assert!(!base.is_for(&me, &"other-org".into()));
        assert!(!base.is_for(&"admin".into(), &org));
    }
}
