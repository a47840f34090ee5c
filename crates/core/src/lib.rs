//! Peer connection lifecycle and resilience engine for small organization meshes.
//!
//! A [`Node`] keeps a device connected to the other devices of its
//! organization: it negotiates peer-to-peer links through a pluggable
//! [`transport::PeerTransport`], exchanges session control over open data
//! channels or a fallback relay, retries failed links with per-reason
//! backoff, persists who it was connected to and keeps the organization
//! reachable while its admin is away by electing a temporary relay.

/// Node configuration and logger setup.
pub mod config;

/// Sealing of data-channel frames.
pub mod crypto;

/// Public address change detection.
pub mod ip_monitor;

/// Temporary relay election and multi-admin coordination.
pub mod mesh;

/// Wire messages exchanged between peers.
pub mod message;

/// The running node and its handle.
mod node;
pub use node::{MeshSnapshot, Node, NodeConfig, NodeError, NodeEvent, NodeHandle};

/// Reconnection bookkeeping and backoff policies.
pub mod reconnect;

/// In-memory view of every known peer.
pub mod registry;

/// Session-control routing over data channels and the fallback relay.
pub mod signaling;

/// Persisted organization state.
pub mod store;

/// Logging infrastructure.
pub mod tracing;

/// Peer link abstraction plus an in-memory implementation for tests and simulation.
pub mod transport;

pub mod types;

pub mod util;
