//! Consumed control-server contracts.
//!
//! The nucleus never speaks the wire protocol itself. The two transports are
//! injected as trait objects, so tests can substitute in-memory fakes and the
//! gRPC plumbing stays outside this crate. Machine keys are opaque strings,
//! stable across restarts and unique within a mesh.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Network assignment returned by `login`.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub registered: bool,
    pub login_url: Option<String>,
    pub ip: String,
    pub cidr: String,
    pub signal_host: String,
    pub signal_port: u16,
}

/// First `{ip, cidr}` assignment streamed back after an interactive login.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub ip: String,
    pub cidr: String,
}

/// A peer as reported by the control server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub machine_key: String,
    pub wg_pub_key: String,
    pub allowed_ips: Vec<String>,
}

/// Authoritative mesh view returned by `sync_peers`.
#[derive(Debug, Clone)]
pub struct SyncResponse {
    pub ip: String,
    pub cidr: String,
    pub peers: Vec<RemotePeer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshEventKind {
    Join,
    Disconnect,
}

/// Membership event on the long-lived mesh stream. Every event carries the
/// authoritative peer list; `Disconnect` additionally names the machine that
/// dropped its signaling connection.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    pub kind: MeshEventKind,
    pub target_mk: String,
    pub peers: Vec<RemotePeer>,
    pub ip: String,
    pub cidr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationKind {
    Offer,
    Answer,
    Candidate,
}

/// One inbound signaling message addressed to this node. `candidate` is an
/// ICE candidate line and is only meaningful for `Candidate` messages.
#[derive(Debug, Clone)]
pub struct NegotiationMessage {
    pub dst_mk: String,
    pub kind: NegotiationKind,
    pub ufrag: String,
    pub pwd: String,
    pub candidate: String,
}

/// STUN/TURN bootstrap material, fetched once per process lifetime.
#[derive(Debug, Clone)]
pub struct StunTurnConfig {
    pub stun_url: String,
    pub turn_url: String,
    pub username: String,
    pub password: String,
}

/// Control-server operations the nucleus consumes.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Exchange the local identity for a network assignment.
    async fn login(&self, mk: &str, wg_pub_key: &str) -> Result<LoginResponse>;

    /// Block until the server streams back the first `{ip, cidr}` assignment
    /// for a machine that has not completed interactive login yet.
    async fn await_login_session(&self, mk: &str) -> Result<LoginSession>;

    /// Authoritative peer list for this machine.
    async fn sync_peers(&self, mk: &str) -> Result<SyncResponse>;

    /// Announce presence and subscribe to membership events for the process
    /// lifetime.
    async fn join_mesh(&self, mk: &str) -> Result<mpsc::Receiver<MeshEvent>>;
}

/// Signaling operations the nucleus consumes. The unary calls carry a 5 s
/// deadline inside the transport.
#[async_trait]
pub trait SignalApi: Send + Sync {
    async fn offer(&self, dst_mk: &str, src_mk: &str, ufrag: &str, pwd: &str) -> Result<()>;

    async fn answer(&self, dst_mk: &str, src_mk: &str, ufrag: &str, pwd: &str) -> Result<()>;

    async fn candidate(&self, dst_mk: &str, src_mk: &str, candidate: &str) -> Result<()>;

    /// Open the long-lived inbound negotiation stream. The transport only
    /// returns once the stream header has been seen, so a successful return
    /// means the stream is usable.
    async fn start_connect(&self, mk: &str) -> Result<mpsc::Receiver<NegotiationMessage>>;

    /// STUN/TURN bootstrap material.
    async fn stun_turn(&self) -> Result<StunTurnConfig>;

    /// Whether the underlying transport is currently usable.
    fn is_ready(&self) -> bool;
}
