//! wiremesh — realtime communication nucleus for a peer-to-peer mesh VPN.
//!
//! Every node keeps an authenticated WireGuard tunnel to every other node in
//! its mesh. Peers are usually behind NAT, so tunnels are hole-punched with
//! ICE (STUN/TURN assisted) and coordinated through a central signaling
//! service. When the punched path can be handed to WireGuard directly the
//! endpoint is rewritten in place; otherwise a small userspace relay bridges
//! the punched connection and the local WireGuard port.
//!
//! The control-server and signaling transports, the CLI, and service
//! installation live outside this crate and are consumed through the traits
//! in [`api`] and [`wg`].

pub mod api;
pub mod backoff;
pub mod config;
pub mod control;
pub mod engine;
pub mod identity;
pub mod proxy;
pub mod session;
pub mod signal;
pub mod state;
#[cfg(unix)]
pub mod status;
pub mod wg;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{
    LoginResponse, LoginSession, MeshEvent, MeshEventKind, NegotiationKind, NegotiationMessage,
    RemotePeer, ServerApi, SignalApi, StunTurnConfig, SyncResponse,
};
pub use backoff::Backoff;
pub use config::ClientConfig;
pub use control::ControlPlane;
pub use engine::Engine;
pub use identity::WgKeyPair;
pub use session::PeerSession;
pub use state::{ConnectState, TunnelState};
#[cfg(unix)]
pub use status::{dial_status, StatusSock, TunnelStatus};
#[cfg(unix)]
pub use wg::CliTunnelDriver;
pub use wg::TunnelDriver;
