//! In-memory fakes for the consumed capabilities.

use crate::api::{
    LoginResponse, LoginSession, MeshEvent, NegotiationMessage, RemotePeer, ServerApi, SignalApi,
    StunTurnConfig, SyncResponse,
};
use crate::wg::TunnelDriver;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Build a peer whose wg public key sorts below the fixture-local
/// "zzzz-local-pub", so the local side is always the dialer in tests.
pub fn remote_peer(mk: &str) -> RemotePeer {
    RemotePeer {
        machine_key: mk.to_string(),
        wg_pub_key: format!("aaaa-{mk}-pub"),
        allowed_ips: vec!["100.64.0.0/24".to_string()],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<SocketAddr>,
    pub keepalive_secs: Option<u32>,
    pub preshared_key: Option<String>,
}

/// Tunnel driver that records the peer table instead of touching the system.
#[derive(Default)]
pub struct MemoryTunnelDriver {
    pub interfaces: Mutex<Vec<String>>,
    pub peers: Mutex<HashMap<String, PeerEntry>>,
}

impl MemoryTunnelDriver {
    pub fn has_peer(&self, pub_key: &str) -> bool {
        self.peers.lock().unwrap().contains_key(pub_key)
    }
}

impl TunnelDriver for MemoryTunnelDriver {
    fn create(
        &self,
        tun: &str,
        _private_key: &str,
        _ip: &str,
        _cidr: &str,
        _listen_port: u16,
    ) -> Result<()> {
        self.interfaces.lock().unwrap().push(tun.to_string());
        Ok(())
    }

    fn add_peer(
        &self,
        _tun: &str,
        pub_key: &str,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        keepalive_secs: Option<u32>,
        preshared_key: Option<&str>,
    ) -> Result<()> {
        self.peers.lock().unwrap().insert(
            pub_key.to_string(),
            PeerEntry {
                allowed_ips: allowed_ips.to_vec(),
                endpoint,
                keepalive_secs,
                preshared_key: preshared_key.map(str::to_string),
            },
        );
        Ok(())
    }

    fn remove_peer(&self, _tun: &str, pub_key: &str) -> Result<()> {
        self.peers.lock().unwrap().remove(pub_key);
        Ok(())
    }

    fn destroy(&self, tun: &str) -> Result<()> {
        self.interfaces.lock().unwrap().retain(|name| name != tun);
        Ok(())
    }
}

/// Control server fake: canned login, mutable sync response, and a mesh
/// event channel the test feeds.
pub struct FakeServerApi {
    pub login: Mutex<LoginResponse>,
    pub sync: Mutex<SyncResponse>,
    mesh_tx: Mutex<Option<mpsc::Sender<MeshEvent>>>,
}

impl Default for FakeServerApi {
    fn default() -> Self {
        Self {
            login: Mutex::new(LoginResponse {
                registered: true,
                login_url: None,
                ip: "100.64.0.1".to_string(),
                cidr: "24".to_string(),
                signal_host: "signal.example.net".to_string(),
                signal_port: 443,
            }),
            sync: Mutex::new(SyncResponse {
                ip: "100.64.0.1".to_string(),
                cidr: "24".to_string(),
                peers: Vec::new(),
            }),
            mesh_tx: Mutex::new(None),
        }
    }
}

impl FakeServerApi {
    /// Whether a client has joined the mesh stream yet.
    pub fn mesh_joined(&self) -> bool {
        self.mesh_tx.lock().unwrap().is_some()
    }

    pub async fn push_event(&self, event: MeshEvent) {
        let tx = self.mesh_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl ServerApi for FakeServerApi {
    async fn login(&self, _mk: &str, _wg_pub_key: &str) -> Result<LoginResponse> {
        Ok(self.login.lock().unwrap().clone())
    }

    async fn await_login_session(&self, _mk: &str) -> Result<LoginSession> {
        let login = self.login.lock().unwrap();
        Ok(LoginSession {
            ip: login.ip.clone(),
            cidr: login.cidr.clone(),
        })
    }

    async fn sync_peers(&self, _mk: &str) -> Result<SyncResponse> {
        Ok(self.sync.lock().unwrap().clone())
    }

    async fn join_mesh(&self, _mk: &str) -> Result<mpsc::Receiver<MeshEvent>> {
        let (tx, rx) = mpsc::channel(16);
        *self.mesh_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentSignal {
    Offer {
        dst_mk: String,
        src_mk: String,
        ufrag: String,
        pwd: String,
    },
    Answer {
        dst_mk: String,
        src_mk: String,
        ufrag: String,
        pwd: String,
    },
    Candidate {
        dst_mk: String,
        src_mk: String,
        candidate: String,
    },
}

/// Signaling fake: records outbound traffic, hands out an inbound stream the
/// test feeds.
pub struct FakeSignalApi {
    pub sent: Mutex<Vec<SentSignal>>,
    pub stun_turn: Mutex<StunTurnConfig>,
    pub ready: AtomicBool,
    stream_tx: Mutex<Option<mpsc::Sender<NegotiationMessage>>>,
}

impl Default for FakeSignalApi {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            stun_turn: Mutex::new(StunTurnConfig {
                stun_url: "stun:stun.example.net:3478".to_string(),
                turn_url: "turn:turn.example.net:3478".to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
            ready: AtomicBool::new(true),
            stream_tx: Mutex::new(None),
        }
    }
}

impl FakeSignalApi {
    pub async fn push_message(&self, msg: NegotiationMessage) {
        let tx = self.stream_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }
}

#[async_trait]
impl SignalApi for FakeSignalApi {
    async fn offer(&self, dst_mk: &str, src_mk: &str, ufrag: &str, pwd: &str) -> Result<()> {
        self.sent.lock().unwrap().push(SentSignal::Offer {
            dst_mk: dst_mk.to_string(),
            src_mk: src_mk.to_string(),
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        });
        Ok(())
    }

    async fn answer(&self, dst_mk: &str, src_mk: &str, ufrag: &str, pwd: &str) -> Result<()> {
        self.sent.lock().unwrap().push(SentSignal::Answer {
            dst_mk: dst_mk.to_string(),
            src_mk: src_mk.to_string(),
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        });
        Ok(())
    }

    async fn candidate(&self, dst_mk: &str, src_mk: &str, candidate: &str) -> Result<()> {
        self.sent.lock().unwrap().push(SentSignal::Candidate {
            dst_mk: dst_mk.to_string(),
            src_mk: src_mk.to_string(),
            candidate: candidate.to_string(),
        });
        Ok(())
    }

    async fn start_connect(&self, _mk: &str) -> Result<mpsc::Receiver<NegotiationMessage>> {
        let (tx, rx) = mpsc::channel(16);
        *self.stream_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stun_turn(&self) -> Result<StunTurnConfig> {
        Ok(self.stun_turn.lock().unwrap().clone())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
