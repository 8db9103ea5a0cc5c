//! Per-peer ICE session.
//!
//! One session per remote machine key, holding one agent, one proxy, and the
//! offer/answer channel pair for its lifetime. Sessions are rebuilt whole via
//! `setup` when the remote restarts and torn down whole via `cleanup` when
//! the peer leaves the mesh; nothing in between.

use crate::api::RemotePeer;
use crate::proxy::{PairEndpoint, WireProxy};
use crate::signal::SignalSender;
use crate::state::ConnectState;
use crate::wg::TunnelDriver;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc_ice::agent::agent_config::AgentConfig;
use webrtc_ice::agent::Agent;
use webrtc_ice::candidate::{Candidate, CandidateType};
use webrtc_ice::mdns::MulticastDnsMode;
use webrtc_ice::network_type::NetworkType;
use webrtc_ice::state::ConnectionState;
use webrtc_ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};
use webrtc_ice::udp_network::UDPNetwork;
use webrtc_ice::url::Url;
use webrtc_util::Conn;

const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(5);
const SIGNAL_CHANNEL_CAPACITY: usize = 8;

/// Short-lived ICE credentials for one direction of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Everything a session needs to know about the local node.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub machine_key: String,
    pub wg_pub_key: String,
    pub ip: String,
    pub cidr: String,
    pub tun_name: String,
    pub wg_port: u16,
    pub preshared_key: Option<String>,
    pub blacklist: Vec<String>,
}

/// Deterministic controller selection: the side with the lexicographically
/// greater WireGuard public key dials, the other side accepts. Both peers
/// compute the same answer, so the glare window never opens.
pub fn is_dialer(local_wg_pub_key: &str, remote_wg_pub_key: &str) -> bool {
    local_wg_pub_key > remote_wg_pub_key
}

type SelectedPairSlot = Arc<std::sync::Mutex<Option<(PairEndpoint, PairEndpoint)>>>;

#[derive(Default)]
struct SessionInner {
    agent: Option<Arc<Agent>>,
    udp_mux: Option<Arc<dyn UDPMux + Send + Sync>>,
    proxy: Option<Arc<WireProxy>>,
    selected_pair: SelectedPairSlot,
    conn: Option<Arc<dyn Conn + Send + Sync>>,
    conn_cancel_tx: Option<mpsc::Sender<()>>,
    waiter: Option<JoinHandle<()>>,
    offer_rx: Option<mpsc::Receiver<Credentials>>,
    answer_rx: Option<mpsc::Receiver<Credentials>>,
    child: CancellationToken,
    closed: bool,
}

pub struct PeerSession {
    remote: RemotePeer,
    local: LocalPeer,
    ice_urls: Vec<Url>,
    signal: SignalSender,
    driver: Arc<dyn TunnelDriver>,
    conn_state: Arc<ConnectState>,
    cancel: CancellationToken,
    offer_tx: mpsc::Sender<Credentials>,
    answer_tx: mpsc::Sender<Credentials>,
    inner: Mutex<SessionInner>,
}

impl PeerSession {
    pub fn new(
        remote: RemotePeer,
        local: LocalPeer,
        ice_urls: Vec<Url>,
        signal: SignalSender,
        driver: Arc<dyn TunnelDriver>,
        conn_state: Arc<ConnectState>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (offer_tx, offer_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let (answer_tx, answer_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

        Arc::new(Self {
            remote,
            local,
            ice_urls,
            signal,
            driver,
            conn_state,
            cancel: parent.child_token(),
            offer_tx,
            answer_tx,
            inner: Mutex::new(SessionInner {
                offer_rx: Some(offer_rx),
                answer_rx: Some(answer_rx),
                ..Default::default()
            }),
        })
    }

    pub fn remote_machine_key(&self) -> &str {
        &self.remote.machine_key
    }

    pub fn remote(&self) -> &RemotePeer {
        &self.remote
    }

    /// Build (or rebuild) the agent, its mux socket, and the proxy. An
    /// existing transport is torn down first, so a replay after a remote
    /// restart starts from a clean slate.
    pub async fn setup(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            bail!("session for [{}] is closed", self.remote.machine_key);
        }

        self.teardown_transport(&mut inner).await;
        inner.child = self.cancel.child_token();

        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind ice mux socket")?;
        let udp_mux: Arc<dyn UDPMux + Send + Sync> =
            UDPMuxDefault::new(UDPMuxParams::new(sock));

        let blacklist = self.local.blacklist.clone();
        let agent = Agent::new(AgentConfig {
            urls: self.ice_urls.clone(),
            network_types: vec![NetworkType::Udp4],
            candidate_types: vec![
                CandidateType::Host,
                CandidateType::ServerReflexive,
                CandidateType::Relay,
            ],
            udp_network: UDPNetwork::Muxed(Arc::clone(&udp_mux)),
            multicast_dns_mode: MulticastDnsMode::Disabled,
            failed_timeout: Some(ICE_FAILED_TIMEOUT),
            interface_filter: Arc::new(Some(Box::new(move |name: &str| {
                !blacklist.iter().any(|blocked| blocked.as_str() == name)
            }))),
            ..Default::default()
        })
        .await
        .context("failed to build ice agent")?;
        let agent = Arc::new(agent);

        let signal = self.signal.clone();
        agent.on_candidate(Box::new(
            move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
                let signal = signal.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        signal.candidate(candidate.marshal());
                    }
                })
            },
        ));

        let conn_state = Arc::clone(&self.conn_state);
        let child = inner.child.clone();
        let remote_mk = self.remote.machine_key.clone();
        agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
            let conn_state = Arc::clone(&conn_state);
            let child = child.clone();
            let remote_mk = remote_mk.clone();
            Box::pin(async move {
                match state {
                    ConnectionState::Completed => {
                        info!("agent for [{remote_mk}] completed");
                        conn_state.connected();
                    }
                    ConnectionState::Failed | ConnectionState::Disconnected => {
                        warn!("agent for [{remote_mk}] entered {state}, releasing the tunnel");
                        conn_state.disconnected();
                        child.cancel();
                    }
                    other => debug!("agent for [{remote_mk}] is {other}"),
                }
            })
        }));

        let selected_pair: SelectedPairSlot = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&selected_pair);
        agent.on_selected_candidate_pair_change(Box::new(
            move |local: &Arc<dyn Candidate + Send + Sync>,
                  remote: &Arc<dyn Candidate + Send + Sync>| {
                let (local_addr, remote_addr) = (local.address(), remote.address());
                *slot.lock().unwrap() = pair_endpoints(local, remote);
                Box::pin(async move {
                    info!(
                        "selected candidate pair changed, local [{local_addr}] <-> remote [{remote_addr}]"
                    );
                })
            },
        ));

        let proxy = Arc::new(WireProxy::new(
            Arc::clone(&self.driver),
            self.local.tun_name.clone(),
            self.remote.wg_pub_key.clone(),
            self.remote.allowed_ips.clone(),
            self.local.wg_port,
            self.local.preshared_key.clone(),
            &inner.child,
        ));

        inner.agent = Some(agent);
        inner.udp_mux = Some(udp_mux);
        inner.proxy = Some(proxy);
        inner.selected_pair = selected_pair;
        Ok(())
    }

    /// Spawn the signaling waiter (at most once per session) and push the
    /// local offer to the remote side. Candidate gathering only begins after
    /// the first offer or answer arrives, so a peer that never responds
    /// costs no gathering work.
    pub async fn start_gathering(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                bail!("session for [{}] is closed", self.remote.machine_key);
            }
            if inner.waiter.is_none() {
                if let (Some(offer_rx), Some(answer_rx)) =
                    (inner.offer_rx.take(), inner.answer_rx.take())
                {
                    let session = Arc::clone(self);
                    inner.waiter = Some(tokio::spawn(async move {
                        session.run_waiter(offer_rx, answer_rx).await;
                    }));
                }
            }
        }

        self.signal_offer().await
    }

    /// Inbound OFFER. Non-blocking: a full queue drops the message.
    pub fn send_offer(&self, ufrag: &str, pwd: &str) {
        let creds = Credentials {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        };
        match self.offer_tx.try_send(creds) {
            Ok(()) => debug!("queued offer from [{}]", self.remote.machine_key),
            Err(e) => warn!("dropping offer from [{}]: {e}", self.remote.machine_key),
        }
    }

    /// Inbound ANSWER. Non-blocking: a full queue drops the message.
    pub fn send_answer(&self, ufrag: &str, pwd: &str) {
        let creds = Credentials {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        };
        match self.answer_tx.try_send(creds) {
            Ok(()) => debug!("queued answer from [{}]", self.remote.machine_key),
            Err(e) => warn!("dropping answer from [{}]: {e}", self.remote.machine_key),
        }
    }

    /// Hand a remote candidate to the agent. Dropped with a log line when
    /// the agent is not up yet.
    pub fn send_candidate(self: &Arc<Self>, candidate: Arc<dyn Candidate + Send + Sync>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let agent = session.inner.lock().await.agent.clone();
            match agent {
                Some(agent) => {
                    if let Err(e) = agent.add_remote_candidate(&candidate) {
                        warn!(
                            "failed to add remote candidate from [{}]: {e}",
                            session.remote.machine_key
                        );
                    }
                }
                None => warn!(
                    "no agent for [{}] yet, dropping candidate",
                    session.remote.machine_key
                ),
            }
        });
    }

    /// Close the connection, the agent, the mux socket, and the proxy, and
    /// stop the waiter. Idempotent.
    pub async fn cleanup(&self) {
        let waiter = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            self.cancel.cancel();
            self.teardown_transport(&mut inner).await;
            inner.waiter.take()
        };

        if let Some(waiter) = waiter {
            let _ = waiter.await;
        }

        // sessions that never built a proxy still must not leave a peer entry
        if let Err(e) = self
            .driver
            .remove_peer(&self.local.tun_name, &self.remote.wg_pub_key)
        {
            warn!(
                "failed to remove wireguard peer [{}]: {e:#}",
                self.remote.wg_pub_key
            );
        }

        self.conn_state.disconnected();
        debug!("cleaned up session for [{}]", self.remote.machine_key);
    }

    async fn teardown_transport(&self, inner: &mut SessionInner) {
        inner.child.cancel();
        inner.conn_cancel_tx = None;

        if let Some(conn) = inner.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("closing punched connection: {e}");
            }
        }
        if let Some(agent) = inner.agent.take() {
            if let Err(e) = agent.close().await {
                debug!("closing ice agent: {e}");
            }
        }
        if let Some(udp_mux) = inner.udp_mux.take() {
            if let Err(e) = udp_mux.close().await {
                debug!("closing udp mux: {e}");
            }
        }
        if let Some(proxy) = inner.proxy.take() {
            if let Err(e) = proxy.stop().await {
                warn!(
                    "failed to stop proxy for [{}]: {e:#}",
                    self.remote.machine_key
                );
            }
        }
    }

    /// Single waiter per session. Waits for credentials from either channel,
    /// answers offers, then gathers and connects. A later offer on an
    /// already-running session re-sends the answer without rebuilding the
    /// agent.
    async fn run_waiter(
        self: Arc<Self>,
        mut offer_rx: mpsc::Receiver<Credentials>,
        mut answer_rx: mpsc::Receiver<Credentials>,
    ) {
        loop {
            let creds = tokio::select! {
                _ = self.cancel.cancelled() => return,
                creds = answer_rx.recv() => match creds {
                    Some(creds) => {
                        debug!("received answer credentials from [{}]", self.remote.machine_key);
                        creds
                    }
                    None => return,
                },
                creds = offer_rx.recv() => match creds {
                    Some(creds) => {
                        debug!("received offer from [{}]", self.remote.machine_key);
                        if let Err(e) = self.signal_answer().await {
                            warn!("failed to answer [{}]: {e:#}", self.remote.machine_key);
                            continue;
                        }
                        creds
                    }
                    None => return,
                },
            };

            if let Err(e) = self.establish(creds).await {
                warn!(
                    "failed to establish tunnel to [{}]: {e:#}",
                    self.remote.machine_key
                );
            }
        }
    }

    /// Gather, connect with the remote credentials, and hand the punched
    /// connection to the proxy.
    async fn establish(&self, creds: Credentials) -> Result<()> {
        let (agent, proxy, selected_pair, cancel_rx) = {
            let mut inner = self.inner.lock().await;
            let agent = inner.agent.clone().context("agent is not set up")?;
            let proxy = inner.proxy.clone().context("proxy is not set up")?;
            let selected_pair = Arc::clone(&inner.selected_pair);
            let (cancel_tx, cancel_rx) = mpsc::channel(1);
            inner.conn_cancel_tx = Some(cancel_tx);
            (agent, proxy, selected_pair, cancel_rx)
        };

        agent
            .gather_candidates()
            .context("failed to start candidate gathering")?;

        let conn: Arc<dyn Conn + Send + Sync> =
            if is_dialer(&self.local.wg_pub_key, &self.remote.wg_pub_key) {
                debug!("dialing [{}]", self.remote.machine_key);
                agent
                    .dial(cancel_rx, creds.ufrag, creds.pwd)
                    .await
                    .context("ice dial failed")?
            } else {
                debug!("accepting from [{}]", self.remote.machine_key);
                agent
                    .accept(cancel_rx, creds.ufrag, creds.pwd)
                    .await
                    .context("ice accept failed")?
            };

        let pair = *selected_pair.lock().unwrap();
        proxy.start(Arc::clone(&conn), pair).await?;

        self.inner.lock().await.conn = Some(conn);
        info!(
            "tunnel up, local [{}] <-> remote [{}]",
            self.local.wg_pub_key, self.remote.wg_pub_key
        );
        Ok(())
    }

    async fn signal_offer(&self) -> Result<()> {
        let agent = self
            .inner
            .lock()
            .await
            .agent
            .clone()
            .context("agent is not set up")?;
        let (ufrag, pwd) = agent.get_local_user_credentials().await;
        self.signal.offer(&ufrag, &pwd).await?;
        debug!("offer sent to [{}]", self.remote.machine_key);
        Ok(())
    }

    async fn signal_answer(&self) -> Result<()> {
        let agent = self
            .inner
            .lock()
            .await
            .agent
            .clone()
            .context("agent is not set up")?;
        let (ufrag, pwd) = agent.get_local_user_credentials().await;
        self.signal.answer(&ufrag, &pwd).await?;
        debug!("answer sent to [{}]", self.remote.machine_key);
        Ok(())
    }
}

fn pair_endpoints(
    local: &Arc<dyn Candidate + Send + Sync>,
    remote: &Arc<dyn Candidate + Send + Sync>,
) -> Option<(PairEndpoint, PairEndpoint)> {
    let local_ip = IpAddr::from_str(&local.address()).ok()?;
    let remote_ip = IpAddr::from_str(&remote.address()).ok()?;
    Some((
        PairEndpoint {
            kind: local.candidate_type(),
            ip: local_ip,
        },
        PairEndpoint {
            kind: remote.candidate_type(),
            ip: remote_ip,
        },
    ))
}
