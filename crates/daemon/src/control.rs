//! Signaling control plane.
//!
//! Owns the peer sessions keyed by remote machine key and keeps the map
//! aligned with the server's view of the mesh: signaling intake creates
//! sessions lazily, membership events and the periodic sync reconcile, and
//! the gather task drives ICE setup for everything that appears.

use crate::api::{
    MeshEvent, MeshEventKind, NegotiationKind, NegotiationMessage, RemotePeer, ServerApi,
    SignalApi, StunTurnConfig,
};
use crate::backoff::Backoff;
use crate::session::{LocalPeer, PeerSession};
use crate::signal::SignalSender;
use crate::state::ConnectState;
use crate::wg::TunnelDriver;
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc_ice::candidate::candidate_base::unmarshal_candidate;
use webrtc_ice::candidate::Candidate;
use webrtc_ice::url::Url;

const SYNC_INTERVAL: Duration = Duration::from_secs(60);
const GATHER_QUEUE_CAPACITY: usize = 32;

pub struct ControlPlane {
    signal: Arc<dyn SignalApi>,
    server: Arc<dyn ServerApi>,
    driver: Arc<dyn TunnelDriver>,
    conn_state: Arc<ConnectState>,
    mk: String,
    local: LocalPeer,
    ice_urls: Mutex<Vec<Url>>,
    peers: Mutex<HashMap<String, Arc<PeerSession>>>,
    gather_tx: mpsc::Sender<Arc<PeerSession>>,
    gather_rx: Mutex<Option<mpsc::Receiver<Arc<PeerSession>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        signal: Arc<dyn SignalApi>,
        server: Arc<dyn ServerApi>,
        driver: Arc<dyn TunnelDriver>,
        conn_state: Arc<ConnectState>,
        local: LocalPeer,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (gather_tx, gather_rx) = mpsc::channel(GATHER_QUEUE_CAPACITY);

        Arc::new(Self {
            signal,
            server,
            driver,
            conn_state,
            mk: local.machine_key.clone(),
            local,
            ice_urls: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            gather_tx,
            gather_rx: Mutex::new(Some(gather_rx)),
            tasks: Mutex::new(Vec::new()),
            cancel: parent.child_token(),
        })
    }

    /// Spawn the four long-lived loops. Their handles are retained so
    /// `close` can wait for every loop to finish.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).run_signaling()));
        tasks.push(tokio::spawn(Arc::clone(self).run_gatherer()));
        tasks.push(tokio::spawn(Arc::clone(self).run_mesh_events()));
        tasks.push(tokio::spawn(Arc::clone(self).run_sync()));
    }

    /// Fetch and parse the STUN/TURN material. Must run before the signaling
    /// stream opens; the result is held for the process lifetime.
    pub async fn configure_stun_turn(&self) -> Result<()> {
        let conf = self
            .signal
            .stun_turn()
            .await
            .context("failed to fetch stun/turn config")?;
        let urls = parse_ice_urls(&conf)?;
        debug!("ice servers configured: {urls:?}");
        *self.ice_urls.lock().await = urls;
        Ok(())
    }

    /// Supervise the inbound negotiation stream, reopening with backoff when
    /// it drops. Established sessions are untouched across reconnects.
    async fn run_signaling(self: Arc<Self>) {
        let mut backoff = Backoff::default();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.signal.start_connect(&self.mk).await {
                Ok(mut stream) => {
                    info!("signaling stream open");
                    backoff.reset();
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            msg = stream.recv() => match msg {
                                Some(msg) => {
                                    if let Err(e) = self.dispatch(msg).await {
                                        warn!("failed to handle signaling message: {e:#}");
                                    }
                                }
                                None => {
                                    warn!("signaling stream closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("failed to open signaling stream: {e:#}"),
            }

            let delay = match backoff.next() {
                Some(delay) => delay,
                None => {
                    backoff.reset();
                    continue;
                }
            };
            debug!("reconnecting signaling stream in {delay:?}");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Route one inbound message into its session, creating the session
    /// lazily when the server recognizes the sender.
    async fn dispatch(self: &Arc<Self>, msg: NegotiationMessage) -> Result<()> {
        if msg.dst_mk.is_empty() {
            bail!("empty destination machine key");
        }

        let mut peers = self.peers.lock().await;
        let session = match peers.get(&msg.dst_mk) {
            Some(session) => Arc::clone(session),
            None => match self.create_session_from_sync(&msg.dst_mk).await? {
                Some(session) => {
                    peers.insert(msg.dst_mk.clone(), Arc::clone(&session));
                    self.enqueue_gather(&session);
                    session
                }
                None => {
                    debug!(
                        "server does not know [{}], dropping {:?}",
                        msg.dst_mk, msg.kind
                    );
                    return Ok(());
                }
            },
        };

        match msg.kind {
            NegotiationKind::Offer => session.send_offer(&msg.ufrag, &msg.pwd),
            NegotiationKind::Answer => session.send_answer(&msg.ufrag, &msg.pwd),
            NegotiationKind::Candidate => match unmarshal_candidate(&msg.candidate) {
                Ok(candidate) => {
                    let candidate: Arc<dyn Candidate + Send + Sync> = Arc::new(candidate);
                    session.send_candidate(candidate);
                }
                Err(e) => warn!("unparseable candidate from [{}]: {e}", msg.dst_mk),
            },
        }
        Ok(())
    }

    /// A message arrived for a peer we have no session for. Ask the server:
    /// if the latest sync names the peer, build a session; otherwise drop.
    async fn create_session_from_sync(&self, dst_mk: &str) -> Result<Option<Arc<PeerSession>>> {
        debug!("first signaling message from [{dst_mk}], consulting the server");
        let sync = self
            .server
            .sync_peers(&self.mk)
            .await
            .context("peer sync failed")?;

        let Some(peer) = sync.peers.into_iter().find(|p| p.machine_key == dst_mk) else {
            return Ok(None);
        };
        Ok(Some(self.build_session(peer).await))
    }

    async fn build_session(&self, remote: RemotePeer) -> Arc<PeerSession> {
        let signal = SignalSender::new(
            Arc::clone(&self.signal),
            remote.machine_key.clone(),
            self.mk.clone(),
        );
        let ice_urls = self.ice_urls.lock().await.clone();
        PeerSession::new(
            remote,
            self.local.clone(),
            ice_urls,
            signal,
            Arc::clone(&self.driver),
            Arc::clone(&self.conn_state),
            &self.cancel,
        )
    }

    fn enqueue_gather(&self, session: &Arc<PeerSession>) {
        if self.gather_tx.try_send(Arc::clone(session)).is_err() {
            warn!(
                "gather queue full, [{}] waits for the next sync",
                session.remote_machine_key()
            );
        }
    }

    /// Single consumer of the gather queue. Runs `setup` then
    /// `start_gathering` for each new session; errors never stop the task.
    async fn run_gatherer(self: Arc<Self>) {
        let mut rx = match self.gather_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let session = tokio::select! {
                _ = self.cancel.cancelled() => return,
                session = rx.recv() => match session {
                    Some(session) => session,
                    None => return,
                },
            };

            let mk = session.remote_machine_key().to_string();
            if !self.signal.is_ready() || !self.peers.lock().await.contains_key(&mk) {
                warn!("signaling not ready or [{mk}] already gone, skipping gather");
                continue;
            }

            if let Err(e) = session.setup().await {
                error!("failed to set up session for [{mk}]: {e:#}");
                continue;
            }
            if let Err(e) = session.start_gathering().await {
                error!("failed to start gathering for [{mk}]: {e:#}");
                continue;
            }
            debug!("gathering started for [{mk}]");
        }
    }

    /// Align the session map with an authoritative peer list: sessions for
    /// departed peers are cleaned up and dropped, new peers get a fresh
    /// session queued for gathering.
    pub async fn apply_peer_list(self: &Arc<Self>, list: &[RemotePeer]) {
        let mut peers = self.peers.lock().await;

        let keep: HashSet<&str> = list.iter().map(|p| p.machine_key.as_str()).collect();
        let stale: Vec<String> = peers
            .keys()
            .filter(|mk| !keep.contains(mk.as_str()))
            .cloned()
            .collect();
        for mk in stale {
            if let Some(session) = peers.remove(&mk) {
                info!("peer [{mk}] left the mesh, cleaning up");
                session.cleanup().await;
            }
        }

        for peer in list {
            if peer.machine_key == self.mk || peers.contains_key(&peer.machine_key) {
                continue;
            }
            info!("new peer [{}] in the mesh", peer.machine_key);
            let session = self.build_session(peer.clone()).await;
            peers.insert(peer.machine_key.clone(), Arc::clone(&session));
            self.enqueue_gather(&session);
        }
    }

    /// Consume the mesh membership stream for the process lifetime.
    async fn run_mesh_events(self: Arc<Self>) {
        let mut stream = match self.server.join_mesh(&self.mk).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to join mesh: {e:#}");
                return;
            }
        };

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = stream.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!("mesh stream closed");
                        return;
                    }
                },
            };
            self.handle_mesh_event(event).await;
        }
    }

    /// A disconnect names a peer whose signaling dropped: its agent is
    /// rebuilt in place so a fresh offer/answer cycle can succeed once the
    /// remote returns. Everything else reconciles the peer list.
    async fn handle_mesh_event(self: &Arc<Self>, event: MeshEvent) {
        if event.kind == MeshEventKind::Disconnect {
            let session = self.peers.lock().await.get(&event.target_mk).cloned();
            if let Some(session) = session {
                info!(
                    "peer [{}] dropped its signaling, rebuilding its agent",
                    event.target_mk
                );
                if let Err(e) = session.setup().await {
                    error!(
                        "failed to rebuild session for [{}]: {e:#}",
                        event.target_mk
                    );
                }
            }
            return;
        }

        self.apply_peer_list(&event.peers).await;
    }

    /// Periodic resync against the authoritative list, in case membership
    /// events were missed.
    async fn run_sync(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.server.sync_peers(&self.mk).await {
                Ok(sync) => self.apply_peer_list(&sync.peers).await,
                Err(e) => warn!("peer sync failed: {e:#}"),
            }
        }
    }

    /// Current session keys, mostly for observability.
    pub async fn peer_keys(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    /// Stop the loops, then tear down every session. The loop tasks are
    /// awaited before the map is drained, so an in-flight dispatch cannot
    /// create a session the drain would miss. Further calls are no-ops.
    pub async fn close(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let sessions: Vec<(String, Arc<PeerSession>)> =
            self.peers.lock().await.drain().collect();
        for (mk, session) in sessions {
            session.cleanup().await;
            debug!("closed session for [{mk}]");
        }
        debug!("control plane closed");
    }
}

fn parse_ice_urls(conf: &StunTurnConfig) -> Result<Vec<Url>> {
    let mut stun = Url::parse_url(&conf.stun_url)
        .with_context(|| format!("invalid stun url {:?}", conf.stun_url))?;
    stun.username = conf.username.clone();
    stun.password = conf.password.clone();

    let mut turn = Url::parse_url(&conf.turn_url)
        .with_context(|| format!("invalid turn url {:?}", conf.turn_url))?;
    turn.username = conf.username.clone();
    turn.password = conf.password.clone();

    Ok(vec![stun, turn])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SyncResponse;
    use crate::testutil::{remote_peer, FakeServerApi, FakeSignalApi, MemoryTunnelDriver};
    use crate::wg::WG_PORT;

    fn local_peer() -> LocalPeer {
        LocalPeer {
            machine_key: "local-mk".to_string(),
            wg_pub_key: "zzzz-local-pub".to_string(),
            ip: "100.64.0.1".to_string(),
            cidr: "24".to_string(),
            tun_name: "wm0".to_string(),
            wg_port: WG_PORT,
            preshared_key: None,
            blacklist: vec!["wm0".to_string()],
        }
    }

    struct Fixture {
        control: Arc<ControlPlane>,
        server: Arc<FakeServerApi>,
        driver: Arc<MemoryTunnelDriver>,
    }

    async fn fixture() -> Fixture {
        let signal = Arc::new(FakeSignalApi::default());
        let server = Arc::new(FakeServerApi::default());
        let driver = Arc::new(MemoryTunnelDriver::default());
        let control = ControlPlane::new(
            Arc::clone(&signal) as Arc<dyn SignalApi>,
            Arc::clone(&server) as Arc<dyn ServerApi>,
            Arc::clone(&driver) as Arc<dyn TunnelDriver>,
            Arc::new(ConnectState::new()),
            local_peer(),
            &CancellationToken::new(),
        );
        control.configure_stun_turn().await.unwrap();
        Fixture {
            control,
            server,
            driver,
        }
    }

    fn offer_for(mk: &str) -> NegotiationMessage {
        NegotiationMessage {
            dst_mk: mk.to_string(),
            kind: NegotiationKind::Offer,
            ufrag: "u".to_string(),
            pwd: "p".to_string(),
            candidate: String::new(),
        }
    }

    #[tokio::test]
    async fn test_reconciliation_tracks_server_list() {
        let f = fixture().await;

        f.control
            .apply_peer_list(&[remote_peer("b"), remote_peer("c")])
            .await;
        let mut keys = f.control.peer_keys().await;
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);

        f.control.apply_peer_list(&[remote_peer("b")]).await;
        assert_eq!(f.control.peer_keys().await, vec!["b"]);

        f.control.apply_peer_list(&[]).await;
        assert!(f.control.peer_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_removed_peer_leaves_wireguard_table() {
        let f = fixture().await;
        f.control.apply_peer_list(&[remote_peer("b")]).await;

        // simulate an established tunnel
        let peer = remote_peer("b");
        f.driver
            .add_peer(
                "wm0",
                &peer.wg_pub_key,
                &peer.allowed_ips,
                None,
                Some(25),
                None,
            )
            .unwrap();
        assert!(f.driver.has_peer(&peer.wg_pub_key));

        f.control.apply_peer_list(&[]).await;
        assert!(!f.driver.has_peer(&peer.wg_pub_key));
    }

    #[tokio::test]
    async fn test_empty_dst_is_rejected() {
        let f = fixture().await;
        assert!(f.control.dispatch(offer_for("")).await.is_err());
        assert!(f.control.peer_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_offer_for_unknown_peer_drops_until_sync_names_it() {
        let f = fixture().await;

        // the server has never heard of "b"
        f.control.dispatch(offer_for("b")).await.unwrap();
        assert!(f.control.peer_keys().await.is_empty());

        // after the server names the peer, a re-sent offer creates a session
        *f.server.sync.lock().unwrap() = SyncResponse {
            ip: "100.64.0.1".to_string(),
            cidr: "24".to_string(),
            peers: vec![remote_peer("b")],
        };
        f.control.dispatch(offer_for("b")).await.unwrap();
        assert_eq!(f.control.peer_keys().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_malformed_candidate_is_dropped() {
        let f = fixture().await;
        f.control.apply_peer_list(&[remote_peer("b")]).await;

        let msg = NegotiationMessage {
            dst_mk: "b".to_string(),
            kind: NegotiationKind::Candidate,
            ufrag: String::new(),
            pwd: String::new(),
            candidate: "garbage".to_string(),
        };
        f.control.dispatch(msg).await.unwrap();
        assert_eq!(f.control.peer_keys().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_disconnect_event_rebuilds_without_removal() {
        let f = fixture().await;
        f.control.apply_peer_list(&[remote_peer("b")]).await;

        f.control
            .handle_mesh_event(MeshEvent {
                kind: MeshEventKind::Disconnect,
                target_mk: "b".to_string(),
                peers: Vec::new(),
                ip: "100.64.0.1".to_string(),
                cidr: "24".to_string(),
            })
            .await;

        // the session survives the rebuild
        assert_eq!(f.control.peer_keys().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let f = fixture().await;
        f.control.apply_peer_list(&[remote_peer("b")]).await;

        f.control.close().await;
        assert!(f.control.peer_keys().await.is_empty());
        f.control.close().await;
    }

    #[tokio::test]
    async fn test_invalid_stun_url_is_fatal() {
        let signal = Arc::new(FakeSignalApi::default());
        *signal.stun_turn.lock().unwrap() = StunTurnConfig {
            stun_url: "not a url".to_string(),
            turn_url: "turn:turn.example.net:3478".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let control = ControlPlane::new(
            signal as Arc<dyn SignalApi>,
            Arc::new(FakeServerApi::default()) as Arc<dyn ServerApi>,
            Arc::new(MemoryTunnelDriver::default()) as Arc<dyn TunnelDriver>,
            Arc::new(ConnectState::new()),
            local_peer(),
            &CancellationToken::new(),
        );
        assert!(control.configure_stun_turn().await.is_err());
    }
}
