//! Top-level coordinator.
//!
//! Logs the node in, brings the tunnel interface up, wires the control plane
//! and the status socket, and supervises shutdown in reverse dependency
//! order.

use crate::api::{ServerApi, SignalApi};
use crate::config::ClientConfig;
use crate::control::ControlPlane;
use crate::identity::{self, WgKeyPair};
use crate::session::LocalPeer;
use crate::state::ConnectState;
use crate::wg::{TunnelDriver, WG_PORT};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
#[cfg(unix)]
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Engine {
    config: ClientConfig,
    keypair: WgKeyPair,
    mk: String,
    server: Arc<dyn ServerApi>,
    signal: Arc<dyn SignalApi>,
    driver: Arc<dyn TunnelDriver>,
    conn_state: Arc<ConnectState>,
    #[cfg(unix)]
    sock_path: PathBuf,
    #[cfg(unix)]
    status_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    control: Mutex<Option<Arc<ControlPlane>>>,
}

impl Engine {
    /// Identity and configuration problems surface here and are fatal;
    /// nothing network-facing happens yet.
    pub fn new(
        config: ClientConfig,
        mk: String,
        server: Arc<dyn ServerApi>,
        signal: Arc<dyn SignalApi>,
        driver: Arc<dyn TunnelDriver>,
        sock_path: Option<PathBuf>,
    ) -> Result<Self> {
        let keypair = match config.wg_private_key.as_deref() {
            Some(encoded) if !encoded.is_empty() => WgKeyPair::from_base64(encoded)
                .context("invalid wireguard private key in config")?,
            _ => WgKeyPair::load_or_generate(&WgKeyPair::default_path())?,
        };

        if let Some(psk) = config.preshared_key.as_deref() {
            if !psk.is_empty() {
                identity::parse_key(psk).context("invalid preshared key")?;
            }
        }

        #[cfg(unix)]
        let sock_path =
            sock_path.unwrap_or_else(|| PathBuf::from(crate::status::DEFAULT_SOCK_PATH));
        #[cfg(not(unix))]
        let _ = sock_path;

        Ok(Self {
            config,
            keypair,
            mk,
            server,
            signal,
            driver,
            conn_state: Arc::new(ConnectState::new()),
            #[cfg(unix)]
            sock_path,
            #[cfg(unix)]
            status_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            control: Mutex::new(None),
        })
    }

    pub fn machine_key(&self) -> &str {
        &self.mk
    }

    pub fn conn_state(&self) -> Arc<ConnectState> {
        Arc::clone(&self.conn_state)
    }

    /// Current peer session keys.
    pub async fn peers(&self) -> Vec<String> {
        match self.control.lock().await.as_ref() {
            Some(control) => control.peer_keys().await,
            None => Vec::new(),
        }
    }

    /// Log in, create the tunnel, and start the long-lived loops. After a
    /// successful return only identity-independent errors can occur, and the
    /// loops recover from or log all of them.
    pub async fn start(&self) -> Result<()> {
        let wg_pub_key = self.keypair.public_key_base64();
        let login = self
            .server
            .login(&self.mk, &wg_pub_key)
            .await
            .context("login failed")?;

        let (ip, cidr) = if login.registered {
            (login.ip, login.cidr)
        } else {
            if let Some(url) = &login.login_url {
                info!("machine not registered yet, complete login at {url}");
            }
            let session = self
                .server
                .await_login_session(&self.mk)
                .await
                .context("login session failed")?;
            (session.ip, session.cidr)
        };
        info!("assigned {ip}/{cidr}");

        self.driver
            .create(
                &self.config.tun_name,
                &self.keypair.private_key_base64(),
                &ip,
                &cidr,
                WG_PORT,
            )
            .context("failed to create tunnel interface")?;

        let local = LocalPeer {
            machine_key: self.mk.clone(),
            wg_pub_key,
            ip: ip.clone(),
            cidr: cidr.clone(),
            tun_name: self.config.tun_name.clone(),
            wg_port: WG_PORT,
            preshared_key: self
                .config
                .preshared_key
                .clone()
                .filter(|key| !key.is_empty()),
            blacklist: self.config.interface_blacklist(),
        };

        let control = ControlPlane::new(
            Arc::clone(&self.signal),
            Arc::clone(&self.server),
            Arc::clone(&self.driver),
            Arc::clone(&self.conn_state),
            local,
            &self.cancel,
        );
        control.configure_stun_turn().await?;
        control.start().await;
        *self.control.lock().await = Some(control);

        #[cfg(unix)]
        {
            let sock = crate::status::StatusSock::new(
                self.sock_path.clone(),
                Arc::clone(&self.conn_state),
                ip,
                cidr,
                &self.cancel,
            );
            let task = tokio::spawn(async move {
                if let Err(e) = sock.serve().await {
                    warn!("status socket failed: {e:#}");
                }
            });
            *self.status_task.lock().await = Some(task);
        }

        let conn_state = Arc::clone(&self.conn_state);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = conn_state.await_ready() => info!("first peer tunnel completed"),
            }
        });

        debug!("engine started");
        Ok(())
    }

    /// Drain in reverse dependency order: sessions, control plane, status
    /// socket, tunnel interface. Every stage is awaited before the next one
    /// starts. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(control) = self.control.lock().await.take() {
            control.close().await;
        }
        self.cancel.cancel();

        #[cfg(unix)]
        if let Some(task) = self.status_task.lock().await.take() {
            let _ = task.await;
        }

        if let Err(e) = self.driver.destroy(&self.config.tun_name) {
            warn!("failed to remove tunnel interface: {e:#}");
        }
        self.conn_state.disconnected();
        debug!("engine stopped");
    }
}
