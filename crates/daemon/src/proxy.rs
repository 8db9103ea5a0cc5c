//! Bridges the hole-punched connection and the local WireGuard port.
//!
//! Two modes. When the selected candidate pair is host-to-host with a public
//! side, WireGuard is pointed at the punched remote address directly and no
//! userspace packets flow. Every other pair goes through a small UDP relay:
//! WireGuard's peer endpoint becomes a loopback socket owned by this proxy,
//! and two copy tasks shuttle datagrams between that socket and the punched
//! connection.

use crate::wg::{TunnelDriver, WG_KEEPALIVE_SECS};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc_ice::candidate::CandidateType;
use webrtc_util::Conn;

const COPY_BUF_SIZE: usize = 1500;

/// One side of a selected candidate pair, reduced to what the relay decision
/// needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairEndpoint {
    pub kind: CandidateType,
    pub ip: IpAddr,
}

/// Whether the selected pair needs the userspace relay. Only a host-to-host
/// pair with at least one public address can be handed to WireGuard
/// directly; symmetric under swapping the two sides.
pub fn should_relay(local: PairEndpoint, remote: PairEndpoint) -> bool {
    let host_pair =
        local.kind == CandidateType::Host && remote.kind == CandidateType::Host;
    !(host_pair && (is_public_ip(local.ip) || is_public_ip(remote.ip)))
}

/// Public means routable: not loopback, not link-local (unicast or
/// multicast), not in a private range.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || is_link_local_multicast_v4(&v4)
                || v4.is_private())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || is_link_local_v6(&v6)
                || is_link_local_multicast_v6(&v6)
                || is_unique_local_v6(&v6))
        }
    }
}

/// 224.0.0.0/24
fn is_link_local_multicast_v4(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 224 && octets[1] == 0 && octets[2] == 0
}

/// fe80::/10
fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80
}

/// ff02::/16
fn is_link_local_multicast_v6(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xff && (octets[1] & 0x0f) == 0x02
}

/// fc00::/7
fn is_unique_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.octets()[0] & 0xfe) == 0xfc
}

#[derive(Default)]
struct ProxyInner {
    local: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-session proxy. Owns the relay socket and copy tasks when relaying,
/// and the WireGuard peer entry in both modes.
pub struct WireProxy {
    driver: Arc<dyn TunnelDriver>,
    tun_name: String,
    remote_wg_pub_key: String,
    allowed_ips: Vec<String>,
    wg_port: u16,
    wg_listen_addr: String,
    preshared_key: Option<String>,
    cancel: CancellationToken,
    inner: Mutex<ProxyInner>,
}

impl WireProxy {
    pub fn new(
        driver: Arc<dyn TunnelDriver>,
        tun_name: String,
        remote_wg_pub_key: String,
        allowed_ips: Vec<String>,
        wg_port: u16,
        preshared_key: Option<String>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            driver,
            tun_name,
            remote_wg_pub_key,
            allowed_ips,
            wg_port,
            wg_listen_addr: format!("127.0.0.1:{wg_port}"),
            preshared_key,
            cancel: parent.child_token(),
            inner: Mutex::new(ProxyInner::default()),
        }
    }

    /// Attach the punched connection. `pair` is the ICE-selected candidate
    /// pair; when it is missing the relay path is taken, which works for any
    /// pair.
    pub async fn start(
        &self,
        conn: Arc<dyn Conn + Send + Sync>,
        pair: Option<(PairEndpoint, PairEndpoint)>,
    ) -> Result<()> {
        match pair {
            Some((local, remote)) if !should_relay(local, remote) => {
                self.start_direct(conn).await
            }
            _ => self.start_relay(conn).await,
        }
    }

    /// Fast path: rewrite the punched remote address to the WireGuard port
    /// and program the peer to talk to it directly.
    async fn start_direct(&self, conn: Arc<dyn Conn + Send + Sync>) -> Result<()> {
        let mut endpoint = conn
            .remote_addr()
            .context("punched connection has no remote address")?;
        endpoint.set_port(self.wg_port);

        debug!(
            "binding [{}] directly to {endpoint}",
            self.remote_wg_pub_key
        );
        self.driver.add_peer(
            &self.tun_name,
            &self.remote_wg_pub_key,
            &self.allowed_ips,
            Some(endpoint),
            Some(WG_KEEPALIVE_SECS),
            self.preshared_key.as_deref(),
        )
    }

    async fn start_relay(&self, conn: Arc<dyn Conn + Send + Sync>) -> Result<()> {
        let local = UdpSocket::bind("127.0.0.1:0")
            .await
            .context("failed to bind relay socket")?;
        local
            .connect(&self.wg_listen_addr)
            .await
            .with_context(|| format!("failed to connect relay socket to {}", self.wg_listen_addr))?;
        let endpoint = local.local_addr().context("relay socket has no address")?;

        self.driver.add_peer(
            &self.tun_name,
            &self.remote_wg_pub_key,
            &self.allowed_ips,
            Some(endpoint),
            Some(WG_KEEPALIVE_SECS),
            self.preshared_key.as_deref(),
        )?;

        let local = Arc::new(local);
        let mut inner = self.inner.lock().await;
        inner.tasks.push(tokio::spawn(copy_to_remote(
            Arc::clone(&local),
            Arc::clone(&conn),
            self.cancel.clone(),
        )));
        inner.tasks.push(tokio::spawn(copy_to_local(
            Arc::clone(&local),
            conn,
            self.cancel.clone(),
        )));
        inner.local = Some(local);

        debug!(
            "relaying [{}] through {endpoint}",
            self.remote_wg_pub_key
        );
        Ok(())
    }

    /// Cancel the copy tasks, drop the relay socket, and remove the peer
    /// from the WireGuard configuration. Safe to call before `start`, and
    /// more than once.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let mut inner = self.inner.lock().await;
        for task in inner.tasks.drain(..) {
            let _ = task.await;
        }
        inner.local = None;

        self.driver
            .remove_peer(&self.tun_name, &self.remote_wg_pub_key)
    }
}

async fn copy_to_remote(
    local: Arc<UdpSocket>,
    remote: Arc<dyn Conn + Send + Sync>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = local.recv(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("relay read from wireguard failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = remote.send(&buf[..n]).await {
                    warn!("relay write to punched connection failed: {e}");
                }
            }
        }
    }
}

async fn copy_to_local(
    local: Arc<UdpSocket>,
    remote: Arc<dyn Conn + Send + Sync>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = remote.recv(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("relay read from punched connection failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = local.send(&buf[..n]).await {
                    warn!("relay write to wireguard failed: {e}");
                }
            }
        }
    }
}
