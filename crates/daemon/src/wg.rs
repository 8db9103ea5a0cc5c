//! WireGuard interface driver.
//!
//! The nucleus only speaks this trait; everything platform-specific stays
//! behind it, and tests substitute an in-memory implementation.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;

/// Data-plane UDP port WireGuard listens on.
pub const WG_PORT: u16 = 51820;
/// Persistent keepalive applied to every peer, in seconds. Keeps NAT
/// mappings warm between handshakes.
pub const WG_KEEPALIVE_SECS: u32 = 25;

pub trait TunnelDriver: Send + Sync {
    /// Create the interface, install the private key and address, bring it
    /// up.
    fn create(
        &self,
        tun: &str,
        private_key: &str,
        ip: &str,
        cidr: &str,
        listen_port: u16,
    ) -> Result<()>;

    /// Add or replace a peer entry. `allowed_ips` fully replaces the peer's
    /// routed prefixes.
    fn add_peer(
        &self,
        tun: &str,
        pub_key: &str,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        keepalive_secs: Option<u32>,
        preshared_key: Option<&str>,
    ) -> Result<()>;

    /// Remove a peer entry. Removing an absent peer succeeds.
    fn remove_peer(&self, tun: &str, pub_key: &str) -> Result<()>;

    /// Tear the interface down.
    fn destroy(&self, tun: &str) -> Result<()>;
}

/// Driver that shells out to `ip` and `wg`. Keys are piped over stdin so they
/// never show up in the process list.
#[cfg(unix)]
pub struct CliTunnelDriver;

#[cfg(unix)]
impl CliTunnelDriver {
    fn run(cmd: &mut std::process::Command) -> Result<()> {
        let output = cmd
            .output()
            .with_context(|| format!("failed to execute {cmd:?}"))?;
        if !output.status.success() {
            bail!(
                "{:?} failed: {}",
                cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn run_with_stdin(cmd: &mut std::process::Command, input: &str) -> Result<()> {
        use std::io::Write;
        use std::process::Stdio;

        let mut child = cmd
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {cmd:?}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).context("failed to pipe key")?;
        }

        let output = child.wait_with_output().context("failed to wait on wg")?;
        if !output.status.success() {
            bail!(
                "{:?} failed: {}",
                cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(unix)]
impl TunnelDriver for CliTunnelDriver {
    fn create(
        &self,
        tun: &str,
        private_key: &str,
        ip: &str,
        cidr: &str,
        listen_port: u16,
    ) -> Result<()> {
        use std::process::Command;

        // ignore failure: the link may already exist from a previous run
        let _ = Command::new("ip")
            .args(["link", "add", "dev", tun, "type", "wireguard"])
            .output();

        Self::run_with_stdin(
            Command::new("wg").args([
                "set",
                tun,
                "listen-port",
                &listen_port.to_string(),
                "private-key",
                "/dev/stdin",
            ]),
            private_key,
        )?;

        Self::run(Command::new("ip").args([
            "address",
            "replace",
            &format!("{ip}/{cidr}"),
            "dev",
            tun,
        ]))?;

        Self::run(Command::new("ip").args(["link", "set", tun, "up"]))
    }

    fn add_peer(
        &self,
        tun: &str,
        pub_key: &str,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        keepalive_secs: Option<u32>,
        preshared_key: Option<&str>,
    ) -> Result<()> {
        use std::process::Command;

        let mut cmd = Command::new("wg");
        cmd.args(["set", tun, "peer", pub_key]);

        if !allowed_ips.is_empty() {
            cmd.arg("allowed-ips").arg(allowed_ips.join(","));
        }
        if let Some(endpoint) = endpoint {
            cmd.arg("endpoint").arg(endpoint.to_string());
        }
        if let Some(keepalive) = keepalive_secs {
            cmd.arg("persistent-keepalive").arg(keepalive.to_string());
        }

        match preshared_key {
            Some(psk) => {
                cmd.args(["preshared-key", "/dev/stdin"]);
                Self::run_with_stdin(&mut cmd, psk)
            }
            None => Self::run(&mut cmd),
        }
    }

    fn remove_peer(&self, tun: &str, pub_key: &str) -> Result<()> {
        use std::process::Command;
        Self::run(Command::new("wg").args(["set", tun, "peer", pub_key, "remove"]))
    }

    fn destroy(&self, tun: &str) -> Result<()> {
        use std::process::Command;
        Self::run(Command::new("ip").args(["link", "del", "dev", tun]))
    }
}
