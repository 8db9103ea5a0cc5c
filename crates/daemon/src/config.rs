//! Client configuration.
//!
//! The nucleus only ever reads this file; producing and rewriting it belongs
//! to the CLI that installed the node.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Persisted client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base64 WireGuard private key. When absent the key file on disk is
    /// used instead.
    #[serde(default)]
    pub wg_private_key: Option<String>,
    #[serde(default)]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub signal_host: String,
    #[serde(default = "default_signal_port")]
    pub signal_port: u16,
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    /// Optional base64 preshared key applied to every peer.
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// Interface names excluded from ICE candidate gathering.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            wg_private_key: None,
            server_host: String::new(),
            server_port: default_server_port(),
            signal_host: String::new(),
            signal_port: default_signal_port(),
            tun_name: default_tun_name(),
            preshared_key: None,
            blacklist: Vec::new(),
        }
    }
}

fn default_server_port() -> u16 {
    443
}
fn default_signal_port() -> u16 {
    443
}
fn default_tun_name() -> String {
    "wm0".to_string()
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let config: ClientConfig =
            toml::from_str(&content).context("failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from the default paths or fall back to defaults.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/wiremesh/client.toml",
            "~/.wiremesh/client.toml",
            "./wiremesh.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    /// Interface filter input for candidate gathering. Always contains the
    /// tunnel interface itself: gathering candidates over our own tunnel
    /// would loop traffic back into it.
    pub fn interface_blacklist(&self) -> Vec<String> {
        let mut list = self.blacklist.clone();
        if !list.iter().any(|name| name == &self.tun_name) {
            list.push(self.tun_name.clone());
        }
        list
    }
}
