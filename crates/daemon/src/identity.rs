//! WireGuard identity: an x25519 keypair persisted as a base64 private key
//! file. Created on first run, reused forever after.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use boringtun::x25519::{PublicKey, StaticSecret};
use log::info;
use rand::rngs::OsRng;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_IDENTITY_DIR: &str = ".wiremesh";
const IDENTITY_FILE: &str = "wg.key";

/// Local WireGuard keypair. The public half is the node's data-plane
/// identity; the private half never leaves this process.
#[derive(Clone)]
pub struct WgKeyPair {
    private_key: StaticSecret,
    public_key: PublicKey,
}

impl fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

impl WgKeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Rebuild a keypair from a base64 private key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = parse_key(encoded)?;
        let private_key = StaticSecret::from(bytes);
        let public_key = PublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key.as_bytes())
    }

    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.private_key.to_bytes())
    }

    /// Default location of the key file.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_IDENTITY_DIR)
            .join(IDENTITY_FILE)
    }

    /// Load the key file.
    pub fn load(path: &Path) -> Result<Self> {
        let encoded = fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {path:?}"))?;
        Self::from_base64(&encoded)
            .with_context(|| format!("key file {path:?} does not contain a valid key"))
    }

    /// Write the private key. Restrictive permissions on unix.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create key directory {dir:?}"))?;
        }

        fs::write(path, self.private_key_base64())
            .with_context(|| format!("failed to write key file {path:?}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        info!("wrote new wireguard key to {path:?}");
        Ok(())
    }

    /// Load the key file, generating it on first run. An existing file is
    /// never rewritten.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let pair = Self::generate();
        pair.save(path)?;
        Ok(pair)
    }
}

/// Parse a base64-encoded 32-byte key.
pub fn parse_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("key is not valid base64")?;
    if bytes.len() != 32 {
        bail!("expected a 32-byte key, got {} bytes", bytes.len());
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
