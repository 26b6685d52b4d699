//! Device identity for gateway connect: Ed25519 keypair, derived device id, and payload signing.
//!
//! The device id is the hex SHA-256 of the raw 32-byte public key, so it depends on nothing but
//! the key. Keys and signatures travel base64url-encoded without padding.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Persisted form of the identity (e.g. ~/.runprobe/device.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    device_id: String,
    public_key: String,
    private_key: String,
}

/// Signing keypair held by a client for the lifetime of its connection.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    device_id: String,
    public_key: String,
    signing_key: SigningKey,
}

/// Build the canonical payload the gateway verifies the device signature against.
///
/// Pipe-delimited: version, deviceId, client id, client mode, role, scopes (comma-joined),
/// signedAt (epoch ms), token, and the challenge nonce when one was issued. The version is `v2`
/// with a nonce and `v1` without.
pub fn build_connect_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at: u64,
    token: &str,
    nonce: Option<&str>,
) -> String {
    let version = if nonce.is_some() { "v2" } else { "v1" };
    let mut parts = vec![
        version.to_string(),
        device_id.to_string(),
        client_id.to_string(),
        client_mode.to_string(),
        role.to_string(),
        scopes.join(","),
        signed_at.to_string(),
        token.to_string(),
    ];
    if let Some(n) = nonce {
        parts.push(n.to_string());
    }
    parts.join("|")
}

/// Hex SHA-256 of the raw public key bytes.
pub fn derive_device_id(public_key: &[u8]) -> String {
    format!("{:x}", Sha256::digest(public_key))
}

impl DeviceIdentity {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    /// Wrap an existing key. Same key, same device id.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let raw = verifying_key.as_bytes();
        Self {
            device_id: derive_device_id(raw),
            public_key: URL_SAFE_NO_PAD.encode(raw),
            signing_key,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw public key, base64url without padding (wire `device.publicKey`).
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign the UTF-8 bytes of `payload`; returns the signature as base64url without padding.
    pub fn sign(&self, payload: &str) -> String {
        let sig = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(sig.to_bytes())
    }

    /// Verify a base64url signature over `payload` with this identity's public key.
    pub fn verify(&self, payload: &str, signature: &str) -> bool {
        verify_signature(&self.public_key, payload, signature).is_ok()
    }

    /// Load from JSON file. Returns None if file missing or invalid.
    pub fn load(path: &Path) -> Option<Self> {
        let s = std::fs::read_to_string(path).ok()?;
        let stored: StoredIdentity = serde_json::from_str(&s).ok()?;
        let key_bytes = URL_SAFE_NO_PAD.decode(stored.private_key.as_bytes()).ok()?;
        let key_arr: [u8; 32] = key_bytes.as_slice().try_into().ok()?;
        let identity = Self::from_signing_key(SigningKey::from_bytes(&key_arr));
        if identity.device_id != stored.device_id {
            log::warn!(
                "device file {} has a stale deviceId; using the one derived from its key",
                path.display()
            );
        }
        Some(identity)
    }

    /// Save to JSON file. Creates parent dirs if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let stored = StoredIdentity {
            device_id: self.device_id.clone(),
            public_key: self.public_key.clone(),
            private_key: URL_SAFE_NO_PAD.encode(self.signing_key.as_bytes()),
        };
        let s = serde_json::to_string_pretty(&stored)?;
        std::fs::write(path, s).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Load the identity at `path`, or generate one and persist it there.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if let Some(identity) = Self::load(path) {
            return Ok(identity);
        }
        let identity = Self::generate()?;
        identity.save(path)?;
        log::info!("created device identity {} at {}", identity.device_id, path.display());
        Ok(identity)
    }
}

/// Standard Ed25519 verification of a base64url signature against a base64url public key.
pub fn verify_signature(public_key: &str, payload: &str, signature: &str) -> Result<(), String> {
    let pub_key_bytes = URL_SAFE_NO_PAD
        .decode(public_key.as_bytes())
        .map_err(|_| "invalid publicKey encoding")?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature.as_bytes())
        .map_err(|_| "invalid signature encoding")?;
    let pk = VerifyingKey::from_bytes(
        pub_key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| "invalid publicKey length")?,
    )
    .map_err(|_| "invalid publicKey")?;
    let sig = ed25519_dalek::Signature::from_bytes(
        sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| "invalid signature length")?,
    );
    pk.verify_strict(payload.as_bytes(), &sig)
        .map_err(|_| "signature verification failed".to_string())
}

/// Default path for the device identity file.
pub fn default_device_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".runprobe").join("device.json"))
        .unwrap_or_else(|| PathBuf::from("device.json"))
}
