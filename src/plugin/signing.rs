//! Package checksums and ed25519 signatures.
//!
//! The payload digest is SHA-256 over payload entries sorted by path; each
//! entry contributes its path bytes, a NUL byte, its length as a big-endian
//! `u64`, then its content. The signature covers
//! `"xpkg-sig-v1\n" || SHA-256(canonical manifest) || payload digest`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{PluginError, PluginManifest, PluginResult};

const SIGNATURE_DOMAIN: &[u8] = b"xpkg-sig-v1\n";

/// Digest over a set of payload entries.
pub fn payload_digest(entries: &BTreeMap<String, Vec<u8>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (path, content) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(content);
    }
    hasher.finalize().into()
}

/// Lowercase hex checksum over a set of payload entries.
pub fn checksum_hex(entries: &BTreeMap<String, Vec<u8>>) -> String {
    hex::encode(payload_digest(entries))
}

/// Compare a manifest checksum with the actual payload digest.
pub fn verify_checksum(manifest: &PluginManifest, digest: &[u8; 32]) -> PluginResult<()> {
    if manifest.checksum.is_empty() {
        return Err(PluginError::Integrity(format!("Package '{}' has no checksum", manifest.id)));
    }
    let actual = hex::encode(digest);
    if !manifest.checksum.eq_ignore_ascii_case(&actual) {
        return Err(PluginError::Integrity(format!(
            "Checksum mismatch for '{}': manifest says {}, payload is {}",
            manifest.id, manifest.checksum, actual
        )));
    }
    Ok(())
}

fn signing_message(manifest: &PluginManifest, digest: &[u8; 32]) -> PluginResult<Vec<u8>> {
    let manifest_hash = Sha256::digest(manifest.canonical_bytes()?);
    let mut message = Vec::with_capacity(SIGNATURE_DOMAIN.len() + 64);
    message.extend_from_slice(SIGNATURE_DOMAIN);
    message.extend_from_slice(&manifest_hash);
    message.extend_from_slice(digest);
    Ok(message)
}

/// Sign a manifest and payload digest, returning the base64 signature.
pub fn sign(manifest: &PluginManifest, digest: &[u8; 32], key: &SigningKey) -> PluginResult<String> {
    let message = signing_message(manifest, digest)?;
    Ok(BASE64_STANDARD.encode(key.sign(&message).to_bytes()))
}

/// Set of public keys trusted to sign packages.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeys {
    /// Create an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode base64 public keys.
    pub fn from_base64<S: AsRef<str>>(encoded: &[S]) -> PluginResult<Self> {
        let keys = encoded
            .iter()
            .map(|k| decode_verifying_key(k.as_ref()))
            .collect::<PluginResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Add a key.
    pub fn add(&mut self, key: VerifyingKey) {
        self.keys.push(key);
    }

    /// Number of trusted keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if no keys are trusted.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a package signature against any trusted key.
    pub fn verify(&self, manifest: &PluginManifest, digest: &[u8; 32]) -> PluginResult<()> {
        let raw = BASE64_STANDARD
            .decode(manifest.signature.trim())
            .map_err(|e| PluginError::Integrity(format!("Invalid signature encoding: {e}")))?;
        let sig = Signature::from_slice(&raw)
            .map_err(|e| PluginError::Integrity(format!("Invalid signature: {e}")))?;
        let message = signing_message(manifest, digest)?;

        if self.keys.iter().any(|key| key.verify(&message, &sig).is_ok()) {
            Ok(())
        } else {
            Err(PluginError::Integrity(format!(
                "Signature of '{}' does not match any trusted key",
                manifest.id
            )))
        }
    }
}

/// Decode a base64 ed25519 public key.
pub fn decode_verifying_key(encoded: &str) -> PluginResult<VerifyingKey> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| PluginError::Config(format!("Invalid trusted key encoding: {e}")))?;
    let array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| PluginError::Config("Trusted key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| PluginError::Config(format!("Invalid trusted key: {e}")))
}

/// Decode a base64 ed25519 secret key.
pub fn decode_signing_key(encoded: &str) -> PluginResult<SigningKey> {
    let bytes = Zeroizing::new(
        BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| PluginError::Config(format!("Invalid signing key encoding: {e}")))?,
    );
    let array: &[u8; ed25519_dalek::SECRET_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| PluginError::Config("Signing key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(array))
}

/// Generate a fresh signing key from the OS RNG.
pub fn generate_signing_key() -> SigningKey {
    let mut secret = Zeroizing::new([0u8; ed25519_dalek::SECRET_KEY_LENGTH]);
    OsRng.fill_bytes(&mut *secret);
    SigningKey::from_bytes(&secret)
}

/// Base64 of a signing key's secret bytes.
pub fn encode_signing_key(key: &SigningKey) -> Zeroizing<String> {
    Zeroizing::new(BASE64_STANDARD.encode(key.to_bytes()))
}

/// Base64 of a public key.
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    BASE64_STANDARD.encode(key.as_bytes())
}
