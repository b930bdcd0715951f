//! Opaque, tamper-evident device tags.
//!
//! A tag hides which device path backs a key blob.  It is
//! `nonce || XChaCha20-Poly1305(path)` where the nonce is the first 24 bytes
//! of `HMAC-SHA256(nonce_key, path)`.  Both secrets live only in memory, so
//! tags stop opening when the process restarts.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 24;

/// A hardware device path.
///
/// The nonce is derived from the plaintext, which is only sound while the
/// plaintext for a given path never changes.  Only this type can be sealed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePath(String);

impl DevicePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DevicePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to seal device tag")]
pub struct SealError;

/// Seals and opens device tags with per-instance secrets.
pub struct DeviceSealer {
    box_secret: Zeroizing<[u8; 32]>,
    nonce_key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for DeviceSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceSealer([redacted])")
    }
}

impl Default for DeviceSealer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSealer {
    /// Fresh secrets from the OS RNG.
    pub fn new() -> Self {
        let mut box_secret = Zeroizing::new([0u8; 32]);
        let mut nonce_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut box_secret[..]);
        OsRng.fill_bytes(&mut nonce_key[..]);
        Self {
            box_secret,
            nonce_key,
        }
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.box_secret[..]))
    }

    fn mac(&self, plaintext: &[u8]) -> Option<HmacSha256> {
        // HMAC accepts keys of any length.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.nonce_key[..]).ok()?;
        mac.update(plaintext);
        Some(mac)
    }

    pub fn seal(&self, path: &DevicePath) -> Result<Vec<u8>, SealError> {
        let plaintext = path.as_str().as_bytes();
        let digest = self.mac(plaintext).ok_or(SealError)?.finalize().into_bytes();
        let nonce = XNonce::from_slice(&digest[..NONCE_LEN]);

        let sealed = self.cipher().encrypt(nonce, plaintext).map_err(|_| SealError)?;
        let mut tag = Vec::with_capacity(NONCE_LEN + sealed.len());
        tag.extend_from_slice(nonce);
        tag.extend_from_slice(&sealed);
        Ok(tag)
    }

    /// Recover the path from a tag.  Anything this instance did not seal
    /// yields `None`.
    pub fn open(&self, tag: &[u8]) -> Option<DevicePath> {
        if tag.len() < NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = tag.split_at(NONCE_LEN);

        let plaintext = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), sealed)
            .ok()?;

        // The AEAD already authenticates the nonce; this also pins it to the
        // recovered path.
        self.mac(&plaintext)?.verify_truncated_left(nonce).ok()?;

        String::from_utf8(plaintext).ok().map(DevicePath)
    }
}
