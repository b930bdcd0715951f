use std::sync::Arc;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub mod composite;
pub mod config;
pub mod prompt;
pub mod registry;

pub use composite::CompositeAgent;

/// SSH agent sign-request flag asking for an `rsa-sha2-256` signature.
pub const SIGN_FLAG_RSA_SHA2_256: u32 = 0x02;
/// SSH agent sign-request flag asking for an `rsa-sha2-512` signature.
pub const SIGN_FLAG_RSA_SHA2_512: u32 = 0x04;

/// A public key advertised by an agent.
///
/// `blob` is the SSH wire encoding of the public key and doubles as the key's
/// identity: two keys are the same key iff their blobs are byte-equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Algorithm name, e.g. `"ecdsa-sha2-nistp256"` or `"u2f@emissary"`.
    pub format: String,
    pub blob: Vec<u8>,
    pub comment: String,
}

impl Key {
    pub fn new(format: impl Into<String>, blob: Vec<u8>, comment: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            blob,
            comment: comment.into(),
        }
    }

    /// Raw fingerprint used for backend affinity: the blob bytes themselves.
    pub fn fingerprint(&self) -> &[u8] {
        &self.blob
    }

    /// OpenSSH-style `SHA256:…` fingerprint, for logs and display only.
    pub fn sha256_fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", BASE64_STANDARD_NO_PAD.encode(digest))
    }
}

/// A signature produced by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub format: String,
    pub blob: Vec<u8>,
}

pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes([redacted])")
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(self.0.to_vec()))
    }
}

/// A private key handed to [`Agent::add`].
///
/// The key travels as an OpenSSH-format private key document so that backends
/// which forward it (the remote proxy) can re-encode it without this crate
/// knowing every key type.
#[derive(Debug, Clone)]
pub struct AddedKey {
    pub private_key: SecretBytes,
    pub comment: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// The key is not held by this agent.  Callers may try another backend.
    #[error("key not found")]
    NotFound,
    #[error("not supported: {0}")]
    Unsupported(String),
    /// A device tag did not open: stale, foreign or tampered key blob.
    #[error("device not found")]
    DeviceNotFound,
    /// A signature returned by hardware did not verify against the known key.
    #[error("signature verification failed: {0}")]
    Verification(String),
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Prompt(#[from] prompt::PromptError),
    #[error(transparent)]
    Aggregate(ErrorList),
    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<AgentError>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn context(self, message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// True for errors that mean "this agent does not have the key".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound | Self::DeviceNotFound => true,
            Self::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Errors accumulated from several backends during a broadcast operation.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<AgentError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: AgentError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentError> {
        self.0.iter()
    }

    /// `Ok(())` when nothing was collected; a single error is returned as-is.
    pub fn into_result(mut self) -> Result<(), AgentError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(AgentError::Aggregate(self)),
        }
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// The signing-agent capability set.
///
/// Implemented by every backend (PIV card, U2F tokens, a forwarded remote
/// agent) and by [`CompositeAgent`], which fans out over a list of backends.
/// All methods take `&self`: implementations guard their own state and must
/// tolerate concurrent calls from several client connections.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Short backend type name used in logs (`"piv"`, `"u2f"`, …).
    fn kind(&self) -> &str;

    async fn list(&self) -> Result<Vec<Key>, AgentError>;

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Signature, AgentError>;

    /// Sign honouring the sign-request flags (`SIGN_FLAG_*`).  Only RSA
    /// keys care; everything else signs as [`Agent::sign`] does.
    async fn sign_with_flags(
        &self,
        key: &Key,
        data: &[u8],
        _flags: u32,
    ) -> Result<Signature, AgentError> {
        self.sign(key, data).await
    }

    async fn add(&self, key: &AddedKey) -> Result<(), AgentError>;

    async fn remove(&self, key: &Key) -> Result<(), AgentError>;

    async fn remove_all(&self) -> Result<(), AgentError>;

    async fn lock(&self, passphrase: &[u8]) -> Result<(), AgentError>;

    async fn unlock(&self, passphrase: &[u8]) -> Result<(), AgentError>;

    /// Not needed by any caller in this workspace; every agent refuses it.
    async fn signers(&self) -> Result<Vec<Box<dyn Signer>>, AgentError> {
        Err(AgentError::unsupported("signers"))
    }
}

/// A single key bound to something that can sign with it.
#[async_trait::async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> &Key;

    async fn sign(&self, data: &[u8]) -> Result<Signature, AgentError>;
}

/// [`Signer`] for one key held by an [`Agent`].
#[derive(Clone)]
pub struct AgentSigner {
    agent: Arc<dyn Agent>,
    key: Key,
}

impl AgentSigner {
    pub fn new(agent: Arc<dyn Agent>, key: Key) -> Self {
        Self { agent, key }
    }
}

impl std::fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSigner")
            .field("agent", &self.agent.kind())
            .field("key", &self.key.sha256_fingerprint())
            .finish()
    }
}

#[async_trait::async_trait]
impl Signer for AgentSigner {
    fn public_key(&self) -> &Key {
        &self.key
    }

    async fn sign(&self, data: &[u8]) -> Result<Signature, AgentError> {
        self.agent.sign(&self.key, data).await
    }
}
