//! SSH agent session and listener.

use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use emissary_core::{AddedKey, Agent, Key, SecretBytes};
use ssh_agent_lib::agent::{Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{AddIdentity, Credential, Identity, RemoveIdentity, SignRequest};
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey, Signature};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

/// Serves an [`Agent`] over the SSH agent protocol.  Cloned per incoming
/// connection by `ssh_agent_lib`.
#[derive(Clone)]
pub struct SshAgent {
    agent: Arc<dyn Agent>,
}

impl std::fmt::Debug for SshAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAgent")
            .field("agent", &self.agent.kind())
            .finish()
    }
}

impl SshAgent {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    /// Bind `socket_path` and serve connections until the listener fails.
    pub async fn listen(self, socket_path: &Path) -> anyhow::Result<()> {
        let listener = bind(socket_path)?;
        info!(socket = %socket_path.display(), "SSH agent listening");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: UnixListener) -> anyhow::Result<()> {
        listen(listener, self).await.context("SSH agent listener")
    }
}

/// Bind the agent socket with mode 0600, replacing a stale socket file.
pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket directory {parent:?}"))?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("remove stale socket {socket_path:?}")),
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind SSH agent socket {socket_path:?}"))?;

    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod 0600 {socket_path:?}"))?;

    Ok(listener)
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

fn agent_err(op: &str, e: emissary_core::AgentError) -> AgentError {
    warn!(op, error = %e, "agent request failed");
    other_err(format!("{op}: {e}"))
}

/// Our key representation from an SSH public key.
pub fn key_from_ssh(data: KeyData, comment: impl Into<String>) -> Result<Key, ssh_key::Error> {
    let format = data.algorithm().as_str().to_string();
    let blob = PublicKey::from(data).to_bytes()?;
    Ok(Key::new(format, blob, comment))
}

/// The SSH public key for one of our keys.
pub fn key_to_ssh(key: &Key) -> Result<KeyData, ssh_key::Error> {
    Ok(PublicKey::from_bytes(&key.blob)?.key_data().clone())
}

pub fn signature_to_ssh(sig: emissary_core::Signature) -> Result<Signature, ssh_key::Error> {
    Signature::new(Algorithm::new(&sig.format)?, sig.blob)
}

pub fn signature_from_ssh(sig: &Signature) -> emissary_core::Signature {
    emissary_core::Signature {
        format: sig.algorithm().as_str().to_string(),
        blob: sig.as_bytes().to_vec(),
    }
}

#[ssh_agent_lib::async_trait]
impl Session for SshAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let keys = self
            .agent
            .list()
            .await
            .map_err(|e| agent_err("list", e))?;

        let mut identities = Vec::with_capacity(keys.len());
        for key in keys {
            match PublicKey::from_bytes(&key.blob) {
                Ok(pubkey) => identities.push(Identity {
                    pubkey: pubkey.into(),
                    comment: key.comment,
                }),
                Err(e) => warn!(
                    fingerprint = %key.sha256_fingerprint(),
                    error = %e,
                    "skipping key with unparseable blob"
                ),
            }
        }

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let key = key_from_ssh(request.pubkey, "").map_err(AgentError::other)?;
        debug!(
            fingerprint = %key.sha256_fingerprint(),
            data_len = request.data.len(),
            flags = request.flags,
            "sign"
        );

        let sig = self
            .agent
            .sign_with_flags(&key, &request.data, request.flags)
            .await
            .map_err(|e| agent_err("sign", e))?;
        signature_to_ssh(sig).map_err(AgentError::other)
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        let Credential::Key { privkey, comment } = identity.credential else {
            return Err(other_err("certificates are not supported"));
        };
        let private = PrivateKey::new(privkey, comment.clone()).map_err(AgentError::other)?;
        let document = private.to_openssh(LineEnding::LF).map_err(AgentError::other)?;

        let added = AddedKey {
            private_key: SecretBytes::new(document.as_bytes().to_vec()),
            comment,
        };
        self.agent
            .add(&added)
            .await
            .map_err(|e| agent_err("add", e))
    }

    async fn remove_identity(&mut self, request: RemoveIdentity) -> Result<(), AgentError> {
        let key = key_from_ssh(request.pubkey, "").map_err(AgentError::other)?;
        self.agent
            .remove(&key)
            .await
            .map_err(|e| agent_err("remove", e))
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.agent
            .remove_all()
            .await
            .map_err(|e| agent_err("remove_all", e))
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        self.agent
            .lock(key.as_bytes())
            .await
            .map_err(|e| agent_err("lock", e))
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        self.agent
            .unlock(key.as_bytes())
            .await
            .map_err(|e| agent_err("unlock", e))
    }
}

/// Default socket location when neither the config nor the command line
/// names one.
pub fn fallback_socket_path() -> PathBuf {
    emissary_core::config::default_socket_path()
        .unwrap_or_else(|| std::env::temp_dir().join("emissary").join("agent.sock"))
}
