//! Backend that forwards to another SSH agent over its Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use emissary_core::config::expand_tilde;
use emissary_core::registry::BackendRegistry;
use emissary_core::{AddedKey, Agent, AgentError, Key, Signature};
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::proto::{AddIdentity, Credential, RemoveIdentity, SignRequest};
use ssh_key::PrivateKey;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::session::{key_from_ssh, key_to_ssh, signature_from_ssh};

type Connection = Client<UnixStream>;

/// Options accepted by a `type = "proxy"` backend entry.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteOptions {
    /// Socket of the agent to forward to.  `~` is expanded.
    pub socket: PathBuf,
}

/// Forwards every operation to the agent listening on `socket`.
///
/// The connection is opened on first use and dropped after any failed
/// exchange, so the next call reconnects.
pub struct RemoteAgent {
    socket: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for RemoteAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAgent")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl RemoteAgent {
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: expand_tilde(socket.as_ref()),
            conn: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect<'c>(
        &self,
        conn: &'c mut Option<Connection>,
    ) -> Result<&'c mut Connection, AgentError> {
        if conn.is_none() {
            let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
                AgentError::Device(format!("connecting to {}: {e}", self.socket.display()))
            })?;
            debug!(socket = %self.socket.display(), "connected to remote agent");
            *conn = Some(Client::new(stream));
        }
        conn.as_mut()
            .ok_or_else(|| AgentError::Device("remote agent connection unavailable".into()))
    }

    /// Map a protocol result, dropping the connection when it failed.
    fn settle<T>(
        &self,
        conn: &mut Option<Connection>,
        op: &str,
        result: Result<T, ssh_agent_lib::error::AgentError>,
    ) -> Result<T, AgentError> {
        result.map_err(|e| {
            debug!(socket = %self.socket.display(), op, error = %e, "remote agent request failed");
            *conn = None;
            AgentError::Other(anyhow::anyhow!("remote agent {op}: {e}"))
        })
    }
}

fn encoding_err(e: ssh_key::Error) -> AgentError {
    AgentError::Other(anyhow::Error::new(e).context("SSH key encoding"))
}

#[async_trait::async_trait]
impl Agent for RemoteAgent {
    fn kind(&self) -> &str {
        "proxy"
    }

    async fn list(&self) -> Result<Vec<Key>, AgentError> {
        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.request_identities().await;
        let identities = self.settle(&mut conn, "list", result)?;

        let mut keys = Vec::with_capacity(identities.len());
        for identity in identities {
            match key_from_ssh(identity.pubkey, identity.comment) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(error = %e, "skipping remote key"),
            }
        }
        Ok(keys)
    }

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Signature, AgentError> {
        self.sign_with_flags(key, data, 0).await
    }

    async fn sign_with_flags(
        &self,
        key: &Key,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, AgentError> {
        let request = SignRequest {
            pubkey: key_to_ssh(key).map_err(encoding_err)?,
            data: data.to_vec(),
            flags,
        };

        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.sign(request).await;
        let sig = self.settle(&mut conn, "sign", result)?;
        Ok(signature_from_ssh(&sig))
    }

    async fn add(&self, key: &AddedKey) -> Result<(), AgentError> {
        let private = PrivateKey::from_openssh(key.private_key.as_slice()).map_err(encoding_err)?;
        let request = AddIdentity {
            credential: Credential::Key {
                privkey: private.key_data().clone(),
                comment: key.comment.clone(),
            },
        };

        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.add_identity(request).await;
        self.settle(&mut conn, "add", result)
    }

    async fn remove(&self, key: &Key) -> Result<(), AgentError> {
        let request = RemoveIdentity {
            pubkey: key_to_ssh(key).map_err(encoding_err)?,
        };

        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.remove_identity(request).await;
        self.settle(&mut conn, "remove", result)
    }

    async fn remove_all(&self) -> Result<(), AgentError> {
        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.remove_all_identities().await;
        self.settle(&mut conn, "remove_all", result)
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<(), AgentError> {
        let passphrase = String::from_utf8_lossy(passphrase).into_owned();
        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.lock(passphrase).await;
        self.settle(&mut conn, "lock", result)
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<(), AgentError> {
        let passphrase = String::from_utf8_lossy(passphrase).into_owned();
        let mut conn = self.conn.lock().await;
        let result = self.connect(&mut conn).await?.unlock(passphrase).await;
        self.settle(&mut conn, "unlock", result)
    }
}

/// Register the `proxy` backend type.
pub fn register_backend(registry: &mut BackendRegistry) {
    registry.register("proxy", |entry, _ctx| {
        let options: RemoteOptions = entry.params()?;
        let agent = RemoteAgent::new(&options.socket);
        info!(backend = entry.id(), socket = %agent.socket().display(), "forwarding to remote agent");
        Ok(Arc::new(agent) as Arc<dyn Agent>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{SoftAgent, serve_in_background};
    use emissary_core::CompositeAgent;
    use emissary_core::config::Config;
    use emissary_core::prompt::{PinEntry, PinEntryLauncher, PromptError};
    use emissary_core::registry::BackendContext;
    use p256::ecdsa::signature::Verifier as _;

    #[tokio::test]
    async fn forwards_list_and_sign() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.sock");
        let soft = SoftAgent::with_keys(&["remote-key"]);
        serve_in_background(soft.clone(), &path).await;

        let remote = RemoteAgent::new(&path);
        let keys = remote.list().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment, "remote-key");
        assert_eq!(keys[0].format, "ecdsa-sha2-nistp256");

        let sig = remote.sign(&keys[0], b"payload").await.unwrap();
        let ssh_sig = crate::session::signature_to_ssh(sig).unwrap();
        let p256_sig = p256::ecdsa::Signature::try_from(&ssh_sig).unwrap();
        soft.verifying_key(0).verify(b"payload", &p256_sig).unwrap();

        remote.lock(b"pw").await.unwrap();
        assert_eq!(soft.locked_with.lock().unwrap().as_deref(), Some(&b"pw"[..]));
    }

    #[tokio::test]
    async fn sign_flags_cross_both_hops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.sock");
        let soft = SoftAgent::with_keys(&["k"]);
        serve_in_background(soft.clone(), &path).await;

        let remote = RemoteAgent::new(&path);
        let keys = remote.list().await.unwrap();
        remote
            .sign_with_flags(&keys[0], b"payload", emissary_core::SIGN_FLAG_RSA_SHA2_512)
            .await
            .unwrap();
        assert_eq!(
            *soft.last_flags.lock().unwrap(),
            Some(emissary_core::SIGN_FLAG_RSA_SHA2_512)
        );

        remote.sign(&keys[0], b"payload").await.unwrap();
        assert_eq!(*soft.last_flags.lock().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn connects_lazily_and_reconnects_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");
        let remote = RemoteAgent::new(&path);

        let err = remote.list().await.unwrap_err();
        assert!(matches!(err, AgentError::Device(_)));

        serve_in_background(SoftAgent::with_keys(&["late"]), &path).await;
        assert_eq!(remote.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remote_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.sock");
        serve_in_background(SoftAgent::with_keys(&["k"]), &path).await;

        let remote = RemoteAgent::new(&path);
        let keys = remote.list().await.unwrap();
        // SoftAgent refuses removal.
        assert!(matches!(remote.remove(&keys[0]).await, Err(AgentError::Other(_))));
        // The next call opens a fresh connection.
        assert_eq!(remote.list().await.unwrap().len(), 1);
    }

    struct NoPrompt;

    impl PinEntryLauncher for NoPrompt {
        fn launch(&self) -> Result<Box<dyn PinEntry>, PromptError> {
            Err(PromptError::Cancelled)
        }
    }

    #[tokio::test]
    async fn registry_builds_proxy_backend_into_composite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwd.sock");
        serve_in_background(SoftAgent::with_keys(&["a", "b"]), &path).await;

        let text = format!(
            "[[backend]]\ntype = \"proxy\"\n[backend.options]\nsocket = {:?}\n",
            path.display().to_string()
        );
        let cfg: Config = toml::from_str(&text).unwrap();

        let mut registry = BackendRegistry::new();
        register_backend(&mut registry);
        let ctx = BackendContext {
            pin_entry: Arc::new(NoPrompt),
        };
        let agents = registry.build_all(&cfg.backend, &ctx).unwrap();
        let composite = CompositeAgent::new(agents);

        let keys = composite.list().await.unwrap();
        assert_eq!(keys.len(), 2);
        composite.sign(&keys[1], b"data").await.unwrap();
    }
}
