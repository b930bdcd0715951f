//! An agent that multiplexes an ordered list of backend agents.
//!
//! `list` asks every backend and remembers which backend produced which key.
//! `sign` goes straight to that backend when it is known, and otherwise tries
//! the backends in order.  The remembered mapping is only a shortcut: a miss
//! costs extra backend calls, never a wrong signature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::{AddedKey, Agent, AgentError, ErrorList, Key, Signature};

pub struct CompositeAgent {
    agents: Vec<Arc<dyn Agent>>,
    /// Key blob → index into `agents`.
    affinity: Mutex<HashMap<Vec<u8>, usize>>,
}

impl std::fmt::Debug for CompositeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.agents.iter().map(|a| a.kind()).collect();
        f.debug_struct("CompositeAgent")
            .field("agents", &kinds)
            .finish_non_exhaustive()
    }
}

impl CompositeAgent {
    pub fn new(agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            agents,
            affinity: Mutex::new(HashMap::new()),
        }
    }

    pub fn backends(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    fn cached_backend(&self, fingerprint: &[u8]) -> Option<usize> {
        match self.affinity.lock() {
            Ok(guard) => guard.get(fingerprint).copied(),
            Err(e) => {
                warn!("affinity cache lock poisoned: {e}");
                None
            }
        }
    }

    fn replace_affinity(&self, entries: HashMap<Vec<u8>, usize>) {
        match self.affinity.lock() {
            Ok(mut guard) => *guard = entries,
            Err(e) => warn!("affinity cache lock poisoned: {e}"),
        }
    }

    fn remember(&self, fingerprint: &[u8], index: usize) {
        match self.affinity.lock() {
            Ok(mut guard) => {
                guard.entry(fingerprint.to_vec()).or_insert(index);
            }
            Err(e) => warn!("affinity cache lock poisoned: {e}"),
        }
    }

    fn forget(&self, fingerprint: &[u8]) {
        match self.affinity.lock() {
            Ok(mut guard) => {
                guard.remove(fingerprint);
            }
            Err(e) => warn!("affinity cache lock poisoned: {e}"),
        }
    }
}

#[async_trait::async_trait]
impl Agent for CompositeAgent {
    fn kind(&self) -> &str {
        "composite"
    }

    async fn list(&self) -> Result<Vec<Key>, AgentError> {
        let mut keys = Vec::new();
        let mut affinity = HashMap::new();
        let mut errors = ErrorList::new();

        for (index, agent) in self.agents.iter().enumerate() {
            match agent.list().await {
                Ok(listed) => {
                    debug!(backend = agent.kind(), count = listed.len(), "listed keys");
                    for key in listed {
                        // First backend to advertise a key owns it.
                        affinity.entry(key.blob.clone()).or_insert(index);
                        keys.push(key);
                    }
                }
                Err(e) => {
                    warn!(backend = agent.kind(), error = %e, "listing keys failed");
                    errors.push(e.context(format!("{} backend", agent.kind())));
                }
            }
        }

        self.replace_affinity(affinity);

        if keys.is_empty() {
            errors.into_result()?;
        } else if !errors.is_empty() {
            warn!(
                failed = errors.len(),
                count = keys.len(),
                "returning keys from the remaining backends"
            );
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
        let fingerprint = key.fingerprint();

        if let Some(index) = self.cached_backend(fingerprint)
            && let Some(agent) = self.agents.get(index)
        {
            debug!(
                backend = agent.kind(),
                fingerprint = %key.sha256_fingerprint(),
                "signing through known backend"
            );
            return agent.sign_with_flags(key, data, flags).await;
        }

        debug!(fingerprint = %key.sha256_fingerprint(), "key not cached, trying every backend");
        for (index, agent) in self.agents.iter().enumerate() {
            match agent.sign_with_flags(key, data, flags).await {
                Ok(signature) => {
                    self.remember(fingerprint, index);
                    return Ok(signature);
                }
                Err(e) => {
                    debug!(backend = agent.kind(), error = %e, "backend did not sign");
                }
            }
        }

        Err(AgentError::NotFound)
    }

    async fn add(&self, key: &AddedKey) -> Result<(), AgentError> {
        let mut errors = ErrorList::new();
        for agent in &self.agents {
            if let Err(e) = agent.add(key).await {
                debug!(backend = agent.kind(), error = %e, "backend rejected key");
                errors.push(e);
            }
        }
        errors
            .into_result()
            .map_err(|e| e.context("unable to add key (maybe none of your backends support it?)"))
    }

    async fn remove(&self, key: &Key) -> Result<(), AgentError> {
        let mut errors = ErrorList::new();
        let mut removed = false;
        for agent in &self.agents {
            match agent.remove(key).await {
                Ok(()) => removed = true,
                Err(e) => errors.push(e),
            }
        }

        self.forget(key.fingerprint());

        if removed {
            Ok(())
        } else {
            errors
                .into_result()
                .map_err(|e| e.context("unable to remove key"))
        }
    }

    async fn remove_all(&self) -> Result<(), AgentError> {
        let mut errors = ErrorList::new();
        for agent in &self.agents {
            if let Err(e) = agent.remove_all().await {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<(), AgentError> {
        let mut errors = ErrorList::new();
        for agent in &self.agents {
            if let Err(e) = agent.lock(passphrase).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<(), AgentError> {
        let mut errors = ErrorList::new();
        for agent in &self.agents {
            if let Err(e) = agent.unlock(passphrase).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }
}
