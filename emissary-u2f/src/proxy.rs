use std::sync::Arc;

use emissary_core::{Agent, AgentSigner, Key, Signer};

use crate::token::{Device, TokenError};

/// Drives a U2F key held by an [`Agent`] as if it were a locally attached
/// token: each raw message becomes a `sign` call and the signature blob is
/// the device response.
#[derive(Debug, Clone)]
pub struct ProxyDevice {
    signer: AgentSigner,
}

impl ProxyDevice {
    pub fn new(agent: Arc<dyn Agent>, key: Key) -> Self {
        Self {
            signer: AgentSigner::new(agent, key),
        }
    }

    pub fn key(&self) -> &Key {
        self.signer.public_key()
    }
}

#[async_trait::async_trait]
impl Device for ProxyDevice {
    async fn message(&self, request: &[u8]) -> Result<Vec<u8>, TokenError> {
        Ok(self.signer.sign(request).await?.blob)
    }
}
