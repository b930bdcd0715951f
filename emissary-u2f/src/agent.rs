use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use emissary_core::{AddedKey, Agent, AgentError, Key, Signature};
use tracing::{debug, warn};

use crate::U2F_FORMAT;
use crate::tag::{DevicePath, DeviceSealer};
use crate::transport::{TokenTransport, TransportError};
use crate::wire::WireKey;

/// Exposes every attached U2F token as a key.
///
/// Signing forwards the caller's data to the device as one raw message and
/// returns the device's response untouched; the token protocol itself is
/// spoken by the client (see [`crate::token`]).
pub struct U2fAgent {
    sealer: DeviceSealer,
    transport: Arc<dyn TokenTransport>,
    device_locks: Mutex<HashMap<DevicePath, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for U2fAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("U2fAgent").finish_non_exhaustive()
    }
}

impl U2fAgent {
    pub fn new(transport: Arc<dyn TokenTransport>) -> Self {
        Self {
            sealer: DeviceSealer::new(),
            transport,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// One lock per device path: exchanges with the same token are
    /// sequential, different tokens run independently.
    fn device_lock(&self, path: &DevicePath) -> Arc<tokio::sync::Mutex<()>> {
        match self.device_locks.lock() {
            Ok(mut locks) => locks.entry(path.clone()).or_default().clone(),
            Err(e) => {
                warn!("device lock table poisoned: {e}");
                Arc::new(tokio::sync::Mutex::new(()))
            }
        }
    }

    fn key_for(&self, path: &DevicePath, product: &str) -> Result<Key, AgentError> {
        let tag = self
            .sealer
            .seal(path)
            .map_err(|e| AgentError::Device(e.to_string()))?;
        let blob = WireKey::new(U2F_FORMAT, tag)
            .to_bytes()
            .map_err(|e| AgentError::Device(format!("encoding key blob: {e}")))?;
        Ok(Key::new(U2F_FORMAT, blob, product))
    }
}

fn device_error(e: TransportError) -> AgentError {
    match e {
        TransportError::NotAttached(_) => AgentError::DeviceNotFound,
        other => AgentError::Device(other.to_string()),
    }
}

fn join_error(e: tokio::task::JoinError) -> AgentError {
    AgentError::Device(format!("device task failed: {e}"))
}

#[async_trait::async_trait]
impl Agent for U2fAgent {
    fn kind(&self) -> &str {
        "u2f"
    }

    async fn list(&self) -> Result<Vec<Key>, AgentError> {
        let transport = Arc::clone(&self.transport);
        let devices = tokio::task::spawn_blocking(move || transport.devices())
            .await
            .map_err(join_error)?
            .map_err(|e| AgentError::Device(e.to_string()).context("enumerating U2F devices"))?;

        let keys = devices
            .iter()
            .map(|dev| self.key_for(&dev.path, &dev.product))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = keys.len(), "listed U2F devices");
        Ok(keys)
    }

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Signature, AgentError> {
        if key.format != U2F_FORMAT {
            return Err(AgentError::NotFound);
        }
        let wire = WireKey::from_bytes(&key.blob).map_err(|_| AgentError::DeviceNotFound)?;
        if wire.format != U2F_FORMAT {
            return Err(AgentError::NotFound);
        }
        let Some(path) = self.sealer.open(&wire.rest) else {
            debug!(fingerprint = %key.sha256_fingerprint(), "device tag did not open");
            return Err(AgentError::DeviceNotFound);
        };

        let lock = self.device_lock(&path).lock_owned().await;
        let transport = Arc::clone(&self.transport);
        let data = data.to_vec();
        let response = tokio::task::spawn_blocking(move || {
            let _lock = lock;
            let mut device = transport.open(&path)?;
            device.message(&data)
        })
        .await
        .map_err(join_error)?
        .map_err(device_error)?;

        Ok(Signature {
            format: U2F_FORMAT.to_string(),
            blob: response,
        })
    }

    async fn add(&self, _key: &AddedKey) -> Result<(), AgentError> {
        Err(AgentError::unsupported("can't add keys to the U2F agent"))
    }

    async fn remove(&self, _key: &Key) -> Result<(), AgentError> {
        Err(AgentError::unsupported(
            "can't remove keys from the U2F agent (unplug them)",
        ))
    }

    async fn remove_all(&self) -> Result<(), AgentError> {
        Err(AgentError::unsupported(
            "can't remove keys from the U2F agent (unplug them)",
        ))
    }

    async fn lock(&self, _passphrase: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }

    async fn unlock(&self, _passphrase: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }
}
