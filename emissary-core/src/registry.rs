//! Backend construction by type name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BackendEntry, ConfigError};
use crate::prompt::PinEntryLauncher;
use crate::{Agent, CompositeAgent};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown backend type {0:?}")]
    UnknownKind(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialize backend '{id}': {source}")]
    Backend {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Shared services handed to every backend factory.
#[derive(Clone)]
pub struct BackendContext {
    pub pin_entry: Arc<dyn PinEntryLauncher>,
}

pub type BackendFactory =
    Box<dyn Fn(&BackendEntry, &BackendContext) -> anyhow::Result<Arc<dyn Agent>> + Send + Sync>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&BackendEntry, &BackendContext) -> anyhow::Result<Arc<dyn Agent>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        entry: &BackendEntry,
        ctx: &BackendContext,
    ) -> Result<Arc<dyn Agent>, RegistryError> {
        let factory = self
            .factories
            .get(&entry.kind)
            .ok_or_else(|| RegistryError::UnknownKind(entry.kind.clone()))?;
        factory(entry, ctx).map_err(|source| RegistryError::Backend {
            id: entry.id().to_string(),
            source,
        })
    }

    /// Build every entry in order.  The first entry that fails, including
    /// one of an unknown type, aborts the whole build.
    pub fn build_all(
        &self,
        entries: &[BackendEntry],
        ctx: &BackendContext,
    ) -> Result<Vec<Arc<dyn Agent>>, RegistryError> {
        let mut agents = Vec::with_capacity(entries.len());
        for entry in entries {
            let agent = self.create(entry, ctx)?;
            tracing::info!(
                backend_id = %entry.id(),
                backend_kind = %entry.kind,
                "backend initialized"
            );
            agents.push(agent);
        }
        Ok(agents)
    }

    pub fn build_composite(
        &self,
        entries: &[BackendEntry],
        ctx: &BackendContext,
    ) -> Result<CompositeAgent, RegistryError> {
        let agents = self.build_all(entries, ctx)?;
        if agents.is_empty() {
            tracing::warn!("no usable backends configured; the agent will hold no keys");
        }
        Ok(CompositeAgent::new(agents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::prompt::{PinEntry, PromptError};
    use crate::{AddedKey, AgentError, Key, Signature};

    struct NoPrompt;

    impl PinEntryLauncher for NoPrompt {
        fn launch(&self) -> Result<Box<dyn PinEntry>, PromptError> {
            Err(PromptError::Cancelled)
        }
    }

    struct Named(String);

    #[async_trait::async_trait]
    impl Agent for Named {
        fn kind(&self) -> &str {
            &self.0
        }
        async fn list(&self) -> Result<Vec<Key>, AgentError> {
            Ok(vec![Key::new("test", self.0.as_bytes().to_vec(), &self.0)])
        }
        async fn sign(&self, _key: &Key, _data: &[u8]) -> Result<Signature, AgentError> {
            Err(AgentError::NotFound)
        }
        async fn add(&self, _key: &AddedKey) -> Result<(), AgentError> {
            Err(AgentError::unsupported("add"))
        }
        async fn remove(&self, _key: &Key) -> Result<(), AgentError> {
            Err(AgentError::NotFound)
        }
        async fn remove_all(&self) -> Result<(), AgentError> {
            Ok(())
        }
        async fn lock(&self, _passphrase: &[u8]) -> Result<(), AgentError> {
            Ok(())
        }
        async fn unlock(&self, _passphrase: &[u8]) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn ctx() -> BackendContext {
        BackendContext {
            pin_entry: Arc::new(NoPrompt),
        }
    }

    fn registry() -> BackendRegistry {
        #[derive(serde::Deserialize)]
        struct Params {
            label: String,
        }

        let mut registry = BackendRegistry::new();
        registry.register("named", |entry, _ctx| {
            let params: Params = entry.params()?;
            Ok(Arc::new(Named(params.label)) as Arc<dyn Agent>)
        });
        registry
    }

    fn config(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[tokio::test]
    async fn builds_backends_in_order() {
        let cfg = config(
            r#"
            [[backend]]
            type = "named"
            [backend.options]
            label = "first"

            [[backend]]
            type = "named"
            [backend.options]
            label = "second"
            "#,
        );
        let agents = registry().build_all(&cfg.backend, &ctx()).unwrap();
        let kinds: Vec<&str> = agents.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, ["first", "second"]);

        let composite = registry().build_composite(&cfg.backend, &ctx()).unwrap();
        assert_eq!(composite.list().await.unwrap().len(), 2);
    }

    #[test]
    fn factory_errors_name_the_backend() {
        let cfg = config("[[backend]]\nid = \"broken\"\ntype = \"named\"\n");
        let err = registry().build_all(&cfg.backend, &ctx()).err().expect("build_all should fail");
        assert!(matches!(err, RegistryError::Backend { ref id, .. } if id == "broken"));
    }

    #[test]
    fn unknown_kind_aborts_the_build() {
        let cfg = config(
            r#"
            [[backend]]
            type = "named"
            [backend.options]
            label = "first"

            [[backend]]
            id = "typo"
            type = "pvi"
            "#,
        );
        let err = registry().build_all(&cfg.backend, &ctx()).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownKind(ref k) if k == "pvi"));
        assert!(registry().build_composite(&cfg.backend, &ctx()).is_err());
    }

    #[test]
    fn create_rejects_unknown_kind() {
        let cfg = config("[[backend]]\ntype = \"nope\"\n");
        let err = registry().create(&cfg.backend[0], &ctx()).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownKind(ref k) if k == "nope"));
    }
}
