use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid options for {kind} backend: {source}")]
    Options {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub backend: Vec<BackendEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Listening socket.  Defaults to `$XDG_RUNTIME_DIR/emissary/agent.sock`.
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Assuan pinentry program used for PIN prompts.
    #[serde(default = "default_pinentry_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            program: default_pinentry_program(),
            args: Vec::new(),
        }
    }
}

/// A backend configuration entry.
///
/// `Debug` is manually implemented to redact known sensitive option keys so
/// they don't appear in logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Name used in logs.  Defaults to the backend type.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl BackendEntry {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.kind)
    }

    /// Deserialize the `options` table into a backend's own parameter type.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let object: serde_json::Map<String, serde_json::Value> = self
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(serde_json::Value::Object(object)).map_err(|source| {
            ConfigError::Options {
                kind: self.kind.clone(),
                source,
            }
        })
    }
}

/// Option keys whose values must never appear in logs or debug output.
const SENSITIVE_OPTION_KEYS: &[&str] = &["pin", "passphrase", "secret", "password"];

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted: HashMap<&str, String> = self
            .options
            .iter()
            .map(|(k, v)| {
                let shown = if SENSITIVE_OPTION_KEYS
                    .iter()
                    .any(|s| k.to_lowercase().contains(s))
                {
                    "[redacted]".to_string()
                } else {
                    v.to_string()
                };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("BackendEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("options", &redacted)
            .finish()
    }
}

fn default_pinentry_program() -> String {
    "pinentry".to_string()
}

/// `$XDG_CONFIG_HOME/emissary/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("emissary").join("config.toml")
}

/// `$XDG_RUNTIME_DIR/emissary/agent.sock`, if a runtime directory exists.
pub fn default_socket_path() -> Option<PathBuf> {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(|d| PathBuf::from(d).join("emissary").join("agent.sock"))
}

/// Expand a leading `~` or `~/` using `$HOME`.  Other paths are returned as-is.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) if meta.mode() & 0o077 != 0 => {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", meta.mode() & 0o777),
                    "config file is readable by group or others; recommend chmod 600"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("could not check config file permissions: {e}"),
        }
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
