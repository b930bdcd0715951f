mod bootstrap;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use emissary_core::config::{Config, default_config_path, expand_tilde, load_config};
use emissary_core::prompt::PinentryLauncher;
use emissary_core::registry::{BackendContext, BackendRegistry};
use emissary_core::Agent;
use emissary_ssh_agent::SshAgent;
use emissary_ssh_agent::session::fallback_socket_path;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: emissaryd [--config <path>] [--socket <path>]

Options:
  -c, --config <path>  Config file (default: $XDG_CONFIG_HOME/emissary/config.toml)
  -s, --socket <path>  Agent socket, overriding [service] socket
  -h, --help           Show this help message";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    socket: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Run(Args),
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let mut parsed = Args {
        config: None,
        socket: None,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-c" | "--config" => {
                let path = args.next().context("--config requires a path argument")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "-s" | "--socket" => {
                let path = args.next().context("--socket requires a path argument")?;
                parsed.socket = Some(PathBuf::from(path));
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    parsed.config = Some(PathBuf::from(path));
                } else if let Some(path) = other.strip_prefix("--socket=") {
                    parsed.socket = Some(PathBuf::from(path));
                } else {
                    anyhow::bail!("unexpected argument {other:?}\n\n{USAGE}");
                }
            }
        }
    }
    Ok(Invocation::Run(parsed))
}

/// Socket precedence: command line, then config, then the runtime default.
fn socket_path(args: &Args, config: &Config) -> PathBuf {
    args.socket
        .clone()
        .or_else(|| config.service.socket.clone())
        .map(|p| expand_tilde(&p))
        .unwrap_or_else(fallback_socket_path)
}

fn registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    emissary_ssh_agent::remote::register_backend(&mut registry);
    #[cfg(all(feature = "hid", target_os = "linux"))]
    emissary_u2f::register_hid_backend(&mut registry);
    #[cfg(feature = "yubikey")]
    emissary_piv::register_backend(&mut registry);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EMISSARY_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    bootstrap::harden_process();

    let args = match parse_args(std::env::args().skip(1))? {
        Invocation::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Invocation::Run(args) => args,
    };

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    tracing::info!(
        config = %config_path.display(),
        backends = config.backend.len(),
        "loaded config"
    );

    let registry = registry();
    let ctx = BackendContext {
        pin_entry: Arc::new(PinentryLauncher::new(&config.prompt)),
    };
    let composite = registry
        .build_composite(&config.backend, &ctx)
        .context("building backends")?;
    let agent: Arc<dyn Agent> = Arc::new(composite);

    let socket = socket_path(&args, &config);
    let server = SshAgent::new(agent);

    tokio::select! {
        result = server.listen(&socket) => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal, exiting");
        }
    }

    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::debug!(error = %e, "socket cleanup");
    }
    Ok(())
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, waiting for SIGINT only");
            ctrl_c.await.ok();
        }
    }
}
