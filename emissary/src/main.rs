use std::os::fd::AsFd as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use emissary_core::Agent;
use emissary_ssh_agent::RemoteAgent;
use emissary_u2f::flow::{
    PRESENCE_POLL_INTERVAL, application_id, authenticate_with_presence, find_registered,
    proxy_tokens, register_any,
};
use emissary_u2f::registration::{Registration, parse_records};
use emissary_u2f::token::{AuthenticateRequest, RegisterRequest};
use emissary_u2f::verify::verify_authentication;
use rand::RngCore as _;
use rand::rngs::OsRng;

/// Application identifier registrations are bound to.
const APPLICATION: &str = "urn:example";

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    // SAFETY: restoring the default disposition has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "daemon" => cmd_daemon(&args[1..]),
        "u2f-register" => cmd_u2f_register().await,
        "u2f-auth" => match &args[1..] {
            [file] => cmd_u2f_auth(Path::new(file)).await,
            _ => bail!("usage: emissary u2f-auth <registrations-file>"),
        },
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
emissary - signing agent for smartcards, U2F tokens and forwarded agents

USAGE:
    emissary <command> [args...]

COMMANDS:
    daemon [emissaryd args...]          Start emissaryd in the background on a fresh
                                        socket and print SSH_AUTH_SOCK=<path>
    u2f-register                        Register a token held by the agent at
                                        $SSH_AUTH_SOCK and print its record line
    u2f-auth <file>                     Authenticate against the records in <file>
                                        and verify the token's signature
    help                                Show this help

EXAMPLES:
    eval \"$(emissary daemon)\"
    emissary u2f-register >> ~/.config/emissary/u2f_keys
    emissary u2f-auth ~/.config/emissary/u2f_keys"
    );
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

/// `emissaryd` next to this executable, or from `PATH`.
fn daemon_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name("emissaryd"))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("emissaryd"))
}

/// A new private directory under the runtime dir holding the agent socket.
fn fresh_socket_path(runtime_dir: &Path) -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("emissary-")
        .tempdir_in(runtime_dir)
        .with_context(|| format!("creating socket directory in {}", runtime_dir.display()))?
        .keep();
    Ok(dir.join("agent.sock"))
}

fn cmd_daemon(extra: &[String]) -> Result<()> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let socket = fresh_socket_path(&runtime_dir)?;

    // The daemon's stdout goes to our stderr so `eval "$(emissary daemon)"`
    // only sees the variable assignment.
    let stderr = std::io::stderr()
        .as_fd()
        .try_clone_to_owned()
        .context("duplicating stderr")?;
    let exe = daemon_executable();
    Command::new(&exe)
        .arg("--socket")
        .arg(&socket)
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stderr))
        .spawn()
        .with_context(|| format!("starting {}", exe.display()))?;

    println!("SSH_AUTH_SOCK={}", socket.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// U2F
// ---------------------------------------------------------------------------

fn connect_agent() -> Result<Arc<dyn Agent>> {
    let socket = std::env::var_os("SSH_AUTH_SOCK").context("SSH_AUTH_SOCK is not set")?;
    Ok(Arc::new(RemoteAgent::new(PathBuf::from(socket))))
}

fn random_challenge() -> [u8; 32] {
    let mut challenge = [0u8; 32];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn cmd_u2f_register() -> Result<()> {
    let agent = connect_agent()?;
    let keys = agent.list().await.context("listing agent keys")?;
    let tokens = proxy_tokens(&agent, &keys);
    if tokens.is_empty() {
        bail!("no U2F tokens connected to the agent");
    }

    eprintln!("Registering, touch a token...");
    let req = RegisterRequest {
        challenge: random_challenge(),
        application: application_id(APPLICATION),
    };
    let resp = register_any(&tokens, &req, PRESENCE_POLL_INTERVAL).await?;

    let user = std::env::var("USER").ok();
    println!("{}", Registration::from_response(user, &resp));
    Ok(())
}

/// One authenticate request per record, all for the same challenge.
fn auth_requests(
    records: &[Registration],
    application: [u8; 32],
    challenge: [u8; 32],
) -> Vec<AuthenticateRequest> {
    records
        .iter()
        .map(|r| r.authenticate_request(application, challenge))
        .collect()
}

async fn cmd_u2f_auth(file: &Path) -> Result<()> {
    let agent = connect_agent()?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let records = parse_records(&text).with_context(|| format!("parsing {}", file.display()))?;

    let application = application_id(APPLICATION);
    let challenge = random_challenge();
    println!("Challenge: {}", hex(&challenge));
    println!("AppID: {}", hex(&application));

    let requests = auth_requests(&records, application, challenge);
    let Some((token, index)) = find_registered(&agent, &requests)
        .await
        .context("talking to token")?
    else {
        bail!("unable to find any registered token");
    };

    eprintln!("Please touch your token...");
    let req = &requests[index];
    let resp = authenticate_with_presence(&token, req, PRESENCE_POLL_INTERVAL).await?;
    println!("Response: {}", hex(&resp.raw_response));

    verify_authentication(&records[index].public_key, req, &resp)
        .context("verifying signature")?;
    println!("OK!");
    Ok(())
}
