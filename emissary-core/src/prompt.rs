//! PIN entry through an external Assuan `pinentry` program.
//!
//! Backends that need a PIN depend only on [`PinEntryLauncher`] and
//! [`PinEntry`]; the daemon wires in [`PinentryLauncher`] built from the
//! `[prompt]` config section.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use zeroize::Zeroizing;

use crate::config::PromptConfig;

/// Assuan error code pinentry reports when the user cancels the dialog.
const ASSUAN_CANCELLED: u32 = 83_886_179;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("failed to start pinentry program {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pinentry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PIN entry cancelled")]
    Cancelled,
    #[error("pinentry error {code}: {message}")]
    Assuan { code: u32, message: String },
    #[error("unexpected pinentry response: {0}")]
    Protocol(String),
}

/// One interactive PIN-entry session.
///
/// Calls block; callers on an async runtime drive sessions from a blocking
/// task.
pub trait PinEntry: Send {
    fn set_description(&mut self, text: &str) -> Result<(), PromptError>;

    fn set_prompt(&mut self, text: &str) -> Result<(), PromptError>;

    /// Text shown alongside the next prompt, e.g. the remaining attempt count.
    fn set_repeat_prompt(&mut self, text: &str) -> Result<(), PromptError>;

    fn get_pin(&mut self) -> Result<Zeroizing<String>, PromptError>;

    fn shutdown(&mut self) -> Result<(), PromptError>;
}

/// Starts PIN-entry sessions on demand.
pub trait PinEntryLauncher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn PinEntry>, PromptError>;
}

/// Launches the configured pinentry program.
#[derive(Debug, Clone)]
pub struct PinentryLauncher {
    program: String,
    args: Vec<String>,
}

impl PinentryLauncher {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

impl PinEntryLauncher for PinentryLauncher {
    fn launch(&self) -> Result<Box<dyn PinEntry>, PromptError> {
        Ok(Box::new(Pinentry::spawn(&self.program, &self.args)?))
    }
}

/// A running pinentry child speaking the Assuan protocol on stdin/stdout.
pub struct Pinentry {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    closed: bool,
}

impl std::fmt::Debug for Pinentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinentry")
            .field("pid", &self.child.id())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Pinentry {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, PromptError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| PromptError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(PromptError::Protocol("pinentry pipes unavailable".into()));
        };

        let mut session = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            closed: false,
        };
        // Greeting.
        session.read_response()?;
        tracing::debug!(program, "pinentry started");
        Ok(session)
    }

    fn command(&mut self, line: &str) -> Result<Option<Zeroizing<String>>, PromptError> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        self.read_response()
    }

    /// Read lines until `OK` or `ERR`, collecting any `D` data.
    fn read_response(&mut self) -> Result<Option<Zeroizing<String>>, PromptError> {
        let mut data: Option<Zeroizing<String>> = None;
        loop {
            let mut line = Zeroizing::new(String::new());
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(PromptError::Protocol("pinentry closed the connection".into()));
            }
            let line = line.trim_end_matches(['\r', '\n']);

            if line == "OK" || line.starts_with("OK ") {
                return Ok(data);
            }
            if let Some(rest) = line.strip_prefix("ERR ") {
                let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
                let code = code.parse::<u32>().unwrap_or(0);
                if code == ASSUAN_CANCELLED {
                    return Err(PromptError::Cancelled);
                }
                return Err(PromptError::Assuan {
                    code,
                    message: message.to_string(),
                });
            }
            if let Some(payload) = line.strip_prefix("D ") {
                let decoded = unescape(payload)?;
                data.get_or_insert_with(|| Zeroizing::new(String::new()))
                    .push_str(&decoded);
                continue;
            }
            // Status and comment lines carry nothing we need.
            if line.starts_with("S ") || line.starts_with('#') || line.is_empty() {
                continue;
            }
            return Err(PromptError::Protocol(line.chars().take(64).collect()));
        }
    }
}

impl PinEntry for Pinentry {
    fn set_description(&mut self, text: &str) -> Result<(), PromptError> {
        self.command(&format!("SETDESC {}", escape(text)))?;
        Ok(())
    }

    fn set_prompt(&mut self, text: &str) -> Result<(), PromptError> {
        self.command(&format!("SETPROMPT {}", escape(text)))?;
        Ok(())
    }

    fn set_repeat_prompt(&mut self, text: &str) -> Result<(), PromptError> {
        self.command(&format!("SETERROR {}", escape(text)))?;
        Ok(())
    }

    fn get_pin(&mut self) -> Result<Zeroizing<String>, PromptError> {
        Ok(self
            .command("GETPIN")?
            .unwrap_or_else(|| Zeroizing::new(String::new())))
    }

    fn shutdown(&mut self) -> Result<(), PromptError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.command("BYE").map(|_| ());
        let _ = self.child.wait();
        result
    }
}

impl Drop for Pinentry {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Percent-escape `%`, CR and LF for an Assuan command argument.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(text: &str) -> Result<Zeroizing<String>, PromptError> {
    let bytes = text.as_bytes();
    let mut out = Zeroizing::new(Vec::with_capacity(bytes.len()));
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| PromptError::Protocol("bad percent escape in data".into()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let s = std::str::from_utf8(&out)
        .map_err(|_| PromptError::Protocol("data is not UTF-8".into()))?;
    Ok(Zeroizing::new(s.to_string()))
}
