//! SSH agent protocol plumbing for emissary.
//!
//! [`SshAgent`] serves any [`emissary_core::Agent`] on a Unix socket using
//! the OpenSSH agent protocol.  [`RemoteAgent`] goes the other way: it is a
//! backend that forwards to an agent already listening somewhere else, such
//! as a forwarded `SSH_AUTH_SOCK`.
//!
//! ```text
//! ssh ──► SshAgent (socket) ──► CompositeAgent ──┬─► RemoteAgent ──► other agent
//!                                                ├─► PivAgent
//!                                                └─► U2fAgent
//! ```

pub mod remote;
pub mod session;

pub use remote::RemoteAgent;
pub use session::SshAgent;
