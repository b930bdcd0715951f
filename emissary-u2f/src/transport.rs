//! The raw HID transport the U2F backend drives.
//!
//! Device enumeration and framing over USB HID are provided by the host
//! integration; this crate only consumes them.

use crate::tag::DevicePath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: DevicePath,
    pub product: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("device {0} is not attached")]
    NotAttached(DevicePath),
    #[error("failed to enumerate devices: {0}")]
    Enumerate(String),
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Blocking device access; callers run it on the blocking pool.
pub trait TokenTransport: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    fn open(&self, path: &DevicePath) -> Result<Box<dyn TokenDevice>, TransportError>;
}

/// An opened token.  `message` sends one framed request and returns the raw
/// response, status word included.
pub trait TokenDevice: Send {
    fn message(&mut self, data: &[u8]) -> Result<Vec<u8>, TransportError>;
}
