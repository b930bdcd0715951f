//! U2F hardware-token support for emissary.
//!
//! [`U2fAgent`] exposes attached tokens as agent keys whose blobs carry an
//! encrypted device tag instead of the device path.  The [`token`] module
//! speaks the raw U2F protocol to any [`token::Device`], including an
//! agent-held key wrapped in a [`ProxyDevice`], and [`flow`] builds the
//! register/authenticate flows on top of it.  With the `hid` feature on
//! Linux, [`HidrawTransport`] reaches real tokens through `/dev/hidraw*`.

use std::sync::Arc;

use emissary_core::registry::BackendRegistry;

pub mod agent;
pub mod flow;
pub mod hid;
#[cfg(all(feature = "hid", target_os = "linux"))]
pub mod hidraw;
pub mod proxy;
pub mod registration;
pub mod tag;
pub mod token;
pub mod transport;
pub mod verify;
pub mod wire;

pub use agent::U2fAgent;
#[cfg(all(feature = "hid", target_os = "linux"))]
pub use hidraw::HidrawTransport;
pub use proxy::ProxyDevice;
pub use tag::{DevicePath, DeviceSealer};
pub use transport::{DeviceInfo, TokenDevice, TokenTransport, TransportError};

/// Key and signature format name for U2F keys.
pub const U2F_FORMAT: &str = "u2f@emissary";

/// Register the `u2f` backend type, backed by `transport`.
pub fn register_backend(registry: &mut BackendRegistry, transport: Arc<dyn TokenTransport>) {
    registry.register("u2f", move |entry, _ctx| {
        tracing::info!(backend = entry.id(), "serving U2F tokens");
        Ok(Arc::new(U2fAgent::new(Arc::clone(&transport))) as Arc<dyn emissary_core::Agent>)
    });
}

/// Register the `u2f` backend type over the host's hidraw devices.
#[cfg(all(feature = "hid", target_os = "linux"))]
pub fn register_hid_backend(registry: &mut BackendRegistry) {
    register_backend(registry, Arc::new(HidrawTransport::new()));
}
