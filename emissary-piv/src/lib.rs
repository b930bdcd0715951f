//! PIV smartcard backend for emissary.
//!
//! [`PivAgent`] lists the ECDSA certificates in the PIV authentication slots
//! and signs with them, asking for the card PIN through the configured
//! pinentry when the card demands it.  Every signature the card returns is
//! verified against the slot's public key before it leaves the agent.

pub mod agent;
pub mod card;
pub mod pubkey;
#[cfg(feature = "yubikey")]
pub mod yubikey;

pub use agent::PivAgent;
pub use card::{Card, CardError, Slot};
pub use pubkey::PivPublicKey;

/// Options accepted by a `type = "piv"` backend entry.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PivOptions {
    /// Substring of the PC/SC reader name to use.  The first card found is
    /// used when unset.
    #[serde(default)]
    pub reader: Option<String>,
}

/// Register the `piv` backend type for YubiKey cards.
#[cfg(feature = "yubikey")]
pub fn register_backend(registry: &mut emissary_core::registry::BackendRegistry) {
    use std::sync::Arc;

    registry.register("piv", |entry, ctx| {
        let options: PivOptions = entry.params()?;
        let card = yubikey::YubiKeyCard::open(options.reader.as_deref())?;
        Ok(Arc::new(PivAgent::new(Box::new(card), Arc::clone(&ctx.pin_entry)))
            as Arc<dyn emissary_core::Agent>)
    });
}
