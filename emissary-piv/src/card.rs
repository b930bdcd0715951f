//! The smartcard operations the PIV backend needs.

use std::ops::{Deref, DerefMut};

/// PIV key slots the agent looks for certificates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// 9a
    Authentication,
    /// 9e
    CardAuthentication,
}

impl Slot {
    pub const LISTED: [Slot; 2] = [Slot::Authentication, Slot::CardAuthentication];

    pub fn id(self) -> u8 {
        match self {
            Slot::Authentication => 0x9a,
            Slot::CardAuthentication => 0x9e,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Slot::Authentication => "PIV Authentication",
            Slot::CardAuthentication => "Card Authentication",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}", self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    EccP256,
    EccP384,
    Rsa1024,
    Rsa2048,
}

/// The parts of a slot certificate the agent uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCertificate {
    pub subject: String,
    /// DER `SubjectPublicKeyInfo`.
    pub public_key_der: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("security status not satisfied (login required)")]
    LoginRequired,
    #[error("wrong PIN ({attempts} attempts remaining)")]
    WrongPin { attempts: u8 },
    #[error("PIN is blocked")]
    PinBlocked,
    #[error("no certificate in slot {0}")]
    NoCertificate(Slot),
    #[error("card transport error: {0}")]
    Transport(String),
    #[error("card error: {0}")]
    Other(String),
}

impl CardError {
    /// Remaining PIN attempts reported with a failed login, or zero.
    pub fn pin_attempts(&self) -> u8 {
        match self {
            CardError::WrongPin { attempts } => *attempts,
            _ => 0,
        }
    }

    pub fn is_login_required(&self) -> bool {
        matches!(self, CardError::LoginRequired)
    }
}

/// A PIV smartcard.  Calls block on card I/O.
pub trait Card: Send {
    fn begin_transaction(&mut self) -> Result<(), CardError>;

    fn end_transaction(&mut self);

    fn select_app(&mut self) -> Result<(), CardError>;

    fn certificate(&mut self, slot: Slot) -> Result<SlotCertificate, CardError>;

    fn login(&mut self, pin_type: PinType, pin: &[u8]) -> Result<(), CardError>;

    fn logout(&mut self) -> Result<(), CardError>;

    /// Sign `input` with the slot key.  ECDSA takes a digest and returns a
    /// DER signature; RSA takes a full PKCS#1 v1.5 block of the modulus size
    /// and returns the raw signature.
    fn sign(&mut self, slot: Slot, algorithm: Algorithm, input: &[u8])
    -> Result<Vec<u8>, CardError>;
}

/// An open card transaction with the PIV application selected.  Ends the
/// transaction when dropped.
pub struct Transaction<'a> {
    card: &'a mut dyn Card,
}

impl<'a> Transaction<'a> {
    pub fn begin(card: &'a mut dyn Card) -> Result<Self, CardError> {
        card.begin_transaction()?;
        let mut tx = Self { card };
        tx.card.select_app()?;
        Ok(tx)
    }
}

impl<'a> Deref for Transaction<'a> {
    type Target = dyn Card + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.card
    }
}

impl<'a> DerefMut for Transaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.card
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.card.end_transaction();
    }
}
