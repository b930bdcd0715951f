//! [`Card`] over a YubiKey reached through PC/SC.

use der::Encode;
use tracing::debug;
use yubikey::certificate::Certificate;
use yubikey::piv::{AlgorithmId, SlotId};
use yubikey::{Context, YubiKey};

use crate::card::{Algorithm, Card, CardError, PinType, Slot, SlotCertificate};

pub struct YubiKeyCard {
    device: YubiKey,
}

impl YubiKeyCard {
    /// Open the first card, or the first whose reader name contains
    /// `reader`.
    pub fn open(reader: Option<&str>) -> Result<Self, CardError> {
        let mut readers = Context::open().map_err(transport)?;
        for candidate in readers.iter().map_err(transport)? {
            let name = candidate.name();
            if let Some(wanted) = reader
                && !name.contains(wanted)
            {
                continue;
            }
            match candidate.open() {
                Ok(device) => {
                    debug!(reader = %name, "opened PIV card");
                    return Ok(Self { device });
                }
                Err(e) => debug!(reader = %name, error = %e, "reader has no usable card"),
            }
        }
        Err(CardError::Transport(match reader {
            Some(wanted) => format!("no card in a reader matching {wanted:?}"),
            None => "no card found".to_string(),
        }))
    }
}

fn transport(e: yubikey::Error) -> CardError {
    CardError::Transport(e.to_string())
}

fn card_error(e: yubikey::Error) -> CardError {
    match e {
        yubikey::Error::WrongPin { tries } => CardError::WrongPin { attempts: tries },
        yubikey::Error::PinLocked => CardError::PinBlocked,
        yubikey::Error::AuthenticationError => CardError::LoginRequired,
        other @ yubikey::Error::PcscError { .. } => transport(other),
        other => CardError::Other(other.to_string()),
    }
}

fn slot_id(slot: Slot) -> SlotId {
    match slot {
        Slot::Authentication => SlotId::Authentication,
        Slot::CardAuthentication => SlotId::CardAuthentication,
    }
}

fn algorithm_id(algorithm: Algorithm) -> AlgorithmId {
    match algorithm {
        Algorithm::EccP256 => AlgorithmId::EccP256,
        Algorithm::EccP384 => AlgorithmId::EccP384,
        Algorithm::Rsa1024 => AlgorithmId::Rsa1024,
        Algorithm::Rsa2048 => AlgorithmId::Rsa2048,
    }
}

impl Card for YubiKeyCard {
    // The yubikey crate opens a PC/SC transaction around every command and
    // selects the PIV application itself.
    fn begin_transaction(&mut self) -> Result<(), CardError> {
        Ok(())
    }

    fn end_transaction(&mut self) {}

    fn select_app(&mut self) -> Result<(), CardError> {
        Ok(())
    }

    fn certificate(&mut self, slot: Slot) -> Result<SlotCertificate, CardError> {
        let cert = Certificate::read(&mut self.device, slot_id(slot)).map_err(|e| match e {
            yubikey::Error::NotFound => CardError::NoCertificate(slot),
            other => card_error(other),
        })?;
        let tbs = &cert.cert.tbs_certificate;
        let public_key_der = tbs
            .subject_public_key_info
            .to_der()
            .map_err(|e| CardError::Other(format!("encoding slot {slot} key: {e}")))?;
        Ok(SlotCertificate {
            subject: tbs.subject.to_string(),
            public_key_der,
        })
    }

    fn login(&mut self, _pin_type: PinType, pin: &[u8]) -> Result<(), CardError> {
        self.device.verify_pin(pin).map_err(card_error)
    }

    fn logout(&mut self) -> Result<(), CardError> {
        self.device.deauthenticate().map_err(card_error)
    }

    fn sign(
        &mut self,
        slot: Slot,
        algorithm: Algorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, CardError> {
        let sig = yubikey::piv::sign_data(
            &mut self.device,
            input,
            algorithm_id(algorithm),
            slot_id(slot),
        )
        .map_err(card_error)?;
        Ok(sig.to_vec())
    }
}
