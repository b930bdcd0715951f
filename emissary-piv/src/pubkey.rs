//! Slot public keys: parsing, SSH encoding, card input and local signature
//! verification.

use emissary_core::SIGN_FLAG_RSA_SHA2_512;
use p256::ecdsa::signature::Verifier;
use p256::pkcs8::DecodePublicKey;
use rsa::Pkcs1v15Sign;
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256, Sha384, Sha512};
use ssh_key::public::{EcdsaPublicKey, KeyData, RsaPublicKey};
use ssh_key::{HashAlg, Mpint};

use crate::card::Algorithm;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported or malformed public key")]
    Unsupported,
    #[error("SSH encoding: {0}")]
    Ssh(#[from] ssh_key::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("card returned a malformed signature")]
    Malformed,
    #[error("card signature does not verify against the slot key")]
    Mismatch,
    #[error("SSH encoding: {0}")]
    Ssh(#[from] ssh_key::Error),
}

/// Digest used for RSA signatures.  SHA-1 `ssh-rsa` signatures are never
/// produced; a request without a SHA-2 flag gets `rsa-sha2-256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RsaHash {
    #[default]
    Sha256,
    Sha512,
}

impl RsaHash {
    pub fn from_flags(flags: u32) -> Self {
        if flags & SIGN_FLAG_RSA_SHA2_512 != 0 {
            Self::Sha512
        } else {
            Self::Sha256
        }
    }

    fn hash_alg(self) -> HashAlg {
        match self {
            Self::Sha256 => HashAlg::Sha256,
            Self::Sha512 => HashAlg::Sha512,
        }
    }

    fn scheme(self) -> Pkcs1v15Sign {
        match self {
            Self::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            Self::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PivPublicKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    Rsa(rsa::RsaPublicKey),
}

impl PivPublicKey {
    /// Parse a DER `SubjectPublicKeyInfo`.  NIST P-256 and P-384 keys and
    /// 1024 or 2048 bit RSA keys are supported.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        if let Ok(key) = p256::PublicKey::from_public_key_der(der) {
            return Ok(Self::P256(key.into()));
        }
        if let Ok(key) = p384::PublicKey::from_public_key_der(der) {
            return Ok(Self::P384(key.into()));
        }
        if let Ok(key) = rsa::RsaPublicKey::from_public_key_der(der)
            && matches!(key.size(), 128 | 256)
        {
            return Ok(Self::Rsa(key));
        }
        Err(KeyError::Unsupported)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::P256(_) => Algorithm::EccP256,
            Self::P384(_) => Algorithm::EccP384,
            Self::Rsa(key) if key.size() == 128 => Algorithm::Rsa1024,
            Self::Rsa(_) => Algorithm::Rsa2048,
        }
    }

    pub fn ssh_key_data(&self) -> Result<KeyData, KeyError> {
        match self {
            Self::P256(key) => Ok(KeyData::Ecdsa(EcdsaPublicKey::from_sec1_bytes(
                key.to_encoded_point(false).as_bytes(),
            )?)),
            Self::P384(key) => Ok(KeyData::Ecdsa(EcdsaPublicKey::from_sec1_bytes(
                key.to_encoded_point(false).as_bytes(),
            )?)),
            Self::Rsa(key) => Ok(KeyData::Rsa(RsaPublicKey {
                e: Mpint::from_positive_bytes(&key.e().to_bytes_be())?,
                n: Mpint::from_positive_bytes(&key.n().to_bytes_be())?,
            })),
        }
    }

    /// SSH algorithm name and wire-encoded public key blob.
    pub fn ssh_encoding(&self) -> Result<(String, Vec<u8>), KeyError> {
        let data = self.ssh_key_data()?;
        let format = data.algorithm().as_str().to_string();
        let blob = ssh_key::PublicKey::from(data).to_bytes()?;
        Ok((format, blob))
    }

    /// What the card is asked to sign for `data`: the curve's digest for
    /// ECDSA, a full PKCS#1 v1.5 block for RSA.
    pub fn card_input(&self, data: &[u8], hash: RsaHash) -> Vec<u8> {
        match self {
            Self::P256(_) => Sha256::digest(data).to_vec(),
            Self::P384(_) => Sha384::digest(data).to_vec(),
            Self::Rsa(key) => pkcs1v15_block(&hash.scheme().prefix, &hash.digest(data), key.size()),
        }
    }

    /// Verify the card's signature over `data` and re-encode it for SSH.
    /// ECDSA signatures arrive DER-encoded, RSA ones raw.
    pub fn verify(
        &self,
        data: &[u8],
        raw: &[u8],
        hash: RsaHash,
    ) -> Result<ssh_key::Signature, SignatureError> {
        match self {
            Self::P256(key) => {
                let sig = p256::ecdsa::Signature::from_der(raw)
                    .map_err(|_| SignatureError::Malformed)?;
                key.verify(data, &sig).map_err(|_| SignatureError::Mismatch)?;
                Ok(ssh_key::Signature::try_from(sig)?)
            }
            Self::P384(key) => {
                let sig = p384::ecdsa::Signature::from_der(raw)
                    .map_err(|_| SignatureError::Malformed)?;
                key.verify(data, &sig).map_err(|_| SignatureError::Mismatch)?;
                Ok(ssh_key::Signature::try_from(sig)?)
            }
            Self::Rsa(key) => {
                if raw.len() != key.size() {
                    return Err(SignatureError::Malformed);
                }
                key.verify(hash.scheme(), &hash.digest(data), raw)
                    .map_err(|_| SignatureError::Mismatch)?;
                let algorithm = ssh_key::Algorithm::Rsa {
                    hash: Some(hash.hash_alg()),
                };
                Ok(ssh_key::Signature::new(algorithm, raw.to_vec())?)
            }
        }
    }
}

/// EMSA-PKCS1-v1_5 encoding of `prefix || hashed` into a `size` byte block.
/// `size` always fits: only 1024 and 2048 bit keys are accepted.
fn pkcs1v15_block(prefix: &[u8], hashed: &[u8], size: usize) -> Vec<u8> {
    let t_len = prefix.len() + hashed.len();
    let mut block = vec![0xff; size];
    block[0] = 0x00;
    block[1] = 0x01;
    block[size - t_len - 1] = 0x00;
    block[size - t_len..size - hashed.len()].copy_from_slice(prefix);
    block[size - hashed.len()..].copy_from_slice(hashed);
    block
}
