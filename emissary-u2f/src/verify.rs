//! Checking an authentication response against an enrolled public key.

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

use crate::token::{AuthenticateRequest, AuthenticateResponse};

/// User-presence flag as set in every response produced after a touch.
const USER_PRESENT: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("enrolled public key is not a valid P-256 point")]
    PublicKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not verify")]
    Mismatch,
}

/// `application || 0x01 || BE32(counter) || challenge`
pub fn signed_message(application: &[u8; 32], counter: u32, challenge: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + 1 + 4 + 32);
    msg.extend_from_slice(application);
    msg.push(USER_PRESENT);
    msg.extend_from_slice(&counter.to_be_bytes());
    msg.extend_from_slice(challenge);
    msg
}

/// Verify `resp` as ECDSA P-256 / SHA-256 over the signed message.
pub fn verify_authentication(
    public_key: &[u8],
    req: &AuthenticateRequest,
    resp: &AuthenticateResponse,
) -> Result<(), VerifyError> {
    let key = VerifyingKey::from_sec1_bytes(public_key).map_err(|_| VerifyError::PublicKey)?;
    let sig = Signature::from_der(&resp.signature).map_err(|_| VerifyError::MalformedSignature)?;
    let msg = signed_message(&req.application, resp.counter, &req.challenge);
    key.verify(&msg, &sig).map_err(|_| VerifyError::Mismatch)
}
