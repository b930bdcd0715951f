//! The U2F raw message protocol, spoken to any [`Device`].
//!
//! Requests are ISO 7816-4 extended-length APDUs and responses end with a
//! two-byte status word.

use emissary_core::AgentError;

pub const INS_REGISTER: u8 = 0x01;
pub const INS_AUTHENTICATE: u8 = 0x02;
pub const INS_VERSION: u8 = 0x03;

const AUTH_ENFORCE: u8 = 0x03;
const AUTH_CHECK_ONLY: u8 = 0x07;

const SW_NO_ERROR: u16 = 0x9000;
const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
const SW_WRONG_DATA: u16 = 0x6A80;

/// Uncompressed P-256 point.
const PUBLIC_KEY_LEN: usize = 65;
const REGISTER_RESERVED: u8 = 0x05;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("user presence required")]
    PresenceRequired,
    #[error("unknown key handle")]
    UnknownKeyHandle,
    #[error("unexpected status {0:#06x}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("no U2F tokens available")]
    NoTokens,
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Something that exchanges one raw U2F message at a time.
#[async_trait::async_trait]
pub trait Device: Send + Sync {
    async fn message(&self, request: &[u8]) -> Result<Vec<u8>, TokenError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub challenge: [u8; 32],
    pub application: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub public_key: Vec<u8>,
    pub key_handle: Vec<u8>,
    /// The full response body, attestation certificate and signature included.
    pub raw: Vec<u8>,
}

impl RegisterResponse {
    /// `0x05 || public key (65) || handle length || handle || attestation`.
    pub fn parse(raw: Vec<u8>) -> Result<Self, TokenError> {
        let header = 1 + PUBLIC_KEY_LEN + 1;
        if raw.len() < header {
            return Err(TokenError::Malformed("registration response too short"));
        }
        if raw[0] != REGISTER_RESERVED {
            return Err(TokenError::Malformed("registration response has wrong tag"));
        }
        let handle_len = raw[1 + PUBLIC_KEY_LEN] as usize;
        let handle = raw
            .get(header..header + handle_len)
            .ok_or(TokenError::Malformed("key handle truncated"))?;
        Ok(Self {
            public_key: raw[1..1 + PUBLIC_KEY_LEN].to_vec(),
            key_handle: handle.to_vec(),
            raw,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateRequest {
    pub challenge: [u8; 32],
    pub application: [u8; 32],
    pub key_handle: Vec<u8>,
}

impl AuthenticateRequest {
    fn body(&self) -> Result<Vec<u8>, TokenError> {
        let handle_len = u8::try_from(self.key_handle.len())
            .map_err(|_| TokenError::InvalidRequest("key handle longer than 255 bytes"))?;
        let mut body = Vec::with_capacity(65 + self.key_handle.len());
        body.extend_from_slice(&self.challenge);
        body.extend_from_slice(&self.application);
        body.push(handle_len);
        body.extend_from_slice(&self.key_handle);
        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub counter: u32,
    /// DER-encoded ECDSA signature.
    pub signature: Vec<u8>,
    /// `presence || counter || signature` as returned by the token.
    pub raw_response: Vec<u8>,
}

/// Build `00 INS P1 00 00 Lc(2) data 00 00`.
pub fn encode_request(ins: u8, p1: u8, data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let len = u16::try_from(data.len())
        .map_err(|_| TokenError::InvalidRequest("request body too long"))?;
    let mut out = Vec::with_capacity(data.len() + 9);
    out.extend_from_slice(&[0x00, ins, p1, 0x00, 0x00]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&[0x00, 0x00]);
    Ok(out)
}

fn split_status(mut raw: Vec<u8>) -> Result<(Vec<u8>, u16), TokenError> {
    if raw.len() < 2 {
        return Err(TokenError::Malformed("response shorter than status word"));
    }
    let sw = u16::from_be_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
    raw.truncate(raw.len() - 2);
    Ok((raw, sw))
}

/// A U2F token reached through some [`Device`].
#[derive(Debug)]
pub struct Token<D> {
    device: D,
}

impl<D: Device> Token<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    async fn exchange(&self, ins: u8, p1: u8, data: &[u8]) -> Result<(Vec<u8>, u16), TokenError> {
        let request = encode_request(ins, p1, data)?;
        split_status(self.device.message(&request).await?)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, TokenError> {
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(&req.challenge);
        body.extend_from_slice(&req.application);

        match self.exchange(INS_REGISTER, AUTH_ENFORCE, &body).await? {
            (data, SW_NO_ERROR) => RegisterResponse::parse(data),
            (_, SW_CONDITIONS_NOT_SATISFIED) => Err(TokenError::PresenceRequired),
            (_, sw) => Err(TokenError::Status(sw)),
        }
    }

    /// Ask whether the token recognises the key handle, without signing.
    pub async fn check_authenticate(&self, req: &AuthenticateRequest) -> Result<(), TokenError> {
        match self.exchange(INS_AUTHENTICATE, AUTH_CHECK_ONLY, &req.body()?).await? {
            // The token would sign once touched: the handle is ours.
            (_, SW_CONDITIONS_NOT_SATISFIED) => Ok(()),
            (_, SW_WRONG_DATA) => Err(TokenError::UnknownKeyHandle),
            (_, sw) => Err(TokenError::Status(sw)),
        }
    }

    pub async fn authenticate(
        &self,
        req: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse, TokenError> {
        let data = match self.exchange(INS_AUTHENTICATE, AUTH_ENFORCE, &req.body()?).await? {
            (data, SW_NO_ERROR) => data,
            (_, SW_CONDITIONS_NOT_SATISFIED) => return Err(TokenError::PresenceRequired),
            (_, SW_WRONG_DATA) => return Err(TokenError::UnknownKeyHandle),
            (_, sw) => return Err(TokenError::Status(sw)),
        };
        if data.len() < 6 {
            return Err(TokenError::Malformed("authentication response too short"));
        }
        Ok(AuthenticateResponse {
            counter: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
            signature: data[5..].to_vec(),
            raw_response: data,
        })
    }

    pub async fn version(&self) -> Result<String, TokenError> {
        match self.exchange(INS_VERSION, 0x00, &[]).await? {
            (data, SW_NO_ERROR) => String::from_utf8(data)
                .map_err(|_| TokenError::Malformed("version is not UTF-8")),
            (_, sw) => Err(TokenError::Status(sw)),
        }
    }
}
