//! Key blob layout for U2F keys: `string(format) || string(tag)`.
//!
//! Both fields are length-prefixed so the blob parses as an opaque SSH
//! public key of an unknown algorithm.

use ssh_encoding::{Decode, Encode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireKey {
    pub format: String,
    pub rest: Vec<u8>,
}

impl WireKey {
    pub fn new(format: impl Into<String>, rest: Vec<u8>) -> Self {
        Self {
            format: format.into(),
            rest,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ssh_encoding::Error> {
        let mut out = Vec::with_capacity(8 + self.format.len() + self.rest.len());
        self.format.as_str().encode(&mut out)?;
        self.rest.as_slice().encode(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(mut blob: &[u8]) -> Result<Self, ssh_encoding::Error> {
        let format = String::decode(&mut blob)?;
        let rest = Vec::<u8>::decode(&mut blob)?;
        if !blob.is_empty() {
            return Err(ssh_encoding::Error::TrailingData {
                remaining: blob.len(),
            });
        }
        Ok(Self { format, rest })
    }
}
