//! Registration records: one `user:public-key,key-handle` line per token,
//! both fields in unpadded standard base64.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD_NO_PAD;

use crate::token::{AuthenticateRequest, RegisterResponse};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("line {line}: missing ',' between public key and key handle")]
    MissingComma { line: usize },
    #[error("line {line}: decoding {field}: {source}")]
    Base64 {
        line: usize,
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub user: Option<String>,
    pub public_key: Vec<u8>,
    pub key_handle: Vec<u8>,
}

impl Registration {
    pub fn from_response(user: Option<String>, resp: &RegisterResponse) -> Self {
        Self {
            user,
            public_key: resp.public_key.clone(),
            key_handle: resp.key_handle.clone(),
        }
    }

    pub fn authenticate_request(
        &self,
        application: [u8; 32],
        challenge: [u8; 32],
    ) -> AuthenticateRequest {
        AuthenticateRequest {
            challenge,
            application,
            key_handle: self.key_handle.clone(),
        }
    }
}

impl std::fmt::Display for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}:")?;
        }
        write!(
            f,
            "{},{}",
            BASE64_STANDARD_NO_PAD.encode(&self.public_key),
            BASE64_STANDARD_NO_PAD.encode(&self.key_handle)
        )
    }
}

/// Parse a registrations file.  Blank lines and `#` comments are skipped and
/// the `user:` prefix is optional.
pub fn parse_records(text: &str) -> Result<Vec<Registration>, RecordError> {
    let mut records = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (user, rest) = match line.split_once(':') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, line),
        };
        let (public_key, key_handle) = rest
            .split_once(',')
            .ok_or(RecordError::MissingComma { line: line_no })?;

        let decode = |field: &'static str, value: &str| {
            BASE64_STANDARD_NO_PAD
                .decode(value.trim())
                .map_err(|source| RecordError::Base64 {
                    line: line_no,
                    field,
                    source,
                })
        };
        records.push(Registration {
            user,
            public_key: decode("public key", public_key)?,
            key_handle: decode("key handle", key_handle)?,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_then_parse() {
        let rec = Registration {
            user: Some("alice".to_string()),
            public_key: vec![4, 1, 2, 3],
            key_handle: vec![0xFF; 5],
        };
        let line = rec.to_string();
        assert_eq!(line, "alice:BAECAw,//////8");
        assert_eq!(parse_records(&line).unwrap(), vec![rec]);
    }

    #[test]
    fn skips_comments_and_allows_missing_user() {
        let text = "# registered tokens\n\n  BAECAw,AQI  \n";
        let recs = parse_records(text).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].user, None);
        assert_eq!(recs[0].public_key, [4, 1, 2, 3]);
        assert_eq!(recs[0].key_handle, [1, 2]);
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse_records("# header\nbob:nocomma\n").unwrap_err();
        assert!(matches!(err, RecordError::MissingComma { line: 2 }));

        let err = parse_records("bob:!!!,AQI\n").unwrap_err();
        assert!(matches!(
            err,
            RecordError::Base64 {
                line: 1,
                field: "public key",
                ..
            }
        ));
    }

    #[test]
    fn builds_authenticate_request_from_record() {
        let rec = Registration {
            user: None,
            public_key: vec![4],
            key_handle: vec![9, 9],
        };
        let req = rec.authenticate_request([1; 32], [2; 32]);
        assert_eq!(req.application, [1; 32]);
        assert_eq!(req.challenge, [2; 32]);
        assert_eq!(req.key_handle, [9, 9]);
    }
}
