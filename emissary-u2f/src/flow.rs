//! Registration and authentication flows over agent-held U2F keys.

use std::sync::Arc;
use std::time::Duration;

use emissary_core::{Agent, Key};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::U2F_FORMAT;
use crate::proxy::ProxyDevice;
use crate::token::{
    AuthenticateRequest, AuthenticateResponse, Device, RegisterRequest, RegisterResponse, Token,
    TokenError,
};

/// Delay between retries while a token waits for a touch.
pub const PRESENCE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// SHA-256 of an application identifier string.
pub fn application_id(name: &str) -> [u8; 32] {
    Sha256::digest(name.as_bytes()).into()
}

/// Wrap every U2F key in `keys` as a token driven through `agent`.
pub fn proxy_tokens(agent: &Arc<dyn Agent>, keys: &[Key]) -> Vec<Token<ProxyDevice>> {
    keys.iter()
        .filter(|k| k.format == U2F_FORMAT)
        .map(|k| Token::new(ProxyDevice::new(Arc::clone(agent), k.clone())))
        .collect()
}

/// Find the first agent-held token that recognises one of `requests`.
///
/// Returns the token and the index of the matching request.  "Unknown key
/// handle" moves on to the next candidate; any other failure ends the search.
pub async fn find_registered(
    agent: &Arc<dyn Agent>,
    requests: &[AuthenticateRequest],
) -> Result<Option<(Token<ProxyDevice>, usize)>, TokenError> {
    let keys = agent.list().await?;
    for token in proxy_tokens(agent, &keys) {
        for (index, req) in requests.iter().enumerate() {
            match token.check_authenticate(req).await {
                Ok(()) => {
                    debug!(token = %token.device().key().comment, index, "key handle recognised");
                    return Ok(Some((token, index)));
                }
                Err(TokenError::UnknownKeyHandle) => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(None)
}

/// Authenticate, retrying every `interval` while the token wants a touch.
pub async fn authenticate_with_presence<D: Device>(
    token: &Token<D>,
    req: &AuthenticateRequest,
    interval: Duration,
) -> Result<AuthenticateResponse, TokenError> {
    loop {
        match token.authenticate(req).await {
            Err(TokenError::PresenceRequired) => tokio::time::sleep(interval).await,
            other => return other,
        }
    }
}

/// Register with whichever token is touched first.
pub async fn register_any<D: Device>(
    tokens: &[Token<D>],
    req: &RegisterRequest,
    interval: Duration,
) -> Result<RegisterResponse, TokenError> {
    if tokens.is_empty() {
        return Err(TokenError::NoTokens);
    }
    loop {
        for token in tokens {
            match token.register(req).await {
                Err(TokenError::PresenceRequired) => continue,
                other => return other,
            }
        }
        tokio::time::sleep(interval).await;
    }
}
