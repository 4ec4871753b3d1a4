//! In-memory token state.
//!
//! Holds the current access/refresh pair plus claims decoded from the access
//! token's payload segment. Tokens are never persisted; a process restart
//! loses the session and the surrounding application re-authenticates.
//!
//! Claims are decoded, not verified — the client only needs the expiry (and
//! tenant/role for display); the server is the authority on validity.

use std::future::Future;
use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use serde::Deserialize;

use sift_core::ClientError;

/// Leeway applied to the expiry check so a token is refreshed slightly
/// before the server would reject it.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

#[derive(Debug, Clone)]
struct TokenPair {
    access: String,
    refresh: String,
    claims: Option<Claims>,
}

/// Decode the claims from a JWT's payload segment. Returns None on any
/// malformed input; callers treat that as an expired token.
pub fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Single owner of the credential pair visible to all outgoing requests.
#[derive(Default)]
pub struct TokenManager {
    inner: Mutex<Option<TokenPair>>,
    /// Serializes refresh attempts; see [`TokenManager::refresh_with`].
    refresh_gate: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both tokens atomically.
    pub fn set_tokens(&self, access: &str, refresh: &str) {
        let claims = decode_claims(access);
        *self.inner.lock().unwrap() = Some(TokenPair {
            access: access.to_string(),
            refresh: refresh.to_string(),
            claims,
        });
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.lock().unwrap().as_ref().map(|p| p.access.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.lock().unwrap().as_ref().map(|p| p.refresh.clone())
    }

    pub fn claims(&self) -> Option<Claims> {
        self.inner.lock().unwrap().as_ref().and_then(|p| p.claims.clone())
    }

    /// Whether the access token should be considered expired. A missing
    /// token, an undecodable token, or a missing `exp` claim all count as
    /// expired.
    pub fn is_access_token_expired(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        match guard.as_ref().and_then(|p| p.claims.as_ref()).and_then(|c| c.exp) {
            Some(exp) => exp <= Utc::now().timestamp() + EXPIRY_SKEW_SECS,
            None => true,
        }
    }

    /// Wipe both tokens.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    /// Refresh the pair with at most one outstanding refresh at a time.
    ///
    /// `observed_access` is the access token the caller last saw. Callers
    /// that queue behind an in-flight refresh find the token already changed
    /// when they acquire the gate and return without issuing a second
    /// network call — the single-flight guarantee.
    pub async fn refresh_with<F, Fut>(
        &self,
        observed_access: Option<&str>,
        do_refresh: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(String, String), ClientError>>,
    {
        let _gate = self.refresh_gate.lock().await;
        if self.access_token().as_deref() != observed_access {
            // Another caller refreshed while we waited for the gate.
            return Ok(());
        }
        let refresh = self
            .refresh_token()
            .ok_or_else(|| ClientError::Unauthorized("no refresh token".to_string()))?;
        let (access, refresh) = do_refresh(refresh).await?;
        self.set_tokens(&access, &refresh);
        Ok(())
    }
}
