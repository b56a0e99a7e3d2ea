//! Opaque bearer tokens with a fixed time-to-live.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::{debug, info};

use crate::{Error, Result};

/// Random bytes per token (256 bits of entropy).
pub const TOKEN_BYTES: usize = 32;

/// Issues and validates random URL-safe tokens.
pub struct TokenAuthenticator {
    ttl: Duration,
    tokens: Mutex<HashMap<String, Instant>>,
}

impl TokenAuthenticator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a new token valid for the configured TTL.
    pub fn generate_token(&self) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        getrandom::fill(&mut bytes)
            .map_err(|e| Error::Config(format!("Failed to generate token: {}", e)))?;
        let token = URL_SAFE_NO_PAD.encode(bytes);

        self.lock().insert(token.clone(), Instant::now() + self.ttl);
        debug!(ttl = ?self.ttl, "token issued");
        Ok(token)
    }

    /// Detailed validation. Expired tokens are removed on sight.
    pub fn check_token(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(Error::InvalidToken("empty token".into()));
        }
        let mut tokens = self.lock();
        let Some(expiry) = tokens.get(token).copied() else {
            return Err(Error::InvalidToken("unknown token".into()));
        };
        if Instant::now() >= expiry {
            tokens.remove(token);
            return Err(Error::TokenExpired);
        }
        Ok(())
    }

    pub fn validate_token(&self, token: &str) -> bool {
        self.check_token(token).is_ok()
    }

    /// Returns `true` when the token existed.
    pub fn revoke_token(&self, token: &str) -> bool {
        let removed = self.lock().remove(token).is_some();
        if removed {
            info!("token revoked");
        }
        removed
    }

    /// Revoke every token, returning how many were dropped.
    pub fn revoke_all(&self) -> usize {
        let mut tokens = self.lock();
        let count = tokens.len();
        tokens.clear();
        info!(count, "all tokens revoked");
        count
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, expiry| now < *expiry);
        before - tokens.len()
    }

    /// Live token count (expired entries are purged first).
    pub fn token_count(&self) -> usize {
        self.cleanup_expired();
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_validate() {
        let auth = TokenAuthenticator::new(Duration::from_secs(60));
        let token = auth.generate_token().unwrap();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(auth.validate_token(&token));
        assert!(!auth.validate_token(""));
        assert!(!auth.validate_token("not-issued"));
    }

    #[test]
    fn test_tokens_are_unique() {
        let auth = TokenAuthenticator::new(Duration::from_secs(60));
        let a = auth.generate_token().unwrap();
        let b = auth.generate_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(auth.token_count(), 2);
    }

    #[test]
    fn test_revoke() {
        let auth = TokenAuthenticator::new(Duration::from_secs(60));
        let token = auth.generate_token().unwrap();
        assert!(auth.revoke_token(&token));
        assert!(!auth.validate_token(&token));
        assert!(!auth.revoke_token(&token));
        assert!(!auth.revoke_token("never-issued"));

        auth.generate_token().unwrap();
        auth.generate_token().unwrap();
        assert_eq!(auth.revoke_all(), 2);
        assert_eq!(auth.token_count(), 0);
    }

    #[test]
    fn test_zero_ttl_expires() {
        let auth = TokenAuthenticator::new(Duration::ZERO);
        let token = auth.generate_token().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(auth.check_token(&token), Err(Error::TokenExpired)));
        // lazily deleted on the failed check
        assert!(matches!(
            auth.check_token(&token),
            Err(Error::InvalidToken(_))
        ));
        assert_eq!(auth.token_count(), 0);
    }
}
