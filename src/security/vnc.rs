//! HMAC-signed, workspace-scoped VNC access tokens.
//!
//! Token layout: `"{hex hmac-sha256}:{expires_at}:{workspace_dir}"` where the
//! MAC covers `"{expires_at}:{workspace_dir}"` and `expires_at` is a float
//! Unix timestamp. Tokens are self-contained; the only server-side state is
//! the revocation set.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default environment variable carrying the HMAC key.
pub const VNC_SECRET_ENV: &str = "VNC_AUTH_SECRET";

/// A freshly issued VNC token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: f64,
    pub workspace_dir: String,
}

/// Parsed but not yet trusted token fields.
struct TokenParts<'a> {
    signature: &'a str,
    expires_raw: &'a str,
    expires_at: f64,
    workspace_dir: &'a str,
}

fn parse(token: &str) -> Result<TokenParts<'_>> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 3 {
        return Err(Error::InvalidToken(format!(
            "expected 3 fields, found {}",
            parts.len()
        )));
    }
    let expires_at: f64 = parts[1]
        .parse()
        .map_err(|_| Error::InvalidToken("expiry is not a number".into()))?;
    if !expires_at.is_finite() {
        return Err(Error::InvalidToken("expiry is not finite".into()));
    }
    Ok(TokenParts {
        signature: parts[0],
        expires_raw: parts[1],
        expires_at,
        workspace_dir: parts[2],
    })
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Issues and validates VNC tokens.
pub struct VncTokenManager {
    secret: SecretString,
    ttl: Duration,
    /// Revoked token -> its embedded expiry, so stale entries can be purged.
    revoked: Mutex<HashMap<String, f64>>,
}

impl VncTokenManager {
    /// Secret resolution order: `secret`, then `$VNC_AUTH_SECRET`, then a
    /// random per-process key.
    pub fn new(secret: Option<SecretString>, ttl: Duration) -> Result<Self> {
        Self::with_secret_env(secret, VNC_SECRET_ENV, ttl)
    }

    pub fn with_secret_env(
        secret: Option<SecretString>,
        secret_env: &str,
        ttl: Duration,
    ) -> Result<Self> {
        let secret = match secret {
            Some(s) => s,
            None => match std::env::var(secret_env) {
                Ok(v) if !v.is_empty() => SecretString::from(v),
                _ => {
                    warn!(
                        env = secret_env,
                        "no VNC secret configured, generating an ephemeral key; tokens will not survive restart"
                    );
                    generate_secret()?
                }
            },
        };
        Ok(Self {
            secret,
            ttl,
            revoked: Mutex::new(HashMap::new()),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn revoked(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.revoked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sign(&self, expires_raw: &str, workspace_dir: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| Error::Config(format!("invalid HMAC key: {}", e)))?;
        mac.update(expires_raw.as_bytes());
        mac.update(b":");
        mac.update(workspace_dir.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Issue a token bound to `workspace_dir`.
    pub fn generate_token(&self, workspace_dir: &str) -> Result<AuthToken> {
        if workspace_dir.contains(':') {
            return Err(Error::Config(format!(
                "workspace path '{}' cannot contain ':'",
                workspace_dir
            )));
        }
        let expires_at = now_epoch() + self.ttl.as_secs_f64();
        let expires_raw = expires_at.to_string();
        let signature = self.sign(&expires_raw, workspace_dir)?;
        debug!(workspace_dir, expires_at, "vnc token issued");
        Ok(AuthToken {
            token: format!("{}:{}:{}", signature, expires_raw, workspace_dir),
            expires_at,
            workspace_dir: workspace_dir.to_string(),
        })
    }

    /// Detailed validation, failing closed on the first problem found.
    pub fn check_token(&self, token: &str, workspace_dir: &str) -> Result<()> {
        if self.revoked().contains_key(token) {
            return Err(Error::TokenRevoked);
        }
        let parts = parse(token)?;
        if now_epoch() >= parts.expires_at {
            return Err(Error::TokenExpired);
        }
        if parts.workspace_dir != workspace_dir {
            return Err(Error::InvalidToken("workspace mismatch".into()));
        }
        let expected = self.sign(parts.expires_raw, parts.workspace_dir)?;
        if !bool::from(expected.as_bytes().ct_eq(parts.signature.as_bytes())) {
            return Err(Error::InvalidToken("signature mismatch".into()));
        }
        Ok(())
    }

    pub fn validate_token(&self, token: &str, workspace_dir: &str) -> bool {
        match self.check_token(token, workspace_dir) {
            Ok(()) => true,
            Err(e) => {
                debug!(workspace_dir, error = %e, "vnc token rejected");
                false
            }
        }
    }

    /// Add a well-formed token to the revocation set.
    ///
    /// Returns `false` for a malformed token, which cannot be revoked.
    pub fn revoke_token(&self, token: &str) -> bool {
        match parse(token) {
            Ok(parts) => {
                self.revoked().insert(token.to_string(), parts.expires_at);
                info!(workspace_dir = parts.workspace_dir, "vnc token revoked");
                true
            }
            Err(e) => {
                warn!(error = %e, "refusing to revoke malformed vnc token");
                false
            }
        }
    }

    /// Drop revocation entries whose token would have expired anyway.
    pub fn purge_revoked(&self) -> usize {
        let now = now_epoch();
        let mut revoked = self.revoked();
        let before = revoked.len();
        revoked.retain(|_, expires_at| *expires_at > now);
        before - revoked.len()
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked().len()
    }
}

fn generate_secret() -> Result<SecretString> {
    let mut key = [0u8; 32];
    getrandom::fill(&mut key)
        .map_err(|e| Error::Config(format!("Failed to generate VNC secret: {}", e)))?;
    Ok(SecretString::from(hex::encode(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(secret: &str) -> VncTokenManager {
        VncTokenManager::new(
            Some(SecretString::from(secret.to_string())),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let mgr = manager("s3cret");
        let issued = mgr.generate_token("/workspace/alpha").unwrap();
        assert!(mgr.validate_token(&issued.token, "/workspace/alpha"));
        assert_eq!(issued.workspace_dir, "/workspace/alpha");

        let fields: Vec<&str> = issued.token.split(':').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].len(), 64);
        assert!(fields[0].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_workspace_mismatch() {
        let mgr = manager("s3cret");
        let issued = mgr.generate_token("/workspace/alpha").unwrap();
        assert!(!mgr.validate_token(&issued.token, "/workspace/beta"));
    }

    #[test]
    fn test_other_secret_rejects() {
        let a = manager("secret-a");
        let b = manager("secret-b");
        let issued = a.generate_token("/ws").unwrap();
        assert!(matches!(
            b.check_token(&issued.token, "/ws"),
            Err(Error::InvalidToken(_))
        ));
    }

    #[test]
    fn test_tampered_expiry_rejected() {
        let mgr = manager("s3cret");
        let issued = mgr.generate_token("/ws").unwrap();
        let sig = issued.token.split(':').next().unwrap();
        let forged = format!("{}:{}:/ws", sig, issued.expires_at + 1000.0);
        assert!(!mgr.validate_token(&forged, "/ws"));
    }

    #[test]
    fn test_expired() {
        let mgr = VncTokenManager::new(Some(SecretString::from("k".to_string())), Duration::ZERO)
            .unwrap();
        let issued = mgr.generate_token("/ws").unwrap();
        assert!(matches!(
            mgr.check_token(&issued.token, "/ws"),
            Err(Error::TokenExpired)
        ));
    }

    #[test]
    fn test_malformed() {
        let mgr = manager("s3cret");
        assert!(!mgr.validate_token("", "/ws"));
        assert!(!mgr.validate_token("abc:def", "/ws"));
        assert!(!mgr.validate_token("abc:notanumber:/ws", "/ws"));
        assert!(!mgr.validate_token("abc:1:2:/ws", "/ws"));
        assert!(!mgr.revoke_token("abc:def"));
        assert_eq!(mgr.revoked_count(), 0);
    }

    #[test]
    fn test_revoke() {
        let mgr = manager("s3cret");
        let issued = mgr.generate_token("/ws").unwrap();
        assert!(mgr.revoke_token(&issued.token));
        assert!(matches!(
            mgr.check_token(&issued.token, "/ws"),
            Err(Error::TokenRevoked)
        ));
        assert_eq!(mgr.purge_revoked(), 0);
    }

    #[test]
    fn test_purge_revoked_drops_stale() {
        let mgr = VncTokenManager::new(Some(SecretString::from("k".to_string())), Duration::ZERO)
            .unwrap();
        let issued = mgr.generate_token("/ws").unwrap();
        assert!(mgr.revoke_token(&issued.token));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.purge_revoked(), 1);
    }

    #[test]
    fn test_workspace_with_colon_refused() {
        let mgr = manager("s3cret");
        assert!(mgr.generate_token("C:/ws").is_err());
    }
}
