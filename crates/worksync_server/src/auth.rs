//! Authentication for sync connections.
//!
//! Tokens are HMAC-SHA256 signatures over the subject and the issue time,
//! so they can be checked without server-side token storage.
//!
//! ## Token Format
//!
//! - 8 bytes: issued-at timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256(secret, subject || issued-at)
//!
//! Total: 40 bytes.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashSet;
use std::time::Duration;
use worksync_protocol::{now_millis, Credentials, Principal};

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_LEN: usize = 8;
const SIGNATURE_LEN: usize = 32;

/// Length of an issued token.
pub const TOKEN_LEN: usize = TIMESTAMP_LEN + SIGNATURE_LEN;

/// Establishes identities for connections.
pub trait Authenticator: Send + Sync + 'static {
    /// Checks credentials. Unregistered subjects fail with
    /// [`ServerError::UnknownIdentity`].
    fn authenticate(&self, credentials: &Credentials) -> ServerResult<Principal>;

    /// Registers the subject named in `credentials`.
    fn register(&self, credentials: &Credentials) -> ServerResult<()>;
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks subject tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `subject`.
    pub fn create_token(&self, subject: &str) -> ServerResult<Vec<u8>> {
        self.create_token_at(subject, now_millis())
    }

    fn create_token_at(&self, subject: &str, issued_at: u64) -> ServerResult<Vec<u8>> {
        let issued = issued_at.to_be_bytes();
        let signature = self.mac(subject, &issued)?.finalize().into_bytes();

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&issued);
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Checks that `token` was issued for `subject` and has not expired.
    pub fn validate_token(&self, token: &[u8], subject: &str) -> ServerResult<()> {
        if token.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed(
                "invalid token length".into(),
            ));
        }
        let (issued, signature) = token.split_at(TIMESTAMP_LEN);

        self.mac(subject, issued)?
            .verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let mut timestamp = [0u8; TIMESTAMP_LEN];
        timestamp.copy_from_slice(issued);
        let issued_at = u64::from_be_bytes(timestamp);
        let expiry = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if now_millis() > issued_at.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }
        Ok(())
    }

    fn mac(&self, subject: &str, issued: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key rejected: {e}")))?;
        mac.update(subject.as_bytes());
        mac.update(issued);
        Ok(mac)
    }
}

/// Token authenticator with a registered-subject roster.
pub struct HmacAuthenticator {
    validator: TokenValidator,
    roster: RwLock<HashSet<String>>,
}

impl HmacAuthenticator {
    /// Creates an authenticator with an empty roster.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            validator: TokenValidator::new(config),
            roster: RwLock::new(HashSet::new()),
        }
    }

    /// Pre-registers subjects.
    pub fn with_subjects<I, S>(self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster.write().extend(subjects.into_iter().map(Into::into));
        self
    }

    /// Returns the token validator.
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Returns true if `subject` is registered.
    pub fn is_registered(&self, subject: &str) -> bool {
        self.roster.read().contains(subject)
    }
}

impl Authenticator for HmacAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> ServerResult<Principal> {
        if !self.is_registered(&credentials.subject) {
            return Err(ServerError::UnknownIdentity(credentials.subject.clone()));
        }
        self.validator
            .validate_token(&credentials.token, &credentials.subject)?;
        Ok(Principal {
            subject: credentials.subject.clone(),
        })
    }

    fn register(&self, credentials: &Credentials) -> ServerResult<()> {
        self.validator
            .validate_token(&credentials.token, &credentials.subject)?;
        self.roster.write().insert(credentials.subject.clone());
        Ok(())
    }
}

/// Accepts any non-empty subject. Used when authentication is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAuthenticator;

impl Authenticator for OpenAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> ServerResult<Principal> {
        if credentials.subject.trim().is_empty() {
            return Err(ServerError::AuthenticationFailed("subject is empty".into()));
        }
        Ok(Principal {
            subject: credentials.subject.clone(),
        })
    }

    fn register(&self, _credentials: &Credentials) -> ServerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-key-32-bytes-long!!";

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(SECRET.to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token("ada").unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(validator.validate_token(&token, "ada").is_ok());
    }

    #[test]
    fn reject_wrong_subject() {
        let validator = validator();
        let token = validator.create_token("ada").unwrap();
        assert!(validator.validate_token(&token, "grace").is_err());
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let mut token = validator.create_token("ada").unwrap();
        token[20] ^= 0xFF;
        assert!(validator.validate_token(&token, "ada").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator =
            TokenValidator::new(AuthConfig::new(SECRET.to_vec()).with_expiry(Duration::from_secs(60)));
        let issued = now_millis() - 61_000;
        let token = validator.create_token_at("ada", issued).unwrap();
        assert!(matches!(
            validator.validate_token(&token, "ada"),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn unregistered_subject_is_unknown_until_registered() {
        let auth = HmacAuthenticator::new(AuthConfig::new(SECRET.to_vec()));
        let token = auth.validator().create_token("ada").unwrap();
        let credentials = Credentials::new("ada", token);

        assert!(matches!(
            auth.authenticate(&credentials),
            Err(ServerError::UnknownIdentity(_))
        ));
        auth.register(&credentials).unwrap();
        assert_eq!(auth.authenticate(&credentials).unwrap().subject, "ada");
    }

    #[test]
    fn registration_requires_a_valid_token() {
        let auth = HmacAuthenticator::new(AuthConfig::new(SECRET.to_vec()));
        let credentials = Credentials::new("mallory", vec![0; TOKEN_LEN]);
        assert!(auth.register(&credentials).is_err());
        assert!(!auth.is_registered("mallory"));
    }

    #[test]
    fn open_authenticator_accepts_any_subject() {
        let auth = OpenAuthenticator;
        let principal = auth
            .authenticate(&Credentials::new("anyone", Vec::new()))
            .unwrap();
        assert_eq!(principal.subject, "anyone");
        assert!(auth.authenticate(&Credentials::new(" ", Vec::new())).is_err());
    }
}
