//! Session tokens.
//!
//! Every session is issued a signed, time-limited token bound to its id.
//! The registry records the token at creation; an envelope is accepted only
//! if its token verifies and equals the recorded one.

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionId;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Envelope carried no token.
    #[error("missing token")]
    MissingToken,

    /// Token signature or structure is invalid.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Token is past its expiry.
    #[error("token expired")]
    Expired,

    /// Token was issued to another session.
    #[error("token bound to another session")]
    SessionMismatch,

    /// Token verifies but is not the one issued to this session.
    #[error("token does not match the issued token")]
    NotIssued,

    /// Session is not registered.
    #[error("unknown session")]
    UnknownSession,

    /// Token could not be signed.
    #[error("failed to issue token: {0}")]
    Issue(String),
}

/// Something that signs and verifies session tokens.
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for a session.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    fn issue(&self, session: &SessionId) -> Result<String, AuthError>;

    /// Verify a token's signature, expiry and session binding.
    ///
    /// # Errors
    ///
    /// Returns an error if any check fails.
    fn verify(&self, token: &str, session: &SessionId) -> Result<(), AuthError>;
}

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Session id.
    pub sub: String,
    /// Issued at (seconds since epoch).
    pub iat: u64,
    /// Expiry (seconds since epoch).
    pub exp: u64,
    /// Unique token id.
    pub jti: String,
}

/// HS256 JWT issuer.
pub struct JwtIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtIssuer {
    /// Create an issuer with a shared secret.
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Create an issuer with a secret that lives only as long as the process.
    #[must_use]
    pub fn ephemeral(ttl: Duration) -> Self {
        let secret = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self::new(secret.as_bytes(), ttl)
    }

    /// Sign arbitrary claims.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }
}

impl TokenIssuer for JwtIssuer {
    fn issue(&self, session: &SessionId) -> Result<String, AuthError> {
        let now = jsonwebtoken::get_current_timestamp();
        let claims = Claims {
            sub: session.to_string(),
            iat: now,
            exp: now.saturating_add(self.ttl.as_secs()),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        self.sign(&claims)
    }

    fn verify(&self, token: &str, session: &SessionId) -> Result<(), AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub != session.as_str() {
            return Err(AuthError::SessionMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> JwtIssuer {
        JwtIssuer::new(b"test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = issuer();
        let session = SessionId::generate();

        let token = issuer.issue(&session).unwrap();
        assert!(issuer.verify(&token, &session).is_ok());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let issuer = JwtIssuer::new(b"secret", Duration::from_secs(u64::MAX));
        let session = SessionId::from("s-1");
        let token = issuer.issue(&session).unwrap();
        assert!(issuer.verify(&token, &session).is_ok());
    }

    #[test]
    fn test_tokens_are_unique() {
        let issuer = issuer();
        let session = SessionId::generate();
        assert_ne!(issuer.issue(&session).unwrap(), issuer.issue(&session).unwrap());
    }

    #[test]
    fn test_token_bound_to_session() {
        let issuer = issuer();
        let token = issuer.issue(&SessionId::generate()).unwrap();

        assert!(matches!(
            issuer.verify(&token, &SessionId::generate()),
            Err(AuthError::SessionMismatch)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let session = SessionId::generate();
        let token = issuer().issue(&session).unwrap();
        let other = JwtIssuer::new(b"other-secret", Duration::from_secs(3600));

        assert!(matches!(
            other.verify(&token, &session),
            Err(AuthError::Invalid(_))
        ));
        assert!(matches!(
            issuer().verify("garbage", &session),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = issuer();
        let session = SessionId::generate();
        let now = jsonwebtoken::get_current_timestamp();
        let token = issuer
            .sign(&Claims {
                sub: session.to_string(),
                iat: now - 120,
                exp: now - 60,
                jti: "expired".into(),
            })
            .unwrap();

        assert!(matches!(
            issuer.verify(&token, &session),
            Err(AuthError::Expired)
        ));
    }
}
