//! Operator credentials: Argon2id password hashes and HS256 access tokens.

use std::fmt::{Debug, Formatter};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use billing_core::{Identity, OperatorId};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ApiError;

/// Hash a password into a PHC string suitable for `operators.password_hash`.
///
/// # Errors
/// Returns an error when hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// # Errors
/// Returns an error when the stored hash is malformed; a wrong password is `Ok(false)`.
pub fn verify_password(password: &str, phc_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(phc_hash)
        .map_err(|err| anyhow!("stored password hash is malformed: {err}"))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(anyhow!("failed to verify password: {err}")),
    }
}

static DUMMY_PASSWORD_HASH: OnceLock<Option<String>> = OnceLock::new();

/// Hash checked in place of a stored one when the login is unknown, so both
/// rejection paths pay for one Argon2 verification. `None` if hashing failed.
pub fn dummy_password_hash() -> Option<&'static str> {
    DUMMY_PASSWORD_HASH
        .get_or_init(|| hash_password("no-such-operator").ok())
        .as_deref()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Operator id, decimal.
    pub sub: String,
    pub login: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl Claims {
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] when the subject is not an operator id.
    pub fn operator_id(&self) -> Result<OperatorId, ApiError> {
        self.sub.parse::<i64>().map(OperatorId).map_err(|_| ApiError::Unauthorized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl Debug for TokenIssuer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// # Errors
    /// Returns an error when `secret` is empty.
    pub fn new(secret: &str, ttl: Duration) -> Result<Self> {
        if secret.is_empty() {
            return Err(anyhow!("token signing secret MUST NOT be empty"));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    /// Sign an access token for `identity` valid for the configured TTL.
    ///
    /// # Errors
    /// Returns an error when the token cannot be signed.
    pub fn issue(&self, identity: &Identity) -> Result<IssuedToken> {
        let issued_at = OffsetDateTime::now_utc();
        let expires_at = issued_at + self.ttl;
        let claims = Claims {
            sub: identity.id.to_string(),
            login: identity.login.clone(),
            iat: issued_at.unix_timestamp(),
            nbf: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("failed to sign access token")?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Check signature, algorithm, and validity window.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] for any token that does not verify.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;

        decode::<Claims>(token, &self.decoding, &validation).map(|data| data.claims).map_err(
            |err| {
                tracing::debug!(error = %err, "rejected access token");
                ApiError::Unauthorized
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> Identity {
        Identity { id: OperatorId(12), login: "olga".to_string(), display_name: "Olga".to_string() }
    }

    #[test]
    fn password_hash_verifies_only_the_original_password() -> Result<()> {
        let hash = hash_password("correct horse")?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash)?);
        assert!(!verify_password("battery staple", &hash)?);
        assert!(verify_password("correct horse", "not-a-phc-string").is_err());
        Ok(())
    }

    #[test]
    fn dummy_hash_is_argon2id_and_is_reused() -> Result<()> {
        let Some(first) = dummy_password_hash() else {
            return Err(anyhow!("dummy hash was not created"));
        };
        assert!(first.starts_with("$argon2id$"));
        assert!(!verify_password("s3cret", first)?);
        assert_eq!(dummy_password_hash(), Some(first));
        Ok(())
    }

    #[test]
    fn issued_token_round_trips_subject_and_login() -> Result<()> {
        let issuer = TokenIssuer::new("unit-test-secret", Duration::from_secs(3600))?;
        let issued = issuer.issue(&operator())?;

        let claims = issuer.verify(&issued.token)?;
        assert_eq!(claims.operator_id()?, OperatorId(12));
        assert_eq!(claims.login, "olga");
        assert_eq!(claims.exp, issued.expires_at.unix_timestamp());
        Ok(())
    }

    #[test]
    fn token_signed_with_other_secret_is_unauthorized() -> Result<()> {
        let issuer = TokenIssuer::new("unit-test-secret", Duration::from_secs(3600))?;
        let foreign = TokenIssuer::new("some-other-secret", Duration::from_secs(3600))?;
        let issued = foreign.issue(&operator())?;

        assert!(matches!(issuer.verify(&issued.token), Err(ApiError::Unauthorized)));
        assert!(matches!(issuer.verify("not.a.jwt"), Err(ApiError::Unauthorized)));
        Ok(())
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(TokenIssuer::new("", Duration::from_secs(60)).is_err());
    }
}
