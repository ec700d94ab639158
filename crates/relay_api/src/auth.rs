use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use thiserror::Error;

const SUBJECT_PREFIX: &str = "user:";

#[derive(Debug, Clone)]
pub struct RelayTokenConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("credential subject `{0}` is not a user")]
    InvalidSubject(String),
}

/// Resolves a bearer credential to the user it was issued for.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<UserId, AuthError>;
}

pub struct JwtCredentialValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl CredentialValidator for JwtCredentialValidator {
    fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|err| AuthError::InvalidCredential(err.to_string()))?;
        parse_subject(&data.claims.sub)
    }
}

pub fn mint_relay_token(
    cfg: &RelayTokenConfig,
    user_id: UserId,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        sub: format!("{SUBJECT_PREFIX}{}", user_id.0),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn parse_subject(subject: &str) -> Result<UserId, AuthError> {
    subject
        .strip_prefix(SUBJECT_PREFIX)
        .and_then(|id| id.parse::<i64>().ok())
        .map(UserId)
        .ok_or_else(|| AuthError::InvalidSubject(subject.to_string()))
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
