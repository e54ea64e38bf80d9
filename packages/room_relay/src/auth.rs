//! Credential issuance and verification.
//!
//! Users live in memory with argon2id password hashes; sessions are HS256
//! JWTs whose `sub` is the login.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::AuthConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid token")]
    InvalidToken,

    #[error("user already exists")]
    UserExists,

    #[error("registration is closed")]
    RegistrationClosed,

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidToken => "invalid_token",
            Self::UserExists => "user_exists",
            Self::RegistrationClosed => "registration_closed",
            Self::Internal(_) => "internal",
        }
    }
}

/// A verified identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub login: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError>;

    /// Check a password and issue a session token.
    async fn login(&self, login: &str, password: &str) -> Result<String, AuthError>;

    async fn register(&self, login: &str, password: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Internal(format!("failed to hash password: {e}")))
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AuthError::Internal(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Clients have been seen sending the token JSON-quoted.
fn normalize_token(token: &str) -> String {
    token.replace('"', "").trim().to_string()
}

pub struct LocalAuthority {
    users: DashMap<String, String>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
    allow_registration: bool,
}

impl LocalAuthority {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            users: DashMap::new(),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            token_ttl: config.token_ttl,
            allow_registration: config.allow_registration,
        }
    }

    fn issue(&self, login: &str) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: login.to_string(),
            iat: now,
            exp: now + self.token_ttl.as_secs(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(format!("failed to sign token: {e}")))
    }
}

#[async_trait]
impl Authenticator for LocalAuthority {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError> {
        let token = normalize_token(token);
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let data = jsonwebtoken::decode::<Claims>(&token, &self.decoding, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Token rejected");
                AuthError::InvalidToken
            })?;
        Ok(Subject {
            login: data.claims.sub,
        })
    }

    async fn login(&self, login: &str, password: &str) -> Result<String, AuthError> {
        let Some(hash) = self.users.get(login).map(|entry| entry.value().clone()) else {
            return Err(AuthError::InvalidCredentials);
        };
        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))??;
        if !valid {
            return Err(AuthError::InvalidCredentials);
        }
        self.issue(login)
    }

    async fn register(&self, login: &str, password: &str) -> Result<(), AuthError> {
        if !self.allow_registration {
            return Err(AuthError::RegistrationClosed);
        }
        let login = login.trim();
        if login.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        if self.users.contains_key(login) {
            return Err(AuthError::UserExists);
        }

        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))??;

        match self.users.entry(login.to_string()) {
            Entry::Occupied(_) => Err(AuthError::UserExists),
            Entry::Vacant(slot) => {
                slot.insert(hash);
                info!(login = %login, "Registered user");
                Ok(())
            }
        }
    }
}
