//! Password hashing and bearer tokens
//!
//! Argon2 for stored password hashes, HS256 JWTs for API sessions. The
//! token carries the user id as `sub` plus the username for log context.

use crate::config::Settings;
use crate::error::{Result, WirewanError};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims for an API session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Login name, for log context
    pub username: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| WirewanError::Config(format!("Failed to hash password: {}", e)))
}

/// Check a password against a stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Issue a bearer token for a user.
pub fn create_access_token(settings: &Settings, user_id: Uuid, username: &str) -> Result<String> {
    let expires = Utc::now() + Duration::minutes(settings.access_token_expire_minutes);
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        exp: expires.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )
    .map_err(|e| WirewanError::Config(format!("Failed to sign token: {}", e)))
}

/// Decode and validate a bearer token, returning the user id.
pub fn decode_token(settings: &Settings, token: &str) -> Result<Uuid> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| WirewanError::Unauthorized("Invalid token".to_string()))?;
    Uuid::parse_str(&data.claims.sub)
        .map_err(|_| WirewanError::Unauthorized("Invalid token payload".to_string()))
}
