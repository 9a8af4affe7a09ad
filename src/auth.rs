//! Identity token validation.
//!
//! The auth service (external collaborator) issues HS256 JWTs; this core
//! only verifies them and extracts the display identity. Tokens are
//! size-checked before parsing and all validation failures collapse into a
//! generic `Unauthorized` so nothing about the failure mode leaks.

use crate::errors::SignalError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Maximum accepted token size in bytes (DoS prevention).
const MAX_TOKEN_BYTES: usize = 8 * 1024;

/// Claims carried by an identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: opaque user id.
    pub sub: String,
    /// Display name chosen at registration.
    pub name: String,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Validated peer identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Validates identity tokens issued by the auth service.
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Create a validator for the shared HS256 secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate a token and return the peer identity.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Unauthorized`] with a generic message for all
    /// failure modes (oversized, malformed, bad signature, expired).
    pub fn validate(&self, token: &str) -> Result<Identity, SignalError> {
        if token.len() > MAX_TOKEN_BYTES {
            tracing::debug!(target: "signal.auth", size = token.len(), "Token exceeds size limit");
            return Err(SignalError::Unauthorized("token too large".to_string()));
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(target: "signal.auth", error = %e, "Token validation failed");
            SignalError::Unauthorized("token rejected".to_string())
        })?;

        Ok(Identity {
            user_id: data.claims.sub,
            display_name: data.claims.name,
        })
    }
}
