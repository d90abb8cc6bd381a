//! Bearer token issuing and verification.

use std::sync::Arc;

use actix_web::http::header;
use actix_web::HttpRequest;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ApiError, ApiResult};

/// Claims carried by a scrapnet bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued to
    pub sub: String,
    /// Expiry, seconds since the epoch
    pub exp: usize,
    /// Issued-at, seconds since the epoch
    pub iat: usize,
}

/// HS256 token service shared across handlers.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    ttl: chrono::Duration,
}

impl JwtService {
    /// Build a service around a signing secret and token lifetime.
    #[must_use]
    pub fn new(secret: &[u8], ttl_minutes: i64) -> Self {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation,
            ttl: chrono::Duration::minutes(ttl_minutes),
        }
    }

    /// Issue a token for `username`.
    pub fn issue(&self, username: &str) -> ApiResult<String> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            exp: (now + self.ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(format!("token generation failed: {e}")))
    }

    /// Validate and decode a token.
    pub fn verify(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                warn!(error = %e, "Token validation failed");
                ApiError::Unauthorized(format!("invalid token: {e}"))
            })
    }
}

/// Pull the bearer token out of an `Authorization` header.
pub fn bearer_token(req: &HttpRequest) -> ApiResult<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))
}
