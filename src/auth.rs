// =============================================================================
// Authentication — bearer JWT verification + webhook HMAC verification
// =============================================================================
//
// Token issuance lives in the auth collaborator; this core only verifies.
// Bearer tokens are HS256 JWTs checked against JWT_SECRET via an Axum
// extractor that short-circuits with 401 before the handler body runs.
//
// Webhook bodies may carry an HMAC-SHA256 hex digest; verification
// recomputes the digest over the raw body and compares in constant time.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::app_state::AppState;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even after a mismatch, preventing timing side-channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// HMAC verification
// =============================================================================

/// Verify an HMAC-SHA256 hex signature over the raw request body.
pub fn verify_hmac_signature(raw_body: &[u8], signature_hex: &str, secret: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), signature_hex.trim().to_lowercase().as_bytes())
}

// =============================================================================
// JWT verification
// =============================================================================

/// Claims carried by tokens the auth collaborator issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    pub exp: i64,
}

/// Verify a bearer token value (without the `Bearer ` prefix).
pub fn verify_token(token: &str, secret: &str) -> Option<Claims> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .ok()
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor validating `Authorization: Bearer <jwt>` against the
/// configured secret. Yields the verified claims.
pub struct AuthClaims(pub Claims);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthClaims {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        match verify_token(token, &state.config.jwt_secret) {
            Some(claims) => Ok(AuthClaims(claims)),
            None => {
                warn!("bearer token failed verification");
                Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "Invalid authorization token",
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn mint(exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: "user-1".to_string(),
            email: "trader@example.com".to_string(),
            role: "admin".to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn valid_token_verifies() {
        let token = mint(3_600);
        let claims = verify_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn expired_token_rejected() {
        let token = mint(-3_600);
        assert!(verify_token(&token, SECRET).is_none());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = mint(3_600);
        assert!(verify_token(&token, "another-secret-another-secret-xx").is_none());
    }

    #[test]
    fn hmac_round_trip() {
        let body = br#"{"symbol":"SPY","direction":"long","timeframe":"5m"}"#;
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_hmac_signature(body, &signature, SECRET));
        // Case-insensitive hex.
        assert!(verify_hmac_signature(body, &signature.to_uppercase(), SECRET));
        // Wrong signature, wrong body, wrong secret all fail.
        assert!(!verify_hmac_signature(body, "deadbeef", SECRET));
        assert!(!verify_hmac_signature(b"tampered", &signature, SECRET));
        assert!(!verify_hmac_signature(body, &signature, "other-secret-other-secret-abcd"));
    }
}
