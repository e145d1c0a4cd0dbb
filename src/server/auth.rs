//! Bearer JWT authentication

use super::error::ServiceError;
use super::models::{Principal, Tier};
use super::AppState;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id
    pub sub: String,
    pub tier: Tier,
    pub exp: i64,
}

/// HS256 token signer and verifier
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService").field("algorithm", &Algorithm::HS256).finish()
    }
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    pub fn issue(&self, owner_id: &str, tier: Tier, ttl: Duration) -> Result<String, ServiceError> {
        let claims = Claims {
            sub: owner_id.to_string(),
            tier,
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(format!("Failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Principal, ServiceError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map_err(|e| ServiceError::Unauthorized(format!("Invalid token: {e}")))?;
        Ok(Principal {
            owner_id: data.claims.sub,
            tier: data.claims.tier,
        })
    }
}

/// The caller behind a valid `Authorization: Bearer` header
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or_else(|| ServiceError::Unauthorized("Missing Authorization header".to_string()))?
            .to_str()
            .map_err(|e| ServiceError::Unauthorized(format!("Invalid Authorization header: {e}")))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ServiceError::Unauthorized("Expected a Bearer token".to_string()))?;

        app_state.jwt.verify(token.trim()).map(AuthUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_then_verify() {
        let jwt = JwtService::new("test-secret");
        let token = jwt.issue("alice", Tier::Pro, Duration::hours(1)).unwrap();
        let principal = jwt.verify(&token).unwrap();
        assert_eq!(principal.owner_id, "alice");
        assert_eq!(principal.tier, Tier::Pro);
    }

    #[test]
    fn test_wrong_secret_and_expired_tokens_fail() {
        let token = JwtService::new("one-secret")
            .issue("alice", Tier::Free, Duration::hours(1))
            .unwrap();
        assert!(matches!(
            JwtService::new("other-secret").verify(&token),
            Err(ServiceError::Unauthorized(_))
        ));

        let jwt = JwtService::new("test-secret");
        let expired = jwt.issue("alice", Tier::Free, Duration::hours(-2)).unwrap();
        assert!(jwt.verify(&expired).is_err());
    }
}
