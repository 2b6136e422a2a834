//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - End-user authentication via HS256 JWT
//! - `ServiceAuth` - Service-to-service authentication via API key
//! - `AdminAuth` - Operator authentication via admin key

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use sprout_billing_core::UserId;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// An authenticated user extracted from a JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
    /// Email claim, when present.
    pub email: Option<String>,
}

/// JWT claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user UUID).
    pub sub: String,
    /// Audience.
    pub aud: String,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: i64,
    /// User email.
    #[serde(default)]
    pub email: Option<String>,
}

impl AuthUser {
    /// Validate a bearer token.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Unauthorized` for bad signatures, expired tokens,
    /// wrong audiences, or subjects that are not user IDs.
    pub fn from_token(token: &str, secret: &str, audience: &str) -> Result<Self, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);

        let key = DecodingKey::from_secret(secret.as_bytes());
        let data = decode::<JwtClaims>(token, &key, &validation).map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            ApiError::Unauthorized
        })?;

        let user_id = data
            .claims
            .sub
            .parse::<UserId>()
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(Self {
            user_id,
            email: data.claims.email,
        })
    }
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let auth_header = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let token = auth_header
                .strip_prefix("Bearer ")
                .ok_or(ApiError::Unauthorized)?;

            let secret = state
                .config
                .auth_jwt_secret
                .as_deref()
                .ok_or(ApiError::Unauthorized)?;

            Self::from_token(token, secret, &state.config.auth_audience)
        })
    }
}

/// Service authentication via API key.
///
/// Used by the analysis service to consume and hold credits.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The service name or identifier.
    pub service_name: String,
}

impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            check_key(parts, "x-api-key", state.config.service_api_key.as_deref())?;

            let service_name = parts
                .headers
                .get("x-service-name")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();

            Ok(ServiceAuth { service_name })
        })
    }
}

/// Admin authentication via admin key.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Operator identifier, for the audit log.
    pub admin_id: String,
}

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            check_key(parts, "x-admin-key", state.config.admin_api_key.as_deref())?;

            let admin_id = parts
                .headers
                .get("x-admin-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();

            tracing::info!(admin_id = %admin_id, "Admin request authenticated");
            Ok(AdminAuth { admin_id })
        })
    }
}

/// Compare a header against a configured key. An unset key rejects everything.
fn check_key(parts: &Parts, header: &str, expected: Option<&str>) -> Result<(), ApiError> {
    let provided = parts
        .headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let expected = expected.ok_or(ApiError::Unauthorized)?;

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, aud: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            sub: sub.to_string(),
            aud: aud.to_string(),
            exp: now + exp_offset,
            iat: now,
            email: Some("ana@example.com".into()),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let user_id = UserId::generate();
        let jwt = token(&user_id.to_string(), "authenticated", 3600);
        let user = AuthUser::from_token(&jwt, SECRET, "authenticated").unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email.as_deref(), Some("ana@example.com"));
    }

    #[test]
    fn rejects_wrong_audience() {
        let user_id = UserId::generate();
        let token = token(&user_id.to_string(), "other", 3600);
        assert!(AuthUser::from_token(&token, SECRET, "authenticated").is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let user_id = UserId::generate();
        let token = token(&user_id.to_string(), "authenticated", -3600);
        assert!(AuthUser::from_token(&token, SECRET, "authenticated").is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let user_id = UserId::generate();
        let token = token(&user_id.to_string(), "authenticated", 3600);
        assert!(AuthUser::from_token(&token, "other-secret", "authenticated").is_err());
    }

    #[test]
    fn rejects_non_uuid_subject() {
        let token = token("not-a-uuid", "authenticated", 3600);
        assert!(AuthUser::from_token(&token, SECRET, "authenticated").is_err());
    }
}
