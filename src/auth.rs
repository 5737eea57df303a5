use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// JWT payload: the subject is the `app_users` id, the role mirrors the
/// user's tagged variant (administrator / client / owner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub name: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(
    state: &AppState,
    user_id: &str,
    role: &str,
    name: &str,
    email: &str,
) -> AppResult<String> {
    let secret = jwt_secret(state)?;
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        name: name.to_string(),
        email: email.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(state.config.jwt_ttl_hours.max(1))).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|error| AppError::Internal(format!("Could not sign token: {error}")))
}

pub fn verify_token(state: &AppState, token: &str) -> AppResult<Claims> {
    let secret = jwt_secret(state)?;
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthorized("Invalid or expired token.".to_string()))
}

/// Resolves the authenticated user id from the request headers.
///
/// Outside production a plain `x-user-id` header is accepted when dev
/// overrides are enabled, so the API can be exercised without issuing tokens.
pub fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    Ok(require_claims(state, headers)?.sub)
}

pub fn require_claims(state: &AppState, headers: &HeaderMap) -> AppResult<Claims> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_str(headers, "x-user-id") {
            return Ok(Claims {
                sub: user_id.to_string(),
                role: "administrator".to_string(),
                name: "Dev Override".to_string(),
                email: String::new(),
                iat: 0,
                exp: i64::MAX,
            });
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Missing Authorization: Bearer token.".to_string())
    })?;
    verify_token(state, token)
}

fn jwt_secret(state: &AppState) -> AppResult<&str> {
    state.config.jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("JWT_SECRET is not configured.".to_string())
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")
        .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};

    use super::bearer_token;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Token abc"));
        assert_eq!(bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
