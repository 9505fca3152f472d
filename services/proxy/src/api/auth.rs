//! Bearer token check for the protected monitoring endpoints.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header::AUTHORIZATION, HeaderMap};

use super::error::ApiError;
use super::ApiState;

/// Proof that the request carried the configured bearer token.
#[derive(Debug, Clone, Copy)]
pub struct Authorized;

impl FromRequestParts<ApiState> for Authorized {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        check_bearer(&parts.headers, &state.token)
    }
}

pub fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<Authorized, ApiError> {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err(ApiError::unauthorized(
            "missing_authorization",
            "Authorization header is required",
        ));
    };

    let Some(token) = value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        ));
    };

    if !constant_time_eq(token.trim().as_bytes(), expected.as_bytes()) {
        return Err(ApiError::unauthorized("invalid_token", "Bearer token is not valid"));
    }

    Ok(Authorized)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
