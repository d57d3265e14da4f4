//! Bearer token authentication

use std::sync::Arc;

use axum::http::{header, HeaderMap};

use crate::error::AppError;

/// Verifies `Authorization: Bearer <token>` against the configured tokens
#[derive(Debug, Clone, Default)]
pub struct ApiTokenAuth {
    tokens: Arc<Vec<String>>,
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl ApiTokenAuth {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    /// Check the request headers.
    ///
    /// With no tokens configured every request is refused with a
    /// configuration error rather than let through.
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AppError> {
        if self.tokens.is_empty() {
            return Err(AppError::Config("no API tokens configured".to_string()));
        }

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;

        let valid = self
            .tokens
            .iter()
            .any(|expected| constant_time_eq(expected.as_bytes(), token.as_bytes()));

        if valid {
            Ok(())
        } else {
            Err(AppError::Unauthorized("invalid bearer token".to_string()))
        }
    }
}
