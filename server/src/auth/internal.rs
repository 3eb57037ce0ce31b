//! Guard for trusted service-to-service endpoints.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

pub const INTERNAL_AUTH_HEADER: &str = "X-Internal-Auth";

/// Hex SHA-256 digest used to compare internal tokens without keeping the
/// plaintext in shared state.
pub fn hash_internal_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Marker extractor: present only when the request is allowed to call
/// internal endpoints. With no token configured every caller is trusted.
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

impl<S> FromRequestParts<S> for InternalCaller
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let Some(expected) = state.internal_token_hash.as_deref() else {
            return Ok(InternalCaller);
        };

        let presented = parts
            .headers
            .get(INTERNAL_AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(hash_internal_token);

        if presented.as_deref() == Some(expected) {
            Ok(InternalCaller)
        } else {
            tracing::warn!("Rejected internal call without valid {}", INTERNAL_AUTH_HEADER);
            Err(ApiError::Unauthorized("Invalid internal credentials".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_hex() {
        let a = hash_internal_token("s3cret");
        assert_eq!(a, hash_internal_token("s3cret"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_internal_token("other"));
    }
}
