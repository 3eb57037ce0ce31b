//! Trusted endpoints used by the accounts service and the messaging gateway.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::auth::internal::InternalCaller;
use crate::auth::middleware::Claims;
use crate::db::{models::User, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;

use super::UserUpsert;

/// PUT /internal/users/{id} - Mirror an account from the accounts service.
pub async fn upsert_user(
    State(state): State<AppState>,
    _internal: InternalCaller,
    Path(user_id): Path<i64>,
    ApiJson(body): ApiJson<UserUpsert>,
) -> ApiResult<Json<User>> {
    let user = with_conn(&state.db, move |conn| super::upsert(conn, user_id, &body)).await?;
    tracing::info!("Mirrored account {} (staff={}, superuser={})", user.id, user.is_staff, user.is_superuser);
    Ok(Json(user))
}

#[derive(Debug, Serialize)]
pub struct IntrospectResponse {
    /// Decimal string, as carried in token subjects
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub is_staff: bool,
    pub is_superuser: bool,
}

impl From<User> for IntrospectResponse {
    fn from(user: User) -> Self {
        let display_name = if user.display_name.trim().is_empty() {
            user.username.clone()
        } else {
            user.display_name
        };
        IntrospectResponse {
            id: user.id.to_string(),
            username: user.username,
            display_name,
            is_staff: user.is_staff,
            is_superuser: user.is_superuser,
        }
    }
}

/// GET /internal/introspect - Resolve the bearer token forwarded by a
/// gateway to the mirrored account behind it.
pub async fn introspect(
    State(state): State<AppState>,
    _internal: InternalCaller,
    claims: Claims,
) -> ApiResult<Json<IntrospectResponse>> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| ApiError::Unauthorized("Token subject is not a user id".into()))?;
    let user = with_conn(&state.db, move |conn| super::require_caller(conn, user_id)).await?;
    Ok(Json(user.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_username() {
        let user = User {
            id: 42,
            username: "bea".into(),
            phone: None,
            display_name: " ".into(),
            is_superuser: false,
            is_staff: true,
            is_active: true,
        };
        let response = IntrospectResponse::from(user);
        assert_eq!(response.id, "42");
        assert_eq!(response.display_name, "bea");
        assert!(response.is_staff);
    }
}
