//! Permission check endpoints: callers asking about themselves, and trusted
//! services asking about any user.

use axum::{extract::State, Json};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::auth::internal::InternalCaller;
use crate::auth::middleware::Caller;
use crate::chat::policy;
use crate::db::with_conn;
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::engine::{Decision, Reason};
use crate::rbac::permissions::{self, SEND_MESSAGE};
use crate::rbac::refs::{self, ObjectKind, ObjectRef, RefBody};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub permission: String,
    pub target: RefBody,
}

#[derive(Debug, Deserialize)]
pub struct InternalCheckRequest {
    pub user_id: i64,
    pub permission: String,
    pub target: RefBody,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub reason: Reason,
    pub permission: String,
    pub target: RefBody,
}

/// Full decision for `(user, permission, object)`. Sending in a
/// conversation also goes through the conversation's send rules.
pub fn decide(conn: &Connection, user_id: i64, object: &ObjectRef, permission: &str) -> Result<Decision, ApiError> {
    if !refs::object_exists(conn, object)? {
        return Err(ApiError::not_found(format!("{} '{}' not found", object.kind, object.id)));
    }
    if object.kind == ObjectKind::Conversation && permission == SEND_MESSAGE {
        return policy::check_send(conn, user_id, &object.id);
    }
    permissions::check_permission(conn, user_id, object, permission)
}

async fn run_check(state: &AppState, user_id: i64, permission: String, target: RefBody) -> ApiResult<CheckResponse> {
    let object = target.to_object()?;
    let permission = crate::rbac::catalog::validate_code(&permission)?.to_string();
    let perm = permission.clone();
    let decision = with_conn(&state.db, move |conn| decide(conn, user_id, &object, &perm)).await?;

    tracing::info!(
        "authz check user={} perm={} allowed={} reason={:?}",
        user_id,
        permission,
        decision.allowed,
        decision.reason
    );
    Ok(CheckResponse {
        allowed: decision.allowed,
        reason: decision.reason,
        permission,
        target,
    })
}

/// POST /api/authz/check - Would the caller be allowed `permission` on `target`?
pub async fn check_self(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CheckRequest>,
) -> ApiResult<Json<CheckResponse>> {
    Ok(Json(run_check(&state, caller.user_id, req.permission, req.target).await?))
}

/// POST /internal/authz/check - Decision for any user (trusted services only).
pub async fn check_internal(
    State(state): State<AppState>,
    _internal: InternalCaller,
    ApiJson(req): ApiJson<InternalCheckRequest>,
) -> ApiResult<Json<CheckResponse>> {
    Ok(Json(run_check(&state, req.user_id, req.permission, req.target).await?))
}
