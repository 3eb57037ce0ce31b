//! Permission catalog: the set of known permission codes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::db::{models::Permission, now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreatePermissionRequest {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PermissionListResponse {
    pub permissions: Vec<Permission>,
}

/// Codes are dotted identifiers such as `chat.pin_message`.
pub fn validate_code(code: &str) -> Result<&str, ApiError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(ApiError::validation("Permission code cannot be empty"));
    }
    if code.len() > 100 || code.chars().any(|c| c.is_whitespace()) {
        return Err(ApiError::validation(format!("Invalid permission code '{}'", code)));
    }
    Ok(code)
}

fn category_of(code: &str) -> &str {
    code.split_once('.').map(|(prefix, _)| prefix).unwrap_or("")
}

pub fn find(conn: &Connection, code: &str) -> Result<Option<Permission>, ApiError> {
    let permission = conn
        .query_row(
            "SELECT code, description, category FROM permissions WHERE code = ?1",
            [code],
            |row| {
                Ok(Permission {
                    code: row.get(0)?,
                    description: row.get(1)?,
                    category: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(permission)
}

/// Register a code on first use. Existing entries are left untouched.
pub fn ensure(conn: &Connection, code: &str) -> Result<(), ApiError> {
    let code = validate_code(code)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO permissions (code, description, category, created_at) VALUES (?1, '', ?2, ?3)",
        params![code, category_of(code), now()],
    )?;
    if inserted > 0 {
        tracing::info!("Permission {} registered on first use", code);
    }
    Ok(())
}

/// GET /api/permissions - List the catalog (staff only).
pub async fn list_permissions(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<PermissionListResponse>> {
    let permissions = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let mut stmt = conn.prepare("SELECT code, description, category FROM permissions ORDER BY code")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Permission {
                    code: row.get(0)?,
                    description: row.get(1)?,
                    category: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await?;

    Ok(Json(PermissionListResponse { permissions }))
}

/// POST /api/permissions - Add a code to the catalog (staff only).
pub async fn create_permission(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreatePermissionRequest>,
) -> ApiResult<(StatusCode, Json<Permission>)> {
    let permission = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let code = validate_code(&req.code)?.to_string();
        if find(conn, &code)?.is_some() {
            return Err(ApiError::validation(format!("Permission '{}' already exists", code)));
        }
        let category = req
            .category
            .unwrap_or_else(|| category_of(&code).to_string());
        conn.execute(
            "INSERT INTO permissions (code, description, category, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![code, req.description, category, now()],
        )?;
        Ok(Permission {
            code,
            description: req.description,
            category,
        })
    })
    .await?;

    tracing::info!("Permission {} created by {}", permission.code, caller.user_id);
    Ok((StatusCode::CREATED, Json(permission)))
}

/// DELETE /api/permissions/{code} - Remove an unused code (staff only).
/// Codes still attached to a role are kept.
pub async fn delete_permission(
    State(state): State<AppState>,
    caller: Caller,
    Path(code): Path<String>,
) -> ApiResult<StatusCode> {
    with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        if find(conn, &code)?.is_none() {
            return Err(ApiError::not_found(format!("Permission '{}' not found", code)));
        }
        let used_by: i64 = conn.query_row(
            "SELECT COUNT(*) FROM role_permissions WHERE permission_code = ?1",
            [&code],
            |row| row.get(0),
        )?;
        if used_by > 0 {
            return Err(ApiError::validation(format!(
                "Permission '{}' is used by {} role(s)",
                code, used_by
            )));
        }
        conn.execute("DELETE FROM permissions WHERE code = ?1", [&code])?;
        Ok(())
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}
