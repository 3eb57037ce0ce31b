use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::db::models::{Role, RoleScope};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::patch::double_option;
use crate::rbac::{catalog, store};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub id: String,
    pub name: String,
    pub scope: RoleScope,
    pub scope_id: Option<String>,
    pub description: String,
    pub parent_role: Option<String>,
    pub is_default: bool,
    /// Codes attached to this role directly
    pub permissions: Vec<String>,
    /// Own codes plus every ancestor's
    pub effective_permissions: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct RoleListResponse {
    pub roles: Vec<RoleResponse>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default = "default_scope")]
    pub scope: RoleScope,
    #[serde(default)]
    pub description: String,
    pub parent_role: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn default_scope() -> RoleScope {
    RoleScope::Global
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub parent_role: Option<Option<String>>,
    pub is_default: Option<bool>,
    /// Replaces the role's own permission set
    pub permissions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AddPermissionsRequest {
    pub permissions: Vec<String>,
}

pub fn role_response(conn: &Connection, role: Role) -> Result<RoleResponse, ApiError> {
    let permissions = store::own_permissions(conn, &role.id)?;
    let effective_permissions = store::effective_permissions(conn, &role.id)?
        .into_iter()
        .collect();
    Ok(RoleResponse {
        id: role.id,
        name: role.name,
        scope: role.scope,
        scope_id: role.scope_id,
        description: role.description,
        parent_role: role.parent_role_id,
        is_default: role.is_default,
        permissions,
        effective_permissions,
        created_at: role.created_at,
        updated_at: role.updated_at,
    })
}

pub(crate) fn require_role(conn: &Connection, role_id: &str) -> Result<Role, ApiError> {
    store::find_role(conn, role_id)?.ok_or_else(|| ApiError::not_found("Role not found"))
}

/// Names are unique per scope level, and per owning instance for local roles.
pub(crate) fn validate_name(
    conn: &Connection,
    name: &str,
    scope: RoleScope,
    scope_id: Option<&str>,
    except: Option<&str>,
) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Role name cannot be empty"));
    }
    let clash: i64 = conn.query_row(
        "SELECT COUNT(*) FROM roles
         WHERE name = ?1 AND scope = ?2 AND COALESCE(scope_id, '') = COALESCE(?3, '') AND id != COALESCE(?4, '')",
        params![name, scope, scope_id, except],
        |row| row.get(0),
    )?;
    if clash > 0 {
        return Err(ApiError::validation(format!(
            "A {} role named '{}' already exists",
            scope, name
        )));
    }
    Ok(name.to_string())
}

/// Attach codes to a role, registering unknown codes in the catalog.
pub(crate) fn add_permissions(conn: &Connection, role_id: &str, codes: &[String]) -> Result<(), ApiError> {
    for code in codes {
        catalog::ensure(conn, code)?;
        conn.execute(
            "INSERT OR IGNORE INTO role_permissions (role_id, permission_code) VALUES (?1, ?2)",
            params![role_id, code.trim()],
        )?;
    }
    Ok(())
}

/// GET /api/roles - List all roles with their permission sets (staff only).
pub async fn list_roles(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<RoleListResponse>> {
    let roles = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM roles ORDER BY scope, name",
            Role::COLUMNS
        ))?;
        let rows = stmt
            .query_map([], Role::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|role| role_response(conn, role))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;

    Ok(Json(RoleListResponse { roles }))
}

/// GET /api/roles/{id} - Role detail (staff only).
pub async fn get_role(
    State(state): State<AppState>,
    caller: Caller,
    Path(role_id): Path<String>,
) -> ApiResult<Json<RoleResponse>> {
    let role = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let role = require_role(conn, &role_id)?;
        role_response(conn, role)
    })
    .await?;
    Ok(Json(role))
}

/// POST /api/roles - Create a role (staff only).
pub async fn create_role(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateRoleRequest>,
) -> ApiResult<(StatusCode, Json<RoleResponse>)> {
    let role = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let name = validate_name(&tx, &req.name, req.scope, None, None)?;
        if let Some(parent) = req.parent_role.as_deref() {
            store::validate_parent(&tx, None, parent)?;
        }

        let role_id = Uuid::now_v7().to_string();
        let ts = now();
        tx.execute(
            "INSERT INTO roles (id, name, scope, description, parent_role_id, is_default, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![role_id, name, req.scope, req.description, req.parent_role, req.is_default, ts],
        )?;
        add_permissions(&tx, &role_id, &req.permissions)?;

        let role = role_response(&tx, require_role(&tx, &role_id)?)?;
        tx.commit()?;
        Ok(role)
    })
    .await?;

    tracing::info!("Role {} '{}' ({}) created by {}", role.id, role.name, role.scope, caller.user_id);
    Ok((StatusCode::CREATED, Json(role)))
}

/// PUT /api/roles/{id} - Update a role (staff only).
/// `permissions`, when present, replaces the role's own set.
pub async fn update_role(
    State(state): State<AppState>,
    caller: Caller,
    Path(role_id): Path<String>,
    ApiJson(req): ApiJson<UpdateRoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let role = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = require_role(&tx, &role_id)?;
        let ts = now();

        if let Some(name) = req.name.as_deref() {
            let name = validate_name(&tx, name, existing.scope, existing.scope_id.as_deref(), Some(&role_id))?;
            tx.execute(
                "UPDATE roles SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, ts, role_id],
            )?;
        }
        if let Some(description) = req.description.as_deref() {
            tx.execute(
                "UPDATE roles SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![description, ts, role_id],
            )?;
        }
        if let Some(parent) = req.parent_role {
            if let Some(parent_id) = parent.as_deref() {
                store::validate_parent(&tx, Some(&role_id), parent_id)?;
            }
            tx.execute(
                "UPDATE roles SET parent_role_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![parent, ts, role_id],
            )?;
        }
        if let Some(is_default) = req.is_default {
            tx.execute(
                "UPDATE roles SET is_default = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_default, ts, role_id],
            )?;
        }
        if let Some(permissions) = req.permissions.as_deref() {
            tx.execute("DELETE FROM role_permissions WHERE role_id = ?1", [&role_id])?;
            add_permissions(&tx, &role_id, permissions)?;
            tx.execute("UPDATE roles SET updated_at = ?1 WHERE id = ?2", params![ts, role_id])?;
        }

        let role = role_response(&tx, require_role(&tx, &role_id)?)?;
        tx.commit()?;
        Ok(role)
    })
    .await?;

    tracing::info!("Role {} updated by {}", role.id, caller.user_id);
    Ok(Json(role))
}

/// POST /api/roles/{id}/permissions - Attach more codes to a role (staff only).
pub async fn add_role_permissions(
    State(state): State<AppState>,
    caller: Caller,
    Path(role_id): Path<String>,
    ApiJson(req): ApiJson<AddPermissionsRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let role = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        if req.permissions.is_empty() {
            return Err(ApiError::validation("permissions must not be empty"));
        }
        let tx = conn.transaction()?;
        require_role(&tx, &role_id)?;
        add_permissions(&tx, &role_id, &req.permissions)?;
        tx.execute("UPDATE roles SET updated_at = ?1 WHERE id = ?2", params![now(), role_id])?;
        let role = role_response(&tx, require_role(&tx, &role_id)?)?;
        tx.commit()?;
        Ok(role)
    })
    .await?;
    Ok(Json(role))
}

/// DELETE /api/roles/{id} - Delete a role (staff only).
/// Assignments go with it; child roles and memberships lose the reference.
pub async fn delete_role(
    State(state): State<AppState>,
    caller: Caller,
    Path(role_id): Path<String>,
) -> ApiResult<StatusCode> {
    let rid = role_id.clone();
    with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let tx = conn.transaction()?;
        require_role(&tx, &rid)?;
        // ACEs name roles by opaque id, so they are not covered by foreign keys
        tx.execute(
            "DELETE FROM aces WHERE principal_type = ?1 AND principal_id = ?2",
            params![crate::rbac::refs::ObjectKind::Role.tag(), rid],
        )?;
        tx.execute("DELETE FROM roles WHERE id = ?1", [&rid])?;
        tx.commit()?;
        Ok(())
    })
    .await?;

    tracing::info!("Role {} deleted by {}", role_id, caller.user_id);
    Ok(StatusCode::NO_CONTENT)
}
