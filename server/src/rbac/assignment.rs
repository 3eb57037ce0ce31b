use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::db::models::{RoleAssignment, RoleScope};
use crate::db::{now, parse_client_timestamp, timestamp, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::refs::{self, ObjectKind, ObjectRef, WireId};
use crate::rbac::store;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub role_id: String,
    pub user_id: i64,
    /// Defaults to the role's own scope
    pub scope_type: Option<RoleScope>,
    pub scope_id: Option<WireId>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentFilter {
    pub user_id: Option<i64>,
    pub role_id: Option<String>,
    pub scope_type: Option<RoleScope>,
    pub scope_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentListResponse {
    pub assignments: Vec<RoleAssignment>,
}

/// Check that `(scope_type, scope_id)` is a valid place to use a role of
/// `role_scope`. GLOBAL roles may be used at any level.
pub fn validate_scope(
    role_scope: RoleScope,
    scope_type: RoleScope,
    scope_id: Option<&str>,
) -> Result<Option<ObjectRef>, ApiError> {
    if role_scope != RoleScope::Global && role_scope != scope_type {
        return Err(ApiError::validation(format!(
            "A {} role cannot be assigned at {} scope",
            role_scope, scope_type
        )));
    }
    match (ObjectKind::from_role_scope(scope_type), scope_id) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(ApiError::validation("GLOBAL assignments must not carry a scope_id")),
        (Some(_), None) => Err(ApiError::validation(format!("scope_id is required for {} scope", scope_type))),
        (Some(kind), Some(id)) if id.is_empty() => Err(ApiError::validation(format!(
            "scope_id is required for {} scope",
            kind
        ))),
        (Some(kind), Some(id)) => Ok(Some(ObjectRef::new(kind, id))),
    }
}

fn find_assignment(conn: &Connection, id: &str) -> Result<Option<RoleAssignment>, ApiError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM role_assignments WHERE id = ?1", RoleAssignment::COLUMNS),
            [id],
            RoleAssignment::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Grant every default role of `scope` to a new member of `scope_id`.
/// Runs inside the caller's membership transaction.
pub fn assign_default_roles(
    conn: &Connection,
    user_id: i64,
    scope: RoleScope,
    scope_id: &str,
) -> Result<usize, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM roles WHERE scope = ?1 AND is_default = 1 AND (scope_id IS NULL OR scope_id = ?2)",
    )?;
    let role_ids = stmt
        .query_map(params![scope, scope_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let ts = now();
    let mut granted = 0;
    for role_id in role_ids {
        granted += conn.execute(
            "INSERT OR IGNORE INTO role_assignments (id, role_id, user_id, scope_type, scope_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            params![Uuid::now_v7().to_string(), role_id, user_id, scope, scope_id, ts],
        )?;
    }
    if granted > 0 {
        tracing::debug!("Granted {} default {} role(s) to user {} in {}", granted, scope, user_id, scope_id);
    }
    Ok(granted)
}

/// POST /api/role-assignments - Assign a role to a user within a scope (staff only).
pub async fn assign_role(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<AssignRoleRequest>,
) -> ApiResult<(StatusCode, Json<RoleAssignment>)> {
    let assignment = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;

        let role = store::find_role(conn, &req.role_id)?
            .ok_or_else(|| ApiError::not_found("Role not found"))?;
        accounts::require_user(conn, req.user_id)?;

        let scope_type = req.scope_type.unwrap_or(role.scope);
        let scope_id = match (&req.scope_id, &role.scope_id) {
            (None, Some(owner)) => Some(owner.clone()),
            (requested, _) => requested.as_ref().map(WireId::as_string),
        };
        if let Some(object) = validate_scope(role.scope, scope_type, scope_id.as_deref())? {
            refs::require_object(conn, &object)?;
        }
        if role.scope_id.is_some() && role.scope_id != scope_id {
            return Err(ApiError::validation("Role belongs to another scope"));
        }

        let expires_at = match req.expires_at.as_deref() {
            Some(raw) => Some(timestamp(
                parse_client_timestamp(raw).ok_or_else(|| ApiError::validation("Invalid expires_at timestamp"))?,
            )),
            None => None,
        };

        let duplicate: i64 = conn.query_row(
            "SELECT COUNT(*) FROM role_assignments
             WHERE role_id = ?1 AND user_id = ?2 AND scope_type = ?3 AND COALESCE(scope_id, '') = COALESCE(?4, '')",
            params![role.id, req.user_id, scope_type, scope_id],
            |row| row.get(0),
        )?;
        if duplicate > 0 {
            return Err(ApiError::validation("Role is already assigned to this user in this scope"));
        }

        let id = Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO role_assignments (id, role_id, user_id, scope_type, scope_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, role.id, req.user_id, scope_type, scope_id, expires_at, now()],
        )?;
        find_assignment(conn, &id)?.ok_or_else(|| ApiError::Internal("assignment vanished".into()))
    })
    .await?;

    tracing::info!(
        "Role {} assigned to user {} at {}:{} by {}",
        assignment.role_id,
        assignment.user_id,
        assignment.scope_type,
        assignment.scope_id.as_deref().unwrap_or("-"),
        caller.user_id
    );
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// GET /api/role-assignments - List assignments, optionally filtered (staff only).
pub async fn list_assignments(
    State(state): State<AppState>,
    caller: Caller,
    Query(filter): Query<AssignmentFilter>,
) -> ApiResult<Json<AssignmentListResponse>> {
    let assignments = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM role_assignments
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR role_id = ?2)
               AND (?3 IS NULL OR scope_type = ?3)
               AND (?4 IS NULL OR scope_id = ?4)
             ORDER BY created_at",
            RoleAssignment::COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![filter.user_id, filter.role_id, filter.scope_type, filter.scope_id],
                RoleAssignment::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await?;

    Ok(Json(AssignmentListResponse { assignments }))
}

/// DELETE /api/role-assignments/{id} - Revoke an assignment (staff only).
pub async fn revoke_assignment(
    State(state): State<AppState>,
    caller: Caller,
    Path(assignment_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = assignment_id.clone();
    with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let removed = conn.execute("DELETE FROM role_assignments WHERE id = ?1", [&id])?;
        if removed == 0 {
            return Err(ApiError::not_found("Role assignment not found"));
        }
        Ok(())
    })
    .await?;

    tracing::info!("Role assignment {} revoked by {}", assignment_id, caller.user_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    #[test]
    fn test_validate_scope() {
        assert!(validate_scope(RoleScope::Global, RoleScope::Global, None).unwrap().is_none());
        assert!(validate_scope(RoleScope::Global, RoleScope::Global, Some("x")).is_err());
        assert!(validate_scope(RoleScope::Channel, RoleScope::Group, Some("g")).is_err());
        assert!(validate_scope(RoleScope::Channel, RoleScope::Channel, None).is_err());

        let object = validate_scope(RoleScope::Global, RoleScope::Channel, Some("ch")).unwrap().unwrap();
        assert_eq!(object, ObjectRef::new(ObjectKind::Channel, "ch"));
    }

    #[test]
    fn test_assign_default_roles_once() {
        let conn = init_memory_db().unwrap();
        let ts = now();
        conn.execute(
            "INSERT INTO users (id, username, created_at, updated_at) VALUES (5, 'u', ?1, ?1)",
            [&ts],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO roles (id, name, scope, is_default, created_at, updated_at)
             VALUES ('member', 'Member', 'GROUP', 1, ?1, ?1), ('mod', 'Moderator', 'GROUP', 0, ?1, ?1)",
            [&ts],
        )
        .unwrap();

        assert_eq!(assign_default_roles(&conn, 5, RoleScope::Group, "g1").unwrap(), 1);
        assert_eq!(assign_default_roles(&conn, 5, RoleScope::Group, "g1").unwrap(), 0);
        assert_eq!(assign_default_roles(&conn, 5, RoleScope::Channel, "c1").unwrap(), 0);
    }
}
