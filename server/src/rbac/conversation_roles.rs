//! Roles local to one conversation, managed by whoever holds
//! chat.set_settings there.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;
use uuid::Uuid;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::chat::{active_member, require_conversation};
use crate::db::models::{Conversation, Role, RoleAssignment, RoleScope};
use crate::db::{now, parse_client_timestamp, timestamp, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::permissions::{require_permission, SET_SETTINGS};
use crate::rbac::refs::ObjectRef;
use crate::rbac::roles::{add_permissions, role_response, validate_name, RoleListResponse, RoleResponse};
use crate::rbac::{catalog, store};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parent_role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    /// code -> granted; false takes the code off the role
    pub permissions: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize)]
pub struct AssignConversationRoleRequest {
    pub user_id: i64,
    pub expires_at: Option<String>,
}

fn require_manager(conn: &Connection, conversation_id: &str, user_id: i64) -> Result<Conversation, ApiError> {
    let conversation = require_conversation(conn, conversation_id)?;
    require_permission(conn, user_id, &ObjectRef::conversation(&conversation.id), SET_SETTINGS)?;
    Ok(conversation)
}

/// A role owned by this conversation; roles of other scopes read as missing.
fn require_local_role(conn: &Connection, conversation_id: &str, role_id: &str) -> Result<Role, ApiError> {
    store::find_role(conn, role_id)?
        .filter(|r| r.scope == RoleScope::Conversation && r.scope_id.as_deref() == Some(conversation_id))
        .ok_or_else(|| ApiError::not_found("Role not found"))
}

/// GET /api/conversations/{id}/roles
pub async fn list_conversation_roles(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<RoleListResponse>> {
    let roles = with_conn(&state.db, move |conn| {
        let conversation = require_manager(conn, &conversation_id, caller.user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM roles WHERE scope = ?1 AND scope_id = ?2 ORDER BY name",
            Role::COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![RoleScope::Conversation, conversation.id], Role::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|role| role_response(conn, role))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;
    Ok(Json(RoleListResponse { roles }))
}

/// POST /api/conversations/{id}/roles - Create a role local to the conversation.
pub async fn create_conversation_role(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
    ApiJson(req): ApiJson<CreateConversationRoleRequest>,
) -> ApiResult<(StatusCode, Json<RoleResponse>)> {
    let role = with_conn(&state.db, move |conn| {
        let conversation = require_manager(conn, &conversation_id, caller.user_id)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let name = validate_name(&tx, &req.name, RoleScope::Conversation, Some(&conversation.id), None)?;
        if let Some(parent) = req.parent_role.as_deref() {
            store::validate_parent(&tx, None, parent)?;
        }

        let role_id = Uuid::now_v7().to_string();
        let ts = now();
        tx.execute(
            "INSERT INTO roles (id, name, scope, scope_id, description, parent_role_id, is_default, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![role_id, name, RoleScope::Conversation, conversation.id, req.description, req.parent_role, ts],
        )?;
        add_permissions(&tx, &role_id, &req.permissions)?;

        let role = require_local_role(&tx, &conversation.id, &role_id)?;
        let role = role_response(&tx, role)?;
        tx.commit()?;
        Ok(role)
    })
    .await?;

    tracing::info!(
        "Conversation role {} '{}' created in {} by {}",
        role.id,
        role.name,
        role.scope_id.as_deref().unwrap_or("-"),
        caller.user_id
    );
    Ok((StatusCode::CREATED, Json(role)))
}

/// POST /api/conversations/{id}/roles/{role_id}/permissions - Grant or withdraw codes.
pub async fn set_conversation_role_permissions(
    State(state): State<AppState>,
    caller: Caller,
    Path((conversation_id, role_id)): Path<(String, String)>,
    ApiJson(req): ApiJson<SetPermissionsRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let role = with_conn(&state.db, move |conn| {
        let conversation = require_manager(conn, &conversation_id, caller.user_id)?;
        let tx = conn.transaction()?;
        let role = require_local_role(&tx, &conversation.id, &role_id)?;

        for (code, granted) in &req.permissions {
            let code = catalog::validate_code(code)?;
            if *granted {
                add_permissions(&tx, &role.id, &[code.to_string()])?;
            } else {
                tx.execute(
                    "DELETE FROM role_permissions WHERE role_id = ?1 AND permission_code = ?2",
                    params![role.id, code],
                )?;
            }
        }
        tx.execute("UPDATE roles SET updated_at = ?1 WHERE id = ?2", params![now(), role.id])?;

        let role = role_response(&tx, require_local_role(&tx, &conversation.id, &role_id)?)?;
        tx.commit()?;
        Ok(role)
    })
    .await?;

    tracing::info!("Permissions of conversation role {} changed by {}", role.id, caller.user_id);
    Ok(Json(role))
}

/// POST /api/conversations/{id}/roles/{role_id}/assign - Give the role to an active member.
/// 201 for a new assignment, 200 when the member already holds it.
pub async fn assign_conversation_role(
    State(state): State<AppState>,
    caller: Caller,
    Path((conversation_id, role_id)): Path<(String, String)>,
    ApiJson(req): ApiJson<AssignConversationRoleRequest>,
) -> ApiResult<(StatusCode, Json<RoleAssignment>)> {
    let (created, assignment) = with_conn(&state.db, move |conn| {
        let conversation = require_manager(conn, &conversation_id, caller.user_id)?;
        let role = require_local_role(conn, &conversation.id, &role_id)?;
        accounts::require_user(conn, req.user_id)?;
        if active_member(conn, &conversation.id, req.user_id)?.is_none() {
            return Err(ApiError::validation("User is not a member of this conversation"));
        }

        let expires_at = match req.expires_at.as_deref() {
            Some(raw) => Some(timestamp(
                parse_client_timestamp(raw).ok_or_else(|| ApiError::validation("Invalid expires_at timestamp"))?,
            )),
            None => None,
        };

        let find = |conn: &Connection| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM role_assignments
                     WHERE role_id = ?1 AND user_id = ?2 AND scope_type = ?3 AND scope_id = ?4",
                    RoleAssignment::COLUMNS
                ),
                params![role.id, req.user_id, RoleScope::Conversation, conversation.id],
                RoleAssignment::from_row,
            )
            .optional()
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = find(&tx)? {
            tx.execute(
                "UPDATE role_assignments SET expires_at = ?1 WHERE id = ?2",
                params![expires_at, existing.id],
            )?;
            let updated = find(&tx)?.ok_or_else(|| ApiError::Internal("assignment vanished".into()))?;
            tx.commit()?;
            return Ok((false, updated));
        }
        tx.execute(
            "INSERT INTO role_assignments (id, role_id, user_id, scope_type, scope_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::now_v7().to_string(),
                role.id,
                req.user_id,
                RoleScope::Conversation,
                conversation.id,
                expires_at,
                now()
            ],
        )?;
        let assignment = find(&tx)?.ok_or_else(|| ApiError::Internal("assignment vanished".into()))?;
        tx.commit()?;
        Ok((true, assignment))
    })
    .await?;

    if created {
        tracing::info!(
            "Conversation role {} assigned to user {} by {}",
            assignment.role_id,
            assignment.user_id,
            caller.user_id
        );
        Ok((StatusCode::CREATED, Json(assignment)))
    } else {
        Ok((StatusCode::OK, Json(assignment)))
    }
}
