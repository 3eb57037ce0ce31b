//! Access control entries: per-principal allow/deny exceptions on a target.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::db::models::AceEffect;
use crate::db::{now, parse_client_timestamp, timestamp, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::catalog;
use crate::rbac::refs::{self, ObjectKind, ObjectRef, Principal, RefBody, Target};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAceRequest {
    #[serde(default)]
    pub principal: Option<RefBody>,
    #[serde(default)]
    pub target: Option<RefBody>,
    pub permissions: Vec<String>,
    #[serde(default = "default_effect")]
    pub effect: AceEffect,
    pub expires_at: Option<String>,
}

fn default_effect() -> AceEffect {
    AceEffect::Allow
}

#[derive(Debug, Serialize)]
pub struct AceResponse {
    pub id: String,
    pub principal: Option<RefBody>,
    pub target: Option<RefBody>,
    pub permissions: Vec<String>,
    pub effect: AceEffect,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct AceListResponse {
    pub aces: Vec<AceResponse>,
}

/// Trimmed, deduplicated, sorted. Empty entries are dropped.
pub fn normalize_permissions<S: AsRef<str>>(codes: &[S]) -> Vec<String> {
    let mut out: Vec<String> = codes
        .iter()
        .map(|c| c.as_ref().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

const ACE_COLUMNS: &str =
    "id, principal_type, principal_id, target_type, target_id, permissions, effect, expires_at, created_at, updated_at";

fn ace_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AceResponse> {
    let p_type: Option<String> = row.get(1)?;
    let p_id: Option<String> = row.get(2)?;
    let t_type: Option<String> = row.get(3)?;
    let t_id: Option<String> = row.get(4)?;
    let permissions: String = row.get(5)?;

    let principal = Principal::from_columns(p_type.as_deref(), p_id.as_deref())
        .unwrap_or(Principal::Public)
        .to_wire();
    let target = Target::from_columns(t_type.as_deref(), t_id.as_deref())
        .unwrap_or(Target::Global)
        .to_wire();

    Ok(AceResponse {
        id: row.get(0)?,
        principal,
        target,
        permissions: serde_json::from_str(&permissions).unwrap_or_default(),
        effect: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn find_ace(conn: &Connection, id: &str) -> Result<Option<AceResponse>, ApiError> {
    let ace = conn
        .query_row(
            &format!("SELECT {} FROM aces WHERE id = ?1", ACE_COLUMNS),
            [id],
            ace_from_row,
        )
        .optional()?;
    Ok(ace)
}

/// Referenced principals and targets must resolve through the registry.
fn validate_refs(conn: &Connection, principal: &Principal, target: &Target) -> Result<(), ApiError> {
    match principal {
        Principal::User(id) => refs::require_object(conn, &ObjectRef::new(ObjectKind::User, id.to_string()))?,
        Principal::Role(id) => refs::require_object(conn, &ObjectRef::new(ObjectKind::Role, id.clone()))?,
        Principal::Public => {}
    }
    if let Target::Object(object) = target {
        refs::require_object(conn, object)?;
    }
    Ok(())
}

/// POST /api/aces - Create an access control entry (staff only).
/// Body: { principal: {type, id} | null, target: {type, id} | null,
///         permissions: [codes], effect: ALLOW | DENY, expires_at }
pub async fn create_ace(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateAceRequest>,
) -> ApiResult<(StatusCode, Json<AceResponse>)> {
    let ace = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;

        let principal = Principal::from_wire(req.principal.as_ref())?;
        let target = Target::from_wire(req.target.as_ref())?;
        let permissions = normalize_permissions(&req.permissions);
        if permissions.is_empty() {
            return Err(ApiError::validation("permissions must contain at least one code"));
        }
        for code in &permissions {
            catalog::validate_code(code)?;
        }
        let expires_at = match req.expires_at.as_deref() {
            Some(raw) => Some(timestamp(
                parse_client_timestamp(raw).ok_or_else(|| ApiError::validation("Invalid expires_at timestamp"))?,
            )),
            None => None,
        };

        let tx = conn.transaction()?;
        validate_refs(&tx, &principal, &target)?;
        for code in &permissions {
            catalog::ensure(&tx, code)?;
        }

        let id = Uuid::now_v7().to_string();
        let (p_type, p_id) = principal.to_columns();
        let (t_type, t_id) = target.to_columns();
        let ts = now();
        tx.execute(
            "INSERT INTO aces (id, principal_type, principal_id, target_type, target_id, permissions, effect, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                p_type,
                p_id,
                t_type,
                t_id,
                serde_json::to_string(&permissions)?,
                req.effect,
                expires_at,
                ts
            ],
        )?;
        let ace = find_ace(&tx, &id)?.ok_or_else(|| ApiError::Internal("ACE vanished".into()))?;
        tx.commit()?;
        Ok(ace)
    })
    .await?;

    tracing::info!("ACE {} ({}) {:?} created by {}", ace.id, ace.effect, ace.permissions, caller.user_id);
    Ok((StatusCode::CREATED, Json(ace)))
}

/// GET /api/aces - List all ACEs (staff only).
pub async fn list_aces(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<AceListResponse>> {
    let aces = with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM aces ORDER BY created_at", ACE_COLUMNS))?;
        let rows = stmt
            .query_map([], ace_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await?;
    Ok(Json(AceListResponse { aces }))
}

/// DELETE /api/aces/{id} - Remove an ACE (staff only).
pub async fn delete_ace(
    State(state): State<AppState>,
    caller: Caller,
    Path(ace_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = ace_id.clone();
    with_conn(&state.db, move |conn| {
        accounts::require_staff(conn, caller.user_id)?;
        if conn.execute("DELETE FROM aces WHERE id = ?1", [&id])? == 0 {
            return Err(ApiError::not_found("ACE not found"));
        }
        Ok(())
    })
    .await?;

    tracing::info!("ACE {} deleted by {}", ace_id, caller.user_id);
    Ok(StatusCode::NO_CONTENT)
}
