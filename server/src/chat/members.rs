//! Conversation membership: joining, leaving, per-member preferences and
//! role changes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection};
use serde::Deserialize;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::db::models::{BaseRole, ConversationMember, ConversationType, NotificationLevel, RoleScope};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::patch::double_option;
use crate::rbac::assignment::assign_default_roles;
use crate::rbac::permissions::{require_permission, ADD_MEMBER, MANAGE_ROLES, REMOVE_MEMBER};
use crate::rbac::refs::ObjectRef;
use crate::rbac::store;
use crate::scopes::membership::depart_conversation;
use crate::state::AppState;

use super::{active_member, active_members, ensure_not_archived, find_member, require_active_member, require_conversation};

/// Get-or-create the membership of `user_id`. A left member is re-activated
/// with the given base role; an active member is returned unchanged.
/// The bool is true when the user (re)joined.
pub fn add_membership(
    conn: &Connection,
    conversation_id: &str,
    user_id: i64,
    base_role: BaseRole,
) -> Result<(ConversationMember, bool), ApiError> {
    match find_member(conn, conversation_id, user_id)? {
        Some(existing) if existing.is_active() => return Ok((existing, false)),
        Some(existing) => {
            conn.execute(
                "UPDATE conversation_members SET left_at = NULL, base_role = ?1 WHERE id = ?2",
                params![base_role, existing.id],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO conversation_members (conversation_id, user_id, base_role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id, user_id, base_role, now()],
            )?;
        }
    }
    assign_default_roles(conn, user_id, RoleScope::Conversation, conversation_id)?;

    let member = find_member(conn, conversation_id, user_id)?
        .ok_or_else(|| ApiError::Internal("membership vanished".into()))?;
    Ok((member, true))
}

/// Soft-leave: the row stays with `left_at` set.
pub fn leave(conn: &Connection, member: &ConversationMember) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE conversation_members SET left_at = ?1 WHERE id = ?2 AND left_at IS NULL",
        params![now(), member.id],
    )?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
    #[serde(default = "default_base_role")]
    pub base_role: BaseRole,
}

fn default_base_role() -> BaseRole {
    BaseRole::Member
}

/// POST /api/conversations/{id}/members - Add (or re-add) a member.
/// Requires an active membership and chat.add_member.
pub async fn add_member(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
    ApiJson(req): ApiJson<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<ConversationMember>)> {
    let (member, joined) = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        ensure_not_archived(&conversation)?;
        if conversation.kind == ConversationType::Direct {
            return Err(ApiError::validation("Direct conversations cannot take more members"));
        }
        require_active_member(conn, &conversation.id, caller.user_id)?;
        require_permission(conn, caller.user_id, &ObjectRef::conversation(&conversation.id), ADD_MEMBER)?;
        if req.base_role == BaseRole::Owner {
            return Err(ApiError::validation("The owner role cannot be granted"));
        }
        accounts::require_user(conn, req.user_id)?;

        let tx = conn.transaction()?;
        let result = add_membership(&tx, &conversation.id, req.user_id, req.base_role)?;
        tx.commit()?;
        Ok(result)
    })
    .await?;

    if joined {
        tracing::info!(
            "User {} added to conversation {} as {} by {}",
            member.user_id,
            member.conversation_id,
            member.base_role,
            caller.user_id
        );
        Ok((StatusCode::CREATED, Json(member)))
    } else {
        Ok((StatusCode::OK, Json(member)))
    }
}

/// GET /api/conversations/{id}/members - Active members (members only).
pub async fn list_members(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Vec<ConversationMember>>> {
    let members = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        active_members(conn, &conversation.id)
    })
    .await?;
    Ok(Json(members))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub notification_level: Option<NotificationLevel>,
    pub is_muted: Option<bool>,
}

/// PATCH /api/conversations/{id}/members/me - Update the caller's own preferences.
pub async fn update_my_preferences(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
    ApiJson(req): ApiJson<UpdatePreferencesRequest>,
) -> ApiResult<Json<ConversationMember>> {
    let member = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        let member = require_active_member(conn, &conversation.id, caller.user_id)?;

        let display_name = req.display_name.as_deref().map(str::trim).unwrap_or(&member.display_name);
        if display_name.chars().count() > 64 {
            return Err(ApiError::validation("display_name is limited to 64 characters"));
        }
        let color = req.color.as_deref().map(str::trim).unwrap_or(&member.color);
        if color.chars().count() > 16 {
            return Err(ApiError::validation("color is limited to 16 characters"));
        }
        conn.execute(
            "UPDATE conversation_members
             SET display_name = ?1, color = ?2, notification_level = ?3, is_muted = ?4
             WHERE id = ?5",
            params![
                display_name,
                color,
                req.notification_level.unwrap_or(member.notification_level),
                req.is_muted.unwrap_or(member.is_muted),
                member.id
            ],
        )?;
        find_member(conn, &conversation.id, caller.user_id)?
            .ok_or_else(|| ApiError::Internal("membership vanished".into()))
    })
    .await?;
    Ok(Json(member))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub base_role: Option<BaseRole>,
    /// Fine-grained CONVERSATION-scope role; null clears it
    #[serde(default, deserialize_with = "double_option")]
    pub role_id: Option<Option<String>>,
}

/// PATCH /api/conversations/{id}/members/{user_id} - Change a member's roles.
/// Requires chat.manage_roles. Ownership cannot be granted or taken away.
pub async fn update_member(
    State(state): State<AppState>,
    caller: Caller,
    Path((conversation_id, user_id)): Path<(String, i64)>,
    ApiJson(req): ApiJson<UpdateMemberRequest>,
) -> ApiResult<Json<ConversationMember>> {
    let member = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        ensure_not_archived(&conversation)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        require_permission(conn, caller.user_id, &ObjectRef::conversation(&conversation.id), MANAGE_ROLES)?;

        let target = active_member(conn, &conversation.id, user_id)?
            .ok_or_else(|| ApiError::not_found("Member not found"))?;

        if let Some(base_role) = req.base_role {
            if base_role == BaseRole::Owner || target.base_role == BaseRole::Owner {
                return Err(ApiError::validation("The owner role cannot be granted or changed"));
            }
            conn.execute(
                "UPDATE conversation_members SET base_role = ?1 WHERE id = ?2",
                params![base_role, target.id],
            )?;
        }

        if let Some(role_id) = req.role_id {
            if let Some(id) = role_id.as_deref() {
                let role = store::find_role(conn, id)?
                    .ok_or_else(|| ApiError::validation(format!("Role '{}' does not exist", id)))?;
                if role.scope != RoleScope::Conversation {
                    return Err(ApiError::validation("Only CONVERSATION roles can be attached to a member"));
                }
                if role.scope_id.as_deref().is_some_and(|owner| owner != conversation.id) {
                    return Err(ApiError::validation("Role belongs to another conversation"));
                }
            }
            conn.execute(
                "UPDATE conversation_members SET role_id = ?1 WHERE id = ?2",
                params![role_id, target.id],
            )?;
        }

        find_member(conn, &conversation.id, user_id)?
            .ok_or_else(|| ApiError::Internal("membership vanished".into()))
    })
    .await?;

    tracing::info!(
        "Member {} of {} now {} (role {:?}), changed by {}",
        member.user_id,
        member.conversation_id,
        member.base_role,
        member.role_id,
        caller.user_id
    );
    Ok(Json(member))
}

/// DELETE /api/conversations/{id}/members/{user_id} - Remove a member.
/// Removing yourself is leaving; removing others needs chat.remove_member
/// and is refused in direct conversations.
pub async fn remove_member(
    State(state): State<AppState>,
    caller: Caller,
    Path((conversation_id, user_id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        let me = require_active_member(conn, &conversation.id, caller.user_id)?;
        if user_id == caller.user_id {
            let tx = conn.transaction()?;
            depart_conversation(&tx, &me)?;
            tx.commit()?;
            return Ok(());
        }
        if conversation.kind == ConversationType::Direct {
            return Err(ApiError::validation("Members of a direct conversation can only leave it themselves"));
        }

        require_permission(conn, caller.user_id, &ObjectRef::conversation(&conversation.id), REMOVE_MEMBER)?;
        let target = active_member(conn, &conversation.id, user_id)?
            .ok_or_else(|| ApiError::not_found("Member not found"))?;
        if target.base_role == BaseRole::Owner {
            return Err(ApiError::validation("The owner cannot be removed"));
        }
        let tx = conn.transaction()?;
        depart_conversation(&tx, &target)?;
        tx.commit()?;
        Ok(())
    })
    .await?;

    tracing::info!("User {} removed from conversation by {}", user_id, caller.user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/conversations/{id}/leave - Leave a conversation (and its group, if any).
pub async fn leave_conversation(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<StatusCode> {
    let cid = conversation_id.clone();
    with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &cid)?;
        let me = require_active_member(conn, &conversation.id, caller.user_id)?;
        let tx = conn.transaction()?;
        depart_conversation(&tx, &me)?;
        tx.commit()?;
        Ok(())
    })
    .await?;

    tracing::info!("User {} left conversation {}", caller.user_id, conversation_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{upsert, UserUpsert};
    use crate::chat::conversations::{create_conversation_record, NewConversation};
    use crate::db::init_memory_db;

    fn setup() -> (Connection, String) {
        let conn = init_memory_db().unwrap();
        for id in [1, 2] {
            upsert(&conn, id, &UserUpsert { is_active: true, ..Default::default() }).unwrap();
        }
        let conversation = create_conversation_record(
            &conn,
            NewConversation {
                kind: ConversationType::Group,
                title: "Team".into(),
                description: String::new(),
                avatar_url: String::new(),
                created_by: 1,
                request: None,
            },
        )
        .unwrap();
        (conn, conversation.id)
    }

    #[test]
    fn test_add_membership_is_get_or_create() {
        let (conn, cid) = setup();
        let (first, joined) = add_membership(&conn, &cid, 2, BaseRole::Member).unwrap();
        assert!(joined);
        let (second, joined_again) = add_membership(&conn, &cid, 2, BaseRole::Admin).unwrap();
        assert!(!joined_again);
        assert_eq!(first.id, second.id);
        assert_eq!(second.base_role, BaseRole::Member);
    }

    #[test]
    fn test_rejoin_reuses_row_and_resets_role() {
        let (conn, cid) = setup();
        let (member, _) = add_membership(&conn, &cid, 2, BaseRole::Admin).unwrap();
        leave(&conn, &member).unwrap();
        assert!(active_member(&conn, &cid, 2).unwrap().is_none());

        let (rejoined, joined) = add_membership(&conn, &cid, 2, BaseRole::Readonly).unwrap();
        assert!(joined);
        assert_eq!(rejoined.id, member.id);
        assert!(rejoined.is_active());
        assert_eq!(rejoined.base_role, BaseRole::Readonly);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversation_members WHERE conversation_id = ?1", [&cid], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
