//! Joining and leaving groups. A group member is also a member of the
//! group's conversation.

use axum::{
    extract::{Path, State},
    Json,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::auth::middleware::Caller;
use crate::chat::members::{add_membership, leave};
use crate::chat::find_member;
use crate::db::models::{BaseRole, ConversationMember, Group, GroupMemberStatus, RoleScope};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiResult};
use crate::rbac::assignment::assign_default_roles;
use crate::rbac::ownable::Ownable;
use crate::state::AppState;

use super::{group_for_conversation, refresh_member_count, require_group};

fn member_status(conn: &Connection, group_id: &str, user_id: i64) -> Result<Option<GroupMemberStatus>, ApiError> {
    let status = conn
        .query_row(
            "SELECT status FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status)
}

/// Activate `user_id` in `group`, join the group conversation and grant the
/// default GROUP roles. Returns false when already an active member.
pub fn join_group(conn: &Connection, group: &Group, user_id: i64) -> Result<bool, ApiError> {
    if member_status(conn, &group.id, user_id)? == Some(GroupMemberStatus::Active) {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO group_members (group_id, user_id, status, joined_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(group_id, user_id) DO UPDATE SET status = excluded.status, joined_at = excluded.joined_at",
        params![group.id, user_id, GroupMemberStatus::Active, now()],
    )?;
    if let Some(conversation_id) = group.conversation_id.as_deref() {
        add_membership(conn, conversation_id, user_id, BaseRole::Member)?;
    }
    assign_default_roles(conn, user_id, RoleScope::Group, &group.id)?;
    refresh_member_count(conn, &group.id)?;
    Ok(true)
}

/// Mark the membership LEFT and leave the group conversation.
pub fn leave_group(conn: &Connection, group: &Group, user_id: i64) -> Result<bool, ApiError> {
    if member_status(conn, &group.id, user_id)? != Some(GroupMemberStatus::Active) {
        return Ok(false);
    }
    conn.execute(
        "UPDATE group_members SET status = ?1 WHERE group_id = ?2 AND user_id = ?3",
        params![GroupMemberStatus::Left, group.id, user_id],
    )?;
    if let Some(conversation_id) = group.conversation_id.as_deref() {
        if let Some(member) = find_member(conn, conversation_id, user_id)? {
            leave(conn, &member)?;
        }
    }
    refresh_member_count(conn, &group.id)?;
    Ok(true)
}

/// Leave a conversation, going through the group when the conversation
/// belongs to one so both memberships end together.
pub fn depart_conversation(conn: &Connection, member: &ConversationMember) -> Result<(), ApiError> {
    if let Some(group) = group_for_conversation(conn, &member.conversation_id)? {
        if group.is_owned_by(member.user_id) {
            return Err(ApiError::validation("The owner cannot leave the group"));
        }
        if leave_group(conn, &group, member.user_id)? {
            return Ok(());
        }
    }
    leave(conn, member)
}

/// POST /api/groups/{id}/join
pub async fn join(
    State(state): State<AppState>,
    caller: Caller,
    Path(group_id): Path<String>,
) -> ApiResult<Json<Group>> {
    let (joined, group) = with_conn(&state.db, move |conn| {
        crate::accounts::require_caller(conn, caller.user_id)?;
        let group = require_group(conn, &group_id)?;
        if group.is_archived {
            return Err(ApiError::validation("Group is archived"));
        }
        let tx = conn.transaction()?;
        let joined = join_group(&tx, &group, caller.user_id)?;
        let group = require_group(&tx, &group.id)?;
        tx.commit()?;
        Ok((joined, group))
    })
    .await?;

    if joined {
        tracing::info!("User {} joined group {} ({} members)", caller.user_id, group.id, group.member_count);
    }
    Ok(Json(group))
}

/// POST /api/groups/{id}/leave - The owner cannot leave their own group.
pub async fn leave_group_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(group_id): Path<String>,
) -> ApiResult<Json<Group>> {
    let group = with_conn(&state.db, move |conn| {
        let group = require_group(conn, &group_id)?;
        if group.is_owned_by(caller.user_id) {
            return Err(ApiError::validation("The owner cannot leave the group"));
        }
        let tx = conn.transaction()?;
        if !leave_group(&tx, &group, caller.user_id)? {
            return Err(ApiError::validation("You are not a member of this group"));
        }
        let group = require_group(&tx, &group.id)?;
        tx.commit()?;
        Ok(group)
    })
    .await?;

    tracing::info!("User {} left group {} ({} members)", caller.user_id, group.id, group.member_count);
    Ok(Json(group))
}
