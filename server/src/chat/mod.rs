//! Conversations: direct-message requests, group/channel/thread rooms,
//! memberships, per-room settings, and the send rules built on them.

pub mod conversations;
pub mod last_message;
pub mod members;
pub mod policy;
pub mod requests;
pub mod settings;
pub mod threads;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::models::{Conversation, ConversationMember, ConversationSettings};
use crate::error::ApiError;

/// Conversation with its settings and active members, as returned by the
/// create and detail endpoints.
#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub settings: ConversationSettings,
    pub members: Vec<ConversationMember>,
}

pub fn find_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>, ApiError> {
    let conversation = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", Conversation::COLUMNS),
            [id],
            Conversation::from_row,
        )
        .optional()?;
    Ok(conversation)
}

pub fn require_conversation(conn: &Connection, id: &str) -> Result<Conversation, ApiError> {
    find_conversation(conn, id)?.ok_or_else(|| ApiError::not_found("Conversation not found"))
}

/// Membership row regardless of state.
pub fn find_member(conn: &Connection, conversation_id: &str, user_id: i64) -> Result<Option<ConversationMember>, ApiError> {
    let member = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                ConversationMember::COLUMNS
            ),
            params![conversation_id, user_id],
            ConversationMember::from_row,
        )
        .optional()?;
    Ok(member)
}

/// Joined, not left, not blocked.
pub fn active_member(conn: &Connection, conversation_id: &str, user_id: i64) -> Result<Option<ConversationMember>, ApiError> {
    Ok(find_member(conn, conversation_id, user_id)?.filter(|m| m.is_active() && !m.is_blocked))
}

pub fn require_active_member(conn: &Connection, conversation_id: &str, user_id: i64) -> Result<ConversationMember, ApiError> {
    active_member(conn, conversation_id, user_id)?
        .ok_or_else(|| ApiError::forbidden("You are not a member of this conversation"))
}

pub fn active_members(conn: &Connection, conversation_id: &str) -> Result<Vec<ConversationMember>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM conversation_members
         WHERE conversation_id = ?1 AND left_at IS NULL
         ORDER BY joined_at, id",
        ConversationMember::COLUMNS
    ))?;
    let members = stmt
        .query_map([conversation_id], ConversationMember::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

pub fn load_settings(conn: &Connection, conversation_id: &str) -> Result<ConversationSettings, ApiError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM conversation_settings WHERE conversation_id = ?1",
            ConversationSettings::COLUMNS
        ),
        [conversation_id],
        ConversationSettings::from_row,
    )
    .optional()?
    .ok_or_else(|| ApiError::Internal(format!("conversation {} has no settings row", conversation_id)))
}

pub fn conversation_detail(conn: &Connection, conversation: Conversation) -> Result<ConversationDetail, ApiError> {
    let settings = load_settings(conn, &conversation.id)?;
    let members = active_members(conn, &conversation.id)?;
    Ok(ConversationDetail {
        conversation,
        settings,
        members,
    })
}

/// Archived rooms accept no further mutation.
pub fn ensure_not_archived(conversation: &Conversation) -> Result<(), ApiError> {
    if conversation.is_archived {
        Err(ApiError::validation("Conversation is archived"))
    } else {
        Ok(())
    }
}
