//! Sub-rooms hanging off a message in a parent conversation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;

use crate::auth::middleware::Caller;
use crate::db::models::{BaseRole, ConversationType, SubroomPolicy, ThreadLink};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::permissions::{require_permission, CREATE_SUBROOM};
use crate::rbac::refs::ObjectRef;
use crate::state::AppState;

use super::conversations::{create_conversation_record, NewConversation};
use super::members::add_membership;
use super::{ensure_not_archived, find_conversation, load_settings, require_active_member, require_conversation};

const MAX_MESSAGE_KEY_LEN: usize = 255;

fn query_link(conn: &Connection, filter: &str, value: &dyn rusqlite::ToSql) -> Result<Option<ThreadLink>, ApiError> {
    let link = conn
        .query_row(
            &format!("SELECT {} FROM thread_links WHERE {} = ?1", ThreadLink::COLUMNS, filter),
            [value],
            ThreadLink::from_row,
        )
        .optional()?;
    Ok(link)
}

pub fn find_link(conn: &Connection, id: i64) -> Result<Option<ThreadLink>, ApiError> {
    query_link(conn, "id", &id)
}

/// The link that made `conversation_id` a thread, if it is one.
pub fn link_for_child(conn: &Connection, conversation_id: &str) -> Result<Option<ThreadLink>, ApiError> {
    query_link(conn, "child_conversation_id", &conversation_id)
}

fn find_by_message(conn: &Connection, parent: &str, message_key: &str) -> Result<Option<ThreadLink>, ApiError> {
    let link = conn
        .query_row(
            &format!(
                "SELECT {} FROM thread_links WHERE parent_conversation_id = ?1 AND parent_message_key = ?2",
                ThreadLink::COLUMNS
            ),
            params![parent, message_key],
            ThreadLink::from_row,
        )
        .optional()?;
    Ok(link)
}

/// Is `conversation_id` on the chain of rooms above `start`, `start` included?
fn is_ancestor(conn: &Connection, start: &str, conversation_id: &str) -> Result<bool, ApiError> {
    let mut seen = HashSet::new();
    let mut current = start.to_string();
    loop {
        if current == conversation_id {
            return Ok(true);
        }
        if !seen.insert(current.clone()) {
            return Ok(false);
        }
        match link_for_child(conn, &current)? {
            Some(link) => current = link.parent_conversation,
            None => return Ok(false),
        }
    }
}

fn has_threads(conn: &Connection, conversation_id: &str) -> Result<bool, ApiError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM thread_links WHERE parent_conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Depth and parent thread for a new link under `parent_link`.
/// An explicit parent thread must be the link that created the parent room.
pub fn placement(
    parent_link: Option<&ThreadLink>,
    requested_parent_thread: Option<i64>,
    max_depth: u32,
) -> Result<(u32, Option<i64>), ApiError> {
    if let Some(requested) = requested_parent_thread {
        if parent_link.map(|l| l.id) != Some(requested) {
            return Err(ApiError::validation("parent_thread does not lead to parent_conversation"));
        }
    }
    let depth = parent_link.map(|l| l.depth + 1).unwrap_or(1);
    if depth > max_depth {
        return Err(ApiError::validation(format!(
            "Thread depth {} exceeds the limit of {}",
            depth, max_depth
        )));
    }
    Ok((depth, parent_link.map(|l| l.id)))
}

#[derive(Debug, Deserialize)]
pub struct CreateThreadRequest {
    pub parent_conversation: String,
    pub parent_message_key: String,
    /// Existing conversation to attach; a new THREAD room is created otherwise
    pub child_conversation: Option<String>,
    pub parent_thread: Option<i64>,
    #[serde(default)]
    pub title: String,
}

/// POST /api/threads - Open a sub-room on a message.
/// 201 with the new link, or 200 with the link already on that message.
pub async fn create_thread(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateThreadRequest>,
) -> ApiResult<(StatusCode, Json<ThreadLink>)> {
    let message_key = req.parent_message_key.trim().to_string();
    if message_key.is_empty() || message_key.chars().count() > MAX_MESSAGE_KEY_LEN {
        return Err(ApiError::validation("parent_message_key must be 1 to 255 characters"));
    }

    let user_id = caller.user_id;
    let (created, link) = with_conn(&state.db, move |conn| {
        let parent = require_conversation(conn, &req.parent_conversation)?;
        require_active_member(conn, &parent.id, user_id)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = find_by_message(&tx, &parent.id, &message_key)? {
            return Ok((false, existing));
        }

        ensure_not_archived(&parent)?;
        let settings = load_settings(&tx, &parent.id)?;
        if settings.subroom_policy == SubroomPolicy::AdminsOnly {
            require_permission(&tx, user_id, &ObjectRef::conversation(&parent.id), CREATE_SUBROOM)?;
        }
        let parent_link = link_for_child(&tx, &parent.id)?;
        let (depth, parent_thread) = placement(parent_link.as_ref(), req.parent_thread, settings.max_subroom_depth)?;

        let child_id = match req.child_conversation.as_deref() {
            Some(child_id) => {
                let child = find_conversation(&tx, child_id)?
                    .ok_or_else(|| ApiError::validation(format!("Conversation '{}' does not exist", child_id)))?;
                if is_ancestor(&tx, &parent.id, &child.id)? {
                    return Err(ApiError::validation("A conversation cannot be a thread of itself or its threads"));
                }
                require_active_member(&tx, &child.id, user_id)?;
                if link_for_child(&tx, &child.id)?.is_some() {
                    return Err(ApiError::validation("Conversation is already a thread"));
                }
                // Stored depths below the child would go stale
                if has_threads(&tx, &child.id)? {
                    return Err(ApiError::validation("A conversation with threads of its own cannot be attached"));
                }
                child.id
            }
            None => {
                let child = create_conversation_record(
                    &tx,
                    NewConversation {
                        kind: ConversationType::Thread,
                        title: req.title,
                        description: String::new(),
                        avatar_url: String::new(),
                        created_by: user_id,
                        request: None,
                    },
                )?;
                add_membership(&tx, &child.id, user_id, BaseRole::Owner)?;
                child.id
            }
        };

        tx.execute(
            "INSERT INTO thread_links (parent_conversation_id, parent_message_key, child_conversation_id,
                parent_thread_id, depth, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![parent.id, message_key, child_id, parent_thread, depth, user_id, now()],
        )?;
        let link = find_link(&tx, tx.last_insert_rowid())?
            .ok_or_else(|| ApiError::Internal("thread link vanished".into()))?;
        tx.commit()?;
        Ok((true, link))
    })
    .await?;

    if created {
        tracing::info!(
            "Thread {} (depth {}) opened on {}:{} by {}",
            link.child_conversation,
            link.depth,
            link.parent_conversation,
            link.parent_message_key,
            user_id
        );
        Ok((StatusCode::CREATED, Json(link)))
    } else {
        Ok((StatusCode::OK, Json(link)))
    }
}

/// GET /api/threads/{id} - Members of the parent conversation only.
pub async fn get_thread(
    State(state): State<AppState>,
    caller: Caller,
    Path(link_id): Path<i64>,
) -> ApiResult<Json<ThreadLink>> {
    let link = with_conn(&state.db, move |conn| {
        let link = find_link(conn, link_id)?.ok_or_else(|| ApiError::not_found("Thread not found"))?;
        require_active_member(conn, &link.parent_conversation, caller.user_id)?;
        Ok(link)
    })
    .await?;
    Ok(Json(link))
}

/// GET /api/conversations/{id}/threads - Threads opened in a conversation.
pub async fn list_threads(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Vec<ThreadLink>>> {
    let links = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM thread_links WHERE parent_conversation_id = ?1 ORDER BY created_at, id",
            ThreadLink::COLUMNS
        ))?;
        let links = stmt
            .query_map([&conversation.id], ThreadLink::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    })
    .await?;
    Ok(Json(links))
}
