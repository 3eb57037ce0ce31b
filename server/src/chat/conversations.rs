//! REST endpoints for conversation lifecycle.
//!
//! Direct conversations start as a pending request from the initiator to the
//! recipient; at most one active direct conversation exists per pair of users.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;
use uuid::Uuid;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::db::models::{
    BaseRole, Conversation, ConversationType, InfoEditPolicy, RequestState, SendPolicy, User,
};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::ownable::require_owner;
use crate::rbac::permissions::{require_permission, EDIT_INFO};
use crate::rbac::refs::ObjectRef;
use crate::state::AppState;

use super::members::add_membership;
use super::{conversation_detail, ensure_not_archived, load_settings, require_active_member, require_conversation, ConversationDetail};

/// Fields for a new conversation row.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub kind: ConversationType,
    pub title: String,
    pub description: String,
    pub avatar_url: String,
    pub created_by: i64,
    /// (initiator, recipient) for direct chat requests
    pub request: Option<(i64, i64)>,
}

/// Insert a conversation and its default settings row. Memberships are
/// added separately by the caller inside the same transaction.
pub fn create_conversation_record(conn: &Connection, new: NewConversation) -> Result<Conversation, ApiError> {
    let id = Uuid::now_v7().to_string();
    let ts = now();
    let (state, initiator, recipient) = match new.request {
        Some((initiator, recipient)) => (RequestState::Pending, Some(initiator), Some(recipient)),
        None => (RequestState::None, None, None),
    };

    conn.execute(
        "INSERT INTO conversations (id, type, title, description, avatar_url, created_by,
            request_state, request_initiator, request_recipient, is_locked, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            id,
            new.kind,
            new.title.trim(),
            new.description,
            new.avatar_url,
            new.created_by,
            state,
            initiator,
            recipient,
            new.request.is_some(),
            ts
        ],
    )?;

    // Channels are broadcast rooms
    let send_policy = match new.kind {
        ConversationType::Channel => SendPolicy::AdminsOnly,
        _ => SendPolicy::AllMembers,
    };
    conn.execute(
        "INSERT INTO conversation_settings (conversation_id, send_policy, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![id, send_policy, ts],
    )?;

    super::require_conversation(conn, &id)
}

/// Direct conversation in which both users still hold a membership.
pub fn find_direct_between(conn: &Connection, a: i64, b: i64) -> Result<Option<Conversation>, ApiError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT c.id FROM conversations c
             JOIN conversation_members ma ON ma.conversation_id = c.id AND ma.user_id = ?2 AND ma.left_at IS NULL
             JOIN conversation_members mb ON mb.conversation_id = c.id AND mb.user_id = ?3 AND mb.left_at IS NULL
             WHERE c.type = ?1
             ORDER BY c.created_at
             LIMIT 1",
            params![ConversationType::Direct, a, b],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => super::find_conversation(conn, &id),
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    #[serde(default)]
    pub peer_user_id: Option<serde_json::Value>,
    /// Phone numbers; the first one names the peer
    #[serde(default)]
    pub participants: Vec<String>,
}

/// Accepts a JSON integer or a numeric string.
fn parse_peer_id(raw: &serde_json::Value) -> Result<Option<i64>, ApiError> {
    match raw {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::validation("peer_user_id must be an integer")),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ApiError::validation("peer_user_id must be an integer")),
        _ => Err(ApiError::validation("peer_user_id must be an integer")),
    }
}

fn resolve_peer(conn: &Connection, req: &CreateDirectRequest) -> Result<User, ApiError> {
    if let Some(peer_id) = req.peer_user_id.as_ref().map(parse_peer_id).transpose()?.flatten() {
        return accounts::require_user(conn, peer_id);
    }
    let phone = req
        .participants
        .iter()
        .map(|p| p.trim())
        .find(|p| !p.is_empty())
        .ok_or_else(|| ApiError::validation("peer_user_id or participants is required"))?;
    match accounts::find_by_phone(conn, phone)? {
        Some(user) if user.is_active => Ok(user),
        _ => Err(ApiError::not_found(format!("No user with phone {}", phone))),
    }
}

/// POST /api/conversations/direct - Get or create a direct conversation.
/// Body: { "peer_user_id": 2 } or { "participants": ["+237600000000"] }.
/// 201 with a pending request when new, 200 with the existing one otherwise.
pub async fn create_direct(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateDirectRequest>,
) -> ApiResult<(StatusCode, Json<ConversationDetail>)> {
    let user_id = caller.user_id;
    let (created, detail) = with_conn(&state.db, move |conn| {
        accounts::require_caller(conn, user_id)?;
        let peer = resolve_peer(conn, &req)?;
        if peer.id == user_id {
            return Err(ApiError::validation("Cannot start a direct conversation with yourself"));
        }

        // Lookup and creation share one write lock so concurrent requests for
        // the same pair cannot both create.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = find_direct_between(&tx, user_id, peer.id)? {
            let detail = conversation_detail(&tx, existing)?;
            tx.commit()?;
            return Ok((false, detail));
        }

        let conversation = create_conversation_record(
            &tx,
            NewConversation {
                kind: ConversationType::Direct,
                title: String::new(),
                description: String::new(),
                avatar_url: String::new(),
                created_by: user_id,
                request: Some((user_id, peer.id)),
            },
        )?;
        add_membership(&tx, &conversation.id, user_id, BaseRole::Owner)?;
        add_membership(&tx, &conversation.id, peer.id, BaseRole::Member)?;
        let detail = conversation_detail(&tx, conversation)?;
        tx.commit()?;
        Ok((true, detail))
    })
    .await?;

    if created {
        tracing::info!(
            "Direct conversation {} requested by {} for {:?}",
            detail.conversation.id,
            user_id,
            detail.conversation.request_recipient
        );
        Ok((StatusCode::CREATED, Json(detail)))
    } else {
        Ok((StatusCode::OK, Json(detail)))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub kind: ConversationType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar_url: String,
    /// Phone numbers of users to add as members
    #[serde(default)]
    pub participants: Vec<String>,
}

/// Users behind the given phones, minus the creator. Unknown phones are a 400.
fn resolve_participants(conn: &Connection, phones: &[String], creator: i64) -> Result<Vec<i64>, ApiError> {
    let mut ids = Vec::new();
    for phone in phones.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let user = accounts::find_by_phone(conn, phone)?
            .filter(|u| u.is_active)
            .ok_or_else(|| ApiError::validation(format!("No user with phone {}", phone)))?;
        if user.id != creator && !ids.contains(&user.id) {
            ids.push(user.id);
        }
    }
    Ok(ids)
}

/// POST /api/conversations - Create a group, channel, thread, post or system room.
/// The caller becomes its sole owner; participants join as members.
pub async fn create_conversation(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<ConversationDetail>)> {
    let user_id = caller.user_id;
    let detail = with_conn(&state.db, move |conn| {
        match req.kind {
            ConversationType::Direct => {
                return Err(ApiError::validation("Use /api/conversations/direct for direct conversations"))
            }
            ConversationType::System => {
                accounts::require_staff(conn, user_id)?;
            }
            _ => {
                accounts::require_caller(conn, user_id)?;
            }
        }
        let participants = resolve_participants(conn, &req.participants, user_id)?;

        let tx = conn.transaction()?;
        let conversation = create_conversation_record(
            &tx,
            NewConversation {
                kind: req.kind,
                title: req.title,
                description: req.description,
                avatar_url: req.avatar_url,
                created_by: user_id,
                request: None,
            },
        )?;
        add_membership(&tx, &conversation.id, user_id, BaseRole::Owner)?;
        for participant in participants {
            add_membership(&tx, &conversation.id, participant, BaseRole::Member)?;
        }
        let detail = conversation_detail(&tx, conversation)?;
        tx.commit()?;
        Ok(detail)
    })
    .await?;

    tracing::info!(
        "Conversation {} ({}) created by {} with {} member(s)",
        detail.conversation.id,
        detail.conversation.kind,
        user_id,
        detail.members.len()
    );
    Ok((StatusCode::CREATED, Json(detail)))
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(rename = "type")]
    pub kind: Option<ConversationType>,
    #[serde(default)]
    pub include_archived: bool,
}

/// GET /api/conversations - Conversations the caller is an active member of,
/// most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListConversationsQuery>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let conversations = with_conn(&state.db, move |conn| {
        let columns = Conversation::COLUMNS
            .split(", ")
            .map(|c| format!("c.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?1 AND m.left_at IS NULL
               AND (?2 IS NULL OR c.type = ?2)
               AND (?3 OR c.is_archived = 0)
             ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
            columns
        ))?;
        let rows = stmt
            .query_map(params![caller.user_id, query.kind, query.include_archived], Conversation::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await?;

    Ok(Json(conversations))
}

/// GET /api/conversations/{id} - Detail for an active member.
pub async fn get_conversation(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        conversation_detail(conn, conversation)
    })
    .await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub struct UpdateInfoRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

/// PATCH /api/conversations/{id} - Edit title, description or avatar.
/// With info_edit_policy=admins_only the caller needs chat.edit_info.
pub async fn update_info(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
    ApiJson(req): ApiJson<UpdateInfoRequest>,
) -> ApiResult<Json<ConversationDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        ensure_not_archived(&conversation)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        if load_settings(conn, &conversation.id)?.info_edit_policy == InfoEditPolicy::AdminsOnly {
            require_permission(conn, caller.user_id, &ObjectRef::conversation(&conversation.id), EDIT_INFO)?;
        }

        let title = req.title.as_deref().map(str::trim).unwrap_or(&conversation.title);
        let description = req.description.as_deref().unwrap_or(&conversation.description);
        let avatar_url = req.avatar_url.as_deref().unwrap_or(&conversation.avatar_url);
        conn.execute(
            "UPDATE conversations SET title = ?1, description = ?2, avatar_url = ?3, updated_at = ?4 WHERE id = ?5",
            params![title, description, avatar_url, now(), conversation.id],
        )?;

        let updated = require_conversation(conn, &conversation.id)?;
        conversation_detail(conn, updated)
    })
    .await?;

    tracing::info!("Conversation {} info updated by {}", detail.conversation.id, caller.user_id);
    Ok(Json(detail))
}

/// POST /api/conversations/{id}/archive - Archive a conversation (owner only).
/// Archival is terminal; repeating it is a no-op.
pub async fn archive_conversation(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        require_owner(&conversation, caller.user_id)?;
        if !conversation.is_archived {
            conn.execute(
                "UPDATE conversations SET is_archived = 1, updated_at = ?1 WHERE id = ?2",
                params![now(), conversation.id],
            )?;
        }
        let updated = require_conversation(conn, &conversation.id)?;
        conversation_detail(conn, updated)
    })
    .await?;

    tracing::info!("Conversation {} archived by {}", detail.conversation.id, caller.user_id);
    Ok(Json(detail))
}

/// POST /api/conversations/{id}/block - Lock a direct conversation.
/// Either participant may block; nobody can send afterwards.
pub async fn block_conversation(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        if conversation.kind != ConversationType::Direct {
            return Err(ApiError::validation("Not a direct conversation"));
        }
        require_active_member(conn, &conversation.id, caller.user_id)?;
        conn.execute(
            "UPDATE conversations SET is_locked = 1, locked_by = ?1, updated_at = ?2 WHERE id = ?3",
            params![caller.user_id, now(), conversation.id],
        )?;
        let updated = require_conversation(conn, &conversation.id)?;
        conversation_detail(conn, updated)
    })
    .await?;

    tracing::info!("Direct conversation {} blocked by {}", detail.conversation.id, caller.user_id);
    Ok(Json(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{upsert, UserUpsert};
    use crate::db::init_memory_db;
    use serde_json::json;

    fn seed_user(conn: &Connection, id: i64, phone: Option<&str>) {
        let input = UserUpsert {
            username: format!("user{}", id),
            phone: phone.map(str::to_string),
            is_active: true,
            ..Default::default()
        };
        upsert(conn, id, &input).unwrap();
    }

    #[test]
    fn test_parse_peer_id() {
        assert_eq!(parse_peer_id(&json!(2)).unwrap(), Some(2));
        assert_eq!(parse_peer_id(&json!("2")).unwrap(), Some(2));
        assert_eq!(parse_peer_id(&json!(null)).unwrap(), None);
        assert!(parse_peer_id(&json!("abc")).is_err());
        assert!(parse_peer_id(&json!(2.5)).is_err());
    }

    #[test]
    fn test_channel_defaults_to_admin_only_sending() {
        let conn = init_memory_db().unwrap();
        seed_user(&conn, 1, None);
        let conversation = create_conversation_record(
            &conn,
            NewConversation {
                kind: ConversationType::Channel,
                title: " News ".into(),
                description: String::new(),
                avatar_url: String::new(),
                created_by: 1,
                request: None,
            },
        )
        .unwrap();
        assert_eq!(conversation.title, "News");
        assert_eq!(conversation.request_state, RequestState::None);
        let settings = load_settings(&conn, &conversation.id).unwrap();
        assert_eq!(settings.send_policy, SendPolicy::AdminsOnly);
        assert_eq!(settings.max_subroom_depth, 8);
    }

    #[test]
    fn test_find_direct_between_ignores_left_members() {
        let mut conn = init_memory_db().unwrap();
        seed_user(&conn, 1, None);
        seed_user(&conn, 2, Some("+237600000000"));
        let tx = conn.transaction().unwrap();
        let dm = create_conversation_record(
            &tx,
            NewConversation {
                kind: ConversationType::Direct,
                title: String::new(),
                description: String::new(),
                avatar_url: String::new(),
                created_by: 1,
                request: Some((1, 2)),
            },
        )
        .unwrap();
        add_membership(&tx, &dm.id, 1, BaseRole::Owner).unwrap();
        add_membership(&tx, &dm.id, 2, BaseRole::Member).unwrap();
        tx.commit().unwrap();

        assert!(dm.is_locked);
        assert_eq!(find_direct_between(&conn, 2, 1).unwrap().unwrap().id, dm.id);

        conn.execute(
            "UPDATE conversation_members SET left_at = ?1 WHERE user_id = 2",
            [now()],
        )
        .unwrap();
        assert!(find_direct_between(&conn, 1, 2).unwrap().is_none());
    }
}
