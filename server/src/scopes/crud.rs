//! REST endpoints for creating, linking and archiving scopes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts;
use crate::auth::middleware::Caller;
use crate::chat::conversations::{create_conversation_record, NewConversation};
use crate::chat::members::add_membership;
use crate::db::models::{BaseRole, Channel, Community, ConversationType, Group};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::rbac::ownable::{require_owner, Ownable};
use crate::state::AppState;

use super::membership::join_group;
use super::{
    archive_linked_conversation, normalize_slug, require_channel, require_community, require_group, unique_violation,
};

#[derive(Debug, Deserialize)]
pub struct CreateCommunityRequest {
    pub name: String,
    pub slug: Option<String>,
}

/// POST /api/communities
pub async fn create_community(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateCommunityRequest>,
) -> ApiResult<(StatusCode, Json<Community>)> {
    let name = required_name(&req.name)?;
    let slug = normalize_slug(req.slug.as_deref(), &name)?;

    let community = with_conn(&state.db, move |conn| {
        accounts::require_caller(conn, caller.user_id)?;
        let id = Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO communities (id, slug, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, slug, name, caller.user_id, now()],
        )
        .map_err(unique_violation("A community with this slug"))?;
        require_community(conn, &id)
    })
    .await?;

    tracing::info!("Community {} ({}) created by {}", community.id, community.slug, caller.user_id);
    Ok((StatusCode::CREATED, Json(community)))
}

/// GET /api/communities/{id}
pub async fn get_community(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Community>> {
    let community = with_conn(&state.db, move |conn| require_community(conn, &id)).await?;
    Ok(Json(community))
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub slug: Option<String>,
    pub community_id: Option<String>,
}

/// POST /api/groups - Create a group with its GROUP conversation.
/// The creator owns both and is the first member.
pub async fn create_group(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<Group>)> {
    let name = required_name(&req.name)?;
    let slug = normalize_slug(req.slug.as_deref(), &name)?;
    let user_id = caller.user_id;

    let group = with_conn(&state.db, move |conn| {
        accounts::require_caller(conn, user_id)?;
        if let Some(community_id) = req.community_id.as_deref() {
            let community = super::find_community(conn, community_id)?
                .ok_or_else(|| ApiError::validation(format!("Community '{}' does not exist", community_id)))?;
            if community.is_archived {
                return Err(ApiError::validation("Community is archived"));
            }
        }

        let tx = conn.transaction()?;
        let conversation = create_conversation_record(
            &tx,
            NewConversation {
                kind: ConversationType::Group,
                title: name.clone(),
                description: String::new(),
                avatar_url: String::new(),
                created_by: user_id,
                request: None,
            },
        )?;
        add_membership(&tx, &conversation.id, user_id, BaseRole::Owner)?;

        let id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO groups (id, slug, name, community_id, owner_id, conversation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, slug, name, req.community_id, user_id, conversation.id, now()],
        )
        .map_err(unique_violation("A group with this slug"))?;
        let group = require_group(&tx, &id)?;
        join_group(&tx, &group, user_id)?;
        let group = require_group(&tx, &id)?;
        tx.commit()?;
        Ok(group)
    })
    .await?;

    tracing::info!("Group {} ({}) created by {}", group.id, group.slug, user_id);
    Ok((StatusCode::CREATED, Json(group)))
}

/// GET /api/groups/{id}
pub async fn get_group(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Group>> {
    let group = with_conn(&state.db, move |conn| require_group(conn, &id)).await?;
    Ok(Json(group))
}

/// Channel with the scopes it is linked to.
#[derive(Debug, Serialize)]
pub struct ChannelDetail {
    #[serde(flatten)]
    pub channel: Channel,
    pub groups: Vec<String>,
    pub communities: Vec<String>,
}

fn channel_detail(conn: &Connection, channel: Channel) -> Result<ChannelDetail, ApiError> {
    let mut stmt = conn.prepare("SELECT group_id FROM channel_groups WHERE channel_id = ?1 ORDER BY group_id")?;
    let groups = stmt
        .query_map([&channel.id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    let mut stmt =
        conn.prepare("SELECT community_id FROM channel_communities WHERE channel_id = ?1 ORDER BY community_id")?;
    let communities = stmt
        .query_map([&channel.id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ChannelDetail {
        channel,
        groups,
        communities,
    })
}

/// Link `channel_id` to groups and communities. Unknown ids are a 400;
/// existing links are kept.
fn link_scopes(conn: &Connection, channel_id: &str, groups: &[String], communities: &[String]) -> Result<(), ApiError> {
    for group_id in groups {
        if super::find_group(conn, group_id)?.is_none() {
            return Err(ApiError::validation(format!("Group '{}' does not exist", group_id)));
        }
        conn.execute(
            "INSERT OR IGNORE INTO channel_groups (channel_id, group_id) VALUES (?1, ?2)",
            params![channel_id, group_id],
        )?;
    }
    for community_id in communities {
        if super::find_community(conn, community_id)?.is_none() {
            return Err(ApiError::validation(format!("Community '{}' does not exist", community_id)));
        }
        conn.execute(
            "INSERT OR IGNORE INTO channel_communities (channel_id, community_id) VALUES (?1, ?2)",
            params![channel_id, community_id],
        )?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub communities: Vec<String>,
}

/// POST /api/channels - Create a channel with its CHANNEL conversation.
pub async fn create_channel(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateChannelRequest>,
) -> ApiResult<(StatusCode, Json<ChannelDetail>)> {
    let name = required_name(&req.name)?;
    let slug = normalize_slug(req.slug.as_deref(), &name)?;
    let user_id = caller.user_id;

    let detail = with_conn(&state.db, move |conn| {
        accounts::require_caller(conn, user_id)?;
        let tx = conn.transaction()?;
        let conversation = create_conversation_record(
            &tx,
            NewConversation {
                kind: ConversationType::Channel,
                title: name.clone(),
                description: String::new(),
                avatar_url: String::new(),
                created_by: user_id,
                request: None,
            },
        )?;
        add_membership(&tx, &conversation.id, user_id, BaseRole::Owner)?;

        let id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO channels (id, slug, name, owner_id, conversation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, slug, name, user_id, conversation.id, now()],
        )
        .map_err(unique_violation("A channel with this slug"))?;
        link_scopes(&tx, &id, &req.groups, &req.communities)?;

        let detail = channel_detail(&tx, require_channel(&tx, &id)?)?;
        tx.commit()?;
        Ok(detail)
    })
    .await?;

    tracing::info!(
        "Channel {} ({}) created by {} linked to {} group(s), {} communit(ies)",
        detail.channel.id,
        detail.channel.slug,
        user_id,
        detail.groups.len(),
        detail.communities.len()
    );
    Ok((StatusCode::CREATED, Json(detail)))
}

/// GET /api/channels/{id}
pub async fn get_channel(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ChannelDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let channel = require_channel(conn, &id)?;
        channel_detail(conn, channel)
    })
    .await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub struct LinkScopesRequest {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub communities: Vec<String>,
}

/// POST /api/channels/{id}/links - Link more groups/communities (owner or staff).
pub async fn link_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<LinkScopesRequest>,
) -> ApiResult<Json<ChannelDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let channel = require_channel(conn, &id)?;
        if !channel.is_owned_by(caller.user_id) {
            accounts::require_staff(conn, caller.user_id)?;
        }
        if channel.is_archived {
            return Err(ApiError::validation("Channel is archived"));
        }
        let tx = conn.transaction()?;
        link_scopes(&tx, &channel.id, &req.groups, &req.communities)?;
        let detail = channel_detail(&tx, channel)?;
        tx.commit()?;
        Ok(detail)
    })
    .await?;

    tracing::info!("Channel {} links updated by {}", detail.channel.id, caller.user_id);
    Ok(Json(detail))
}

/// POST /api/communities/{id}/archive (owner only)
pub async fn archive_community(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Community>> {
    let community = with_conn(&state.db, move |conn| {
        let community = require_community(conn, &id)?;
        require_owner(&community, caller.user_id)?;
        conn.execute("UPDATE communities SET is_archived = 1 WHERE id = ?1", [&community.id])?;
        require_community(conn, &community.id)
    })
    .await?;

    tracing::info!("Community {} archived by {}", community.id, caller.user_id);
    Ok(Json(community))
}

/// POST /api/groups/{id}/archive - Owner only; archives the group conversation too.
pub async fn archive_group(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Group>> {
    let group = with_conn(&state.db, move |conn| {
        let group = require_group(conn, &id)?;
        require_owner(&group, caller.user_id)?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE groups SET is_archived = 1 WHERE id = ?1", [&group.id])?;
        archive_linked_conversation(&tx, group.conversation_id.as_deref())?;
        let group = require_group(&tx, &group.id)?;
        tx.commit()?;
        Ok(group)
    })
    .await?;

    tracing::info!("Group {} archived by {}", group.id, caller.user_id);
    Ok(Json(group))
}

/// POST /api/channels/{id}/archive - Owner only; archives the channel conversation too.
pub async fn archive_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ChannelDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        let channel = require_channel(conn, &id)?;
        require_owner(&channel, caller.user_id)?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE channels SET is_archived = 1 WHERE id = ?1", [&channel.id])?;
        archive_linked_conversation(&tx, channel.conversation_id.as_deref())?;
        let detail = channel_detail(&tx, require_channel(&tx, &channel.id)?)?;
        tx.commit()?;
        Ok(detail)
    })
    .await?;

    tracing::info!("Channel {} archived by {}", detail.channel.id, caller.user_id);
    Ok(Json(detail))
}

fn required_name(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > 128 {
        return Err(ApiError::validation("name must be 1 to 128 characters"));
    }
    Ok(name.to_string())
}
