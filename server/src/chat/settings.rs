use axum::{
    extract::{Path, State},
    Json,
};
use rusqlite::params;
use serde::Deserialize;

use crate::auth::middleware::Caller;
use crate::db::models::{ConversationSettings, InfoEditPolicy, JoinPolicy, SendPolicy, SubroomPolicy};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::patch::double_option;
use crate::rbac::permissions::{require_permission, SET_SETTINGS};
use crate::rbac::refs::ObjectRef;
use crate::state::AppState;

use super::{ensure_not_archived, load_settings, require_active_member, require_conversation};

#[derive(Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub send_policy: Option<SendPolicy>,
    pub join_policy: Option<JoinPolicy>,
    pub info_edit_policy: Option<InfoEditPolicy>,
    pub subroom_policy: Option<SubroomPolicy>,
    pub max_subroom_depth: Option<u32>,
    /// null switches retention off
    #[serde(default, deserialize_with = "double_option")]
    pub message_retention_days: Option<Option<u32>>,
    pub allow_reactions: Option<bool>,
    pub allow_stickers: Option<bool>,
    pub allow_attachments: Option<bool>,
}

/// Apply a partial update, validating the numeric bounds.
pub fn apply_patch(
    current: &ConversationSettings,
    patch: SettingsPatch,
    max_depth_limit: u32,
) -> Result<ConversationSettings, ApiError> {
    let mut next = current.clone();

    if let Some(depth) = patch.max_subroom_depth {
        if depth == 0 || depth > max_depth_limit {
            return Err(ApiError::validation(format!(
                "max_subroom_depth must be between 1 and {}",
                max_depth_limit
            )));
        }
        next.max_subroom_depth = depth;
    }
    if let Some(retention) = patch.message_retention_days {
        if retention == Some(0) {
            return Err(ApiError::validation("message_retention_days must be at least 1 or null"));
        }
        next.message_retention_days = retention;
    }

    if let Some(v) = patch.send_policy {
        next.send_policy = v;
    }
    if let Some(v) = patch.join_policy {
        next.join_policy = v;
    }
    if let Some(v) = patch.info_edit_policy {
        next.info_edit_policy = v;
    }
    if let Some(v) = patch.subroom_policy {
        next.subroom_policy = v;
    }
    if let Some(v) = patch.allow_reactions {
        next.allow_reactions = v;
    }
    if let Some(v) = patch.allow_stickers {
        next.allow_stickers = v;
    }
    if let Some(v) = patch.allow_attachments {
        next.allow_attachments = v;
    }
    Ok(next)
}

/// GET /api/conversations/{id}/settings
pub async fn get_settings(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationSettings>> {
    let settings = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        load_settings(conn, &conversation.id)
    })
    .await?;
    Ok(Json(settings))
}

/// PATCH /api/conversations/{id}/settings - Requires chat.set_settings.
pub async fn update_settings(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
    ApiJson(patch): ApiJson<SettingsPatch>,
) -> ApiResult<Json<ConversationSettings>> {
    let limit = state.chat.max_subroom_depth_limit;
    let settings = with_conn(&state.db, move |conn| {
        let conversation = require_conversation(conn, &conversation_id)?;
        ensure_not_archived(&conversation)?;
        require_active_member(conn, &conversation.id, caller.user_id)?;
        require_permission(conn, caller.user_id, &ObjectRef::conversation(&conversation.id), SET_SETTINGS)?;

        let next = apply_patch(&load_settings(conn, &conversation.id)?, patch, limit)?;
        conn.execute(
            "UPDATE conversation_settings SET
                send_policy = ?1, join_policy = ?2, info_edit_policy = ?3, subroom_policy = ?4,
                max_subroom_depth = ?5, message_retention_days = ?6,
                allow_reactions = ?7, allow_stickers = ?8, allow_attachments = ?9, updated_at = ?10
             WHERE conversation_id = ?11",
            params![
                next.send_policy,
                next.join_policy,
                next.info_edit_policy,
                next.subroom_policy,
                next.max_subroom_depth,
                next.message_retention_days,
                next.allow_reactions,
                next.allow_stickers,
                next.allow_attachments,
                now(),
                conversation.id
            ],
        )?;
        load_settings(conn, &conversation.id)
    })
    .await?;

    tracing::info!(
        "Settings of {} updated by {}: send={} join={} depth={}",
        settings.conversation_id,
        caller.user_id,
        settings.send_policy,
        settings.join_policy,
        settings.max_subroom_depth
    );
    Ok(Json(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ConversationSettings {
        ConversationSettings {
            conversation_id: "c1".into(),
            send_policy: SendPolicy::AllMembers,
            join_policy: JoinPolicy::InviteOnly,
            info_edit_policy: InfoEditPolicy::AdminsOnly,
            subroom_policy: SubroomPolicy::AllMembers,
            max_subroom_depth: 8,
            message_retention_days: Some(30),
            allow_reactions: true,
            allow_stickers: true,
            allow_attachments: true,
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_partial_patch_keeps_other_fields() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"send_policy": "admins_only", "allow_stickers": false}"#).unwrap();
        let next = apply_patch(&defaults(), patch, 64).unwrap();
        assert_eq!(next.send_policy, SendPolicy::AdminsOnly);
        assert!(!next.allow_stickers);
        assert_eq!(next.join_policy, JoinPolicy::InviteOnly);
        assert_eq!(next.message_retention_days, Some(30));
    }

    #[test]
    fn test_retention_null_clears() {
        let patch: SettingsPatch = serde_json::from_str(r#"{"message_retention_days": null}"#).unwrap();
        assert_eq!(apply_patch(&defaults(), patch, 64).unwrap().message_retention_days, None);

        let zero: SettingsPatch = serde_json::from_str(r#"{"message_retention_days": 0}"#).unwrap();
        assert!(apply_patch(&defaults(), zero, 64).is_err());
    }

    #[test]
    fn test_depth_bounds() {
        for (depth, ok) in [(0, false), (1, true), (64, true), (65, false)] {
            let patch = SettingsPatch {
                max_subroom_depth: Some(depth),
                ..Default::default()
            };
            assert_eq!(apply_patch(&defaults(), patch, 64).is_ok(), ok, "depth {}", depth);
        }
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        assert!(serde_json::from_str::<SettingsPatch>(r#"{"join_policy": "anyone"}"#).is_err());
    }
}
