//! Last-message bookkeeping pushed by the messaging service.
//! Updates may arrive out of order; an older timestamp never overwrites a
//! newer one.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::auth::internal::InternalCaller;
use crate::db::{parse_client_timestamp, parse_timestamp, timestamp, with_conn};
use crate::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;

use super::require_conversation;

#[derive(Debug, Deserialize)]
pub struct LastMessageUpdate {
    pub last_message_at: Option<String>,
    pub last_message_preview: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct LastMessageAck {
    pub ok: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

/// True when `incoming` is older than what is stored. Equal timestamps are
/// applied so a corrected preview for the same message lands.
pub fn is_stale(stored: Option<&str>, incoming: DateTime<Utc>) -> bool {
    stored
        .and_then(parse_timestamp)
        .map(|current| incoming < current)
        .unwrap_or(false)
}

pub fn truncate_preview(preview: &str, max_chars: usize) -> String {
    preview.chars().take(max_chars).collect()
}

/// PATCH /api/conversations/{id}/update-last-message (internal)
/// Body: { "last_message_at": "<ISO-8601>", "last_message_preview": "..." }
pub async fn update_last_message(
    State(state): State<AppState>,
    _internal: InternalCaller,
    Path(conversation_id): Path<String>,
    ApiJson(req): ApiJson<LastMessageUpdate>,
) -> ApiResult<Json<LastMessageAck>> {
    let max_chars = state.chat.preview_max_chars;
    let ack = with_conn(&state.db, move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let conversation = require_conversation(&tx, &conversation_id)?;

        let raw = req
            .last_message_at
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::validation("last_message_at required"))?;
        let incoming = parse_client_timestamp(raw).ok_or_else(|| ApiError::validation("Invalid datetime"))?;

        if is_stale(conversation.last_message_at.as_deref(), incoming) {
            tracing::debug!(
                "Ignoring stale last message for {}: {} < {:?}",
                conversation.id,
                raw,
                conversation.last_message_at
            );
            return Ok(LastMessageAck { ok: true, ignored: true });
        }

        let preview = truncate_preview(req.last_message_preview.as_deref().unwrap_or(""), max_chars);
        tx.execute(
            "UPDATE conversations SET last_message_at = ?1, last_message_preview = ?2 WHERE id = ?3",
            params![timestamp(incoming), preview, conversation.id],
        )?;
        tx.commit()?;
        Ok(LastMessageAck { ok: true, ignored: false })
    })
    .await?;
    Ok(Json(ack))
}
