//! Direct chat request workflow: the recipient of a pending request accepts
//! or rejects it.

use axum::{
    extract::{Path, State},
    Json,
};
use rusqlite::params;

use crate::auth::middleware::Caller;
use crate::db::models::{Conversation, ConversationType, RequestState};
use crate::db::{now, with_conn};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

use super::{conversation_detail, require_conversation, ConversationDetail};

/// Decide whether `user_id` may move the request on `conversation` to `to`.
/// Returns the target state or the error to report.
pub fn transition(conversation: &Conversation, user_id: i64, to: RequestState) -> Result<RequestState, ApiError> {
    if conversation.kind != ConversationType::Direct {
        return Err(ApiError::validation("Not a direct conversation"));
    }
    if conversation.request_state != RequestState::Pending {
        return Err(ApiError::validation(format!(
            "Request is {}, not pending",
            conversation.request_state
        )));
    }
    if conversation.request_recipient != Some(user_id) {
        return Err(ApiError::forbidden("Only the recipient can answer this request"));
    }
    match to {
        RequestState::Accepted | RequestState::Rejected => Ok(to),
        other => Err(ApiError::validation(format!("Cannot move a request to {}", other))),
    }
}

fn answer(conn: &rusqlite::Connection, conversation_id: &str, user_id: i64, to: RequestState) -> Result<ConversationDetail, ApiError> {
    let conversation = require_conversation(conn, conversation_id)?;
    let state = transition(&conversation, user_id, to)?;
    let ts = now();
    let stamp_column = match state {
        RequestState::Accepted => "request_accepted_at",
        _ => "request_rejected_at",
    };
    // Guarded on pending so a concurrent answer loses cleanly.
    let changed = conn.execute(
        &format!(
            "UPDATE conversations SET request_state = ?1, {} = ?2, updated_at = ?2
             WHERE id = ?3 AND request_state = ?4",
            stamp_column
        ),
        params![state, ts, conversation.id, RequestState::Pending],
    )?;
    if changed == 0 {
        return Err(ApiError::validation("Request is no longer pending"));
    }
    let updated = require_conversation(conn, &conversation.id)?;
    conversation_detail(conn, updated)
}

/// POST /api/conversations/{id}/accept-request
pub async fn accept_request(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        answer(conn, &conversation_id, caller.user_id, RequestState::Accepted)
    })
    .await?;

    tracing::info!("Direct request {} accepted by {}", detail.conversation.id, caller.user_id);
    Ok(Json(detail))
}

/// POST /api/conversations/{id}/reject-request
pub async fn reject_request(
    State(state): State<AppState>,
    caller: Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationDetail>> {
    let detail = with_conn(&state.db, move |conn| {
        answer(conn, &conversation_id, caller.user_id, RequestState::Rejected)
    })
    .await?;

    tracing::info!("Direct request {} rejected by {}", detail.conversation.id, caller.user_id);
    Ok(Json(detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(state: RequestState) -> Conversation {
        Conversation {
            id: "c1".into(),
            kind: ConversationType::Direct,
            title: String::new(),
            description: String::new(),
            avatar_url: String::new(),
            created_by: 1,
            request_state: state,
            request_initiator: Some(1),
            request_recipient: Some(2),
            request_accepted_at: None,
            request_rejected_at: None,
            is_archived: false,
            is_locked: true,
            locked_by: None,
            last_message_at: None,
            last_message_preview: String::new(),
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_recipient_answers_pending_request() {
        let pending = direct(RequestState::Pending);
        assert_eq!(transition(&pending, 2, RequestState::Accepted).unwrap(), RequestState::Accepted);
        assert_eq!(transition(&pending, 2, RequestState::Rejected).unwrap(), RequestState::Rejected);
    }

    #[test]
    fn test_initiator_cannot_answer() {
        let pending = direct(RequestState::Pending);
        assert!(matches!(
            transition(&pending, 1, RequestState::Accepted),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_answered_requests_are_final() {
        for state in [RequestState::Accepted, RequestState::Rejected, RequestState::None] {
            let conversation = direct(state);
            assert!(matches!(
                transition(&conversation, 2, RequestState::Accepted),
                Err(ApiError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_group_has_no_request() {
        let mut group = direct(RequestState::Pending);
        group.kind = ConversationType::Group;
        assert!(matches!(
            transition(&group, 2, RequestState::Rejected),
            Err(ApiError::Validation(_))
        ));
    }
}
