//! Who may post into a conversation.
//!
//! The engine is consulted first so superusers pass and ACE denies on
//! chat.send_message still bite; membership, request state, lock and
//! send_policy are applied after that.

use chrono::Utc;
use rusqlite::Connection;

use crate::db::models::{BaseRole, Conversation, ConversationMember, ConversationSettings, ConversationType, RequestState, SendPolicy};
use crate::error::ApiError;
use crate::rbac::engine::{evaluate, Decision, Reason};
use crate::rbac::permissions::SEND_MESSAGE;
use crate::rbac::refs::ObjectRef;
use crate::rbac::store;

use super::{active_member, load_settings, require_conversation};

/// Send decision given the engine's answer for chat.send_message and the
/// caller's active membership (if any).
pub fn evaluate_send(
    engine: Decision,
    conversation: &Conversation,
    settings: &ConversationSettings,
    member: Option<&ConversationMember>,
) -> Decision {
    match engine.reason {
        Reason::Superuser => return engine,
        Reason::AceDeny => return engine,
        _ => {}
    }

    let allow = Decision::allow(Reason::SendPolicy);
    let deny = Decision::deny(Reason::SendPolicy);

    let Some(member) = member else {
        return deny;
    };
    if conversation.is_archived || member.base_role == BaseRole::Readonly {
        return deny;
    }

    if conversation.kind == ConversationType::Direct {
        if conversation.locked_by.is_some() {
            return deny;
        }
        return match conversation.request_state {
            RequestState::Pending if conversation.request_initiator == Some(member.user_id) => allow,
            RequestState::Pending | RequestState::Rejected => deny,
            RequestState::Accepted | RequestState::None => allow,
        };
    }

    let privileged = member.base_role.is_privileged();
    if conversation.is_locked && !privileged {
        return deny;
    }
    if settings.send_policy == SendPolicy::AdminsOnly && !privileged {
        return deny;
    }
    allow
}

/// Load everything [`evaluate_send`] needs for `(user, conversation)`.
pub fn check_send(conn: &Connection, user_id: i64, conversation_id: &str) -> Result<Decision, ApiError> {
    let conversation = require_conversation(conn, conversation_id)?;
    let settings = load_settings(conn, &conversation.id)?;
    let member = active_member(conn, &conversation.id, user_id)?;

    let object = ObjectRef::conversation(&conversation.id);
    let subject = store::load_subject(conn, user_id)?;
    let scope = store::load_scope(conn, user_id, &object, false)?;
    let engine = evaluate(&subject, &scope, SEND_MESSAGE, Utc::now());

    let decision = evaluate_send(engine, &conversation, &settings, member.as_ref());
    tracing::debug!(
        "send check user={} conversation={} engine={:?} -> {:?}",
        user_id,
        conversation.id,
        engine,
        decision
    );
    Ok(decision)
}
