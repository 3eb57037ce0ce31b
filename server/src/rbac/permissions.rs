use bitflags::bitflags;
use chrono::Utc;
use rusqlite::Connection;

use crate::db::models::BaseRole;
use crate::error::ApiError;
use crate::rbac::engine::{evaluate, Decision};
use crate::rbac::refs::ObjectRef;
use crate::rbac::store;

pub const SEND_MESSAGE: &str = "chat.send_message";
pub const ADD_MEMBER: &str = "chat.add_member";
pub const REMOVE_MEMBER: &str = "chat.remove_member";
pub const CREATE_SUBROOM: &str = "chat.create_subroom";
pub const PIN_MESSAGE: &str = "chat.pin_message";
pub const SET_SETTINGS: &str = "chat.set_settings";
pub const EDIT_INFO: &str = "chat.edit_info";
pub const MANAGE_ROLES: &str = "chat.manage_roles";
pub const ARCHIVE: &str = "chat.archive";

bitflags! {
    /// Conversation actions that owners and admins get without consulting roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoarseActions: u32 {
        const SET_SETTINGS   = 1 << 0;
        const EDIT_INFO      = 1 << 1;
        const ADD_MEMBER     = 1 << 2;
        const REMOVE_MEMBER  = 1 << 3;
        const PIN_MESSAGE    = 1 << 4;
        const CREATE_SUBROOM = 1 << 5;
        const MANAGE_ROLES   = 1 << 6;
        const ARCHIVE        = 1 << 7;
    }
}

impl CoarseActions {
    /// Actions a conversation base role carries without any fine-grained role.
    pub fn for_base_role(role: BaseRole) -> CoarseActions {
        match role {
            BaseRole::Owner | BaseRole::Admin => CoarseActions::all(),
            BaseRole::Member | BaseRole::Readonly => CoarseActions::empty(),
        }
    }

    /// The coarse action named by a permission code, if it is one.
    pub fn from_code(code: &str) -> Option<CoarseActions> {
        let flag = match code {
            SET_SETTINGS => CoarseActions::SET_SETTINGS,
            EDIT_INFO => CoarseActions::EDIT_INFO,
            ADD_MEMBER => CoarseActions::ADD_MEMBER,
            REMOVE_MEMBER => CoarseActions::REMOVE_MEMBER,
            PIN_MESSAGE => CoarseActions::PIN_MESSAGE,
            CREATE_SUBROOM => CoarseActions::CREATE_SUBROOM,
            MANAGE_ROLES => CoarseActions::MANAGE_ROLES,
            ARCHIVE => CoarseActions::ARCHIVE,
            _ => return None,
        };
        Some(flag)
    }
}

/// Load facts for `(user, object)` and run the engine.
/// Reads current rows (not token claims) so changes apply immediately.
pub fn check_permission(
    conn: &Connection,
    user_id: i64,
    object: &ObjectRef,
    permission: &str,
) -> Result<Decision, ApiError> {
    let now = Utc::now();
    let subject = store::load_subject(conn, user_id)?;
    let scope = store::load_scope(conn, user_id, object, true)?;
    let decision = evaluate(&subject, &scope, permission, now);
    tracing::debug!(
        "authz user={} perm={} target={}:{} -> {:?}",
        user_id,
        permission,
        object.kind,
        object.id,
        decision
    );
    Ok(decision)
}

/// Like [`check_permission`] but returns 403 on deny.
pub fn require_permission(
    conn: &Connection,
    user_id: i64,
    object: &ObjectRef,
    permission: &str,
) -> Result<(), ApiError> {
    if check_permission(conn, user_id, object, permission)?.allowed {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("Missing permission {}", permission)))
    }
}
