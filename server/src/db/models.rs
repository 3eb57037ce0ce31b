//! Database row types and the text-backed enums stored in them.
//! Rows correspond 1:1 to the SQLite schema defined in migrations.rs.

use rusqlite::Row;
use serde::Serialize;

/// Declares a closed set of string values that round-trips through serde
/// (as the text value) and through SQLite TEXT columns. Parsing is
/// case-insensitive.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                $(
                    if raw.eq_ignore_ascii_case($text) {
                        return Some($name::$variant);
                    }
                )+
                None
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(d)?;
                $name::parse(&raw).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "invalid value '{}', expected one of: {}",
                        raw,
                        $name::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
                    ))
                })
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let raw = value.as_str()?;
                $name::parse(raw).ok_or_else(|| {
                    rusqlite::types::FromSqlError::Other(
                        format!("invalid {} '{}'", stringify!($name), raw).into(),
                    )
                })
            }
        }
    };
}

text_enum!(ConversationType {
    Direct => "direct",
    Group => "group",
    Channel => "channel",
    Post => "post",
    Thread => "thread",
    System => "system",
});

text_enum!(
    /// Direct chat request workflow: none -> pending -> {accepted, rejected}.
    RequestState {
        None => "none",
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
);

text_enum!(
    /// Fast per-conversation role stored on the membership row.
    BaseRole {
        Owner => "owner",
        Admin => "admin",
        Member => "member",
        Readonly => "readonly",
    }
);

impl BaseRole {
    pub fn is_privileged(&self) -> bool {
        matches!(self, BaseRole::Owner | BaseRole::Admin)
    }
}

text_enum!(NotificationLevel {
    All => "all",
    Mentions => "mentions",
    None => "none",
});

text_enum!(SendPolicy {
    AllMembers => "all_members",
    AdminsOnly => "admins_only",
});

text_enum!(JoinPolicy {
    InviteOnly => "invite_only",
    LinkJoin => "link_join",
    Open => "open",
});

text_enum!(InfoEditPolicy {
    AdminsOnly => "admins_only",
    AllMembers => "all_members",
});

text_enum!(SubroomPolicy {
    AdminsOnly => "admins_only",
    AllMembers => "all_members",
});

text_enum!(
    /// Level at which a role or role assignment applies.
    RoleScope {
        Global => "GLOBAL",
        Partner => "PARTNER",
        Community => "COMMUNITY",
        Channel => "CHANNEL",
        Group => "GROUP",
        Conversation => "CONVERSATION",
    }
);

text_enum!(AceEffect {
    Allow => "ALLOW",
    Deny => "DENY",
});

text_enum!(GroupMemberStatus {
    Active => "ACTIVE",
    Left => "LEFT",
});

/// Local mirror of an account owned by the accounts service.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub phone: Option<String>,
    pub display_name: String,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_active: bool,
}

impl User {
    pub const COLUMNS: &'static str =
        "id, username, phone, display_name, is_superuser, is_staff, is_active";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            phone: row.get(2)?,
            display_name: row.get(3)?,
            is_superuser: row.get(4)?,
            is_staff: row.get(5)?,
            is_active: row.get(6)?,
        })
    }

    /// Staff and superusers may manage roles, permissions and ACEs.
    pub fn can_manage_rbac(&self) -> bool {
        self.is_superuser || self.is_staff
    }
}

/// Chat room of any type.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub title: String,
    pub description: String,
    pub avatar_url: String,
    pub created_by: i64,
    pub request_state: RequestState,
    pub request_initiator: Option<i64>,
    pub request_recipient: Option<i64>,
    pub request_accepted_at: Option<String>,
    pub request_rejected_at: Option<String>,
    pub is_archived: bool,
    pub is_locked: bool,
    pub locked_by: Option<i64>,
    pub last_message_at: Option<String>,
    pub last_message_preview: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub const COLUMNS: &'static str = "id, type, title, description, avatar_url, created_by, \
        request_state, request_initiator, request_recipient, request_accepted_at, \
        request_rejected_at, is_archived, is_locked, locked_by, last_message_at, \
        last_message_preview, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Conversation {
            id: row.get(0)?,
            kind: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            avatar_url: row.get(4)?,
            created_by: row.get(5)?,
            request_state: row.get(6)?,
            request_initiator: row.get(7)?,
            request_recipient: row.get(8)?,
            request_accepted_at: row.get(9)?,
            request_rejected_at: row.get(10)?,
            is_archived: row.get(11)?,
            is_locked: row.get(12)?,
            locked_by: row.get(13)?,
            last_message_at: row.get(14)?,
            last_message_preview: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }
}

/// Membership of a user in a conversation. `left_at` null means active.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMember {
    pub id: i64,
    pub conversation_id: String,
    pub user_id: i64,
    pub base_role: BaseRole,
    pub role_id: Option<String>,
    pub display_name: String,
    pub color: String,
    pub notification_level: NotificationLevel,
    pub is_muted: bool,
    pub is_blocked: bool,
    pub joined_at: String,
    pub left_at: Option<String>,
}

impl ConversationMember {
    pub const COLUMNS: &'static str = "id, conversation_id, user_id, base_role, role_id, \
        display_name, color, notification_level, is_muted, is_blocked, joined_at, left_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ConversationMember {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            user_id: row.get(2)?,
            base_role: row.get(3)?,
            role_id: row.get(4)?,
            display_name: row.get(5)?,
            color: row.get(6)?,
            notification_level: row.get(7)?,
            is_muted: row.get(8)?,
            is_blocked: row.get(9)?,
            joined_at: row.get(10)?,
            left_at: row.get(11)?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Per-conversation policy knobs.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSettings {
    pub conversation_id: String,
    pub send_policy: SendPolicy,
    pub join_policy: JoinPolicy,
    pub info_edit_policy: InfoEditPolicy,
    pub subroom_policy: SubroomPolicy,
    pub max_subroom_depth: u32,
    pub message_retention_days: Option<u32>,
    pub allow_reactions: bool,
    pub allow_stickers: bool,
    pub allow_attachments: bool,
    pub updated_at: String,
}

impl ConversationSettings {
    pub const COLUMNS: &'static str = "conversation_id, send_policy, join_policy, \
        info_edit_policy, subroom_policy, max_subroom_depth, message_retention_days, \
        allow_reactions, allow_stickers, allow_attachments, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ConversationSettings {
            conversation_id: row.get(0)?,
            send_policy: row.get(1)?,
            join_policy: row.get(2)?,
            info_edit_policy: row.get(3)?,
            subroom_policy: row.get(4)?,
            max_subroom_depth: row.get(5)?,
            message_retention_days: row.get(6)?,
            allow_reactions: row.get(7)?,
            allow_stickers: row.get(8)?,
            allow_attachments: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

/// Link from a message in one conversation to a child thread conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadLink {
    pub id: i64,
    pub parent_conversation: String,
    pub parent_message_key: String,
    pub child_conversation: String,
    pub parent_thread: Option<i64>,
    pub depth: u32,
    pub created_by: i64,
    pub created_at: String,
}

impl ThreadLink {
    pub const COLUMNS: &'static str = "id, parent_conversation_id, parent_message_key, \
        child_conversation_id, parent_thread_id, depth, created_by, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ThreadLink {
            id: row.get(0)?,
            parent_conversation: row.get(1)?,
            parent_message_key: row.get(2)?,
            child_conversation: row.get(3)?,
            parent_thread: row.get(4)?,
            depth: row.get(5)?,
            created_by: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// Permission catalog entry.
#[derive(Debug, Clone, Serialize)]
pub struct Permission {
    pub code: String,
    pub description: String,
    pub category: String,
}

/// Role row without its permission set (see `rbac::roles::role_response`).
#[derive(Debug, Clone)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub scope: RoleScope,
    /// Owning scope instance, for roles local to one conversation
    pub scope_id: Option<String>,
    pub description: String,
    pub parent_role_id: Option<String>,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Role {
    pub const COLUMNS: &'static str =
        "id, name, scope, scope_id, description, parent_role_id, is_default, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Role {
            id: row.get(0)?,
            name: row.get(1)?,
            scope: row.get(2)?,
            scope_id: row.get(3)?,
            description: row.get(4)?,
            parent_role_id: row.get(5)?,
            is_default: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

/// Binding of a role to a user within one scope instance.
#[derive(Debug, Clone, Serialize)]
pub struct RoleAssignment {
    pub id: String,
    pub role_id: String,
    pub user_id: i64,
    pub scope_type: RoleScope,
    pub scope_id: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

impl RoleAssignment {
    pub const COLUMNS: &'static str =
        "id, role_id, user_id, scope_type, scope_id, expires_at, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RoleAssignment {
            id: row.get(0)?,
            role_id: row.get(1)?,
            user_id: row.get(2)?,
            scope_type: row.get(3)?,
            scope_id: row.get(4)?,
            expires_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

// --- Scopes ---

#[derive(Debug, Clone, Serialize)]
pub struct Community {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub owner_id: i64,
    pub is_archived: bool,
    pub created_at: String,
}

impl Community {
    pub const COLUMNS: &'static str = "id, slug, name, owner_id, is_archived, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Community {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            owner_id: row.get(3)?,
            is_archived: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub community_id: Option<String>,
    pub owner_id: i64,
    pub conversation_id: Option<String>,
    pub member_count: i64,
    pub is_archived: bool,
    pub created_at: String,
}

impl Group {
    pub const COLUMNS: &'static str = "id, slug, name, community_id, owner_id, conversation_id, \
        member_count, is_archived, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Group {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            community_id: row.get(3)?,
            owner_id: row.get(4)?,
            conversation_id: row.get(5)?,
            member_count: row.get(6)?,
            is_archived: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub owner_id: i64,
    pub conversation_id: Option<String>,
    pub is_archived: bool,
    pub created_at: String,
}

impl Channel {
    pub const COLUMNS: &'static str =
        "id, slug, name, owner_id, conversation_id, is_archived, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Channel {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            owner_id: row.get(3)?,
            conversation_id: row.get(4)?,
            is_archived: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_parse_is_case_insensitive() {
        assert_eq!(RoleScope::parse("conversation"), Some(RoleScope::Conversation));
        assert_eq!(RoleScope::parse("CHANNEL"), Some(RoleScope::Channel));
        assert_eq!(BaseRole::parse("Owner"), Some(BaseRole::Owner));
        assert_eq!(SendPolicy::parse("everyone"), None);
    }

    #[test]
    fn test_text_enum_serde() {
        let json = serde_json::to_string(&SendPolicy::AdminsOnly).unwrap();
        assert_eq!(json, "\"admins_only\"");
        let parsed: AceEffect = serde_json::from_str("\"deny\"").unwrap();
        assert_eq!(parsed, AceEffect::Deny);
        assert!(serde_json::from_str::<BaseRole>("\"superadmin\"").is_err());
    }
}
