//! Typed references to objects that roles, assignments and ACEs point at.
//!
//! On the wire a reference is `{"type": "<namespace>.<Model>", "id": "<pk>"}`.
//! In the database it is a `(type_tag, id)` pair of nullable TEXT columns.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::models::RoleScope;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    User,
    Role,
    Conversation,
    Community,
    Group,
    Channel,
    Partner,
}

impl ObjectKind {
    pub const ALL: &'static [ObjectKind] = &[
        ObjectKind::User,
        ObjectKind::Role,
        ObjectKind::Conversation,
        ObjectKind::Community,
        ObjectKind::Group,
        ObjectKind::Channel,
        ObjectKind::Partner,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ObjectKind::User => "accounts.User",
            ObjectKind::Role => "core.Role",
            ObjectKind::Conversation => "chat.Conversation",
            ObjectKind::Community => "core.Community",
            ObjectKind::Group => "core.Group",
            ObjectKind::Channel => "core.Channel",
            ObjectKind::Partner => "partners.Partner",
        }
    }

    /// Namespace must match exactly; the model part is case-insensitive.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let (namespace, model) = tag.trim().split_once('.')?;
        Self::ALL.iter().copied().find(|kind| {
            let (ns, m) = kind.tag().split_once('.').unwrap_or_default();
            ns == namespace && m.eq_ignore_ascii_case(model)
        })
    }

    /// Scope level used when matching role assignments against this kind.
    pub fn role_scope(&self) -> Option<RoleScope> {
        match self {
            ObjectKind::Conversation => Some(RoleScope::Conversation),
            ObjectKind::Community => Some(RoleScope::Community),
            ObjectKind::Group => Some(RoleScope::Group),
            ObjectKind::Channel => Some(RoleScope::Channel),
            ObjectKind::Partner => Some(RoleScope::Partner),
            ObjectKind::User | ObjectKind::Role => None,
        }
    }

    pub fn from_role_scope(scope: RoleScope) -> Option<Self> {
        match scope {
            RoleScope::Conversation => Some(ObjectKind::Conversation),
            RoleScope::Community => Some(ObjectKind::Community),
            RoleScope::Group => Some(ObjectKind::Group),
            RoleScope::Channel => Some(ObjectKind::Channel),
            RoleScope::Partner => Some(ObjectKind::Partner),
            RoleScope::Global => None,
        }
    }

    /// Table backing this kind. Partners live in another service.
    fn table(&self) -> Option<&'static str> {
        match self {
            ObjectKind::User => Some("users"),
            ObjectKind::Role => Some("roles"),
            ObjectKind::Conversation => Some("conversations"),
            ObjectKind::Community => Some("communities"),
            ObjectKind::Group => Some("groups"),
            ObjectKind::Channel => Some("channels"),
            ObjectKind::Partner => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        ObjectRef { kind, id: id.into() }
    }

    pub fn conversation(id: impl Into<String>) -> Self {
        Self::new(ObjectKind::Conversation, id)
    }

    pub fn to_wire(&self) -> RefBody {
        RefBody {
            kind: Some(self.kind.tag().to_string()),
            id: Some(WireId::Text(self.id.clone())),
        }
    }
}

/// Who an ACE applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    User(i64),
    Role(String),
    Public,
}

pub const PUBLIC_PRINCIPAL_ID: &str = "PUBLIC";

impl Principal {
    /// Decode from a request body. A null principal is PUBLIC.
    pub fn from_wire(body: Option<&RefBody>) -> Result<Self, ApiError> {
        let Some(body) = body else {
            return Ok(Principal::Public);
        };
        let id = body.id.as_ref().map(WireId::as_string);
        match body.kind.as_deref() {
            None if id.as_deref() == Some(PUBLIC_PRINCIPAL_ID) || id.is_none() => Ok(Principal::Public),
            None => Err(ApiError::validation("Principal type is required")),
            Some(tag) => {
                let kind = ObjectKind::from_tag(tag)
                    .ok_or_else(|| ApiError::validation(format!("Unknown principal type '{}'", tag)))?;
                let id = id.ok_or_else(|| ApiError::validation("Principal id is required"))?;
                match kind {
                    ObjectKind::User => id
                        .parse()
                        .map(Principal::User)
                        .map_err(|_| ApiError::validation("User principal id must be an integer")),
                    ObjectKind::Role => Ok(Principal::Role(id)),
                    other => Err(ApiError::validation(format!(
                        "Principal must be a user or a role, got {}",
                        other
                    ))),
                }
            }
        }
    }

    /// `(principal_type, principal_id)` columns.
    pub fn to_columns(&self) -> (Option<&'static str>, String) {
        match self {
            Principal::User(id) => (Some(ObjectKind::User.tag()), id.to_string()),
            Principal::Role(id) => (Some(ObjectKind::Role.tag()), id.clone()),
            Principal::Public => (None, PUBLIC_PRINCIPAL_ID.to_string()),
        }
    }

    /// Inverse of [`Principal::to_columns`]. Unknown combinations yield None.
    pub fn from_columns(kind: Option<&str>, id: Option<&str>) -> Option<Self> {
        match (kind.and_then(ObjectKind::from_tag), id) {
            (None, _) if kind.is_none() => Some(Principal::Public),
            (Some(ObjectKind::User), Some(id)) => id.parse().ok().map(Principal::User),
            (Some(ObjectKind::Role), Some(id)) => Some(Principal::Role(id.to_string())),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> Option<RefBody> {
        match self {
            Principal::Public => None,
            other => {
                let (kind, id) = other.to_columns();
                Some(RefBody {
                    kind: kind.map(str::to_string),
                    id: Some(WireId::Text(id)),
                })
            }
        }
    }
}

/// What an ACE applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Object(ObjectRef),
    TypeWide(ObjectKind),
    Global,
}

impl Target {
    /// Decode from a request body. Null is global, a missing id is type-wide.
    pub fn from_wire(body: Option<&RefBody>) -> Result<Self, ApiError> {
        let Some(body) = body else {
            return Ok(Target::Global);
        };
        let Some(tag) = body.kind.as_deref() else {
            return match body.id {
                None => Ok(Target::Global),
                Some(_) => Err(ApiError::validation("Target type is required when an id is given")),
            };
        };
        let kind = ObjectKind::from_tag(tag)
            .ok_or_else(|| ApiError::validation(format!("Unknown target type '{}'", tag)))?;
        match body.id.as_ref().map(WireId::as_string) {
            None => Ok(Target::TypeWide(kind)),
            Some(id) if id.is_empty() => Ok(Target::TypeWide(kind)),
            Some(id) => Ok(Target::Object(ObjectRef::new(kind, id))),
        }
    }

    pub fn to_columns(&self) -> (Option<&'static str>, Option<String>) {
        match self {
            Target::Object(r) => (Some(r.kind.tag()), Some(r.id.clone())),
            Target::TypeWide(kind) => (Some(kind.tag()), None),
            Target::Global => (None, None),
        }
    }

    pub fn from_columns(kind: Option<&str>, id: Option<&str>) -> Option<Self> {
        match (kind, id) {
            (None, None) => Some(Target::Global),
            (Some(tag), None) => ObjectKind::from_tag(tag).map(Target::TypeWide),
            (Some(tag), Some(id)) => {
                ObjectKind::from_tag(tag).map(|kind| Target::Object(ObjectRef::new(kind, id)))
            }
            (None, Some(_)) => None,
        }
    }

    /// True if an ACE with this target applies to `object`.
    pub fn covers(&self, object: &ObjectRef) -> bool {
        match self {
            Target::Object(r) => r == object,
            Target::TypeWide(kind) => *kind == object.kind,
            Target::Global => true,
        }
    }

    pub fn to_wire(&self) -> Option<RefBody> {
        match self {
            Target::Global => None,
            Target::TypeWide(kind) => Some(RefBody {
                kind: Some(kind.tag().to_string()),
                id: None,
            }),
            Target::Object(r) => Some(r.to_wire()),
        }
    }
}

/// Ids arrive as JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Int(i64),
    Text(String),
}

impl WireId {
    pub fn as_string(&self) -> String {
        match self {
            WireId::Int(n) => n.to_string(),
            WireId::Text(s) => s.trim().to_string(),
        }
    }
}

/// Wire form of a generic reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefBody {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<WireId>,
}

impl RefBody {
    /// Concrete object reference, 400 otherwise.
    pub fn to_object(&self) -> Result<ObjectRef, ApiError> {
        match Target::from_wire(Some(self))? {
            Target::Object(r) => Ok(r),
            _ => Err(ApiError::validation("A concrete object reference {type, id} is required")),
        }
    }
}

/// Registry lookup: does the referenced object exist? Partner references are
/// weak (owned by another service) and always accepted.
pub fn object_exists(conn: &Connection, object: &ObjectRef) -> Result<bool, ApiError> {
    let Some(table) = object.kind.table() else {
        return Ok(true);
    };
    let found = if object.kind == ObjectKind::User {
        match object.id.parse::<i64>() {
            Ok(id) => conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |_| Ok(()))
                .optional()?
                .is_some(),
            Err(_) => false,
        }
    } else {
        conn.query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", table),
            [&object.id],
            |_| Ok(()),
        )
        .optional()?
        .is_some()
    };
    Ok(found)
}

/// 400 if a referenced object is missing.
pub fn require_object(conn: &Connection, object: &ObjectRef) -> Result<(), ApiError> {
    if object_exists(conn, object)? {
        Ok(())
    } else {
        Err(ApiError::validation(format!(
            "Referenced {} '{}' does not exist",
            object.kind, object.id
        )))
    }
}
