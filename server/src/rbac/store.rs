//! Loads engine facts and role hierarchies from SQLite.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::accounts;
use crate::db::models::{AceEffect, BaseRole, GroupMemberStatus, Role};
use crate::db::parse_timestamp;
use crate::error::ApiError;
use crate::rbac::engine::{AceFact, AssignmentFact, MembershipFact, RoleGrant, ScopeFacts, SubjectFacts};
use crate::rbac::refs::{ObjectKind, ObjectRef, Principal, Target};

/// Unparseable expiry columns count as already expired.
fn expiry(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_timestamp(&s).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

pub fn find_role(conn: &Connection, role_id: &str) -> Result<Option<Role>, ApiError> {
    let role = conn
        .query_row(
            &format!("SELECT {} FROM roles WHERE id = ?1", Role::COLUMNS),
            [role_id],
            Role::from_row,
        )
        .optional()?;
    Ok(role)
}

/// Permission codes attached directly to a role, sorted.
pub fn own_permissions(conn: &Connection, role_id: &str) -> Result<Vec<String>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT permission_code FROM role_permissions WHERE role_id = ?1 ORDER BY permission_code",
    )?;
    let codes = stmt
        .query_map([role_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(codes)
}

fn parent_of(conn: &Connection, role_id: &str) -> Result<Option<String>, ApiError> {
    let parent = conn
        .query_row(
            "SELECT parent_role_id FROM roles WHERE id = ?1",
            [role_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten();
    Ok(parent)
}

/// Own permissions plus every ancestor's. A cycle in stored data stops the
/// walk instead of looping.
pub fn effective_permissions(conn: &Connection, role_id: &str) -> Result<BTreeSet<String>, ApiError> {
    let mut permissions = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut current = Some(role_id.to_string());

    while let Some(id) = current {
        if !seen.insert(id.clone()) {
            tracing::warn!("Role parent cycle detected at {}", id);
            break;
        }
        permissions.extend(own_permissions(conn, &id)?);
        current = parent_of(conn, &id)?;
    }
    Ok(permissions)
}

pub fn role_grant(conn: &Connection, role_id: &str) -> Result<RoleGrant, ApiError> {
    Ok(RoleGrant {
        role_id: role_id.to_string(),
        permissions: effective_permissions(conn, role_id)?,
    })
}

/// Would making `new_parent` the parent of `role_id` close a loop?
/// `parents` maps every role to its current parent.
pub fn creates_cycle(parents: &HashMap<String, Option<String>>, role_id: &str, new_parent: &str) -> bool {
    let mut seen = HashSet::new();
    let mut current = Some(new_parent);
    while let Some(id) = current {
        if id == role_id {
            return true;
        }
        if !seen.insert(id) {
            // Pre-existing loop that does not pass through role_id
            return false;
        }
        current = parents.get(id).and_then(|p| p.as_deref());
    }
    false
}

fn parent_map(conn: &Connection) -> Result<HashMap<String, Option<String>>, ApiError> {
    let mut stmt = conn.prepare("SELECT id, parent_role_id FROM roles")?;
    let map = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<String, Option<String>>, _>>()?;
    Ok(map)
}

/// Parent must exist and must not make the hierarchy cyclic. `role_id` is
/// None for a role that is not stored yet.
pub fn validate_parent(conn: &Connection, role_id: Option<&str>, parent_id: &str) -> Result<(), ApiError> {
    if find_role(conn, parent_id)?.is_none() {
        return Err(ApiError::validation(format!("Parent role '{}' does not exist", parent_id)));
    }
    if let Some(role_id) = role_id {
        if creates_cycle(&parent_map(conn)?, role_id, parent_id) {
            return Err(ApiError::validation("Parent role would create a cycle"));
        }
    }
    Ok(())
}

pub fn load_subject(conn: &Connection, user_id: i64) -> Result<SubjectFacts, ApiError> {
    let is_superuser = accounts::is_superuser(conn, user_id)?;
    let mut stmt = conn.prepare("SELECT role_id, expires_at FROM role_assignments WHERE user_id = ?1")?;
    let assigned_roles = stmt
        .query_map([user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(role_id, expires)| (role_id, expiry(expires)))
        .collect();

    Ok(SubjectFacts {
        user_id,
        is_superuser,
        assigned_roles,
    })
}

fn load_membership(conn: &Connection, user_id: i64, object: &ObjectRef) -> Result<Option<MembershipFact>, ApiError> {
    let row: Option<(Option<BaseRole>, Option<String>, Option<String>)> = match object.kind {
        ObjectKind::Conversation => conn
            .query_row(
                "SELECT base_role, role_id FROM conversation_members
                 WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL AND is_blocked = 0",
                params![object.id, user_id],
                |row| Ok((Some(row.get(0)?), row.get(1)?, None)),
            )
            .optional()?,
        ObjectKind::Group => conn
            .query_row(
                "SELECT role_id, expires_at FROM group_members
                 WHERE group_id = ?1 AND user_id = ?2 AND status = ?3",
                params![object.id, user_id, GroupMemberStatus::Active],
                |row| Ok((None, row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        _ => None,
    };

    let Some((base_role, role_id, expires_at)) = row else {
        return Ok(None);
    };
    let role = match role_id {
        Some(id) => Some(role_grant(conn, &id)?),
        None => None,
    };
    Ok(Some(MembershipFact {
        base_role,
        role,
        expires_at: expiry(expires_at),
    }))
}

fn load_assignments(conn: &Connection, user_id: i64, object: &ObjectRef) -> Result<Vec<AssignmentFact>, ApiError> {
    let Some(scope) = object.kind.role_scope() else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(
        "SELECT role_id, expires_at FROM role_assignments
         WHERE user_id = ?1 AND scope_type = ?2 AND scope_id = ?3",
    )?;
    let rows = stmt
        .query_map(params![user_id, scope, object.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(role_id, expires)| {
            Ok(AssignmentFact {
                role: role_grant(conn, &role_id)?,
                expires_at: expiry(expires),
            })
        })
        .collect()
}

/// ACEs whose target could cover `object`: exact, type-wide or global.
fn load_aces(conn: &Connection, object: &ObjectRef) -> Result<Vec<AceFact>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id, principal_type, principal_id, target_type, target_id, permissions, effect, expires_at
         FROM aces
         WHERE (target_type = ?1 AND (target_id = ?2 OR target_id IS NULL))
            OR (target_type IS NULL AND target_id IS NULL)",
    )?;
    let rows = stmt
        .query_map(params![object.kind.tag(), object.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, AceEffect>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut aces = Vec::with_capacity(rows.len());
    for (id, p_type, p_id, t_type, t_id, perms, effect, expires) in rows {
        let principal = Principal::from_columns(p_type.as_deref(), p_id.as_deref());
        let target = Target::from_columns(t_type.as_deref(), t_id.as_deref());
        let permissions = serde_json::from_str::<Vec<String>>(&perms).ok();
        match (principal, target, permissions) {
            (Some(principal), Some(target), Some(permissions)) => aces.push(AceFact {
                principal,
                target,
                permissions,
                effect,
                expires_at: expiry(expires),
            }),
            _ => tracing::warn!("Skipping malformed ACE {}", id),
        }
    }
    Ok(aces)
}

fn linked_scopes(conn: &Connection, channel_id: &str) -> Result<Vec<ObjectRef>, ApiError> {
    let mut linked = Vec::new();
    let mut stmt = conn.prepare("SELECT group_id FROM channel_groups WHERE channel_id = ?1")?;
    for id in stmt.query_map([channel_id], |row| row.get::<_, String>(0))? {
        linked.push(ObjectRef::new(ObjectKind::Group, id?));
    }
    let mut stmt = conn.prepare("SELECT community_id FROM channel_communities WHERE channel_id = ?1")?;
    for id in stmt.query_map([channel_id], |row| row.get::<_, String>(0))? {
        linked.push(ObjectRef::new(ObjectKind::Community, id?));
    }
    Ok(linked)
}

/// Everything the engine needs about `object` for `user_id`. Linked scopes
/// are loaded one level deep for channels when `with_links` is set.
pub fn load_scope(conn: &Connection, user_id: i64, object: &ObjectRef, with_links: bool) -> Result<ScopeFacts, ApiError> {
    let mut scope = ScopeFacts::new(object.clone());
    scope.membership = load_membership(conn, user_id, object)?;
    scope.assignments = load_assignments(conn, user_id, object)?;
    scope.aces = load_aces(conn, object)?;

    if with_links && object.kind == ObjectKind::Channel {
        for linked in linked_scopes(conn, &object.id)? {
            scope.linked.push(load_scope(conn, user_id, &linked, false)?);
        }
    }
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_db, now};

    fn insert_role(conn: &Connection, id: &str, parent: Option<&str>, perms: &[&str]) {
        conn.execute(
            "INSERT INTO roles (id, name, scope, parent_role_id, created_at, updated_at)
             VALUES (?1, ?1, 'GLOBAL', ?2, ?3, ?3)",
            params![id, parent, now()],
        )
        .unwrap();
        for p in perms {
            conn.execute(
                "INSERT INTO role_permissions (role_id, permission_code) VALUES (?1, ?2)",
                params![id, p],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_creates_cycle() {
        let parents: HashMap<String, Option<String>> = [
            ("a".to_string(), None),
            ("b".to_string(), Some("a".to_string())),
            ("c".to_string(), Some("b".to_string())),
        ]
        .into_iter()
        .collect();
        // a -> c would close c -> b -> a -> c
        assert!(creates_cycle(&parents, "a", "c"));
        assert!(creates_cycle(&parents, "a", "a"));
        assert!(!creates_cycle(&parents, "c", "a"));
    }

    #[test]
    fn test_effective_permissions_include_ancestors() {
        let conn = init_memory_db().unwrap();
        insert_role(&conn, "base", None, &["chat.send_message"]);
        insert_role(&conn, "mod", Some("base"), &["chat.pin_message"]);
        insert_role(&conn, "lead", Some("mod"), &["chat.archive"]);

        let lead = effective_permissions(&conn, "lead").unwrap();
        let base = effective_permissions(&conn, "base").unwrap();
        assert!(lead.is_superset(&base));
        assert_eq!(lead.len(), 3);
    }

    #[test]
    fn test_effective_permissions_survive_stored_cycle() {
        let conn = init_memory_db().unwrap();
        insert_role(&conn, "x", None, &["chat.pin_message"]);
        insert_role(&conn, "y", Some("x"), &["chat.archive"]);
        conn.execute("UPDATE roles SET parent_role_id = 'y' WHERE id = 'x'", []).unwrap();

        let perms = effective_permissions(&conn, "y").unwrap();
        assert_eq!(perms.len(), 2);
    }

    #[test]
    fn test_validate_parent() {
        let conn = init_memory_db().unwrap();
        insert_role(&conn, "a", None, &[]);
        insert_role(&conn, "b", Some("a"), &[]);
        assert!(validate_parent(&conn, Some("a"), "b").is_err());
        assert!(validate_parent(&conn, None, "missing").is_err());
        assert!(validate_parent(&conn, Some("b"), "a").is_ok());
    }

    #[test]
    fn test_malformed_ace_rows_are_skipped() {
        let conn = init_memory_db().unwrap();
        let ts = now();
        conn.execute(
            "INSERT INTO aces (id, principal_type, principal_id, target_type, target_id, permissions, effect, created_at, updated_at)
             VALUES ('bad', NULL, 'PUBLIC', NULL, NULL, 'not json', 'ALLOW', ?1, ?1),
                    ('good', NULL, 'PUBLIC', NULL, NULL, '[\"chat.pin_message\"]', 'DENY', ?1, ?1)",
            [&ts],
        )
        .unwrap();
        let aces = load_aces(&conn, &ObjectRef::conversation("c")).unwrap();
        assert_eq!(aces.len(), 1);
        assert_eq!(aces[0].effect, AceEffect::Deny);
    }
}
