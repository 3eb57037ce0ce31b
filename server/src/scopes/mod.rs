//! Communities, groups and channels: the scopes above conversations that
//! roles and ACEs can target. Groups and channels each carry a conversation.

pub mod crud;
pub mod membership;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::models::{Channel, Community, Group};
use crate::error::ApiError;

const MAX_SLUG_LEN: usize = 64;

pub fn find_community(conn: &Connection, id: &str) -> Result<Option<Community>, ApiError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM communities WHERE id = ?1", Community::COLUMNS),
            [id],
            Community::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn find_group(conn: &Connection, id: &str) -> Result<Option<Group>, ApiError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM groups WHERE id = ?1", Group::COLUMNS),
            [id],
            Group::from_row,
        )
        .optional()?;
    Ok(row)
}

/// The group whose conversation is `conversation_id`, if any.
pub fn group_for_conversation(conn: &Connection, conversation_id: &str) -> Result<Option<Group>, ApiError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM groups WHERE conversation_id = ?1", Group::COLUMNS),
            [conversation_id],
            Group::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn find_channel(conn: &Connection, id: &str) -> Result<Option<Channel>, ApiError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM channels WHERE id = ?1", Channel::COLUMNS),
            [id],
            Channel::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn require_community(conn: &Connection, id: &str) -> Result<Community, ApiError> {
    find_community(conn, id)?.ok_or_else(|| ApiError::not_found("Community not found"))
}

pub fn require_group(conn: &Connection, id: &str) -> Result<Group, ApiError> {
    find_group(conn, id)?.ok_or_else(|| ApiError::not_found("Group not found"))
}

pub fn require_channel(conn: &Connection, id: &str) -> Result<Channel, ApiError> {
    find_channel(conn, id)?.ok_or_else(|| ApiError::not_found("Channel not found"))
}

/// Lowercase ASCII letters, digits and dashes. Derived from the name when
/// no slug is given.
pub fn normalize_slug(slug: Option<&str>, name: &str) -> Result<String, ApiError> {
    let slug = match slug.map(str::trim).filter(|s| !s.is_empty()) {
        Some(explicit) => explicit.to_ascii_lowercase(),
        None => {
            let mut out = String::new();
            for c in name.trim().chars() {
                if c.is_ascii_alphanumeric() {
                    out.push(c.to_ascii_lowercase());
                } else if !out.ends_with('-') && !out.is_empty() {
                    out.push('-');
                }
            }
            out.trim_end_matches('-').to_string()
        }
    };
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        return Err(ApiError::validation("slug must be 1 to 64 characters"));
    }
    if !slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(ApiError::validation("slug may only contain a-z, 0-9 and '-'"));
    }
    Ok(slug)
}

/// Recompute the cached member count from active memberships.
pub fn refresh_member_count(conn: &Connection, group_id: &str) -> Result<i64, ApiError> {
    conn.execute(
        "UPDATE groups SET member_count =
            (SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND status = 'ACTIVE')
         WHERE id = ?1",
        [group_id],
    )?;
    let count = conn.query_row("SELECT member_count FROM groups WHERE id = ?1", [group_id], |row| row.get(0))?;
    Ok(count)
}

/// Archive the conversation attached to a scope, if any.
pub fn archive_linked_conversation(conn: &Connection, conversation_id: Option<&str>) -> Result<(), ApiError> {
    if let Some(id) = conversation_id {
        conn.execute(
            "UPDATE conversations SET is_archived = 1, updated_at = ?1 WHERE id = ?2",
            params![crate::db::now(), id],
        )?;
    }
    Ok(())
}

/// Maps a UNIQUE violation on insert to a 400 naming the duplicated thing.
pub(crate) fn unique_violation(what: &'static str) -> impl FnOnce(rusqlite::Error) -> ApiError {
    move |e| match e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            ApiError::validation(format!("{} already exists", what))
        }
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_from_name() {
        assert_eq!(normalize_slug(None, "Douala Runners").unwrap(), "douala-runners");
        assert_eq!(normalize_slug(None, "  Hello,  World! ").unwrap(), "hello-world");
        assert_eq!(normalize_slug(Some("Team-1"), "ignored").unwrap(), "team-1");
    }

    #[test]
    fn test_invalid_slugs() {
        assert!(normalize_slug(None, "!!!").is_err());
        assert!(normalize_slug(Some("bad slug"), "x").is_err());
        assert!(normalize_slug(Some(&"a".repeat(65)), "x").is_err());
    }
}
