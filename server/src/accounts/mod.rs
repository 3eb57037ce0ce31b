//! Local mirror of accounts owned by the external accounts service.
//!
//! The accounts service pushes users through `PUT /internal/users/{id}`;
//! everything else here only reads the mirror.

pub mod sync;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::models::User;
use crate::error::ApiError;

pub fn find_by_id(conn: &Connection, user_id: i64) -> Result<Option<User>, ApiError> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", User::COLUMNS),
            [user_id],
            User::from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn find_by_phone(conn: &Connection, phone: &str) -> Result<Option<User>, ApiError> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE phone = ?1", User::COLUMNS),
            [phone.trim()],
            User::from_row,
        )
        .optional()?;
    Ok(user)
}

/// Active user or 404.
pub fn require_user(conn: &Connection, user_id: i64) -> Result<User, ApiError> {
    match find_by_id(conn, user_id)? {
        Some(user) if user.is_active => Ok(user),
        _ => Err(ApiError::not_found(format!("User {} not found", user_id))),
    }
}

/// The authenticated caller's mirrored account, else 401.
pub fn require_caller(conn: &Connection, user_id: i64) -> Result<User, ApiError> {
    match find_by_id(conn, user_id)? {
        Some(user) if user.is_active => Ok(user),
        _ => Err(ApiError::Unauthorized("Account is unknown or inactive".into())),
    }
}

/// Staff or superuser, else 403. Unknown callers are treated as non-staff.
pub fn require_staff(conn: &Connection, user_id: i64) -> Result<User, ApiError> {
    match find_by_id(conn, user_id)? {
        Some(user) if user.is_active && user.can_manage_rbac() => Ok(user),
        _ => Err(ApiError::forbidden("Staff privileges required")),
    }
}

pub fn is_superuser(conn: &Connection, user_id: i64) -> Result<bool, ApiError> {
    Ok(find_by_id(conn, user_id)?
        .map(|u| u.is_active && u.is_superuser)
        .unwrap_or(false))
}

/// Fields accepted from the accounts service.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UserUpsert {
    #[serde(default)]
    pub username: String,
    pub phone: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Insert or refresh a mirrored account.
pub fn upsert(conn: &Connection, user_id: i64, input: &UserUpsert) -> Result<User, ApiError> {
    let now = crate::db::now();
    let phone = input
        .phone
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    conn.execute(
        "INSERT INTO users (id, username, phone, display_name, is_superuser, is_staff, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(id) DO UPDATE SET
            username = excluded.username,
            phone = excluded.phone,
            display_name = excluded.display_name,
            is_superuser = excluded.is_superuser,
            is_staff = excluded.is_staff,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at",
        params![
            user_id,
            input.username,
            phone,
            input.display_name,
            input.is_superuser,
            input.is_staff,
            input.is_active,
            now
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ApiError::validation("Phone number already belongs to another user")
        }
        other => other.into(),
    })?;

    find_by_id(conn, user_id)?.ok_or_else(|| ApiError::Internal("upserted user vanished".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    #[test]
    fn test_upsert_then_lookup_by_phone() {
        let conn = init_memory_db().unwrap();
        let input = UserUpsert {
            username: "bea".into(),
            phone: Some(" +237600000000 ".into()),
            is_active: true,
            ..Default::default()
        };
        upsert(&conn, 2, &input).unwrap();

        let found = find_by_phone(&conn, "+237600000000").unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert!(!found.can_manage_rbac());
    }

    #[test]
    fn test_upsert_updates_flags() {
        let conn = init_memory_db().unwrap();
        let mut input = UserUpsert {
            username: "root".into(),
            is_active: true,
            ..Default::default()
        };
        upsert(&conn, 1, &input).unwrap();
        assert!(require_staff(&conn, 1).is_err());

        input.is_staff = true;
        upsert(&conn, 1, &input).unwrap();
        assert!(require_staff(&conn, 1).is_ok());
        assert!(!is_superuser(&conn, 1).unwrap());
    }

    #[test]
    fn test_duplicate_phone_is_validation_error() {
        let conn = init_memory_db().unwrap();
        let input = UserUpsert {
            phone: Some("+1555".into()),
            is_active: true,
            ..Default::default()
        };
        upsert(&conn, 1, &input).unwrap();
        let err = upsert(&conn, 2, &input).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
