pub mod migrations;
pub mod models;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ApiError;

/// Type alias for the shared database connection.
/// rusqlite is synchronous - we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("parley.db");
    let mut conn = Connection::open(&db_path)?;

    // WAL for concurrent readers, foreign keys for membership/settings cascades
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database with the full schema, used by unit tests.
pub fn init_memory_db() -> Result<Connection, Box<dyn std::error::Error>> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrations::migrations().to_latest(&mut conn)?;
    Ok(conn)
}

/// Run a unit of database work on the blocking pool while holding the connection lock.
pub async fn with_conn<T, F>(db: &DbPool, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, ApiError> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = db
            .lock()
            .map_err(|_| ApiError::Internal("DB lock poisoned".to_string()))?;
        f(&mut conn)
    })
    .await?
}

/// Fixed-width RFC 3339 form so lexical order in SQLite equals time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

/// Parse a timestamp column written by [`timestamp`].
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an ISO-8601 timestamp from a request body. Offsets are honoured;
/// naive values (no offset) are taken as UTC.
pub fn parse_client_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// True if an optional expiry column is unset or still in the future.
pub fn is_unexpired(expires_at: Option<&str>, now: DateTime<Utc>) -> bool {
    match expires_at {
        None => true,
        Some(raw) => parse_timestamp(raw).map(|at| at > now).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = Utc::now();
        let late = early + Duration::milliseconds(1500);
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(timestamp(early).len(), timestamp(late).len());
    }

    #[test]
    fn test_expiry_checks() {
        let now = Utc::now();
        assert!(is_unexpired(None, now));
        assert!(is_unexpired(Some(&timestamp(now + Duration::hours(1))), now));
        assert!(!is_unexpired(Some(&timestamp(now - Duration::hours(1))), now));
        assert!(!is_unexpired(Some("garbage"), now));
    }

    #[test]
    fn test_client_timestamps() {
        let aware = parse_client_timestamp("2024-05-01T12:00:00+02:00").unwrap();
        let naive = parse_client_timestamp("2024-05-01T10:00:00").unwrap();
        assert_eq!(aware, naive);
        assert!(parse_client_timestamp("2024-05-01 10:00:00.250").is_some());
        assert!(parse_client_timestamp("yesterday").is_none());
        assert!(parse_client_timestamp("").is_none());
    }

    #[test]
    fn test_memory_db_migrates() {
        let conn = init_memory_db().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM permissions", [], |row| row.get(0))
            .unwrap();
        // Seeded chat.* catalog
        assert!(count >= 9);
    }
}
