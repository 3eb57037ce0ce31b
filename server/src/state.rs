use crate::config::ChatConfig;
use crate::db::DbPool;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Hex SHA-256 of the configured internal token, if any
    pub internal_token_hash: Option<String>,
    /// Chat limits from the [chat] config section
    pub chat: ChatConfig,
}
