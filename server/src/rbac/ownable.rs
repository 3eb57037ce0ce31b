//! Ownership capability for entities whose owner alone may archive them.

use crate::db::models::{Channel, Community, Conversation, Group};
use crate::error::ApiError;

pub trait Ownable {
    fn owner_id(&self) -> i64;

    fn is_owned_by(&self, user_id: i64) -> bool {
        self.owner_id() == user_id
    }
}

impl Ownable for Conversation {
    fn owner_id(&self) -> i64 {
        self.created_by
    }
}

impl Ownable for Community {
    fn owner_id(&self) -> i64 {
        self.owner_id
    }
}

impl Ownable for Group {
    fn owner_id(&self) -> i64 {
        self.owner_id
    }
}

impl Ownable for Channel {
    fn owner_id(&self) -> i64 {
        self.owner_id
    }
}

/// 403 unless `user_id` owns `entity`.
pub fn require_owner<T: Ownable>(entity: &T, user_id: i64) -> Result<(), ApiError> {
    if entity.is_owned_by(user_id) {
        Ok(())
    } else {
        Err(ApiError::forbidden("Only the owner can perform this action"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn community(owner_id: i64) -> Community {
        Community {
            id: "co".into(),
            slug: "co".into(),
            name: "Co".into(),
            owner_id,
            is_archived: false,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_require_owner() {
        assert!(require_owner(&community(4), 4).is_ok());
        assert!(matches!(require_owner(&community(4), 5), Err(ApiError::Forbidden(_))));
    }
}
