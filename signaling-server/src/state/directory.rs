use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::DirectoryError;
use crate::UserId;

/// Authoritative identity fields for a user, as stored by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub first_name: String,
    pub last_name: String,
    /// Stored file name under `/assets`; empty when the user has no picture.
    pub picture_path: String,
}

impl DisplayInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    pub fn picture_url(&self, api_base_url: &str) -> Option<String> {
        if self.picture_path.is_empty() {
            return None;
        }
        Some(format!("{}/assets/{}", api_base_url.trim_end_matches('/'), self.picture_path))
    }
}

/// The platform's user store, as seen by the broker.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, DirectoryError>;

    async fn set_online_status(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPresence {
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// In-process directory. Used when no database is configured.
#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<UserId, DisplayInfo>>,
    presence: RwLock<HashMap<UserId, StoredPresence>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: impl Into<UserId>, info: DisplayInfo) {
        self.users.write().await.insert(user_id.into(), info);
    }

    pub async fn presence_of(&self, user_id: &str) -> Option<StoredPresence> {
        self.presence.read().await.get(user_id).cloned()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, DirectoryError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn set_online_status(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        self.presence.write().await.insert(
            user_id.to_string(),
            StoredPresence {
                is_online,
                last_seen_at,
            },
        );
        Ok(())
    }
}
