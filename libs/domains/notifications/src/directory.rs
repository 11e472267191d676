//! Team membership lookup for fan-out.

use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Trait for resolving a team id to its member user ids.
///
/// An unknown team resolves to an empty list, not an error. Errors are reserved
/// for lookups that may succeed later (backend unavailable).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TeamDirectory: Send + Sync {
    async fn members(&self, team_id: Uuid) -> NotificationResult<Vec<Uuid>>;
}

/// In-memory directory, optionally seeded from a JSON file of the form
/// `{ "<team uuid>": ["<user uuid>", ...] }`.
#[derive(Clone, Default)]
pub struct InMemoryTeamDirectory {
    teams: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
}

impl InMemoryTeamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(teams: HashMap<Uuid, Vec<Uuid>>) -> Self {
        Self {
            teams: Arc::new(RwLock::new(teams)),
        }
    }

    /// Load teams from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> NotificationResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            NotificationError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let teams: HashMap<Uuid, Vec<Uuid>> = serde_json::from_str(&raw).map_err(|e| {
            NotificationError::Config(format!("Invalid team directory {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), teams = teams.len(), "Loaded team directory");
        Ok(Self::from_map(teams))
    }

    /// Replace a team's member list.
    pub async fn set_members(&self, team_id: Uuid, members: Vec<Uuid>) {
        self.teams.write().await.insert(team_id, members);
    }

    pub async fn team_count(&self) -> usize {
        self.teams.read().await.len()
    }
}

#[async_trait]
impl TeamDirectory for InMemoryTeamDirectory {
    async fn members(&self, team_id: Uuid) -> NotificationResult<Vec<Uuid>> {
        Ok(self
            .teams
            .read()
            .await
            .get(&team_id)
            .cloned()
            .unwrap_or_default())
    }
}
