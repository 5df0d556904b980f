//! Persistent store collaborator.
//!
//! The bridge only ever talks to storage through the [`Store`] trait. Two
//! backends ship: [`MemoryStore`] for tests and throwaway runs, and
//! `SqliteStore` (behind the `sqlite` feature) for real deployments.

mod memory;
#[cfg(feature = "sqlite")]
mod schema;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use schema::MIGRATIONS;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{DatabaseConfig, StoreBackend};
use crate::{BridgeError, Result};

/// Attribute map stored on a character card.
pub type Attributes = Map<String, Value>;

/// A character card owned by one user on one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterCard {
    pub id: i64,
    pub user_id: String,
    pub platform: String,
    pub card_name: String,
    pub card_type: String,
    pub is_active: bool,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data for creating a new character card.
#[derive(Debug, Clone)]
pub struct NewCharacter {
    pub user_id: String,
    pub platform: String,
    pub card_name: String,
    pub card_type: String,
    pub is_active: bool,
    pub attributes: Attributes,
}

impl NewCharacter {
    /// Create a new inactive card with no attributes.
    pub fn new(
        user_id: impl Into<String>,
        platform: impl Into<String>,
        card_name: impl Into<String>,
        card_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            card_name: card_name.into(),
            card_type: card_type.into(),
            is_active: false,
            attributes: Attributes::new(),
        }
    }

    /// Set the initial attributes.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Mark the card as the user's active card.
    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}

/// Group-scoped card binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterBinding {
    pub user_id: String,
    pub platform: String,
    pub group_id: String,
    pub card_name: String,
}

/// A multi-participant game running across one or more channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSession {
    pub id: i64,
    pub name: String,
    pub platform: String,
    /// Channel the game was opened in.
    pub origin: String,
    pub gm: Vec<String>,
    pub players: Vec<String>,
    pub observers: Vec<String>,
    /// Channels the game is visible in.
    pub areas: Vec<String>,
    pub config: Map<String, Value>,
    pub roulette: Map<String, Value>,
    pub is_logging: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameSession {
    /// Build an unsaved session opened in `origin`.
    pub fn new(name: impl Into<String>, platform: impl Into<String>, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            platform: platform.into(),
            areas: vec![origin.clone()],
            origin,
            gm: Vec::new(),
            players: Vec::new(),
            observers: Vec::new(),
            config: Map::new(),
            roulette: Map::new(),
            is_logging: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Asynchronous store over the collections the bridge consumes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a card by owner and name.
    async fn get_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<Option<CharacterCard>>;

    /// Get the user's globally active card.
    async fn get_active_character(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<Option<CharacterCard>>;

    /// List all cards owned by a user, ordered by name.
    async fn list_characters(&self, user_id: &str, platform: &str) -> Result<Vec<CharacterCard>>;

    /// Create a card. Fails if the name is already taken for that owner.
    async fn create_character(&self, new: &NewCharacter) -> Result<CharacterCard>;

    /// Replace a card's attribute map. Returns false when the card does not exist.
    async fn update_attributes(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
        attributes: &Attributes,
    ) -> Result<bool>;

    /// Make `card_name` the only active card of the user.
    async fn set_active_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<bool>;

    /// Delete a card together with its group bindings.
    async fn remove_character(&self, user_id: &str, platform: &str, card_name: &str)
        -> Result<bool>;

    /// Get the card bound to a group.
    async fn get_binding(
        &self,
        user_id: &str,
        platform: &str,
        group_id: &str,
    ) -> Result<Option<CharacterBinding>>;

    /// Create or replace a group binding.
    async fn set_binding(&self, binding: &CharacterBinding) -> Result<()>;

    /// Remove a group binding.
    async fn remove_binding(&self, user_id: &str, platform: &str, group_id: &str) -> Result<bool>;

    /// Find the game session whose areas contain `channel_id`.
    async fn find_session(&self, platform: &str, channel_id: &str) -> Result<Option<GameSession>>;

    /// Find a game session by name.
    async fn get_session_by_name(&self, platform: &str, name: &str) -> Result<Option<GameSession>>;

    /// Insert (id 0) or update a game session, returning the stored row.
    async fn save_session(&self, session: &GameSession) -> Result<GameSession>;

    /// Delete a game session.
    async fn remove_session(&self, id: i64) -> Result<bool>;

    /// Read one group data value.
    async fn get_group_data(&self, group_id: &str, key: &str) -> Result<Option<Value>>;

    /// Read all data values of one group.
    async fn group_data(&self, group_id: &str) -> Result<Map<String, Value>>;

    /// Upsert one group data value.
    async fn set_group_data(&self, group_id: &str, key: &str, value: &Value) -> Result<()>;

    /// Read one user data value.
    async fn get_user_data(&self, user_id: &str, key: &str) -> Result<Option<Value>>;

    /// Read all data values of one user.
    async fn user_data(&self, user_id: &str) -> Result<Map<String, Value>>;

    /// Upsert one user data value.
    async fn set_user_data(&self, user_id: &str, key: &str, value: &Value) -> Result<()>;
}

/// Open the store selected by the database configuration.
pub async fn open(config: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path).await?)),
        #[cfg(not(feature = "sqlite"))]
        StoreBackend::Sqlite => Err(BridgeError::Config(
            "sqlite backend requested but the sqlite feature is disabled".to_string(),
        )),
    }
}

pub(crate) fn duplicate_card(card_name: &str) -> BridgeError {
    BridgeError::Store(format!("character '{card_name}' already exists"))
}
