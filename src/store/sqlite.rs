//! SQLite store backend.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::schema::MIGRATIONS;
use super::{
    duplicate_card, Attributes, CharacterBinding, CharacterCard, GameSession, NewCharacter, Store,
};
use crate::{BridgeError, Result};

/// Store backed by a SQLite connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CharacterRow {
    id: i64,
    user_id: String,
    platform: String,
    card_name: String,
    card_type: String,
    is_active: bool,
    attributes: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CharacterRow> for CharacterCard {
    type Error = BridgeError;

    fn try_from(row: CharacterRow) -> Result<Self> {
        Ok(CharacterCard {
            id: row.id,
            attributes: decode_json(&row.attributes)?,
            user_id: row.user_id,
            platform: row.platform,
            card_name: row.card_name,
            card_type: row.card_type,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    name: String,
    platform: String,
    origin: String,
    gm: String,
    players: String,
    observers: String,
    areas: String,
    config: String,
    roulette: String,
    is_logging: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for GameSession {
    type Error = BridgeError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(GameSession {
            id: row.id,
            gm: decode_json(&row.gm)?,
            players: decode_json(&row.players)?,
            observers: decode_json(&row.observers)?,
            areas: decode_json(&row.areas)?,
            config: decode_json(&row.config)?,
            roulette: decode_json(&row.roulette)?,
            name: row.name,
            platform: row.platform,
            origin: row.origin,
            is_logging: row.is_logging,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| BridgeError::Store(format!("invalid JSON column: {e}")))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| BridgeError::Store(e.to_string()))
}

const CHARACTER_COLUMNS: &str = "id, user_id, platform, card_name, card_type, is_active, attributes, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, name, platform, origin, gm, players, observers, areas, config, roulette, is_logging, created_at, updated_at";

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory database");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A second connection would see a different in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get the current schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        )
        .fetch_one(&self.pool)
        .await?;

        if !table_exists {
            return Ok(0);
        }

        let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let current_version = self.schema_version().await?;

        if current_version as usize >= MIGRATIONS.len() {
            debug!("Database is up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current_version,
            MIGRATIONS.len()
        );

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version     INTEGER PRIMARY KEY,
                applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        for (i, migration) in MIGRATIONS.iter().enumerate().skip(current_version as usize) {
            let version = (i + 1) as i64;
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!("Applied migration v{}", version);
        }

        Ok(())
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn get_data(&self, table: &str, owner_column: &str, owner: &str, key: &str) -> Result<Option<Value>> {
        let sql = format!("SELECT data_value FROM {table} WHERE {owner_column} = ? AND data_key = ?");
        let row: Option<String> = sqlx::query_scalar(&sql)
            .bind(owner)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|text| decode_json(&text)).transpose()
    }

    async fn all_data(&self, table: &str, owner_column: &str, owner: &str) -> Result<Map<String, Value>> {
        let sql = format!("SELECT data_key, data_value FROM {table} WHERE {owner_column} = ?");
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        let mut map = Map::new();
        for (key, text) in rows {
            match decode_json(&text) {
                Ok(value) => {
                    map.insert(key, value);
                }
                Err(e) => {
                    let corrupt = BridgeError::CacheCorruption {
                        key: format!("{owner}/{key}"),
                        reason: e.to_string(),
                    };
                    warn!(table, "{}", corrupt);
                }
            }
        }
        Ok(map)
    }

    async fn set_data(&self, table: &str, owner_column: &str, owner: &str, key: &str, value: &Value) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} ({owner_column}, data_key, data_value) VALUES (?, ?, ?)
             ON CONFLICT ({owner_column}, data_key) DO UPDATE SET data_value = excluded.data_value"
        );
        sqlx::query(&sql)
            .bind(owner)
            .bind(key)
            .bind(encode_json(value)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<Option<CharacterCard>> {
        let sql = format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters WHERE user_id = ? AND platform = ? AND card_name = ?"
        );
        let row = sqlx::query_as::<_, CharacterRow>(&sql)
            .bind(user_id)
            .bind(platform)
            .bind(card_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CharacterCard::try_from).transpose()
    }

    async fn get_active_character(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<Option<CharacterCard>> {
        let sql = format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters WHERE user_id = ? AND platform = ? AND is_active = 1 LIMIT 1"
        );
        let row = sqlx::query_as::<_, CharacterRow>(&sql)
            .bind(user_id)
            .bind(platform)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CharacterCard::try_from).transpose()
    }

    async fn list_characters(&self, user_id: &str, platform: &str) -> Result<Vec<CharacterCard>> {
        let sql = format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters WHERE user_id = ? AND platform = ? ORDER BY card_name"
        );
        let rows = sqlx::query_as::<_, CharacterRow>(&sql)
            .bind(user_id)
            .bind(platform)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CharacterCard::try_from).collect()
    }

    async fn create_character(&self, new: &NewCharacter) -> Result<CharacterCard> {
        if self
            .get_character(&new.user_id, &new.platform, &new.card_name)
            .await?
            .is_some()
        {
            return Err(duplicate_card(&new.card_name));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO characters (user_id, platform, card_name, card_type, is_active, attributes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.user_id)
        .bind(&new.platform)
        .bind(&new.card_name)
        .bind(&new.card_type)
        .bind(new.is_active)
        .bind(encode_json(&new.attributes)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(CharacterCard {
            id: result.last_insert_rowid(),
            user_id: new.user_id.clone(),
            platform: new.platform.clone(),
            card_name: new.card_name.clone(),
            card_type: new.card_type.clone(),
            is_active: new.is_active,
            attributes: new.attributes.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_attributes(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
        attributes: &Attributes,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE characters SET attributes = ?, updated_at = ?
             WHERE user_id = ? AND platform = ? AND card_name = ?",
        )
        .bind(encode_json(attributes)?)
        .bind(Utc::now())
        .bind(user_id)
        .bind(platform)
        .bind(card_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_active_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM characters WHERE user_id = ? AND platform = ? AND card_name = ?)",
        )
        .bind(user_id)
        .bind(platform)
        .bind(card_name)
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE characters SET is_active = (card_name = ?) WHERE user_id = ? AND platform = ?",
        )
        .bind(card_name)
        .bind(user_id)
        .bind(platform)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM character_bindings WHERE user_id = ? AND platform = ? AND card_name = ?",
        )
        .bind(user_id)
        .bind(platform)
        .bind(card_name)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM characters WHERE user_id = ? AND platform = ? AND card_name = ?",
        )
        .bind(user_id)
        .bind(platform)
        .bind(card_name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_binding(
        &self,
        user_id: &str,
        platform: &str,
        group_id: &str,
    ) -> Result<Option<CharacterBinding>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT card_name FROM character_bindings WHERE user_id = ? AND platform = ? AND group_id = ?",
        )
        .bind(user_id)
        .bind(platform)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(card_name,)| CharacterBinding {
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            group_id: group_id.to_string(),
            card_name,
        }))
    }

    async fn set_binding(&self, binding: &CharacterBinding) -> Result<()> {
        sqlx::query(
            "INSERT INTO character_bindings (user_id, platform, group_id, card_name) VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, platform, group_id) DO UPDATE SET card_name = excluded.card_name",
        )
        .bind(&binding.user_id)
        .bind(&binding.platform)
        .bind(&binding.group_id)
        .bind(&binding.card_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_binding(&self, user_id: &str, platform: &str, group_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM character_bindings WHERE user_id = ? AND platform = ? AND group_id = ?",
        )
        .bind(user_id)
        .bind(platform)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_session(&self, platform: &str, channel_id: &str) -> Result<Option<GameSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM game_sessions
             WHERE platform = ? AND EXISTS (SELECT 1 FROM json_each(game_sessions.areas) WHERE value = ?)
             ORDER BY id LIMIT 1"
        );
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(platform)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GameSession::try_from).transpose()
    }

    async fn get_session_by_name(&self, platform: &str, name: &str) -> Result<Option<GameSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM game_sessions WHERE platform = ? AND name = ?");
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(platform)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GameSession::try_from).transpose()
    }

    async fn save_session(&self, session: &GameSession) -> Result<GameSession> {
        let mut stored = session.clone();
        stored.updated_at = Utc::now();

        if stored.id == 0 {
            let result = sqlx::query(
                "INSERT INTO game_sessions (name, platform, origin, gm, players, observers, areas, config, roulette, is_logging, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&stored.name)
            .bind(&stored.platform)
            .bind(&stored.origin)
            .bind(encode_json(&stored.gm)?)
            .bind(encode_json(&stored.players)?)
            .bind(encode_json(&stored.observers)?)
            .bind(encode_json(&stored.areas)?)
            .bind(encode_json(&stored.config)?)
            .bind(encode_json(&stored.roulette)?)
            .bind(stored.is_logging)
            .bind(stored.created_at)
            .bind(stored.updated_at)
            .execute(&self.pool)
            .await?;
            stored.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                "UPDATE game_sessions SET name = ?, origin = ?, gm = ?, players = ?, observers = ?, areas = ?,
                 config = ?, roulette = ?, is_logging = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&stored.name)
            .bind(&stored.origin)
            .bind(encode_json(&stored.gm)?)
            .bind(encode_json(&stored.players)?)
            .bind(encode_json(&stored.observers)?)
            .bind(encode_json(&stored.areas)?)
            .bind(encode_json(&stored.config)?)
            .bind(encode_json(&stored.roulette)?)
            .bind(stored.is_logging)
            .bind(stored.updated_at)
            .bind(stored.id)
            .execute(&self.pool)
            .await?;
        }

        Ok(stored)
    }

    async fn remove_session(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM game_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_group_data(&self, group_id: &str, key: &str) -> Result<Option<Value>> {
        self.get_data("group_data", "group_id", group_id, key).await
    }

    async fn group_data(&self, group_id: &str) -> Result<Map<String, Value>> {
        self.all_data("group_data", "group_id", group_id).await
    }

    async fn set_group_data(&self, group_id: &str, key: &str, value: &Value) -> Result<()> {
        self.set_data("group_data", "group_id", group_id, key, value).await
    }

    async fn get_user_data(&self, user_id: &str, key: &str) -> Result<Option<Value>> {
        self.get_data("user_data", "user_id", user_id, key).await
    }

    async fn user_data(&self, user_id: &str) -> Result<Map<String, Value>> {
        self.all_data("user_data", "user_id", user_id).await
    }

    async fn set_user_data(&self, user_id: &str, key: &str, value: &Value) -> Result<()> {
        self.set_data("user_data", "user_id", user_id, key, value).await
    }
}
