//! Multi-participant game sessions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;

use crate::store::{GameSession, Store};
use crate::{BridgeError, Result};

/// Participant role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Gm,
    Player,
    Observer,
}

impl Role {
    fn roster(self, session: &mut GameSession) -> &mut Vec<String> {
        match self {
            Role::Gm => &mut session.gm,
            Role::Player => &mut session.players,
            Role::Observer => &mut session.observers,
        }
    }
}

/// Script-facing view of a session.
///
/// Keys `name`, `gm`, `pls`, `obs`, `areas`, then the session config
/// flattened in, then `roulette` and `isLogging`.
pub fn session_view(session: &GameSession) -> Map<String, Value> {
    fn strings(list: &[String]) -> Value {
        Value::Array(list.iter().cloned().map(Value::String).collect())
    }

    let mut view = Map::new();
    view.insert("name".to_string(), Value::String(session.name.clone()));
    view.insert("gm".to_string(), strings(&session.gm));
    view.insert("pls".to_string(), strings(&session.players));
    view.insert("obs".to_string(), strings(&session.observers));
    view.insert("areas".to_string(), strings(&session.areas));
    for (key, value) in &session.config {
        view.insert(key.clone(), value.clone());
    }
    view.insert("roulette".to_string(), Value::Object(session.roulette.clone()));
    view.insert("isLogging".to_string(), Value::Bool(session.is_logging));
    view
}

/// Service for game sessions.
pub struct GameSessionService {
    store: Arc<dyn Store>,
    counter: AtomicU32,
}

impl GameSessionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            counter: AtomicU32::new(0),
        }
    }

    /// Session covering a channel, if any.
    pub async fn get_session(&self, platform: &str, channel_id: &str) -> Result<Option<GameSession>> {
        self.store.find_session(platform, channel_id).await
    }

    pub async fn get_session_by_name(&self, platform: &str, name: &str) -> Result<Option<GameSession>> {
        self.store.get_session_by_name(platform, name).await
    }

    /// Create a session originating in `channel_id`.
    ///
    /// Unnamed sessions get `game#<n>`. Names are unique per platform.
    pub async fn create_session(
        &self,
        platform: &str,
        channel_id: &str,
        name: Option<&str>,
    ) -> Result<GameSession> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("game#{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1),
        };
        if self.store.get_session_by_name(platform, &name).await?.is_some() {
            return Err(BridgeError::Validation(format!("game '{name}' already exists")));
        }
        let session = self
            .store
            .save_session(&GameSession::new(name, platform, channel_id))
            .await?;
        info!(game = %session.name, channel_id, "Created game session");
        Ok(session)
    }

    pub async fn destroy_session(&self, session: &GameSession) -> Result<bool> {
        let removed = self.store.remove_session(session.id).await?;
        if removed {
            info!(game = %session.name, "Destroyed game session");
        }
        Ok(removed)
    }

    /// Add a user to a roster. Returns false when already listed.
    pub async fn add_participant(
        &self,
        session: &mut GameSession,
        role: Role,
        user_id: &str,
    ) -> Result<bool> {
        let roster = role.roster(session);
        if roster.iter().any(|u| u == user_id) {
            return Ok(false);
        }
        roster.push(user_id.to_string());
        self.save(session).await?;
        Ok(true)
    }

    /// Remove a user from a roster. Returns false when not listed.
    pub async fn remove_participant(
        &self,
        session: &mut GameSession,
        role: Role,
        user_id: &str,
    ) -> Result<bool> {
        let roster = role.roster(session);
        let before = roster.len();
        roster.retain(|u| u != user_id);
        if roster.len() == before {
            return Ok(false);
        }
        self.save(session).await?;
        Ok(true)
    }

    /// Extend the session to another channel.
    pub async fn add_area(&self, session: &mut GameSession, channel_id: &str) -> Result<bool> {
        if session.areas.iter().any(|a| a == channel_id) {
            return Ok(false);
        }
        session.areas.push(channel_id.to_string());
        self.save(session).await?;
        Ok(true)
    }

    pub async fn remove_area(&self, session: &mut GameSession, channel_id: &str) -> Result<bool> {
        let before = session.areas.len();
        session.areas.retain(|a| a != channel_id);
        if session.areas.len() == before {
            return Ok(false);
        }
        self.save(session).await?;
        Ok(true)
    }

    pub async fn set_config(&self, session: &mut GameSession, key: &str, value: Value) -> Result<()> {
        session.config.insert(key.to_string(), value);
        self.save(session).await
    }

    pub async fn set_roulette(&self, session: &mut GameSession, face: u32, data: Value) -> Result<()> {
        session.roulette.insert(face.to_string(), data);
        self.save(session).await
    }

    pub async fn clear_roulette(&self, session: &mut GameSession) -> Result<()> {
        session.roulette.clear();
        self.save(session).await
    }

    pub async fn set_logging(&self, session: &mut GameSession, enabled: bool) -> Result<()> {
        session.is_logging = enabled;
        self.save(session).await
    }

    async fn save(&self, session: &mut GameSession) -> Result<()> {
        session.updated_at = Utc::now();
        *session = self.store.save_session(session).await?;
        Ok(())
    }
}
