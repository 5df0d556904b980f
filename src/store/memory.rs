//! In-process store backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{
    duplicate_card, Attributes, CharacterBinding, CharacterCard, GameSession, NewCharacter, Store,
};
use crate::Result;

type CardKey = (String, String, String);

#[derive(Default)]
struct Inner {
    next_card_id: i64,
    next_session_id: i64,
    characters: BTreeMap<CardKey, CharacterCard>,
    bindings: HashMap<CardKey, CharacterBinding>,
    sessions: BTreeMap<i64, GameSession>,
    group_data: HashMap<String, Map<String, Value>>,
    user_data: HashMap<String, Map<String, Value>>,
}

/// Store keeping every collection in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(user_id: &str, platform: &str, third: &str) -> CardKey {
    (user_id.to_string(), platform.to_string(), third.to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<Option<CharacterCard>> {
        let inner = self.inner.read().await;
        Ok(inner.characters.get(&key(user_id, platform, card_name)).cloned())
    }

    async fn get_active_character(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<Option<CharacterCard>> {
        let inner = self.inner.read().await;
        Ok(inner
            .characters
            .values()
            .find(|c| c.user_id == user_id && c.platform == platform && c.is_active)
            .cloned())
    }

    async fn list_characters(&self, user_id: &str, platform: &str) -> Result<Vec<CharacterCard>> {
        let inner = self.inner.read().await;
        Ok(inner
            .characters
            .values()
            .filter(|c| c.user_id == user_id && c.platform == platform)
            .cloned()
            .collect())
    }

    async fn create_character(&self, new: &NewCharacter) -> Result<CharacterCard> {
        let mut inner = self.inner.write().await;
        let k = key(&new.user_id, &new.platform, &new.card_name);
        if inner.characters.contains_key(&k) {
            return Err(duplicate_card(&new.card_name));
        }
        inner.next_card_id += 1;
        let now = Utc::now();
        let card = CharacterCard {
            id: inner.next_card_id,
            user_id: new.user_id.clone(),
            platform: new.platform.clone(),
            card_name: new.card_name.clone(),
            card_type: new.card_type.clone(),
            is_active: new.is_active,
            attributes: new.attributes.clone(),
            created_at: now,
            updated_at: now,
        };
        inner.characters.insert(k, card.clone());
        Ok(card)
    }

    async fn update_attributes(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
        attributes: &Attributes,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.characters.get_mut(&key(user_id, platform, card_name)) {
            Some(card) => {
                card.attributes = attributes.clone();
                card.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_active_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.characters.contains_key(&key(user_id, platform, card_name)) {
            return Ok(false);
        }
        for card in inner
            .characters
            .values_mut()
            .filter(|c| c.user_id == user_id && c.platform == platform)
        {
            card.is_active = card.card_name == card_name;
        }
        Ok(true)
    }

    async fn remove_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .characters
            .remove(&key(user_id, platform, card_name))
            .is_some();
        inner.bindings.retain(|_, b| {
            !(b.user_id == user_id && b.platform == platform && b.card_name == card_name)
        });
        Ok(removed)
    }

    async fn get_binding(
        &self,
        user_id: &str,
        platform: &str,
        group_id: &str,
    ) -> Result<Option<CharacterBinding>> {
        let inner = self.inner.read().await;
        Ok(inner.bindings.get(&key(user_id, platform, group_id)).cloned())
    }

    async fn set_binding(&self, binding: &CharacterBinding) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.bindings.insert(
            key(&binding.user_id, &binding.platform, &binding.group_id),
            binding.clone(),
        );
        Ok(())
    }

    async fn remove_binding(&self, user_id: &str, platform: &str, group_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .bindings
            .remove(&key(user_id, platform, group_id))
            .is_some())
    }

    async fn find_session(&self, platform: &str, channel_id: &str) -> Result<Option<GameSession>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| s.platform == platform && s.areas.iter().any(|a| a == channel_id))
            .cloned())
    }

    async fn get_session_by_name(&self, platform: &str, name: &str) -> Result<Option<GameSession>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| s.platform == platform && s.name == name)
            .cloned())
    }

    async fn save_session(&self, session: &GameSession) -> Result<GameSession> {
        let mut inner = self.inner.write().await;
        let mut stored = session.clone();
        if stored.id == 0 {
            inner.next_session_id += 1;
            stored.id = inner.next_session_id;
        }
        stored.updated_at = Utc::now();
        inner.sessions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn remove_session(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.sessions.remove(&id).is_some())
    }

    async fn get_group_data(&self, group_id: &str, key: &str) -> Result<Option<Value>> {
        let inner = self.inner.read().await;
        Ok(inner
            .group_data
            .get(group_id)
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn group_data(&self, group_id: &str) -> Result<Map<String, Value>> {
        let inner = self.inner.read().await;
        Ok(inner.group_data.get(group_id).cloned().unwrap_or_default())
    }

    async fn set_group_data(&self, group_id: &str, key: &str, value: &Value) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .group_data
            .entry(group_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get_user_data(&self, user_id: &str, key: &str) -> Result<Option<Value>> {
        let inner = self.inner.read().await;
        Ok(inner
            .user_data
            .get(user_id)
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn user_data(&self, user_id: &str) -> Result<Map<String, Value>> {
        let inner = self.inner.read().await;
        Ok(inner.user_data.get(user_id).cloned().unwrap_or_default())
    }

    async fn set_user_data(&self, user_id: &str, key: &str, value: &Value) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .user_data
            .entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}
