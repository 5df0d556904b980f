//! Character card operations.
//!
//! Cards are owned by `(user, platform)`. A user has at most one globally
//! active card and may bind a different card per group; the bound card wins
//! inside that group.

pub mod session;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::alias::CARD_TYPE_KEY;
use crate::script::literal::to_embedded_table;
use crate::store::{Attributes, CharacterBinding, CharacterCard, NewCharacter, Store};
use crate::{BridgeError, Result};

pub use session::{GameSessionService, Role};

/// Card key holding the card name for scripts.
pub const CARD_NAME_KEY: &str = "__Name";

/// Group data key caching a player's serialized card.
pub fn player_card_key(user_id: &str) -> String {
    format!("player_card#{user_id}")
}

/// Flat view of a card as scripts see it: name and type plus attributes.
pub fn card_snapshot(card: &CharacterCard) -> Attributes {
    let mut snapshot = Attributes::new();
    snapshot.insert(CARD_NAME_KEY.to_string(), Value::String(card.card_name.clone()));
    snapshot.insert("name".to_string(), Value::String(card.card_name.clone()));
    snapshot.insert(CARD_TYPE_KEY.to_string(), Value::String(card.card_type.clone()));
    for (key, value) in &card.attributes {
        snapshot.insert(key.clone(), value.clone());
    }
    snapshot
}

/// Service for character cards and their group bindings.
#[derive(Clone)]
pub struct CharacterService {
    store: Arc<dyn Store>,
}

impl CharacterService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn get_active_card(&self, user_id: &str, platform: &str) -> Result<Option<CharacterCard>> {
        self.store.get_active_character(user_id, platform).await
    }

    pub async fn get_card(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
    ) -> Result<Option<CharacterCard>> {
        self.store.get_character(user_id, platform, card_name).await
    }

    pub async fn list_cards(&self, user_id: &str, platform: &str) -> Result<Vec<CharacterCard>> {
        self.store.list_characters(user_id, platform).await
    }

    /// Create a card. The user's first card becomes active.
    pub async fn create_card(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
        card_type: &str,
        attributes: Attributes,
    ) -> Result<CharacterCard> {
        if card_name.trim().is_empty() {
            return Err(BridgeError::Validation("card name must not be empty".to_string()));
        }
        let first = self.store.list_characters(user_id, platform).await?.is_empty();
        let new = NewCharacter::new(user_id, platform, card_name, card_type)
            .with_attributes(attributes)
            .active(first);
        let card = self.store.create_character(&new).await?;
        debug!(user_id, card = %card.card_name, active = card.is_active, "Created character card");
        Ok(card)
    }

    /// Merge `attributes` into the named card, or the active one.
    pub async fn set_attributes(
        &self,
        user_id: &str,
        platform: &str,
        card_name: Option<&str>,
        attributes: Attributes,
    ) -> Result<CharacterCard> {
        let mut card = self.target_card(user_id, platform, card_name).await?;
        card.attributes.extend(attributes);
        self.store
            .update_attributes(user_id, platform, &card.card_name, &card.attributes)
            .await?;
        Ok(card)
    }

    /// Make the named card the user's only active card.
    pub async fn switch_card(&self, user_id: &str, platform: &str, card_name: &str) -> Result<()> {
        if !self
            .store
            .set_active_character(user_id, platform, card_name)
            .await?
        {
            return Err(BridgeError::NotFound(format!("character '{card_name}'")));
        }
        Ok(())
    }

    /// Delete a card and its bindings. Returns false when it did not exist.
    pub async fn delete_card(&self, user_id: &str, platform: &str, card_name: &str) -> Result<bool> {
        self.store.remove_character(user_id, platform, card_name).await
    }

    /// Card bound to `group_id`, if the binding and the card both exist.
    pub async fn get_bound_card(
        &self,
        user_id: &str,
        platform: &str,
        group_id: &str,
    ) -> Result<Option<CharacterCard>> {
        let Some(binding) = self.store.get_binding(user_id, platform, group_id).await? else {
            return Ok(None);
        };
        self.store
            .get_character(user_id, platform, &binding.card_name)
            .await
    }

    /// Bound card for the group, falling back to the active card.
    pub async fn resolve_card(
        &self,
        user_id: &str,
        platform: &str,
        group_id: &str,
    ) -> Result<Option<CharacterCard>> {
        if let Some(card) = self.get_bound_card(user_id, platform, group_id).await? {
            return Ok(Some(card));
        }
        self.store.get_active_character(user_id, platform).await
    }

    /// Bind a card (the active one when unnamed) to a group.
    ///
    /// Also caches the card as a literal under `player_card#<user>` in the
    /// group's data so scripts of other players can read it. A failed cache
    /// write is logged and does not undo the binding.
    pub async fn bind_card(
        &self,
        user_id: &str,
        platform: &str,
        group_id: &str,
        card_name: Option<&str>,
    ) -> Result<CharacterCard> {
        if group_id.is_empty() {
            return Err(BridgeError::Validation(
                "cards can only be bound inside a group".to_string(),
            ));
        }
        let card = self.target_card(user_id, platform, card_name).await?;
        self.store
            .set_binding(&CharacterBinding {
                user_id: user_id.to_string(),
                platform: platform.to_string(),
                group_id: group_id.to_string(),
                card_name: card.card_name.clone(),
            })
            .await?;

        let blob = to_embedded_table(&Value::Object(card_snapshot(&card)));
        if let Err(e) = self
            .store
            .set_group_data(group_id, &player_card_key(user_id), &Value::String(blob))
            .await
        {
            warn!(user_id, group_id, error = %e, "Failed to cache bound card");
        }
        Ok(card)
    }

    /// Remove a group binding.
    pub async fn unbind_card(&self, user_id: &str, platform: &str, group_id: &str) -> Result<bool> {
        self.store.remove_binding(user_id, platform, group_id).await
    }

    async fn target_card(
        &self,
        user_id: &str,
        platform: &str,
        card_name: Option<&str>,
    ) -> Result<CharacterCard> {
        let card = match card_name {
            Some(name) => self.store.get_character(user_id, platform, name).await?,
            None => self.store.get_active_character(user_id, platform).await?,
        };
        card.ok_or_else(|| match card_name {
            Some(name) => BridgeError::NotFound(format!("character '{name}'")),
            None => BridgeError::NotFound("active character".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::literal::parse_embedded_literal;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn service() -> CharacterService {
        CharacterService::new(Arc::new(MemoryStore::new()))
    }

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[tokio::test]
    async fn test_first_card_becomes_active() {
        let svc = service();
        let a = svc.create_card("u1", "qq", "Alice", "Maid", attrs(json!({"宠爱": 5}))).await.unwrap();
        let b = svc.create_card("u1", "qq", "Bob", "Maid", Attributes::new()).await.unwrap();
        assert!(a.is_active);
        assert!(!b.is_active);

        let active = svc.get_active_card("u1", "qq").await.unwrap().unwrap();
        assert_eq!(active.card_name, "Alice");

        svc.switch_card("u1", "qq", "Bob").await.unwrap();
        let active = svc.get_active_card("u1", "qq").await.unwrap().unwrap();
        assert_eq!(active.card_name, "Bob");

        assert!(matches!(
            svc.switch_card("u1", "qq", "Carol").await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_names_rejected() {
        let svc = service();
        svc.create_card("u1", "qq", "Alice", "Maid", Attributes::new()).await.unwrap();
        assert!(svc.create_card("u1", "qq", "Alice", "Maid", Attributes::new()).await.is_err());
        assert!(matches!(
            svc.create_card("u1", "qq", "  ", "Maid", Attributes::new()).await,
            Err(BridgeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_set_attributes_merges() {
        let svc = service();
        svc.create_card("u1", "qq", "Alice", "Maid", attrs(json!({"宠爱": 5, "压力": 1}))).await.unwrap();
        let card = svc
            .set_attributes("u1", "qq", None, attrs(json!({"压力": 3})))
            .await
            .unwrap();
        assert_eq!(card.attributes.get("宠爱"), Some(&json!(5)));
        assert_eq!(card.attributes.get("压力"), Some(&json!(3)));

        let stored = svc.get_card("u1", "qq", "Alice").await.unwrap().unwrap();
        assert_eq!(stored.attributes.get("压力"), Some(&json!(3)));

        assert!(svc
            .set_attributes("u2", "qq", None, Attributes::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bound_card_wins_over_active() {
        let svc = service();
        svc.create_card("u1", "qq", "Alice", "Maid", Attributes::new()).await.unwrap();
        svc.create_card("u1", "qq", "Bob", "Maid", Attributes::new()).await.unwrap();
        svc.bind_card("u1", "qq", "g1", Some("Bob")).await.unwrap();

        let in_group = svc.resolve_card("u1", "qq", "g1").await.unwrap().unwrap();
        assert_eq!(in_group.card_name, "Bob");
        let elsewhere = svc.resolve_card("u1", "qq", "g2").await.unwrap().unwrap();
        assert_eq!(elsewhere.card_name, "Alice");

        assert!(svc.unbind_card("u1", "qq", "g1").await.unwrap());
        let in_group = svc.resolve_card("u1", "qq", "g1").await.unwrap().unwrap();
        assert_eq!(in_group.card_name, "Alice");
    }

    #[tokio::test]
    async fn test_bind_writes_card_cache() {
        let svc = service();
        svc.create_card("u1", "qq", "Alice", "Maid", attrs(json!({"宠爱": 5}))).await.unwrap();
        svc.bind_card("u1", "qq", "g1", None).await.unwrap();

        let blob = svc
            .store()
            .get_group_data("g1", "player_card#u1")
            .await
            .unwrap()
            .unwrap();
        let parsed = parse_embedded_literal(blob.as_str().unwrap()).unwrap();
        assert_eq!(parsed["__Name"], json!("Alice"));
        assert_eq!(parsed["type"], json!("Maid"));
        assert_eq!(parsed["宠爱"], json!(5));
    }

    #[tokio::test]
    async fn test_bind_requires_group() {
        let svc = service();
        svc.create_card("u1", "qq", "Alice", "Maid", Attributes::new()).await.unwrap();
        assert!(matches!(
            svc.bind_card("u1", "qq", "", None).await,
            Err(BridgeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_drops_binding() {
        let svc = service();
        svc.create_card("u1", "qq", "Alice", "Maid", Attributes::new()).await.unwrap();
        svc.bind_card("u1", "qq", "g1", None).await.unwrap();
        assert!(svc.delete_card("u1", "qq", "Alice").await.unwrap());
        assert!(!svc.delete_card("u1", "qq", "Alice").await.unwrap());
        assert!(svc.get_bound_card("u1", "qq", "g1").await.unwrap().is_none());
        assert!(svc.store().get_binding("u1", "qq", "g1").await.unwrap().is_none());
    }

    #[test]
    fn test_card_snapshot_keys() {
        let card = CharacterCard {
            id: 1,
            user_id: "u1".to_string(),
            platform: "qq".to_string(),
            card_name: "Alice".to_string(),
            card_type: "Maid".to_string(),
            is_active: true,
            attributes: attrs(json!({"宠爱": 5})),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let snapshot = card_snapshot(&card);
        assert_eq!(snapshot["__Name"], json!("Alice"));
        assert_eq!(snapshot["name"], json!("Alice"));
        assert_eq!(snapshot["type"], json!("Maid"));
        assert_eq!(snapshot["宠爱"], json!(5));
    }
}
