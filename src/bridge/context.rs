//! Per-invocation execution context.
//!
//! Everything a script may read is resolved here, before the interpreter
//! runs: the invoking user's card, the channel's game session, teammate
//! cards, the rule tables, the alias maps and the keyed data of the invoking
//! group and user. Optional pieces that fail to resolve are left empty.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::alias::AliasSnapshot;
use crate::character::session::session_view;
use crate::character::{card_snapshot, player_card_key, CharacterService, GameSessionService, CARD_NAME_KEY};
use crate::plugin::SharedRegistries;
use crate::script::literal::parse_embedded_literal;
use crate::store::Attributes;
use crate::{BridgeError, Result};

use super::effects::{DataScope, StorageBridge};
use super::identity::ChatIdentity;

/// Rule tables keyed by system, then keyword.
pub type RuleSnapshot = BTreeMap<String, BTreeMap<String, String>>;

/// Group data key of a user's free-form card text.
pub fn card_text_key(user_id: &str) -> String {
    format!("card#{user_id}")
}

/// Snapshot handed to one script call. Discarded afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub argument_tail: String,
    pub user_id: String,
    pub username: Option<String>,
    /// Group id for keyed data (the channel id in private chats).
    pub group_id: String,
    pub channel_id: String,
    pub is_private: bool,
    pub platform: String,
    /// Card snapshot of the invoking user (bound card, else active card).
    pub active_character: Option<Attributes>,
    pub cached_card_text: Option<String>,
    pub game_session: Option<Map<String, Value>>,
    pub rules: Rc<RuleSnapshot>,
    pub aliases: Rc<AliasSnapshot>,
    /// Card snapshots of session players, keyed by user id.
    pub teammates: BTreeMap<String, Attributes>,
    pub storage: StorageBridge,
}

impl ExecutionContext {
    /// Name of the invoking user's card.
    pub fn character_name(&self) -> Option<&str> {
        self.active_character
            .as_ref()
            .and_then(|card| card.get(CARD_NAME_KEY).or_else(|| card.get("name")))
            .and_then(Value::as_str)
    }

    /// Prefetched card of another player.
    pub fn player_card(&self, user_id: &str) -> Option<&Attributes> {
        self.teammates.get(user_id)
    }

    /// Bare context for user `u1` in group `g1`.
    #[cfg(test)]
    pub(crate) fn test_context(argument_tail: &str) -> Self {
        Self {
            argument_tail: argument_tail.to_string(),
            user_id: "u1".to_string(),
            username: Some("Kai".to_string()),
            group_id: "g1".to_string(),
            channel_id: "chan-1".to_string(),
            is_private: false,
            platform: "qq".to_string(),
            active_character: None,
            cached_card_text: None,
            game_session: None,
            rules: Rc::new(RuleSnapshot::new()),
            aliases: Rc::new(AliasSnapshot::new()),
            teammates: BTreeMap::new(),
            storage: StorageBridge::new(),
        }
    }
}

/// Builds [`ExecutionContext`]s from the store.
#[derive(Clone)]
pub struct ContextBuilder {
    characters: CharacterService,
    sessions: Arc<GameSessionService>,
    registries: SharedRegistries,
}

impl ContextBuilder {
    pub fn new(
        characters: CharacterService,
        sessions: Arc<GameSessionService>,
        registries: SharedRegistries,
    ) -> Self {
        Self {
            characters,
            sessions,
            registries,
        }
    }

    pub fn characters(&self) -> &CharacterService {
        &self.characters
    }

    /// Resolve everything a script may read for one invocation.
    pub async fn build(&self, identity: &ChatIdentity, argument_tail: &str) -> ExecutionContext {
        let store = self.characters.store();
        let platform = identity.platform.as_str();
        let user_id = identity.user_id.as_str();
        let group_id = identity.data_group().to_string();

        let (rules, aliases) = {
            let registries = self.registries.borrow();
            (
                Rc::new(registries.rules.snapshot()),
                Rc::new(registries.templates.alias_snapshot()),
            )
        };

        let active_character = match self
            .characters
            .resolve_card(user_id, platform, identity.binding_group())
            .await
        {
            Ok(card) => card.as_ref().map(card_snapshot),
            Err(e) => {
                debug!(user_id, error = %e, "No character for context");
                None
            }
        };

        let group_data = store.group_data(&group_id).await.unwrap_or_else(|e| {
            warn!(group_id = %group_id, error = %e, "Failed to read group data");
            Map::new()
        });
        let user_data = store.user_data(user_id).await.unwrap_or_else(|e| {
            warn!(user_id, error = %e, "Failed to read user data");
            Map::new()
        });

        let cached_card_text = group_data.get(&card_text_key(user_id)).and_then(text_value);

        let session = match self.sessions.get_session(platform, &group_id).await {
            Ok(session) => session,
            Err(e) => {
                debug!(group_id = %group_id, error = %e, "No game session for context");
                None
            }
        };

        let mut teammates = BTreeMap::new();
        if let Some(session) = &session {
            for player in &session.players {
                if let Some(card) = self
                    .prefetch_player(player, platform, identity.binding_group(), &group_data)
                    .await
                {
                    teammates.insert(player.clone(), card);
                }
            }
            debug!(
                game = %session.name,
                players = session.players.len(),
                cached = teammates.len(),
                "Prefetched teammate cards"
            );
        }

        let storage = StorageBridge::new()
            .with_view(DataScope::Group, group_id.clone(), group_data)
            .with_view(DataScope::User, user_id, user_data);

        ExecutionContext {
            argument_tail: argument_tail.to_string(),
            user_id: user_id.to_string(),
            username: identity.username.clone(),
            group_id,
            channel_id: identity.channel_id.clone(),
            is_private: identity.is_private(),
            platform: platform.to_string(),
            active_character,
            cached_card_text,
            game_session: session.as_ref().map(session_view),
            rules,
            aliases,
            teammates,
            storage,
        }
    }

    /// The player's bound or active card from the store.
    ///
    /// The cached `player_card#` blob only stands in when the store read
    /// fails, so deleted or edited cards are never served from the cache.
    async fn prefetch_player(
        &self,
        player: &str,
        platform: &str,
        binding_group: &str,
        group_data: &Map<String, Value>,
    ) -> Option<Attributes> {
        match self
            .characters
            .resolve_card(player, platform, binding_group)
            .await
        {
            Ok(card) => card.as_ref().map(card_snapshot),
            Err(e) => {
                warn!(player, error = %e, "Failed to resolve teammate card, trying cache");
                let key = player_card_key(player);
                let blob = group_data.get(&key)?;
                decode_card_blob(&key, blob)
                    .map_err(|e| warn!("{}", e))
                    .ok()
            }
        }
    }
}

/// Decode a cached card. Anything but an object literal is corruption.
pub fn decode_card_blob(key: &str, blob: &Value) -> Result<Attributes> {
    let corrupt = |reason: &str| BridgeError::CacheCorruption {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let parsed = match blob {
        Value::Object(map) => return Ok(map.clone()),
        Value::String(text) => parse_embedded_literal(text).ok_or_else(|| corrupt("unparsable literal"))?,
        _ => return Err(corrupt("not a table literal")),
    };
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(corrupt("not a table literal")),
    }
}

/// Render a stored value as plain text.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
