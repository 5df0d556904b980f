//! Deferred storage callbacks.
//!
//! Scripts run synchronously and cannot reach the async store. Reads are
//! served from data prefetched before the call; writes are queued as
//! [`StoreEffect`]s and applied after the interpreter returns.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::store::Store;

/// Which key/value collection a callback addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataScope {
    Group,
    User,
}

/// A write requested by a script, applied after the call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEffect {
    SetGroupData {
        group_id: String,
        key: String,
        value: Value,
    },
    SetUserData {
        user_id: String,
        key: String,
        value: Value,
    },
}

#[derive(Debug, Default)]
struct StorageState {
    views: HashMap<(DataScope, String), Map<String, Value>>,
    pending: Vec<StoreEffect>,
}

/// Shared handle to the prefetched data and the queued writes of one call.
#[derive(Debug, Clone, Default)]
pub struct StorageBridge {
    state: Rc<RefCell<StorageState>>,
}

impl StorageBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the readable view of one group or user.
    pub fn with_view(self, scope: DataScope, id: impl Into<String>, data: Map<String, Value>) -> Self {
        self.state.borrow_mut().views.insert((scope, id.into()), data);
        self
    }

    /// Read a value: prefetched data overlaid with writes queued so far.
    pub fn get(&self, scope: DataScope, id: &str, key: &str) -> Option<Value> {
        let state = self.state.borrow();
        state
            .views
            .get(&(scope, id.to_string()))
            .and_then(|data| data.get(key))
            .cloned()
    }

    /// Queue a write and make it visible to later reads in the same call.
    pub fn set(&self, scope: DataScope, id: &str, key: &str, value: Value) {
        let mut state = self.state.borrow_mut();
        state
            .views
            .entry((scope, id.to_string()))
            .or_default()
            .insert(key.to_string(), value.clone());
        let effect = match scope {
            DataScope::Group => StoreEffect::SetGroupData {
                group_id: id.to_string(),
                key: key.to_string(),
                value,
            },
            DataScope::User => StoreEffect::SetUserData {
                user_id: id.to_string(),
                key: key.to_string(),
                value,
            },
        };
        state.pending.push(effect);
    }

    /// Writes queued so far.
    pub fn pending(&self) -> Vec<StoreEffect> {
        self.state.borrow().pending.clone()
    }

    /// Drop every queued write. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        let dropped = std::mem::take(&mut self.state.borrow_mut().pending);
        dropped.len()
    }

    /// Apply the queued writes to the store.
    ///
    /// Failures are logged and skipped. Returns the number of writes applied.
    pub async fn flush(&self, store: &dyn Store) -> usize {
        let pending = std::mem::take(&mut self.state.borrow_mut().pending);
        let mut applied = 0;
        for effect in pending {
            let result = match &effect {
                StoreEffect::SetGroupData {
                    group_id,
                    key,
                    value,
                } => store.set_group_data(group_id, key, value).await,
                StoreEffect::SetUserData {
                    user_id,
                    key,
                    value,
                } => store.set_user_data(user_id, key, value).await,
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => warn!(?effect, error = %e, "Failed to apply script storage write"),
            }
        }
        if applied > 0 {
            debug!(applied, "Flushed script storage writes");
        }
        applied
    }
}
