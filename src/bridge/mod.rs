//! Execution bridge between chat commands and synchronous scripts.
//!
//! One invocation runs snapshot, call, then reconcile:
//!
//! 1. [`ContextBuilder::build`] resolves everything the script may read.
//! 2. The interpreter runs the script synchronously.
//! 3. Queued storage writes are flushed, the cached card text is re-read and
//!    placeholders are substituted into the reply.
//!
//! Errors never leave the bridge; they become a one-line `[error]` reply.

pub mod context;
pub mod effects;
pub mod identity;
pub mod postprocess;

use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::ExtensionConfig;
use crate::script::Interpreter;
use crate::store::Store;
use crate::BridgeError;

pub use context::{card_text_key, ContextBuilder, ExecutionContext, RuleSnapshot};
pub use effects::{DataScope, StorageBridge, StoreEffect};
pub use identity::ChatIdentity;
pub use postprocess::Placeholders;

/// Runs scripts on behalf of registered commands.
pub struct Bridge {
    builder: ContextBuilder,
    interpreter: Rc<dyn Interpreter>,
    store: Arc<dyn Store>,
    fallback_nick: String,
    fallback_card: String,
}

impl Bridge {
    pub fn new(
        builder: ContextBuilder,
        interpreter: Rc<dyn Interpreter>,
        store: Arc<dyn Store>,
        config: &ExtensionConfig,
    ) -> Self {
        Self {
            builder,
            interpreter,
            store,
            fallback_nick: config.fallback_nick.clone(),
            fallback_card: config.fallback_card.clone(),
        }
    }

    /// Run `script` for `identity` and return the reply text.
    pub async fn invoke(&self, script: &str, identity: &ChatIdentity, argument_tail: &str) -> String {
        let context = self.builder.build(identity, argument_tail).await;
        debug!(script, suffix = %argument_tail, "Calling extension script");

        let text = match self.interpreter.call_script(script, &context) {
            Ok(text) => text,
            Err(e) => {
                let dropped = context.storage.discard();
                error!(script, error = %e, dropped, "Extension script failed");
                return error_reply(&e);
            }
        };

        context.storage.flush(self.store.as_ref()).await;
        let card_text = self.reread_card_text(&context).await;
        postprocess::render(&text, &self.placeholders(identity, &context, card_text))
    }

    /// Card text after the script's writes were applied.
    async fn reread_card_text(&self, context: &ExecutionContext) -> Option<String> {
        let key = card_text_key(&context.user_id);
        match self.store.get_group_data(&context.group_id, &key).await {
            Ok(Some(Value::String(text))) => Some(text),
            Ok(Some(Value::Null)) | Ok(None) => None,
            Ok(Some(other)) => Some(other.to_string()),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to re-read card text");
                context.cached_card_text.clone()
            }
        }
    }

    fn placeholders(
        &self,
        identity: &ChatIdentity,
        context: &ExecutionContext,
        card_text: Option<String>,
    ) -> Placeholders {
        let nick = identity
            .username
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| Some(identity.user_id.clone()).filter(|id| !id.is_empty()))
            .unwrap_or_else(|| self.fallback_nick.clone());
        let pc = context.character_name().unwrap_or_default().to_string();
        let card = card_text
            .filter(|text| !text.is_empty())
            .or_else(|| Some(pc.clone()).filter(|name| !name.is_empty()))
            .unwrap_or_else(|| self.fallback_card.clone());

        Placeholders {
            nick,
            uid: identity.user_id.clone(),
            gid: context.group_id.clone(),
            card,
            pc,
        }
    }
}

/// One-line reply for a failed invocation.
pub fn error_reply(error: &BridgeError) -> String {
    let message = error.to_string();
    format!("[error] {}", message.lines().next().unwrap_or_default())
}
