//! Lua script engine with sandboxing.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Function, HookTriggers, Lua, Result as LuaResult, Table, Value, VmState};

use crate::alias::AliasSnapshot;
use crate::bridge::context::ExecutionContext;
use crate::config::InterpreterConfig;
use crate::store::Attributes;
use crate::{BridgeError, Result};

use super::api::{json_to_lua, CallScope, DiceApi, ScopeGuard, ScopeSlot};
use super::loader::ScriptDialect;
use super::wrapper::wrap_lua_script;

/// Globals removed from every Lua state.
const DISABLED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "loadfile",
    "dofile",
    "load",
    "require",
    "package",
    "debug",
    "collectgarbage",
];

/// Reply for script results that have no text form.
pub const UNSUPPORTED_RESULT: &str = "[unsupported return type]";

/// Primitives the bridge needs from an embedded interpreter.
pub trait Interpreter {
    /// Compile `source` and register it under `name`, replacing any previous unit.
    fn load_script(&self, name: &str, source: &str, dialect: ScriptDialect) -> Result<()>;

    /// Forget a script. Returns false when it was not loaded.
    fn unload_script(&self, name: &str) -> bool;

    /// Run a script against a context and return its textual result.
    fn call_script(&self, name: &str, context: &ExecutionContext) -> Result<String>;

    fn has_script(&self, name: &str) -> bool;

    /// Names of all loaded scripts, sorted.
    fn list_scripts(&self) -> Vec<String>;
}

/// Resource limits for script execution.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of instructions per call (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&InterpreterConfig::default())
    }
}

impl From<&InterpreterConfig> for ResourceLimits {
    fn from(config: &InterpreterConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_mb * 1024 * 1024,
        }
    }
}

/// Lua script execution engine with sandboxing.
pub struct ScriptEngine {
    lua: Lua,
    /// Loaded script functions keyed by name; also read by `loadLua`.
    scripts: Table,
    names: RefCell<BTreeSet<String>>,
    scope: ScopeSlot,
    instruction_count: Arc<AtomicU64>,
    limits: ResourceLimits,
}

impl ScriptEngine {
    /// Create a new ScriptEngine with default resource limits.
    pub fn new() -> Result<Self> {
        Self::with_limits(ResourceLimits::default())
    }

    /// Create a new ScriptEngine with custom resource limits.
    pub fn with_limits(limits: ResourceLimits) -> Result<Self> {
        let lua = Lua::new();

        Self::apply_sandbox(&lua)?;

        let scripts = lua.create_table().map_err(interpreter_error)?;
        let scope: ScopeSlot = Rc::new(RefCell::new(None));
        DiceApi::new(Rc::clone(&scope))
            .register(&lua, &scripts)
            .map_err(|e| BridgeError::Interpreter(format!("Failed to register dice API: {}", e)))?;

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory).map_err(|e| {
                BridgeError::Interpreter(format!("Failed to set memory limit: {}", e))
            })?;
        }

        Ok(Self {
            lua,
            scripts,
            names: RefCell::new(BTreeSet::new()),
            scope,
            instruction_count: Arc::new(AtomicU64::new(0)),
            limits,
        })
    }

    /// Apply sandbox restrictions to the Lua environment.
    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in DISABLED_GLOBALS {
            globals.set(*name, Value::Nil).map_err(|e| {
                BridgeError::Interpreter(format!("Failed to disable {}: {}", name, e))
            })?;
        }
        Ok(())
    }

    fn install_hook(&self) {
        self.instruction_count.store(0, Ordering::SeqCst);
        if self.limits.max_instructions == 0 {
            return;
        }

        let count = Arc::clone(&self.instruction_count);
        let limit = self.limits.max_instructions;
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(10000),
            move |_lua, _debug| {
                let current = count.fetch_add(10000, Ordering::SeqCst) + 10000;
                if current > limit {
                    Err(mlua::Error::RuntimeError(
                        "Script exceeded instruction limit".to_string(),
                    ))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    /// Build the `msg` table a script receives.
    fn build_msg(&self, ctx: &ExecutionContext) -> LuaResult<Table> {
        let lua = &self.lua;
        let msg = lua.create_table()?;
        msg.set("suffix", ctx.argument_tail.as_str())?;
        msg.set("uid", ctx.user_id.as_str())?;
        msg.set("gid", ctx.group_id.as_str())?;
        msg.set("private", ctx.is_private)?;
        msg.set("platform", ctx.platform.as_str())?;
        if let Some(username) = &ctx.username {
            msg.set("username", username.as_str())?;
        }
        if let Some(card) = &ctx.active_character {
            msg.set("char", self.card_table(card, &ctx.aliases)?)?;
        }
        if let Some(text) = &ctx.cached_card_text {
            msg.set("card", text.as_str())?;
        }

        let game = match &ctx.game_session {
            Some(view) => json_to_lua(lua, view)?,
            None => Value::Table(lua.create_table()?),
        };
        msg.set("game", game)?;
        msg.set("pluginRules", json_to_lua(lua, ctx.rules.as_ref())?)?;

        let teammates = lua.create_table()?;
        for (uid, card) in &ctx.teammates {
            teammates.set(uid.as_str(), self.card_table(card, &ctx.aliases)?)?;
        }
        let get_player_card = lua.create_function(move |_, (uid, _gid): (Option<String>, Value)| {
            match uid {
                Some(uid) => teammates.get::<Value>(uid),
                None => Ok(Value::Nil),
            }
        })?;
        msg.set("getPlayerCard", get_player_card)?;

        Ok(msg)
    }

    /// Card as a Lua table whose missing keys resolve through template aliases.
    fn card_table(&self, card: &Attributes, aliases: &AliasSnapshot) -> LuaResult<Value> {
        let value = json_to_lua(&self.lua, card)?;
        let Value::Table(table) = &value else {
            return Ok(value);
        };
        let Some(map) = aliases.card_aliases(card) else {
            return Ok(value);
        };

        let map = map.clone();
        let index = self.lua.create_function(move |_, (table, key): (Table, Value)| {
            let Value::String(key) = key else {
                return Ok(Value::Nil);
            };
            match map.get(key.to_string_lossy().as_str()) {
                Some(display) => table.raw_get::<Value>(display.as_str()),
                None => Ok(Value::Nil),
            }
        })?;
        let metatable = self.lua.create_table()?;
        metatable.set("__index", index)?;
        let setmetatable: Function = self.lua.globals().get("setmetatable")?;
        setmetatable.call::<()>((table.clone(), metatable))?;
        Ok(value)
    }

    /// Get the instruction count of the last call.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    /// Get the resource limits.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

impl Interpreter for ScriptEngine {
    fn load_script(&self, name: &str, source: &str, dialect: ScriptDialect) -> Result<()> {
        let load_error = |reason: String| BridgeError::ScriptLoad {
            name: name.to_string(),
            reason,
        };
        if dialect != ScriptDialect::Lua {
            return Err(load_error(format!(
                ".{} scripts are not supported by the Lua interpreter",
                dialect.extension()
            )));
        }

        let code = wrap_lua_script(source);
        let value: Value = self
            .lua
            .load(code.as_str())
            .set_name(name)
            .eval()
            .map_err(|e| load_error(e.to_string()))?;
        let Value::Function(function) = value else {
            return Err(load_error("script did not evaluate to a function".to_string()));
        };

        self.scripts
            .set(name, function)
            .map_err(|e| load_error(e.to_string()))?;
        self.names.borrow_mut().insert(name.to_string());
        Ok(())
    }

    fn unload_script(&self, name: &str) -> bool {
        if !self.names.borrow_mut().remove(name) {
            return false;
        }
        let _ = self.scripts.set(name, Value::Nil);
        true
    }

    fn call_script(&self, name: &str, context: &ExecutionContext) -> Result<String> {
        let function = match self.scripts.get::<Value>(name).map_err(interpreter_error)? {
            Value::Function(function) => function,
            _ => return Err(BridgeError::NotFound(format!("script '{}'", name))),
        };
        let msg = self.build_msg(context).map_err(interpreter_error)?;

        let _scope = ScopeGuard::enter(
            &self.scope,
            CallScope {
                script: name.to_string(),
                storage: context.storage.clone(),
                rules: Rc::clone(&context.rules),
            },
        );

        self.install_hook();
        let result = function.call::<Value>(msg);
        let _ = self.lua.remove_hook();

        result.map(|value| result_to_string(&value)).map_err(interpreter_error)
    }

    fn has_script(&self, name: &str) -> bool {
        self.names.borrow().contains(name)
    }

    fn list_scripts(&self) -> Vec<String> {
        self.names.borrow().iter().cloned().collect()
    }
}

fn interpreter_error(e: mlua::Error) -> BridgeError {
    BridgeError::Interpreter(e.to_string())
}

/// Text form of a script result.
fn result_to_string(value: &Value) -> String {
    match value {
        Value::Nil => String::new(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        _ => UNSUPPORTED_RESULT.to_string(),
    }
}
