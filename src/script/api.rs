//! Host API for Lua scripts.
//!
//! Provides the `dice` global table and the `loadLua` global. Data and rule
//! functions act on the call currently running, which the engine installs
//! as a [`CallScope`] for the duration of the call.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Lua, LuaSerdeExt, Result as LuaResult, SerializeOptions, Table, Value};
use serde::Serialize;
use tracing::info;

use crate::bridge::context::RuleSnapshot;
use crate::bridge::effects::{DataScope, StorageBridge};

/// State of the script call in progress.
pub(crate) struct CallScope {
    pub script: String,
    pub storage: StorageBridge,
    pub rules: Rc<RuleSnapshot>,
}

pub(crate) type ScopeSlot = Rc<RefCell<Option<CallScope>>>;

/// Clears the active scope when dropped, including on error paths.
pub(crate) struct ScopeGuard {
    slot: ScopeSlot,
}

impl ScopeGuard {
    pub fn enter(slot: &ScopeSlot, scope: CallScope) -> Self {
        *slot.borrow_mut() = Some(scope);
        Self {
            slot: Rc::clone(slot),
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.slot.borrow_mut().take();
    }
}

/// Builder registering the host API with a Lua state.
pub struct DiceApi {
    scope: ScopeSlot,
}

impl DiceApi {
    pub(crate) fn new(scope: ScopeSlot) -> Self {
        Self { scope }
    }

    /// Register `dice` and `loadLua`. `scripts` is the table of loaded scripts.
    pub fn register(&self, lua: &Lua, scripts: &Table) -> LuaResult<()> {
        let dice = lua.create_table()?;

        self.register_log(lua, &dice)?;
        self.register_rule_lookup(lua, &dice)?;
        self.register_data_functions(lua, &dice)?;

        lua.globals().set("dice", dice)?;

        // loadLua(name) - another loaded script's function, or nil
        let scripts = scripts.clone();
        let load_fn = lua.create_function(move |_, name: String| scripts.get::<Value>(name))?;
        lua.globals().set("loadLua", load_fn)?;

        Ok(())
    }

    /// Register dice.log(text).
    fn register_log(&self, lua: &Lua, dice: &Table) -> LuaResult<()> {
        let slot = Rc::clone(&self.scope);
        let log_fn = lua.create_function(move |_, text: Value| {
            let script = slot
                .borrow()
                .as_ref()
                .map(|scope| scope.script.clone())
                .unwrap_or_default();
            info!(script = %script, "{}", value_to_string(&text));
            Ok(())
        })?;
        dice.set("log", log_fn)?;
        Ok(())
    }

    /// Register dice.queryRule(keyword) returning `{success, content, error}`.
    fn register_rule_lookup(&self, lua: &Lua, dice: &Table) -> LuaResult<()> {
        let slot = Rc::clone(&self.scope);
        let query_fn = lua.create_function(move |lua, keyword: String| {
            let found = with_scope(&slot, |scope| {
                scope
                    .rules
                    .values()
                    .find_map(|manual| manual.get(&keyword).cloned())
            })?;
            let result = lua.create_table()?;
            match found {
                Some(text) => {
                    result.set("success", true)?;
                    result.set("content", text)?;
                }
                None => {
                    result.set("success", false)?;
                    result.set("error", format!("rule not found: {keyword}"))?;
                }
            }
            Ok(result)
        })?;
        dice.set("queryRule", query_fn)?;
        Ok(())
    }

    /// Register get/set functions for group and user data.
    fn register_data_functions(&self, lua: &Lua, dice: &Table) -> LuaResult<()> {
        for (scope, getter, setter) in [
            (DataScope::Group, "getGroupData", "setGroupData"),
            (DataScope::User, "getUserData", "setUserData"),
        ] {
            let slot = Rc::clone(&self.scope);
            let get_fn = lua.create_function(move |lua, (id, key): (String, String)| {
                match with_scope(&slot, |s| s.storage.get(scope, &id, &key))? {
                    Some(value) => json_to_lua(lua, &value),
                    None => Ok(Value::Nil),
                }
            })?;
            dice.set(getter, get_fn)?;

            let slot = Rc::clone(&self.scope);
            let set_fn = lua.create_function(move |lua, (id, key, value): (String, String, Value)| {
                let value: serde_json::Value = lua.from_value(value)?;
                with_scope(&slot, |s| s.storage.set(scope, &id, &key, value))
            })?;
            dice.set(setter, set_fn)?;
        }
        Ok(())
    }
}

fn with_scope<R>(slot: &ScopeSlot, f: impl FnOnce(&CallScope) -> R) -> LuaResult<R> {
    let scope = slot.borrow();
    match scope.as_ref() {
        Some(scope) => Ok(f(scope)),
        None => Err(mlua::Error::RuntimeError(
            "dice API is only available during a script call".to_string(),
        )),
    }
}

/// Convert a serializable host value into a plain Lua value.
///
/// `null` becomes `nil` and arrays carry no metatable.
pub(crate) fn json_to_lua<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> LuaResult<Value> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
        .set_array_metatable(false);
    lua.to_value_with(value, options)
}

/// Convert a Lua value to a string for logging.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        _ => "[unknown]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn lua_with_api() -> (Lua, ScopeSlot) {
        let lua = Lua::new();
        let slot: ScopeSlot = Rc::new(RefCell::new(None));
        let scripts = lua.create_table().unwrap();
        DiceApi::new(Rc::clone(&slot)).register(&lua, &scripts).unwrap();
        (lua, slot)
    }

    fn scope(storage: StorageBridge) -> CallScope {
        let mut manual = BTreeMap::new();
        manual.insert("stress".to_string(), "Stress rises.".to_string());
        let mut rules = RuleSnapshot::new();
        rules.insert("Maid".to_string(), manual);
        CallScope {
            script: "test.script".to_string(),
            storage,
            rules: Rc::new(rules),
        }
    }

    #[test]
    fn test_api_requires_active_scope() {
        let (lua, _slot) = lua_with_api();
        let result = lua.load(r#"return dice.getUserData("u1", "k")"#).eval::<Value>();
        assert!(result.is_err());
    }

    #[test]
    fn test_query_rule() {
        let (lua, slot) = lua_with_api();
        let _guard = ScopeGuard::enter(&slot, scope(StorageBridge::new()));

        let found: String = lua
            .load(r#"local r = dice.queryRule("stress") return tostring(r.success) .. ":" .. r.content"#)
            .eval()
            .unwrap();
        assert_eq!(found, "true:Stress rises.");

        let missing: String = lua
            .load(r#"local r = dice.queryRule("nope") return tostring(r.success) .. ":" .. r.error"#)
            .eval()
            .unwrap();
        assert_eq!(missing, "false:rule not found: nope");
    }

    #[test]
    fn test_data_functions_queue_writes() {
        let (lua, slot) = lua_with_api();
        let storage = StorageBridge::new();
        {
            let _guard = ScopeGuard::enter(&slot, scope(storage.clone()));
            let value: String = lua
                .load(
                    r#"
                    dice.setGroupData("g1", "mood", "calm")
                    dice.setUserData("u1", "hp", 7)
                    return dice.getGroupData("g1", "mood") .. "/" .. dice.getUserData("u1", "hp")
                "#,
                )
                .eval()
                .unwrap();
            assert_eq!(value, "calm/7");
        }
        assert!(slot.borrow().is_none());
        assert_eq!(storage.pending().len(), 2);
        assert_eq!(storage.get(DataScope::User, "u1", "hp"), Some(json!(7)));
    }

    #[test]
    fn test_log_accepts_any_value() {
        let (lua, slot) = lua_with_api();
        let _guard = ScopeGuard::enter(&slot, scope(StorageBridge::new()));
        lua.load(r#"dice.log("hello") dice.log(nil) dice.log({})"#)
            .exec()
            .unwrap();
    }

    #[test]
    fn test_json_to_lua_shapes() {
        let lua = Lua::new();
        let value = json_to_lua(&lua, &json!({"a": [1, 2], "b": null, "c": "x"})).unwrap();
        lua.globals().set("v", value).unwrap();
        let summary: String = lua
            .load(r#"return #v.a .. tostring(v.b) .. v.c"#)
            .eval()
            .unwrap();
        assert_eq!(summary, "2nilx");
    }
}
