//! Compatibility shim around plain plugin scripts.
//!
//! Plugin scripts are usually written as a bare chunk that reads `msg` and
//! calls helpers such as `getGroupData` or `queryRule` as if they were
//! globals. Such chunks are wrapped into `return function(msg) ... end`
//! with those helpers defined as locals.

const PRELUDE: &str = r#"return function(msg)
  local function queryRule(query)
    if msg.pluginRules then
      for _, manual in pairs(msg.pluginRules) do
        if manual[query] then
          return manual[query]
        end
      end
    end
    local result = dice.queryRule(query)
    if result and result.success then
      return result.content
    end
    return nil
  end

  local function setGroupConf(gid, key, value)
    dice.setGroupData(gid, key, tostring(value))
  end
  local function getGroupConf(gid, key)
    return dice.getGroupData(gid, key)
  end
  local function setGroupData(gid, key, value)
    dice.setGroupData(gid, key, tostring(value))
  end
  local function getGroupData(gid, key)
    return dice.getGroupData(gid, key)
  end
  local function setUserData(uid, key, value)
    dice.setUserData(uid, key, tostring(value))
  end
  local function getUserData(uid, key)
    return dice.getUserData(uid, key)
  end

  local function getPlayerCard(uid, gid)
    if msg.getPlayerCard then
      return msg.getPlayerCard(uid, gid)
    end
    return nil
  end

  if msg.game and msg.game.pls then
    setmetatable(msg.game.pls, {
      __index = {
        totable = function(self)
          return self
        end
      }
    })
  end

  local __result = (function()
"#;

const EPILOGUE: &str = r#"
  end)()

  if type(__result) == "string" then
    local card = getGroupData(msg.gid, "card#" .. msg.uid) or msg.card
    if card ~= nil and card ~= "" then
      __result = __result:gsub("{card}", function() return tostring(card) end)
    end
    local pc = msg.char and msg.char.__Name or ""
    __result = __result:gsub("{pc}", function() return tostring(pc) end)
  end

  return __result
end"#;

/// Whether `code` already evaluates to a function (`return function ...`).
pub fn is_function_form(code: &str) -> bool {
    code.trim_start()
        .strip_prefix("return")
        .is_some_and(|rest| {
            rest.starts_with(char::is_whitespace) && rest.trim_start().starts_with("function")
        })
}

/// Wrap a bare script chunk. Function-form scripts are returned trimmed.
pub fn wrap_lua_script(code: &str) -> String {
    let trimmed = code.trim();
    if is_function_form(trimmed) {
        return trimmed.to_string();
    }

    let mut wrapped = String::with_capacity(PRELUDE.len() + code.len() + EPILOGUE.len());
    wrapped.push_str(PRELUDE);
    wrapped.push_str(code);
    wrapped.push_str(EPILOGUE);
    wrapped
}
