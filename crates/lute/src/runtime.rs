// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template runtime contract.
//!
//! Compiled template classes extend a fixed Lua base class, `Template`,
//! provided by the embedded [`RUNTIME_SOURCE`] prelude:
//!
//! - `output`: appendable string buffer, concatenated by `result()`
//! - `data`: the mutable parameter table bound before a render
//! - `vars`: static ordered registry of declared variables
//! - `write(any)`: formats and appends to `output`
//! - `get_data(name, kind)`: typed parameter lookup
//! - `initialize()`: user-extensible hook, called before `render`
//! - `render()`: abstract; the generated classes override it
//!
//! Declared `var`s become typed properties: reading `inst.n` routes through
//! `get_data` with the declared type, writing stores into `data`. Inside a
//! generated `render`, bare names resolve through `scope()` in the order
//! data → instance → globals.
//!
//! The Rust side wraps one instantiated template object as a
//! [`TemplateInstance`].

use crate::codegen::LuaSourceMap;
use crate::error::{Error, Result};
use mlua::{Function, Lua, LuaSerdeExt, Table, Value};

/// The Lua runtime prelude shared by every generated chunk.
pub const RUNTIME_SOURCE: &str = r#"
-- LUTE template runtime.
local Runtime = {}

local function type_name(value)
  local numeric = math.type(value)
  if numeric ~= nil then
    return numeric
  end
  return type(value)
end

local function check_type(name, expected, value)
  if value == nil or expected == nil or expected == "any" then
    return value
  end
  local actual = type_name(value)
  local ok
  if expected == "number" then
    ok = actual == "integer" or actual == "float" or actual == "number"
  elseif expected == "integer" then
    ok = actual == "integer"
  else
    ok = actual == expected
  end
  if not ok then
    error(string.format("variable '%s' expects %s, got %s", name, expected, actual), 3)
  end
  return value
end

local Template = {}
Template.class_name = "Template"
Template.vars = {}
Template.properties = {}

function Template:write(value)
  if value ~= nil then
    self.output[#self.output + 1] = tostring(value)
  end
end

function Template:get_data(name, expected)
  return check_type(name, expected, self.data[name])
end

function Template:initialize()
end

function Template:render()
  error("render is not implemented for " .. self.class_name, 2)
end

function Template:result()
  return table.concat(self.output)
end

-- Name scope for generated render bodies: data first, then instance
-- members, then the real globals.
function Template:scope()
  local inst = self
  return setmetatable({}, {
    __index = function(_, key)
      local declared = inst.properties[key]
      if declared ~= nil then
        return inst:get_data(key, declared)
      end
      local value = inst.data[key]
      if value ~= nil then
        return value
      end
      local member = inst[key]
      if member ~= nil then
        return member
      end
      return _G[key]
    end,
    __newindex = function(_, key, value)
      inst.data[key] = value
    end,
  })
end

Runtime.Template = Template
Runtime.vars = {}

function Runtime.class(name, base)
  base = base or Template
  local class = setmetatable({}, { __index = base })
  class.class_name = name
  class.base = base
  class.vars = {}
  class.properties = setmetatable({}, { __index = base.properties })
  class.__instance_meta = {
    __index = function(inst, key)
      local declared = class.properties[key]
      if declared ~= nil then
        return inst:get_data(key, declared)
      end
      return class[key]
    end,
    __newindex = function(inst, key, value)
      if class.properties[key] ~= nil then
        inst.data[key] = value
      else
        rawset(inst, key, value)
      end
    end,
  }
  return class
end

function Runtime.register_vars(class)
  for _, var in ipairs(class.vars) do
    class.properties[var.name] = var.kind
    local seen = false
    for _, existing in ipairs(Runtime.vars) do
      if existing.name == var.name then
        seen = true
        break
      end
    end
    if not seen then
      Runtime.vars[#Runtime.vars + 1] = {
        name = var.name,
        kind = var.kind,
        declared = var.declared,
      }
    end
  end
end

function Runtime.base(ns, name)
  local base = ns[name] or _G[name]
  if base == nil then
    error("unknown base class: " .. name, 2)
  end
  return base
end

function Runtime.new(class)
  local inst = { output = {}, data = {} }
  return setmetatable(inst, class.__instance_meta)
end

return Runtime
"#;

const RUNTIME_REGISTRY_KEY: &str = "lute.runtime";

/// Loads the runtime prelude into a Lua state, reusing a previously loaded
/// instance from the registry.
pub(crate) fn load_runtime(lua: &Lua) -> Result<Table> {
    if let Ok(existing) = lua.named_registry_value::<Table>(RUNTIME_REGISTRY_KEY) {
        return Ok(existing);
    }
    let runtime: Table = lua
        .load(RUNTIME_SOURCE)
        .set_name("@lute/runtime.lua")
        .eval()?;
    lua.set_named_registry_value(RUNTIME_REGISTRY_KEY, runtime.clone())?;
    Ok(runtime)
}

/// A freshly constructed template object bound to an engine's Lua state.
///
/// Every instance owns its parameter table and output buffer; instances of
/// one artifact are independent of each other.
#[derive(Debug)]
pub struct TemplateInstance<'a> {
    lua: &'a Lua,
    table: Table,
    class_name: String,
    template_name: String,
    source_map: Option<LuaSourceMap>,
}

impl<'a> TemplateInstance<'a> {
    pub(crate) fn new(
        lua: &'a Lua,
        table: Table,
        class_name: String,
        template_name: String,
        source_map: Option<LuaSourceMap>,
    ) -> Self {
        Self {
            lua,
            table,
            class_name,
            template_name,
            source_map,
        }
    }

    /// The generated class this instance was constructed from.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Sets one entry of the instance's parameter table.
    pub fn set<V: serde::Serialize>(&self, name: &str, value: &V) -> Result<()> {
        let data: Table = self.table.raw_get("data")?;
        data.set(name, self.lua.to_value(value)?)?;
        Ok(())
    }

    /// Merges every field of a serializable value into the parameter table.
    ///
    /// Non-table values (e.g. `null`) bind nothing.
    pub fn bind<T: serde::Serialize>(&self, values: &T) -> Result<()> {
        let bound = self.lua.to_value(values)?;
        if let Value::Table(table) = bound {
            let data: Table = self.table.raw_get("data")?;
            for pair in table.pairs::<Value, Value>() {
                let (key, value) = pair?;
                data.set(key, value)?;
            }
        }
        Ok(())
    }

    /// Invokes the `initialize` hook.
    pub fn initialize(&self) -> Result<()> {
        let hook: Function = self.table.get("initialize")?;
        hook.call::<()>(self.table.clone())
            .map_err(|e| self.execution_error(e))
    }

    /// Invokes the generated `render` override and returns the output.
    pub fn render(&self) -> Result<String> {
        let render: Function = self.table.get("render")?;
        render
            .call::<String>(self.table.clone())
            .map_err(|e| self.execution_error(e))
    }

    fn execution_error(&self, error: mlua::Error) -> Error {
        let mut message = error.to_string();
        if let Some(map) = &self.source_map {
            message = map.translate_error(&message);
        }
        Error::Execution {
            template: self.template_name.clone(),
            message,
        }
    }
}
