/// `scripting/value.rs` — the only place interpreter values cross into host code
///
/// `ScriptValue` and `Callback` wrap mlua values so the registry, the catalog and
/// producers never touch the interpreter's representation directly. `EventArg`
/// is the host → script direction: plain Rust values a producer passes along
/// with an event.
use std::fmt;

use mlua::{Function, IntoLua, Lua, Result as LuaResult, Table, Value};

// ── ScriptValue ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScriptValue(Value);

impl ScriptValue {
    pub fn nil() -> Self {
        Self(Value::Nil)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.0, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn as_callable(&self) -> Option<Callback> {
        match &self.0 {
            Value::Function(f) => Some(Callback(f.clone())),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<Table> {
        match &self.0 {
            Value::Table(t) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match &self.0 {
            Value::String(s) => Some(s.to_string_lossy()),
            _ => None,
        }
    }

    /// Integers, and floats without a fractional part.
    pub fn as_integer(&self) -> Option<i64> {
        match self.0 {
            Value::Integer(i) => Some(i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(n as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.0 {
            Value::Integer(i) => Some(i as f64),
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.0 {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        lua_value_to_json(&self.0)
    }

    pub(crate) fn into_inner(self) -> Value {
        self.0
    }
}

impl Default for ScriptValue {
    fn default() -> Self {
        Self::nil()
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", display_value(&self.0))
    }
}

// ── Callback ──────────────────────────────────────────────────────────────────

/// A callable obtained from an evaluated script, bound to the runtime that
/// produced it.
#[derive(Debug, Clone)]
pub struct Callback(Function);

impl Callback {
    pub(crate) fn function(&self) -> &Function {
        &self.0
    }
}

// ── EventArg ──────────────────────────────────────────────────────────────────

/// One positional argument a producer hands to `dispatch`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventArg {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
}

impl EventArg {
    /// Best-effort typing of free text (console input, chat arguments).
    pub fn parse(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            EventArg::Int(i)
        } else if let Ok(n) = raw.parse::<f64>() {
            EventArg::Number(n)
        } else {
            match raw {
                "true" => EventArg::Bool(true),
                "false" => EventArg::Bool(false),
                "nil" => EventArg::Nil,
                _ => EventArg::Str(raw.to_string()),
            }
        }
    }
}

impl IntoLua for EventArg {
    fn into_lua(self, lua: &Lua) -> LuaResult<Value> {
        Ok(match self {
            EventArg::Nil => Value::Nil,
            EventArg::Bool(b) => Value::Boolean(b),
            EventArg::Int(i) => Value::Integer(i),
            EventArg::Number(n) => Value::Number(n),
            EventArg::Str(s) => Value::String(lua.create_string(s.as_str())?),
        })
    }
}

impl fmt::Display for EventArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventArg::Nil => f.write_str("nil"),
            EventArg::Bool(b) => write!(f, "{b}"),
            EventArg::Int(i) => write!(f, "{i}"),
            EventArg::Number(n) => write!(f, "{n}"),
            EventArg::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for EventArg {
    fn from(s: &str) -> Self {
        EventArg::Str(s.to_string())
    }
}

impl From<String> for EventArg {
    fn from(s: String) -> Self {
        EventArg::Str(s)
    }
}

impl From<i64> for EventArg {
    fn from(i: i64) -> Self {
        EventArg::Int(i)
    }
}

impl From<i32> for EventArg {
    fn from(i: i32) -> Self {
        EventArg::Int(i64::from(i))
    }
}

impl From<u32> for EventArg {
    fn from(i: u32) -> Self {
        EventArg::Int(i64::from(i))
    }
}

impl From<f64> for EventArg {
    fn from(n: f64) -> Self {
        EventArg::Number(n)
    }
}

impl From<bool> for EventArg {
    fn from(b: bool) -> Self {
        EventArg::Bool(b)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn display_value(val: &Value) -> String {
    match val {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy(),
        Value::Table(_) => lua_value_to_json(val).to_string(),
        other => other.type_name().to_string(),
    }
}

pub(crate) fn lua_value_to_json(val: &Value) -> serde_json::Value {
    match val {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::json!(i),
        Value::Number(n) => serde_json::json!(n),
        Value::String(s) => serde_json::Value::String(s.to_string_lossy()),
        Value::Table(t) => {
            // Array heuristic: keys are exactly 1..n
            let pairs: Vec<(Value, Value)> = t.clone().pairs::<Value, Value>().filter_map(|p| p.ok()).collect();
            let mut keys: Vec<i64> = pairs
                .iter()
                .filter_map(|(k, _)| match k {
                    Value::Integer(n) => Some(*n),
                    _ => None,
                })
                .collect();
            keys.sort_unstable();
            let is_array = !pairs.is_empty()
                && keys.len() == pairs.len()
                && keys.iter().enumerate().all(|(i, k)| *k == i as i64 + 1);
            if is_array {
                let mut items = pairs;
                items.sort_by_key(|(k, _)| match k {
                    Value::Integer(n) => *n,
                    _ => 0,
                });
                serde_json::Value::Array(items.iter().map(|(_, v)| lua_value_to_json(v)).collect())
            } else {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    let key = match k {
                        Value::String(ks) => ks.to_string_lossy(),
                        Value::Integer(n) => n.to_string(),
                        _ => continue,
                    };
                    map.insert(key, lua_value_to_json(&v));
                }
                serde_json::Value::Object(map)
            }
        }
        _ => serde_json::Value::Null,
    }
}

pub(crate) fn json_to_lua_value(lua: &Lua, val: &serde_json::Value) -> LuaResult<Value> {
    match val {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(Value::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Ok(Value::String(lua.create_string(s.as_str())?)),
        serde_json::Value::Array(arr) => {
            let t = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                t.set(i + 1, json_to_lua_value(lua, v)?)?;
            }
            Ok(Value::Table(t))
        }
        serde_json::Value::Object(obj) => {
            let t = lua.create_table()?;
            for (k, v) in obj {
                t.set(k.as_str(), json_to_lua_value(lua, v)?)?;
            }
            Ok(Value::Table(t))
        }
    }
}
