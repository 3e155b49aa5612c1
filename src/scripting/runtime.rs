/// `scripting/runtime.rs` — the process-wide Lua VM
///
/// One interpreter for the whole host. Reaction files, catalog scripts and every
/// callback they return live in the same global namespace, so scripts may share
/// state through globals and closures. Capabilities are installed with `bind`
/// before the first file is evaluated; they are the only way scripts reach the
/// outside world.
///
/// mlua's `send` feature makes the VM `Send + Sync` and serialises entry behind
/// its own reentrant lock. Callbacks and catalog scripts run as coroutines
/// (`invoke`, `run`): the lock is only held while Lua code is executing, so a
/// script awaiting a host operation (`utilslib.delay`, `pointslib.get`) yields
/// the VM to everything else. `evaluate` runs a chunk synchronously and is
/// meant for declarations; an async host function called from it raises.
use std::sync::{Arc, Mutex, PoisonError};

use mlua::{IntoLuaMulti, Lua, MultiValue, StdLib, Variadic};

use crate::{
    capabilities::Capability,
    error::{HubError, HubResult},
};

use super::value::{Callback, EventArg, ScriptValue};

#[derive(Clone)]
pub struct ScriptRuntime {
    lua: Lua,
    bound: Arc<Mutex<Vec<&'static str>>>,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        let lua = Lua::new();
        Self {
            lua,
            bound: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A VM restricted to the pure libraries (string, table, math, utf8).
    /// Used where a script must not reach `os`/`io` directly.
    pub fn restricted() -> HubResult<Self> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            mlua::LuaOptions::default(),
        )?;
        Ok(Self {
            lua,
            bound: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    // ── Capabilities ──────────────────────────────────────────────────────

    /// Install `capability` as a named global. Re-binding a name replaces it.
    pub fn bind(&self, capability: &dyn Capability) -> HubResult<()> {
        let name = capability.name();
        let table = capability.build(&self.lua)?;
        self.lua.globals().set(name, table)?;

        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        if !bound.contains(&name) {
            bound.push(name);
        }
        log::debug!("[runtime] bound capability '{}'", name);
        Ok(())
    }

    pub fn bound_names(&self) -> Vec<&'static str> {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Execution ─────────────────────────────────────────────────────────

    /// Run `source` top to bottom and return everything the chunk returned.
    /// `chunk_name` shows up in error messages (`welcome:3: ...`).
    pub fn evaluate(&self, chunk_name: &str, source: &str) -> HubResult<Vec<ScriptValue>> {
        let values = self
            .lua
            .load(source)
            .set_name(format!("={chunk_name}"))
            .eval::<MultiValue>()?;
        Ok(values.into_iter().map(ScriptValue::from).collect())
    }

    /// Like `evaluate`, but the chunk runs as a coroutine and may await
    /// async host functions.
    pub async fn run(&self, chunk_name: &str, source: &str) -> HubResult<Vec<ScriptValue>> {
        let chunk = self
            .lua
            .load(source)
            .set_name(format!("={chunk_name}"))
            .into_function()?;
        let values: MultiValue = chunk.call_async(()).await?;
        Ok(values.into_iter().map(ScriptValue::from).collect())
    }

    /// Call a callback previously obtained from `evaluate`.
    pub async fn invoke(&self, callback: &Callback, args: &[EventArg]) -> HubResult<Vec<ScriptValue>> {
        self.invoke_with(callback, Variadic::from_iter(args.iter().cloned()))
            .await
    }

    pub(crate) async fn invoke_with(
        &self,
        callback: &Callback,
        args: impl IntoLuaMulti,
    ) -> HubResult<Vec<ScriptValue>> {
        let values: MultiValue = callback.function().call_async(args).await?;
        Ok(values.into_iter().map(ScriptValue::from).collect())
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a line number from an interpreter message
/// (`welcome:5: boom`, `runtime error: [string "x"]:5: boom`).
pub(crate) fn parse_error_line(err: &str) -> Option<u32> {
    let first = err.lines().next()?;
    let parts: Vec<&str> = first.split(':').collect();
    if parts.len() < 3 {
        return None;
    }
    parts[1..parts.len() - 1]
        .iter()
        .find(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .and_then(|p| p.parse::<u32>().ok())
}
