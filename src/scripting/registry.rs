/// `scripting/registry.rs` — name → reaction store and dispatch fan-out
///
/// Readers clone `Arc<Reaction>`s out under a short read lock and invoke them
/// with the lock released, so a reload never waits on a running callback and a
/// dispatch never waits on a reload. A dispatch already holding the old
/// reaction finishes against it.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use futures_util::future::join_all;

use crate::error::{HubError, HubResult};

use super::{
    kind::EventKind,
    reaction::{name_from_path, CallResult, Reaction},
    runtime::ScriptRuntime,
    value::{EventArg, ScriptValue},
};

#[derive(Clone)]
pub struct ReactionRegistry {
    runtime: ScriptRuntime,
    reactions: Arc<RwLock<HashMap<String, Arc<Reaction>>>>,
}

impl ReactionRegistry {
    pub fn new(runtime: ScriptRuntime) -> Self {
        Self {
            runtime,
            reactions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    // ── Mutation ──────────────────────────────────────────────────────────

    /// Validate `declared` and store it under the file's stem, replacing any
    /// previous reaction of that name. A bad declaration is logged and dropped.
    pub fn upsert(&self, file_path: &Path, declared: &ScriptValue) -> Option<Arc<Reaction>> {
        let reaction = match self.declare(file_path, declared) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                log::warn!("[registry] {}", e);
                return None;
            }
        };

        let previous = self
            .reactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reaction.name().to_string(), Arc::clone(&reaction));

        match previous {
            Some(old) => log::info!(
                "[registry] Replaced '{}' ({} → {}, cooldown {}ms)",
                reaction.name(),
                old.kind(),
                reaction.kind(),
                reaction.cooldown().as_millis()
            ),
            None => log::info!(
                "[registry] Loaded '{}' ({}, cooldown {}ms)",
                reaction.name(),
                reaction.kind(),
                reaction.cooldown().as_millis()
            ),
        }
        Some(reaction)
    }

    /// Build a reaction from a declaration table without registering it.
    pub fn declare(&self, file_path: &Path, declared: &ScriptValue) -> HubResult<Reaction> {
        let file = file_path.display().to_string();
        let reject = |reason: String| HubError::Declaration {
            file: file.clone(),
            reason,
        };

        let table = declared
            .as_table()
            .ok_or_else(|| reject(format!("expected a table, got {}", declared.type_name())))?;
        let field = |key: &str| -> HubResult<ScriptValue> {
            Ok(ScriptValue::from(table.get::<mlua::Value>(key)?))
        };

        let kind_value = field("kind")?;
        let kind = if let Some(name) = kind_value.as_str() {
            EventKind::from_name(&name)
                .ok_or_else(|| reject(format!("unknown kind '{name}'")))?
        } else if let Some(code) = kind_value.as_integer() {
            let kind = EventKind::from_code(code)
                .ok_or_else(|| reject(format!("unknown kind code {code}")))?;
            // Hosts without StreamOn/StreamOff numbered everything after Cheer
            // two lower, so an old file's code can silently mean another kind.
            log::warn!(
                "[registry] {}: numeric kind {} read as {}; declare kind = \"{}\" to be explicit",
                file,
                code,
                kind,
                kind
            );
            kind
        } else if kind_value.is_nil() {
            return Err(reject("missing 'kind'".into()));
        } else {
            return Err(reject(format!(
                "'kind' must be a string or integer, got {}",
                kind_value.type_name()
            )));
        };

        let oncall = field("oncall")?
            .as_callable()
            .ok_or_else(|| reject("'oncall' is missing or not a function".into()))?;

        let onerror_value = field("onerror")?;
        let onerror = match onerror_value.as_callable() {
            Some(cb) => Some(cb),
            None if onerror_value.is_nil() => None,
            None => return Err(reject("'onerror' is not a function".into())),
        };

        let cooldown_value = field("cooldown")?;
        let cooldown_ms = if cooldown_value.is_nil() {
            0
        } else {
            match cooldown_value.as_integer() {
                Some(ms) if ms >= 0 => ms as u64,
                _ => {
                    return Err(reject(format!(
                        "'cooldown' must be a non-negative integer, got {cooldown_value}"
                    )))
                }
            }
        };

        Ok(Reaction::new(
            file_path,
            kind,
            Duration::from_millis(cooldown_ms),
            oncall,
            onerror,
            self.runtime.clone(),
        ))
    }

    /// Drop the reaction loaded from `file_path`; no-op if absent.
    pub fn remove(&self, file_path: &Path) -> Option<Arc<Reaction>> {
        let name = name_from_path(file_path);
        let removed = self
            .reactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
        if removed.is_some() {
            log::info!("[registry] Removed '{}'", name);
        }
        removed
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> HubResult<()> {
        let reaction = self
            .get(name)
            .ok_or_else(|| HubError::NameNotFound(name.to_string()))?;
        reaction.set_enabled(enabled);
        log::info!(
            "[registry] '{}' {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    // ── Lookup ────────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<Arc<Reaction>> {
        self.reactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn by_kind(&self, kind: EventKind) -> Vec<Arc<Reaction>> {
        self.reactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .reactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.reactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Dispatch ──────────────────────────────────────────────────────────

    /// Call every reaction of `kind`, each on its own task. One reaction
    /// failing, or waiting on a host operation, never affects the others.
    pub async fn dispatch(&self, kind: EventKind, args: Vec<EventArg>) -> Vec<(String, CallResult)> {
        let targets = self.by_kind(kind);
        if targets.is_empty() {
            log::debug!("[registry] No reactions for {}", kind);
            return Vec::new();
        }

        let args: Arc<[EventArg]> = args.into();
        let calls = targets.into_iter().map(|reaction| {
            let args = Arc::clone(&args);
            async move {
                let name = reaction.name().to_string();
                let result = run_isolated(reaction, args).await;
                (name, result)
            }
        });

        let results = join_all(calls).await;
        for (name, result) in &results {
            if let Some(msg) = &result.error_message {
                log::warn!("[registry] {} reaction '{}' failed: {}", kind, name, msg);
            }
        }
        results
    }

    /// Call one reaction by name, but only if it is of the kind the caller
    /// expects. A missing name or a kind mismatch is logged and skipped.
    pub async fn dispatch_named(
        &self,
        name: &str,
        kind: EventKind,
        args: Vec<EventArg>,
    ) -> HubResult<CallResult> {
        let reaction = match self.get(name) {
            Some(r) if r.kind() == kind => r,
            Some(r) => {
                let err = HubError::KindMismatch {
                    name: name.to_string(),
                    expected: kind,
                    actual: r.kind(),
                };
                log::warn!("[registry] {}", err);
                return Err(err);
            }
            None => {
                let err = HubError::NameNotFound(name.to_string());
                log::warn!("[registry] {}", err);
                return Err(err);
            }
        };

        let result = run_isolated(reaction, args.into()).await;
        if let Some(msg) = &result.error_message {
            log::warn!("[registry] {} reaction '{}' failed: {}", kind, name, msg);
        }
        Ok(result)
    }
}

/// Run the call on its own task so a panic in host code surfaces as a failed
/// result instead of unwinding through the dispatcher.
async fn run_isolated(reaction: Arc<Reaction>, args: Arc<[EventArg]>) -> CallResult {
    let name = reaction.name().to_string();
    match tokio::spawn(async move { reaction.call(&args).await }).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("[registry] reaction '{}' task aborted: {}", name, e);
            CallResult::failed(format!("reaction task aborted: {e}"), ScriptValue::nil())
        }
    }
}
