/// `scripting/catalog.rs` — on-demand scripts, addressed by name
///
/// Catalog entries are just names pointing at files. The body is read and run
/// fresh on every call, so edits are picked up without a reload step.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use crate::error::{HubError, HubResult};

use super::{
    reaction::{name_from_path, CallResult},
    runtime::ScriptRuntime,
    value::ScriptValue,
};

#[derive(Debug)]
pub struct CatalogScript {
    pub name: String,
    pub file_path: PathBuf,
    enabled: AtomicBool,
}

impl CatalogScript {
    fn new(file_path: &Path) -> Self {
        Self {
            name: name_from_path(file_path),
            file_path: file_path.to_path_buf(),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct ScriptCatalog {
    runtime: ScriptRuntime,
    scripts: Arc<RwLock<HashMap<String, Arc<CatalogScript>>>>,
}

impl ScriptCatalog {
    pub fn new(runtime: ScriptRuntime) -> Self {
        Self {
            runtime,
            scripts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn upsert(&self, file_path: &Path) {
        let script = Arc::new(CatalogScript::new(file_path));
        let name = script.name.clone();
        let replaced = self
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), script)
            .is_some();
        if !replaced {
            log::info!("[catalog] Registered script '{}'", name);
        }
    }

    pub fn remove(&self, file_path: &Path) {
        self.remove_named(&name_from_path(file_path));
    }

    pub fn remove_named(&self, name: &str) -> bool {
        let removed = self
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            log::info!("[catalog] Removed script '{}'", name);
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn get(&self, name: &str) -> Option<Arc<CatalogScript>> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> HubResult<()> {
        let script = self
            .get(name)
            .ok_or_else(|| HubError::NameNotFound(name.to_string()))?;
        script.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Read the script's file and run it as a coroutine.
    pub async fn call(&self, name: &str) -> CallResult {
        let Some(script) = self.get(name) else {
            let err = HubError::NameNotFound(name.to_string());
            log::warn!("[catalog] {}", err);
            return CallResult::failed(err.to_string(), ScriptValue::nil());
        };
        if !script.is_enabled() {
            log::debug!("[catalog] '{}' is disabled, skipping", name);
            return CallResult::suppressed();
        }

        let source = match tokio::fs::read_to_string(&script.file_path).await {
            Ok(s) => s,
            Err(e) => {
                let err = HubError::io(&script.file_path, e);
                log::warn!("[catalog] {}", err);
                return CallResult::failed(err.to_string(), ScriptValue::nil());
            }
        };

        match self.runtime.run(&script.name, &source).await {
            Ok(values) => CallResult::completed(values.into_iter().next().unwrap_or_default()),
            Err(e) => {
                log::warn!("[catalog] script '{}' failed: {}", name, e);
                CallResult::failed(e.to_string(), ScriptValue::nil())
            }
        }
    }
}
