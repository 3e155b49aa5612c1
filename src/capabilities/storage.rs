/// `capabilities/storage.rs` — `storagelib`, a JSON-file key/value store
///
/// Values live in memory and hit disk only on `save`/`backup`. Saves go
/// through a temp file and a rename, so a crash never leaves half a file.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use mlua::{Lua, Table, Value};

use crate::{
    error::{HubError, HubResult},
    scripting::value::{json_to_lua_value, lua_value_to_json},
};

use super::Capability;

// ── JsonStore ─────────────────────────────────────────────────────────────────

pub struct JsonStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, serde_json::Value>>,
    /// Serialises file operations.
    io: Mutex<()>,
    /// Set when the data file could neither be loaded nor moved aside.
    /// `save` refuses to touch it until a `load` succeeds.
    protect_file: AtomicBool,
}

impl JsonStore {
    /// Open the store, loading `path` if it exists. A file that fails to
    /// load is renamed to `<path>.corrupt-<timestamp>` and the store starts
    /// empty, so the next save cannot clobber it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            data: Mutex::new(BTreeMap::new()),
            io: Mutex::new(()),
            protect_file: AtomicBool::new(false),
        };
        if let Err(e) = store.load() {
            match store.set_aside() {
                Ok(moved) => log::warn!(
                    "[storage] {}; moved to {}, starting empty",
                    e,
                    moved.display()
                ),
                Err(move_err) => {
                    log::error!(
                        "[storage] {}; could not move it aside ({}), saves are disabled",
                        e,
                        move_err
                    );
                    store.protect_file.store(true, Ordering::SeqCst);
                }
            }
        }
        store
    }

    fn set_aside(&self) -> HubResult<PathBuf> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let mut target = self.path.clone().into_os_string();
        target.push(chrono::Local::now().format(".corrupt-%Y-%m-%d-%H-%M-%S").to_string());
        let target = PathBuf::from(target);
        std::fs::rename(&self.path, &target).map_err(|e| HubError::io(&self.path, e))?;
        Ok(target)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> HubResult<Option<serde_json::Value>> {
        validate_key(key)?;
        Ok(self.data().get(key).cloned())
    }

    /// `Null` removes the key.
    pub fn set(&self, key: &str, value: serde_json::Value) -> HubResult<()> {
        validate_key(key)?;
        let mut data = self.data();
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> HubResult<bool> {
        validate_key(key)?;
        Ok(self.data().remove(key).is_some())
    }

    pub fn contains(&self, key: &str) -> HubResult<bool> {
        validate_key(key)?;
        Ok(self.data().contains_key(key))
    }

    pub fn clear(&self) {
        self.data().clear();
    }

    pub fn count(&self) -> usize {
        self.data().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data().keys().cloned().collect()
    }

    // ── File operations ───────────────────────────────────────────────────

    /// Replace the in-memory contents with the file's. A missing file is an
    /// empty store.
    pub fn load(&self) -> HubResult<()> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HubError::io(&self.path, e)),
        };
        let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(&raw).map_err(|e| {
            HubError::Capability(format!("invalid JSON in {}: {}", self.path.display(), e))
        })?;
        let mut data = self.data();
        data.clear();
        data.extend(parsed.into_iter().filter(|(k, _)| !k.trim().is_empty()));
        self.protect_file.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn save(&self) -> HubResult<()> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        if self.protect_file.load(Ordering::SeqCst) {
            return Err(HubError::Capability(format!(
                "{} failed to load, refusing to overwrite it",
                self.path.display()
            )));
        }
        self.write_to(&self.path)
    }

    /// Write a copy next to the data file. Default suffix is
    /// `.backup-YYYY-MM-DD-HH-MM-SS` (local time).
    pub fn backup(&self, suffix: Option<&str>) -> HubResult<PathBuf> {
        let suffix = suffix.map(str::to_string).unwrap_or_else(|| {
            chrono::Local::now()
                .format(".backup-%Y-%m-%d-%H-%M-%S")
                .to_string()
        });
        let mut target = self.path.clone().into_os_string();
        target.push(&suffix);
        let target = PathBuf::from(target);

        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_to(&target)?;
        Ok(target)
    }

    /// Empty store deletes the file rather than writing `{}`.
    fn write_to(&self, target: &Path) -> HubResult<()> {
        let snapshot = self.data().clone();
        if snapshot.is_empty() {
            return match std::fs::remove_file(target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(HubError::io(target, e)),
            };
        }

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| HubError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| HubError::Capability(format!("serialising store: {e}")))?;

        let mut tmp = target.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(|e| HubError::io(&tmp, e))?;
        std::fs::rename(&tmp, target).map_err(|e| HubError::io(target, e))?;
        Ok(())
    }
}

fn validate_key(key: &str) -> HubResult<()> {
    if key.trim().is_empty() {
        return Err(HubError::Capability("storage key must not be empty".into()));
    }
    Ok(())
}

// ── storagelib ────────────────────────────────────────────────────────────────

pub struct StorageLib {
    store: Arc<JsonStore>,
}

impl StorageLib {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }
}

impl Capability for StorageLib {
    fn name(&self) -> &'static str {
        "storagelib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        // Plain get/set accept anything JSON can hold.
        let store = Arc::clone(&self.store);
        tbl.set(
            "get",
            lua.create_function(move |lua, key: String| match store.get(&key).map_err(HubError::into_lua)? {
                Some(v) => json_to_lua_value(lua, &v),
                None => Ok(Value::Nil),
            })?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "set",
            lua.create_function(move |_, (key, value): (String, Value)| {
                store.set(&key, lua_value_to_json(&value)).map_err(HubError::into_lua)
            })?,
        )?;

        // Typed accessors return nil when the stored value has another type.
        let typed_get = |check: fn(&serde_json::Value) -> bool| {
            let store = Arc::clone(&self.store);
            lua.create_function(move |lua, key: String| {
                match store.get(&key).map_err(HubError::into_lua)? {
                    Some(v) if check(&v) => json_to_lua_value(lua, &v),
                    _ => Ok(Value::Nil),
                }
            })
        };
        tbl.set("gettable", typed_get(|v| v.is_object() || v.is_array())?)?;
        tbl.set("getstring", typed_get(serde_json::Value::is_string)?)?;
        tbl.set("getnumber", typed_get(serde_json::Value::is_number)?)?;
        tbl.set("getbool", typed_get(serde_json::Value::is_boolean)?)?;

        let store = Arc::clone(&self.store);
        tbl.set(
            "settable",
            lua.create_function(move |_, (key, value): (String, Option<Table>)| {
                let json = value
                    .map(|t| lua_value_to_json(&Value::Table(t)))
                    .unwrap_or(serde_json::Value::Null);
                store.set(&key, json).map_err(HubError::into_lua)
            })?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "setstring",
            lua.create_function(move |_, (key, value): (String, Option<String>)| {
                store
                    .set(&key, value.map(serde_json::Value::String).unwrap_or_default())
                    .map_err(HubError::into_lua)
            })?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "setnumber",
            lua.create_function(move |_, (key, value): (String, Option<f64>)| {
                let json = match value {
                    Some(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => serde_json::json!(n as i64),
                    Some(n) => serde_json::json!(n),
                    None => serde_json::Value::Null,
                };
                store.set(&key, json).map_err(HubError::into_lua)
            })?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "setbool",
            lua.create_function(move |_, (key, value): (String, Option<bool>)| {
                store
                    .set(&key, value.map(serde_json::Value::Bool).unwrap_or_default())
                    .map_err(HubError::into_lua)
            })?,
        )?;

        let store = Arc::clone(&self.store);
        tbl.set(
            "remove",
            lua.create_function(move |_, key: String| store.remove(&key).map_err(HubError::into_lua))?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "contains",
            lua.create_function(move |_, key: String| store.contains(&key).map_err(HubError::into_lua))?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "clear",
            lua.create_function(move |_, ()| {
                store.clear();
                Ok(())
            })?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set("count", lua.create_function(move |_, ()| Ok(store.count()))?)?;
        let store = Arc::clone(&self.store);
        tbl.set("keys", lua.create_function(move |_, ()| Ok(store.keys()))?)?;

        let store = Arc::clone(&self.store);
        tbl.set(
            "load",
            lua.create_function(move |_, ()| store.load().map_err(HubError::into_lua))?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "save",
            lua.create_function(move |_, ()| store.save().map_err(HubError::into_lua))?,
        )?;
        let store = Arc::clone(&self.store);
        tbl.set(
            "backup",
            lua.create_function(move |_, suffix: Option<String>| {
                store
                    .backup(suffix.as_deref())
                    .map(|p| p.display().to_string())
                    .map_err(HubError::into_lua)
            })?,
        )?;

        Ok(tbl)
    }
}
