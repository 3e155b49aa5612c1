/// `config.rs` — host configuration (`configs/hub.json`)
///
/// Every field has a default, so a missing file or a partial one is fine.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

pub const CONFIG_ENV: &str = "STREAMHUB_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "configs/hub.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Directory containing `configs/reactions` and `configs/scripts`.
    pub content_root: PathBuf,
    /// env_logger filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Load scripts into a VM without `os`/`io`.
    pub restricted_stdlib: bool,
    pub reload: ReloadConfig,
    pub storage: StorageConfig,
    pub points: PointsConfig,
    pub media: MediaConfig,
    pub speech: SpeechConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("."),
            log_filter: "info".into(),
            restricted_stdlib: false,
            reload: ReloadConfig::default(),
            storage: StorageConfig::default(),
            points: PointsConfig::default(),
            media: MediaConfig::default(),
            speech: SpeechConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub read_retries: u32,
    pub retry_backoff_ms: u64,
    pub extension: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            poll_interval_ms: 200,
            read_retries: 3,
            retry_backoff_ms: 100,
            extension: "script".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("data/data.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsConfig {
    /// SQLite file for the points ledger. Unset keeps points in memory.
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub channels: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            channels: vec!["Main".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub voices: Vec<String>,
    pub banned_words_file: Option<PathBuf>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            voices: vec!["Default".into()],
            banned_words_file: None,
        }
    }
}

impl HubConfig {
    /// Load from `$STREAMHUB_CONFIG` or `configs/hub.json`.
    pub fn load() -> HubResult<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> HubResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[config] {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(HubError::io(path, e)),
        };
        serde_json::from_str(&raw)
            .map_err(|e| HubError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn reactions_dir(&self) -> PathBuf {
        self.content_root.join("configs").join("reactions")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.content_root.join("configs").join("scripts")
    }

    /// Relative paths in the config are taken relative to `content_root`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.content_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = HubConfig::load_from(Path::new("/no/such/hub.json")).unwrap();
        assert_eq!(cfg.reload.debounce_ms, 250);
        assert_eq!(cfg.reload.read_retries, 3);
        assert_eq!(cfg.media.channels, vec!["Main".to_string()]);
        assert!(cfg.points.database.is_none());
        assert_eq!(cfg.reactions_dir(), PathBuf::from("./configs/reactions"));
        assert_eq!(cfg.resolve(Path::new("/abs/points.db")), PathBuf::from("/abs/points.db"));
        assert_eq!(cfg.resolve(&cfg.storage.data_file), PathBuf::from("./data/data.json"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.json");
        std::fs::write(&path, r#"{ "reload": { "debounce_ms": 50 }, "log_filter": "debug" }"#).unwrap();

        let cfg = HubConfig::load_from(&path).unwrap();
        assert_eq!(cfg.reload.debounce_ms, 50);
        assert_eq!(cfg.reload.poll_interval_ms, 200);
        assert_eq!(cfg.log_filter, "debug");
        assert_eq!(cfg.storage.data_file, PathBuf::from("data/data.json"));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(HubConfig::load_from(&path), Err(HubError::Config(_))));
    }
}
