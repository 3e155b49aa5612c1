/// `state.rs` — owner of every process-wide singleton
///
/// `AppState::start` wires services → runtime → capabilities → registry and
/// catalog → reload pipeline, in that order; nothing is reachable before it
/// returns and nothing survives `shutdown`.
use std::sync::{Arc, Mutex, PoisonError};

use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};

use crate::{
    capabilities::{
        bind_all,
        hardware::{BlockedInputs, SimulatedInput},
        media::{MediaBoard, MediaEvent},
        platform::OfflinePlatform,
        points::{MemoryLedger, PointsLedger},
        speech::SpeechQueue,
        storage::JsonStore,
        HostServices,
    },
    config::HubConfig,
    db::SqlitePointsLedger,
    error::HubResult,
    scripting::{
        catalog::ScriptCatalog,
        dispatcher::Dispatcher,
        registry::ReactionRegistry,
        reload::{ReloadPipeline, SweepReport},
        runtime::ScriptRuntime,
    },
};

pub struct AppState {
    pub config: HubConfig,
    pub services: HostServices,
    /// Concrete handle on the media board for host-side producers
    /// (`end_reached`) and the event forwarder.
    pub media: Arc<MediaBoard>,
    pub dispatcher: Dispatcher,
    pub pipeline: ReloadPipeline,
    pub startup: SweepReport,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Must be called from inside a multi-threaded tokio runtime.
    pub async fn start(config: HubConfig) -> HubResult<Self> {
        let handle = Handle::current();

        // ── Services ─────────────────────────────────────────────────────────
        let storage = Arc::new(JsonStore::open(config.resolve(&config.storage.data_file)));
        let media = Arc::new(MediaBoard::new(config.media.channels.clone()));
        let points: Arc<dyn PointsLedger> = match &config.points.database {
            Some(path) => Arc::new(SqlitePointsLedger::open(&config.resolve(path)).await?),
            None => {
                log::info!("[startup] No points database configured, balances stay in memory");
                Arc::new(MemoryLedger::new())
            }
        };
        let speech = Arc::new(SpeechQueue::new(
            config.speech.voices.clone(),
            config.speech.banned_words_file.as_deref().map(|p| config.resolve(p)),
        ));
        let services = HostServices {
            storage,
            media: media.clone(),
            hardware: Arc::new(SimulatedInput::new()),
            blocked: Arc::new(BlockedInputs::new()),
            points,
            speech,
            platform: Arc::new(OfflinePlatform),
        };

        // ── Runtime + capabilities ───────────────────────────────────────────
        let runtime = if config.restricted_stdlib {
            ScriptRuntime::restricted()?
        } else {
            ScriptRuntime::new()
        };
        let catalog = ScriptCatalog::new(runtime.clone());
        bind_all(&runtime, &services, &catalog)?;
        let registry = ReactionRegistry::new(runtime);
        let dispatcher = Dispatcher::new(registry.clone(), catalog.clone(), handle.clone());

        // ── Reload pipeline ──────────────────────────────────────────────────
        let pipeline = ReloadPipeline::new(
            registry,
            catalog,
            config.reactions_dir(),
            config.scripts_dir(),
            config.reload.clone(),
        );
        let startup = pipeline.start().await?;
        log::info!(
            "[startup] {} reaction(s) loaded, {} rejected, {} script(s) cataloged",
            startup.reactions,
            startup.rejected,
            startup.scripts
        );

        let forwarder = handle.spawn(forward_media_events(media.subscribe(), dispatcher.clone()));

        Ok(Self {
            config,
            services,
            media,
            dispatcher,
            pipeline,
            startup,
            forwarder: Mutex::new(Some(forwarder)),
        })
    }

    /// Stop watchers and pending reloads, then flush storage.
    pub fn shutdown(&self) {
        self.pipeline.shutdown();
        if let Some(task) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        match self.services.storage.save() {
            Ok(()) => log::info!("[shutdown] Storage saved to {}", self.services.storage.path().display()),
            Err(e) => log::error!("[shutdown] Failed to save storage: {}", e),
        }
    }
}

/// Media board → dispatcher. Events are dispatched in the order they were
/// emitted.
async fn forward_media_events(mut rx: broadcast::Receiver<MediaEvent>, dispatcher: Dispatcher) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                log::debug!("[media] {} on '{}'", event.kind, event.channel);
                dispatcher.dispatch(event.kind, event.args()).await;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("[media] Event forwarder lagged, {} event(s) dropped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capabilities::media::MediaControl, config::ReloadConfig};
    use std::time::Duration;

    fn config_in(root: &std::path::Path) -> HubConfig {
        HubConfig {
            content_root: root.to_path_buf(),
            reload: ReloadConfig {
                debounce_ms: 50,
                poll_interval_ms: 20,
                ..ReloadConfig::default()
            },
            ..HubConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn media_events_reach_reactions_and_storage_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let reactions = dir.path().join("configs/reactions");
        std::fs::create_dir_all(&reactions).unwrap();
        std::fs::write(
            reactions.join("onadd.script"),
            r#"return {
                kind = "MediaAdd",
                oncall = function(channel, source, position)
                    storagelib.set("last_added", channel .. ":" .. source)
                end,
            }"#,
        )
        .unwrap();

        let state = AppState::start(config_in(dir.path())).await.unwrap();
        assert_eq!(state.startup.reactions, 1);

        state.media.add("Main", "intro.mp3").unwrap();
        let mut stored = None;
        for _ in 0..50 {
            stored = state.services.storage.get("last_added").unwrap();
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stored, Some(serde_json::json!("Main:intro.mp3")));

        state.shutdown();
        assert!(dir.path().join("data/data.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_route_through_the_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let reactions = dir.path().join("configs/reactions");
        std::fs::create_dir_all(&reactions).unwrap();
        std::fs::write(
            reactions.join("hello.script"),
            r#"return {
                kind = "Command",
                cooldown = 0,
                oncall = function(user, id, args) return "hi " .. user .. " " .. args end,
            }"#,
        )
        .unwrap();

        let state = AppState::start(config_in(dir.path())).await.unwrap();
        let res = state
            .dispatcher
            .route_command("hello", "alice", "1", "there")
            .await
            .unwrap();
        assert_eq!(res.result.as_str().as_deref(), Some("hi alice there"));
        assert!(state.dispatcher.route_command("nope", "alice", "1", "").await.is_none());
        state.shutdown();
    }
}
