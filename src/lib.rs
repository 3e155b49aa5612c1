pub mod capabilities;
pub mod config;
pub mod console;
pub mod db;
pub mod error;
pub mod scripting;
pub mod state;

use std::time::Duration;

use config::HubConfig;
use error::{HubError, HubResult};
use state::AppState;

pub fn run() -> HubResult<()> {
    let config = HubConfig::load()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_filter))
        .init();

    // ── Tokio runtime ────────────────────────────────────────────────────────
    //
    // Multi-threaded: scripts run on the blocking pool and capability
    // bindings block on async services from there.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("streamhub-worker")
        .build()
        .map_err(|e| HubError::Startup(format!("tokio runtime: {e}")))?;

    let result = runtime.block_on(async {
        let state = AppState::start(config).await?;
        log::info!(
            "[startup] Watching {} and {}; type 'help' for console commands",
            state.config.reactions_dir().display(),
            state.config.scripts_dir().display()
        );

        tokio::select! {
            _ = console::run_console(&state) => log::info!("[shutdown] Console closed"),
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => log::info!("[shutdown] Interrupted"),
                Err(e) => log::error!("[shutdown] Failed to listen for ctrl-c: {}", e),
            },
        }

        state.shutdown();
        Ok::<_, HubError>(())
    });

    // A pending stdin read holds a blocking thread; don't wait on it forever.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
