/// `capabilities/` — the host surface scripts can reach
///
/// Each capability is one Lua global (`loggerlib`, `medialib`, ...) holding a
/// table of functions. The functions close over a trait object for the
/// service behind them, so the in-process implementations here can be swapped
/// for real integrations without touching the bindings.
///
/// Scripts call them with dot syntax: `medialib.add("Main", "intro.mp3")`.
///
/// Anything that waits (points, platform, `utilslib.delay`, holds) is an
/// async function: the calling script suspends and the VM stays available to
/// other reactions until the operation completes.
use std::sync::Arc;

use mlua::{Lua, Table};

use crate::{
    error::HubResult,
    scripting::{catalog::ScriptCatalog, runtime::ScriptRuntime},
};

pub mod hardware;
pub mod logger;
pub mod media;
pub mod platform;
pub mod points;
pub mod scripts;
pub mod speech;
pub mod storage;
pub mod utils;

use hardware::{BlockedInputs, HardwareControl, HardwareLib};
use logger::LoggerLib;
use media::{MediaControl, MediaLib};
use platform::{PlatformQuery, TwitchLib};
use points::{PointsLedger, PointsLib};
use scripts::ScriptLib;
use speech::{SpeechControl, SpeechLib};
use storage::{JsonStore, StorageLib};
use utils::UtilsLib;

/// A named global installed into the script runtime.
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, lua: &Lua) -> mlua::Result<Table>;
}

/// The services behind the capability tables.
#[derive(Clone)]
pub struct HostServices {
    pub storage: Arc<JsonStore>,
    pub media: Arc<dyn MediaControl>,
    pub hardware: Arc<dyn HardwareControl>,
    pub blocked: Arc<BlockedInputs>,
    pub points: Arc<dyn PointsLedger>,
    pub speech: Arc<dyn SpeechControl>,
    pub platform: Arc<dyn PlatformQuery>,
}

/// Install every capability. Must run before the first script is evaluated.
pub fn bind_all(
    runtime: &ScriptRuntime,
    services: &HostServices,
    catalog: &ScriptCatalog,
) -> HubResult<()> {
    let libs: Vec<Box<dyn Capability>> = vec![
        Box::new(LoggerLib),
        Box::new(UtilsLib),
        Box::new(StorageLib::new(Arc::clone(&services.storage))),
        Box::new(MediaLib::new(Arc::clone(&services.media))),
        Box::new(HardwareLib::new(
            Arc::clone(&services.hardware),
            Arc::clone(&services.blocked),
        )),
        Box::new(PointsLib::new(Arc::clone(&services.points))),
        Box::new(SpeechLib::new(Arc::clone(&services.speech))),
        Box::new(TwitchLib::new(Arc::clone(&services.platform))),
        Box::new(ScriptLib::new(catalog.clone())),
    ];
    for lib in &libs {
        runtime.bind(lib.as_ref())?;
    }
    log::info!("[capabilities] Bound {}", runtime.bound_names().join(", "));
    Ok(())
}
