/// `scripting/` — the reaction engine
///
/// One Lua VM (mlua) for the whole process. Reaction files declare which
/// event they handle and are hot-reloaded from disk; catalog scripts are run
/// on demand by name. Script errors are caught and logged, never propagated
/// to the producer that raised the event.
pub mod catalog;
pub mod dispatcher;
pub mod kind;
pub mod reaction;
pub mod registry;
pub mod reload;
pub mod runtime;
pub mod scanner;
pub mod value;

pub use catalog::ScriptCatalog;
pub use dispatcher::Dispatcher;
pub use kind::EventKind;
pub use reaction::{CallResult, CallStatus, Reaction};
pub use registry::ReactionRegistry;
pub use reload::ReloadPipeline;
pub use runtime::ScriptRuntime;
pub use value::{Callback, EventArg, ScriptValue};
