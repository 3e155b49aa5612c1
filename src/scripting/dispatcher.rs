/// `scripting/dispatcher.rs` — inbound surface for event producers
///
/// Chat, input hook, media board and console all talk to the engine through
/// this handle and nothing else.
use tokio::runtime::Handle;

use crate::error::HubResult;

use super::{
    catalog::ScriptCatalog,
    kind::EventKind,
    reaction::CallResult,
    registry::ReactionRegistry,
    value::EventArg,
};

#[derive(Clone)]
pub struct Dispatcher {
    registry: ReactionRegistry,
    catalog: ScriptCatalog,
    handle: Handle,
}

impl Dispatcher {
    pub fn new(registry: ReactionRegistry, catalog: ScriptCatalog, handle: Handle) -> Self {
        Self {
            registry,
            catalog,
            handle,
        }
    }

    pub fn registry(&self) -> &ReactionRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ScriptCatalog {
        &self.catalog
    }

    /// Fan `kind` out to every matching reaction.
    pub async fn dispatch(&self, kind: EventKind, args: Vec<EventArg>) -> Vec<(String, CallResult)> {
        log::debug!("[dispatch] {} ({} args)", kind, args.len());
        self.registry.dispatch(kind, args).await
    }

    pub async fn dispatch_named(
        &self,
        name: &str,
        kind: EventKind,
        args: Vec<EventArg>,
    ) -> HubResult<CallResult> {
        self.registry.dispatch_named(name, kind, args).await
    }

    /// Fire-and-forget dispatch for producers that are not async (input hook,
    /// media board callbacks).
    pub fn fire(&self, kind: EventKind, args: Vec<EventArg>) {
        let registry = self.registry.clone();
        self.handle.spawn(async move {
            registry.dispatch(kind, args).await;
        });
    }

    /// Route a chat command. Only reactions registered as `Command` are
    /// considered; anything else with the same name is left alone.
    pub async fn route_command(
        &self,
        command: &str,
        user: &str,
        user_id: &str,
        args_text: &str,
    ) -> Option<CallResult> {
        let known = self
            .registry
            .by_kind(EventKind::Command)
            .iter()
            .any(|r| r.name() == command);
        if !known {
            log::debug!("[dispatch] '{}' is not a command reaction", command);
            return None;
        }
        self.dispatch_named(
            command,
            EventKind::Command,
            vec![user.into(), user_id.into(), args_text.into()],
        )
        .await
        .ok()
    }

    /// Run a catalog script on its own task.
    pub async fn call_script(&self, name: &str) -> CallResult {
        let catalog = self.catalog.clone();
        let owned = name.to_string();
        match tokio::spawn(async move { catalog.call(&owned).await }).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("[dispatch] script '{}' task aborted: {}", name, e);
                CallResult::failed(format!("script task aborted: {e}"), Default::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::{reaction::CallStatus, runtime::ScriptRuntime};
    use std::{path::Path, time::Duration};

    fn dispatcher() -> Dispatcher {
        let runtime = ScriptRuntime::new();
        Dispatcher::new(
            ReactionRegistry::new(runtime.clone()),
            ScriptCatalog::new(runtime),
            Handle::current(),
        )
    }

    fn load(d: &Dispatcher, name: &str, src: &str) {
        let declared = d.registry().runtime().evaluate(name, src).unwrap().remove(0);
        d.registry()
            .upsert(Path::new(&format!("reactions/{name}.script")), &declared)
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn route_command_only_matches_command_reactions() {
        let d = dispatcher();
        load(
            &d,
            "so",
            "return { kind = 'Command', oncall = function(user, id, args) return user .. '>' .. args end }",
        );
        load(&d, "raid", "return { kind = 'Reward', oncall = function() return 'reward' end }");

        let res = d.route_command("so", "alice", "1", "bob").await.unwrap();
        assert_eq!(res.result.as_str().as_deref(), Some("alice>bob"));
        assert!(d.route_command("raid", "alice", "1", "").await.is_none());
        assert!(d.route_command("unknown", "alice", "1", "").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fire_runs_in_background() {
        let d = dispatcher();
        load(
            &d,
            "keys",
            "return { kind = 'KeyDown', oncall = function(code) last_key = code end }",
        );
        d.fire(EventKind::KeyDown, vec![EventArg::Int(65)]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let out = d.registry().runtime().evaluate("check", "return last_key").unwrap();
        assert_eq!(out[0].as_integer(), Some(65));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn call_script_unknown_name_fails() {
        let d = dispatcher();
        let res = d.call_script("nothing").await;
        assert_eq!(res.status, CallStatus::Failed);
    }
}
