/// `scripting/reaction.rs` — one registered event handler
///
/// A reaction is built once from a declaration table and never mutated apart
/// from `enabled` and its last-fired timestamp; reloading a file builds a new
/// reaction and swaps it in whole.
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use serde::Serialize;

use super::{
    kind::EventKind,
    runtime::{parse_error_line, ScriptRuntime},
    value::{Callback, EventArg, ScriptValue},
};

// ── Call result ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The callback ran to completion.
    Completed,
    /// Disabled or still cooling down; nothing ran.
    Suppressed,
    /// The callback raised.
    Failed,
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub status: CallStatus,
    pub error_message: Option<String>,
    pub error_line: Option<u32>,
    /// First value the callback returned (or the error callback, on failure).
    pub result: ScriptValue,
}

impl CallResult {
    pub fn completed(result: ScriptValue) -> Self {
        Self {
            status: CallStatus::Completed,
            error_message: None,
            error_line: None,
            result,
        }
    }

    pub fn suppressed() -> Self {
        Self {
            status: CallStatus::Suppressed,
            error_message: None,
            error_line: None,
            result: ScriptValue::nil(),
        }
    }

    pub fn failed(message: impl Into<String>, result: ScriptValue) -> Self {
        let message = message.into();
        Self {
            status: CallStatus::Failed,
            error_line: parse_error_line(&message),
            error_message: Some(message),
            result,
        }
    }

    /// Suppressed calls count as success.
    pub fn success(&self) -> bool {
        self.status != CallStatus::Failed
    }
}

// ── Reaction ──────────────────────────────────────────────────────────────────

pub struct Reaction {
    name: String,
    file_path: PathBuf,
    kind: EventKind,
    cooldown: Duration,
    enabled: AtomicBool,
    oncall: Callback,
    onerror: Option<Callback>,
    runtime: ScriptRuntime,
    /// Held for the whole of `call`, which serialises invocations of this
    /// reaction and makes the cooldown check-and-set atomic.
    gate: tokio::sync::Mutex<()>,
    last_fired: Mutex<Option<Instant>>,
}

impl Reaction {
    pub fn new(
        file_path: &Path,
        kind: EventKind,
        cooldown: Duration,
        oncall: Callback,
        onerror: Option<Callback>,
        runtime: ScriptRuntime,
    ) -> Self {
        Self {
            name: name_from_path(file_path),
            file_path: file_path.to_path_buf(),
            kind,
            cooldown,
            enabled: AtomicBool::new(true),
            oncall,
            onerror,
            runtime,
            gate: tokio::sync::Mutex::new(()),
            last_fired: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn has_error_handler(&self) -> bool {
        self.onerror.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn last_fired_at(&self) -> Option<Instant> {
        *self.last_fired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the handler unless disabled or cooling down. While the handler
    /// awaits a host operation other reactions keep running; only further
    /// calls to this reaction wait.
    pub async fn call(&self, args: &[EventArg]) -> CallResult {
        self.call_at(Instant::now(), args).await
    }

    pub(crate) async fn call_at(&self, now: Instant, args: &[EventArg]) -> CallResult {
        let _gate = self.gate.lock().await;

        if !self.is_enabled() {
            log::debug!("[reaction] '{}' is disabled, skipping", self.name);
            return CallResult::suppressed();
        }
        if self.cooling_down(now) {
            log::debug!("[reaction] '{}' is cooling down, skipping", self.name);
            return CallResult::suppressed();
        }

        match self.runtime.invoke(&self.oncall, args).await {
            Ok(values) => {
                *self.last_fired.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
                CallResult::completed(values.into_iter().next().unwrap_or_default())
            }
            Err(err) => {
                // A failed attempt does not consume the cooldown window.
                let message = err.to_string();
                let result = self.report_failure(&message).await;
                CallResult::failed(message, result)
            }
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.last_fired_at()
            .is_some_and(|last| now.saturating_duration_since(last) < self.cooldown)
    }

    /// Hand the failure to the script's own `onerror`, if any, and return what
    /// it returned.
    async fn report_failure(&self, message: &str) -> ScriptValue {
        let Some(onerror) = &self.onerror else {
            return ScriptValue::nil();
        };
        let failed_at = chrono::Utc::now().timestamp_millis();
        match self
            .runtime
            .invoke_with(onerror, (self.name.clone(), message.to_string(), failed_at))
            .await
        {
            Ok(values) => values.into_iter().next().unwrap_or_default(),
            Err(err) => {
                log::warn!("[reaction] onerror of '{}' failed too: {}", self.name, err);
                ScriptValue::nil()
            }
        }
    }
}

impl std::fmt::Debug for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("cooldown", &self.cooldown)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Registry key for a source file: its stem (`reactions/welcome.script` → `welcome`).
pub fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(rt: &ScriptRuntime, src: &str, cooldown_ms: u64) -> Reaction {
        let values = rt.evaluate("test", src).unwrap();
        let table = values[0].as_table().unwrap();
        let oncall = ScriptValue::from(table.get::<mlua::Value>("oncall").unwrap())
            .as_callable()
            .unwrap();
        let onerror = ScriptValue::from(table.get::<mlua::Value>("onerror").unwrap()).as_callable();
        Reaction::new(
            Path::new("configs/reactions/welcome.script"),
            EventKind::Follow,
            Duration::from_millis(cooldown_ms),
            oncall,
            onerror,
            rt.clone(),
        )
    }

    #[test]
    fn name_comes_from_file_stem() {
        assert_eq!(name_from_path(Path::new("a/b/welcome.script")), "welcome");
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_call() {
        let rt = ScriptRuntime::new();
        let r = reaction(
            &rt,
            "calls = 0; return { oncall = function(user, id) calls = calls + 1; return user .. id end }",
            5000,
        );
        let t0 = Instant::now();

        let first = r.call_at(t0, &["alice".into(), "123".into()]).await;
        assert_eq!(first.status, CallStatus::Completed);
        assert_eq!(first.result.as_str().as_deref(), Some("alice123"));

        let second = r.call_at(t0 + Duration::from_secs(2), &["bob".into(), "456".into()]).await;
        assert_eq!(second.status, CallStatus::Suppressed);
        assert!(second.success());
        assert!(second.result.is_nil());

        let third = r.call_at(t0 + Duration::from_secs(6), &["bob".into(), "456".into()]).await;
        assert_eq!(third.status, CallStatus::Completed);
        assert_eq!(third.result.as_str().as_deref(), Some("bob456"));

        let calls = rt.evaluate("check", "return calls").unwrap();
        assert_eq!(calls[0].as_integer(), Some(2));
    }

    #[tokio::test]
    async fn zero_cooldown_never_throttles() {
        let rt = ScriptRuntime::new();
        let r = reaction(&rt, "return { oncall = function() return 1 end }", 0);
        let t0 = Instant::now();
        assert_eq!(r.call_at(t0, &[]).await.status, CallStatus::Completed);
        assert_eq!(r.call_at(t0, &[]).await.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn disabled_reaction_is_suppressed() {
        let rt = ScriptRuntime::new();
        let r = reaction(&rt, "return { oncall = function() return 1 end }", 0);
        r.set_enabled(false);
        let res = r.call(&[]).await;
        assert_eq!(res.status, CallStatus::Suppressed);
        assert!(r.last_fired_at().is_none());
    }

    #[tokio::test]
    async fn failure_does_not_consume_cooldown() {
        let rt = ScriptRuntime::new();
        let r = reaction(
            &rt,
            "attempts = 0; return { oncall = function() attempts = attempts + 1; if attempts == 1 then error('first fails') end; return 'ok' end }",
            5000,
        );
        let t0 = Instant::now();
        let failed = r.call_at(t0, &[]).await;
        assert_eq!(failed.status, CallStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap().contains("first fails"));
        assert!(r.last_fired_at().is_none());

        let retried = r.call_at(t0 + Duration::from_millis(10), &[]).await;
        assert_eq!(retried.status, CallStatus::Completed);
        assert_eq!(retried.result.as_str().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn onerror_receives_name_message_and_timestamp() {
        let rt = ScriptRuntime::new();
        let r = reaction(
            &rt,
            r#"return {
                oncall = function() error('nope') end,
                onerror = function(name, msg, at)
                    if type(at) ~= 'number' then return 'bad timestamp' end
                    return name .. ' failed: ' .. msg
                end
            }"#,
            0,
        );
        let res = r.call(&[]).await;
        assert!(!res.success());
        let reported = res.result.as_str().unwrap();
        assert!(reported.starts_with("welcome failed: "), "{reported}");
        assert!(reported.contains("nope"));
    }

    #[tokio::test]
    async fn failing_onerror_leaves_result_empty() {
        let rt = ScriptRuntime::new();
        let r = reaction(
            &rt,
            "return { oncall = function() error('a') end, onerror = function() error('b') end }",
            0,
        );
        let res = r.call(&[]).await;
        assert_eq!(res.status, CallStatus::Failed);
        assert!(res.result.is_nil());
        assert!(res.error_message.unwrap().contains('a'));
    }

    #[tokio::test]
    async fn failed_result_carries_line_number() {
        let rt = ScriptRuntime::new();
        let r = reaction(&rt, "return {\n oncall = function()\n error('line three')\n end }", 0);
        let res = r.call(&[]).await;
        assert_eq!(res.error_line, Some(3));
    }
}
