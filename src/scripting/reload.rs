/// `scripting/reload.rs` — keeps the registry and catalog in sync with disk
///
/// Per watched directory: a scanner thread emits `FileEvent`s into a channel,
/// a Tokio task turns them into reload work. Reaction files are debounced per
/// path; deletions apply immediately. Catalog files only track presence.
///
/// Debounce state is a generation number per path. Scheduling a reload bumps
/// it, a delete clears it, and a reload only commits if its generation is
/// still the current one when it gets there. The check and the registry write
/// happen under the same lock as delete, so a late reload can never bring back
/// a file that was removed after it started.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::ReloadConfig,
    error::{HubError, HubResult},
};

use super::{
    catalog::ScriptCatalog,
    reaction::name_from_path,
    registry::ReactionRegistry,
    scanner::{DirectoryScanner, FileEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedDir {
    Reactions,
    Scripts,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reactions: usize,
    pub rejected: usize,
    pub scripts: usize,
}

pub struct ReloadPipeline {
    inner: Arc<Inner>,
    stop: Arc<AtomicBool>,
    watchers: Mutex<Vec<thread::JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    registry: ReactionRegistry,
    catalog: ScriptCatalog,
    settings: ReloadConfig,
    reactions_dir: PathBuf,
    scripts_dir: PathBuf,
    /// path → generation of the newest scheduled reload
    pending: Mutex<HashMap<PathBuf, u64>>,
    next_generation: AtomicU64,
    /// Serialises reload attempts for one path.
    apply_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    /// Reload attempts that reached the read/evaluate stage.
    attempts: AtomicU64,
    closed: AtomicBool,
}

impl ReloadPipeline {
    pub fn new(
        registry: ReactionRegistry,
        catalog: ScriptCatalog,
        reactions_dir: impl Into<PathBuf>,
        scripts_dir: impl Into<PathBuf>,
        settings: ReloadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                catalog,
                settings,
                reactions_dir: reactions_dir.into(),
                scripts_dir: scripts_dir.into(),
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                apply_locks: Mutex::new(HashMap::new()),
                attempts: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            watchers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load everything on disk once, then start watching. Changes made while
    /// the sweep runs are picked up by the first scan.
    pub async fn start(&self) -> HubResult<SweepReport> {
        let ext = self.inner.settings.extension.clone();
        let reactions = DirectoryScanner::new(&self.inner.reactions_dir, &ext);
        let scripts = DirectoryScanner::new(&self.inner.scripts_dir, &ext);

        let inner = Arc::clone(&self.inner);
        let report = tokio::task::spawn_blocking(move || inner.sweep())
            .await
            .map_err(|e| HubError::Startup(format!("sweep aborted: {e}")))?;
        log::info!(
            "[reload] Startup sweep: {} reactions ({} rejected), {} scripts",
            report.reactions,
            report.rejected,
            report.scripts
        );

        self.watch(reactions, WatchedDir::Reactions)?;
        self.watch(scripts, WatchedDir::Scripts)?;
        Ok(report)
    }

    fn watch(&self, scanner: DirectoryScanner, which: WatchedDir) -> HubResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dir = scanner.dir().to_path_buf();
        let interval = Duration::from_millis(self.inner.settings.poll_interval_ms);
        let watcher = scanner
            .spawn(interval, tx, Arc::clone(&self.stop))
            .map_err(|e| HubError::io(&dir, e))?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.handle_event(which, event);
            }
        });

        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(watcher);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(())
    }

    /// Synchronous full load of both directories.
    pub fn sweep(&self) -> SweepReport {
        self.inner.sweep()
    }

    /// Feed one filesystem event in. Must be called inside a Tokio runtime.
    pub fn handle_event(&self, which: WatchedDir, event: FileEvent) {
        self.inner.handle_event(which, event);
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn reload_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Paths with a reload lock currently allocated.
    pub fn tracked_paths(&self) -> usize {
        self.inner.apply_lock_count()
    }

    /// Stop the watchers and cancel every pending debounce.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        let cancelled = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let n = pending.len();
            pending.clear();
            n
        };

        let watchers: Vec<_> = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for watcher in watchers {
            if watcher.join().is_err() {
                log::warn!("[reload] watcher thread panicked");
            }
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        log::info!("[reload] Stopped ({} pending reloads cancelled)", cancelled);
    }
}

impl Drop for ReloadPipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Inner {
    fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let ext = &self.settings.extension;

        for path in DirectoryScanner::new(&self.reactions_dir, ext).known_files() {
            let loaded = read_blocking(&path, &self.settings)
                .and_then(|source| self.evaluate_and_upsert(&path, &source, None));
            match loaded {
                Ok(true) => report.reactions += 1,
                Ok(false) => report.rejected += 1,
                Err(e) => {
                    log::error!("[reload] {}", e);
                    report.rejected += 1;
                }
            }
        }
        for path in DirectoryScanner::new(&self.scripts_dir, ext).known_files() {
            self.catalog.upsert(&path);
            report.scripts += 1;
        }
        report
    }

    fn handle_event(self: &Arc<Self>, which: WatchedDir, event: FileEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match (which, event) {
            (WatchedDir::Reactions, FileEvent::Created(path) | FileEvent::Modified(path)) => {
                self.schedule(path);
            }
            (WatchedDir::Reactions, FileEvent::Removed(path)) => self.remove_now(&path),
            (WatchedDir::Reactions, FileEvent::Renamed { from, to }) => {
                self.remove_now(&from);
                self.schedule(to);
            }
            (WatchedDir::Scripts, FileEvent::Created(path)) => self.catalog.upsert(&path),
            (WatchedDir::Scripts, FileEvent::Modified(_)) => {}
            (WatchedDir::Scripts, FileEvent::Removed(path)) => self.catalog.remove(&path),
            (WatchedDir::Scripts, FileEvent::Renamed { from, to }) => {
                self.catalog.remove(&from);
                self.catalog.upsert(&to);
            }
        }
    }

    /// (Re)start the debounce window for `path`.
    fn schedule(self: &Arc<Self>, path: PathBuf) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), generation);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(inner.settings.debounce_ms)).await;
            if !inner.is_current(&path, generation) {
                return;
            }
            let lock = inner.apply_lock(&path);
            {
                let _guard = lock.lock().await;
                if inner.is_current(&path, generation) {
                    inner.apply(&path, generation).await;
                }
            }
            drop(lock);
            inner.release_apply_lock(&path);
        });
    }

    async fn apply(self: &Arc<Self>, path: &Path, generation: u64) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let source = match read_async(path, &self.settings).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[reload] giving up on {} until it changes again: {}", path.display(), e);
                self.clear_if_current(path, generation);
                return;
            }
        };
        if !self.is_current(path, generation) {
            return;
        }

        let inner = Arc::clone(self);
        let file = path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || {
            inner.evaluate_and_upsert(&file, &source, Some(generation))
        })
        .await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::error!("[reload] {}", e),
            Err(e) => log::error!("[reload] reload of {} aborted: {}", path.display(), e),
        }
        self.clear_if_current(path, generation);
    }

    /// Evaluate a reaction file and register what it returns. With a
    /// generation, the registry is only touched if that generation is still
    /// current. Returns whether a reaction was registered.
    fn evaluate_and_upsert(
        &self,
        path: &Path,
        source: &str,
        generation: Option<u64>,
    ) -> HubResult<bool> {
        if source.trim().is_empty() {
            log::warn!("[reload] {} is empty, skipping", path.display());
            return Ok(false);
        }
        let name = name_from_path(path);
        let values = self.registry.runtime().evaluate(&name, source).map_err(|e| {
            HubError::Script(format!("evaluating {}: {}", path.display(), e))
        })?;
        let declared = values.into_iter().next().unwrap_or_default();
        if declared.as_table().is_none() {
            log::warn!(
                "[reload] {} returned {}, expected a reaction table",
                path.display(),
                declared.type_name()
            );
            return Ok(false);
        }

        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(generation) = generation {
            if pending.get(path) != Some(&generation) {
                log::debug!("[reload] {} superseded, not applying", path.display());
                return Ok(false);
            }
        }
        Ok(self.registry.upsert(path, &declared).is_some())
    }

    fn remove_now(&self, path: &Path) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.remove(path);
            self.registry.remove(path);
        }
        self.release_apply_lock(path);
    }

    fn is_current(&self, path: &Path, generation: u64) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            == Some(&generation)
    }

    fn clear_if_current(&self, path: &Path, generation: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.get(path) == Some(&generation) {
            pending.remove(path);
        }
    }

    fn apply_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.apply_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Forget the lock for `path` once no reload holds or waits on it.
    fn release_apply_lock(&self, path: &Path) {
        let mut locks = self.apply_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(path);
        }
    }

    fn apply_lock_count(&self) -> usize {
        self.apply_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ── File reads with retry ─────────────────────────────────────────────────────

async fn read_async(path: &Path, settings: &ReloadConfig) -> HubResult<String> {
    let attempts = settings.read_retries.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => return Ok(s),
            Err(e) => {
                log::debug!(
                    "[reload] read {} failed (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(settings.retry_backoff_ms * u64::from(attempt))).await;
        }
    }
    Err(HubError::io(path, last_err.unwrap_or_else(|| std::io::ErrorKind::Other.into())))
}

fn read_blocking(path: &Path, settings: &ReloadConfig) -> HubResult<String> {
    let attempts = settings.read_retries.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match std::fs::read_to_string(path) {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
        if attempt < attempts {
            thread::sleep(Duration::from_millis(settings.retry_backoff_ms * u64::from(attempt)));
        }
    }
    Err(HubError::io(path, last_err.unwrap_or_else(|| std::io::ErrorKind::Other.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::{kind::EventKind, runtime::ScriptRuntime};
    use std::fs;

    struct Fixture {
        _root: tempfile::TempDir,
        reactions: PathBuf,
        scripts: PathBuf,
        registry: ReactionRegistry,
        catalog: ScriptCatalog,
        pipeline: ReloadPipeline,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let reactions = root.path().join("reactions");
        let scripts = root.path().join("scripts");
        fs::create_dir_all(&reactions).unwrap();
        fs::create_dir_all(&scripts).unwrap();

        let runtime = ScriptRuntime::new();
        let registry = ReactionRegistry::new(runtime.clone());
        let catalog = ScriptCatalog::new(runtime);
        let settings = ReloadConfig {
            debounce_ms: 50,
            poll_interval_ms: 20,
            read_retries: 3,
            retry_backoff_ms: 10,
            extension: "script".into(),
        };
        let pipeline = ReloadPipeline::new(
            registry.clone(),
            catalog.clone(),
            &reactions,
            &scripts,
            settings,
        );
        Fixture {
            _root: root,
            reactions,
            scripts,
            registry,
            catalog,
            pipeline,
        }
    }

    fn follow(tag: &str) -> String {
        format!("return {{ kind = 'Follow', oncall = function() return '{tag}' end }}")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    #[test]
    fn sweep_loads_everything_and_skips_bad_files() {
        let f = fixture();
        fs::write(f.reactions.join("welcome.script"), follow("hi")).unwrap();
        fs::write(f.reactions.join("broken.script"), "return {").unwrap();
        fs::write(f.reactions.join("nokind.script"), "return { oncall = function() end }").unwrap();
        fs::write(f.reactions.join("empty.script"), "   ").unwrap();
        fs::write(f.reactions.join("readme.txt"), "ignored").unwrap();
        fs::write(f.scripts.join("tool.script"), "return 1").unwrap();

        let report = f.pipeline.sweep();
        assert_eq!(
            report,
            SweepReport {
                reactions: 1,
                rejected: 3,
                scripts: 1
            }
        );
        assert_eq!(f.registry.names(), vec!["welcome".to_string()]);
        assert!(f.catalog.contains("tool"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn burst_of_writes_collapses_to_one_reload() {
        let f = fixture();
        let path = f.reactions.join("burst.script");
        for i in 0..5 {
            fs::write(&path, follow(&format!("v{i}"))).unwrap();
            f.pipeline
                .handle_event(WatchedDir::Reactions, FileEvent::Modified(path.clone()));
        }
        settle().await;

        assert_eq!(f.pipeline.reload_attempts(), 1);
        assert_eq!(f.pipeline.pending_count(), 0);
        assert_eq!(f.pipeline.tracked_paths(), 0);
        let res = f.registry.get("burst").unwrap().call(&[]).await;
        assert_eq!(res.result.as_str().as_deref(), Some("v4"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn renames_and_temp_files_leave_no_locks_behind() {
        let f = fixture();
        for i in 0..5 {
            let tmp = f.reactions.join(format!("tmp{i}.script"));
            fs::write(&tmp, follow("t")).unwrap();
            f.pipeline
                .handle_event(WatchedDir::Reactions, FileEvent::Created(tmp.clone()));
            settle().await;
            let to = f.reactions.join(format!("final{i}.script"));
            fs::rename(&tmp, &to).unwrap();
            f.pipeline.handle_event(
                WatchedDir::Reactions,
                FileEvent::Renamed { from: tmp, to },
            );
        }
        settle().await;

        assert_eq!(f.registry.len(), 5);
        assert_eq!(f.pipeline.pending_count(), 0);
        assert_eq!(f.pipeline.tracked_paths(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_retries_until_the_file_becomes_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.script");
        fs::create_dir(&path).unwrap();

        let swap = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(40));
                fs::remove_dir(&path).unwrap();
                fs::write(&path, "return 1").unwrap();
            })
        };
        let settings = ReloadConfig {
            read_retries: 6,
            retry_backoff_ms: 25,
            ..ReloadConfig::default()
        };
        let source = read_async(&path, &settings).await.unwrap();
        swap.join().unwrap();
        assert_eq!(source, "return 1");

        let missing = dir.path().join("never.script");
        let started = std::time::Instant::now();
        let err = read_async(&missing, &settings).await.unwrap_err();
        assert!(matches!(err, HubError::Io { .. }), "{err:?}");
        // backoff grows linearly: 25 + 50 + 75 + 100 + 125
        assert!(started.elapsed() >= Duration::from_millis(375));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_file_is_dropped_until_the_next_change() {
        let f = fixture();
        let path = f.reactions.join("locked.script");
        fs::create_dir(&path).unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Modified(path.clone()));
        settle().await;

        assert_eq!(f.pipeline.reload_attempts(), 1);
        assert_eq!(f.pipeline.pending_count(), 0);
        assert!(f.registry.get("locked").is_none());

        fs::remove_dir(&path).unwrap();
        fs::write(&path, follow("open")).unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Modified(path));
        settle().await;

        assert_eq!(f.pipeline.reload_attempts(), 2);
        let res = f.registry.get("locked").unwrap().call(&[]).await;
        assert_eq!(res.result.as_str().as_deref(), Some("open"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_cancels_pending_reload() {
        let f = fixture();
        let path = f.reactions.join("gone.script");
        fs::write(&path, follow("x")).unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Created(path.clone()));
        fs::remove_file(&path).unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Removed(path.clone()));
        settle().await;

        assert!(f.registry.get("gone").is_none());
        assert_eq!(f.pipeline.reload_attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_then_recreate_keeps_only_new_content() {
        let f = fixture();
        let path = f.reactions.join("welcome.script");
        fs::write(&path, follow("old")).unwrap();
        f.pipeline.sweep();
        assert!(f.registry.get("welcome").is_some());

        fs::remove_file(&path).unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Removed(path.clone()));
        assert!(f.registry.get("welcome").is_none());

        fs::write(
            &path,
            "return { kind = 'Cheer', oncall = function() return 'new' end }",
        )
        .unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Created(path.clone()));
        settle().await;

        assert_eq!(f.registry.len(), 1);
        assert!(f.registry.by_kind(EventKind::Follow).is_empty());
        let res = f.registry.get("welcome").unwrap().call(&[]).await;
        assert_eq!(res.result.as_str().as_deref(), Some("new"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rename_moves_the_reaction() {
        let f = fixture();
        let from = f.reactions.join("old.script");
        fs::write(&from, follow("x")).unwrap();
        f.pipeline.sweep();

        let to = f.reactions.join("new.script");
        fs::rename(&from, &to).unwrap();
        f.pipeline.handle_event(
            WatchedDir::Reactions,
            FileEvent::Renamed {
                from,
                to: to.clone(),
            },
        );
        assert!(f.registry.get("old").is_none());
        settle().await;
        assert!(f.registry.get("new").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_evaluation_keeps_previous_reaction() {
        let f = fixture();
        let path = f.reactions.join("keep.script");
        fs::write(&path, follow("good")).unwrap();
        f.pipeline.sweep();

        fs::write(&path, "return { kind = ").unwrap();
        f.pipeline
            .handle_event(WatchedDir::Reactions, FileEvent::Modified(path));
        settle().await;

        let res = f.registry.get("keep").unwrap().call(&[]).await;
        assert_eq!(res.result.as_str().as_deref(), Some("good"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_picks_up_live_changes() {
        let f = fixture();
        fs::write(f.reactions.join("first.script"), follow("1")).unwrap();
        let report = f.pipeline.start().await.unwrap();
        assert_eq!(report.reactions, 1);

        fs::write(f.reactions.join("second.script"), follow("2")).unwrap();
        fs::write(f.scripts.join("adhoc.script"), "return 'adhoc'").unwrap();
        settle().await;
        assert!(f.registry.get("second").is_some());
        assert!(f.catalog.contains("adhoc"));

        fs::remove_file(f.reactions.join("first.script")).unwrap();
        fs::remove_file(f.scripts.join("adhoc.script")).unwrap();
        settle().await;
        assert!(f.registry.get("first").is_none());
        assert!(!f.catalog.contains("adhoc"));

        f.pipeline.shutdown();
        fs::write(f.reactions.join("third.script"), follow("3")).unwrap();
        settle().await;
        assert!(f.registry.get("third").is_none());
    }
}
