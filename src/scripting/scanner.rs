/// `scripting/scanner.rs` — polling change detection for a script directory
///
/// Each scan compares (mtime, length) per file against the previous snapshot.
/// A file that disappears while another with the same stamp appears is
/// reported as a rename.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, SystemTime},
};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

pub struct DirectoryScanner {
    dir: PathBuf,
    extension: String,
    snapshot: HashMap<PathBuf, Stamp>,
}

impl DirectoryScanner {
    /// Snapshot the directory now; the first `scan` reports only changes
    /// made after this point.
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        let dir = dir.into();
        let extension = extension.trim_start_matches('.').to_string();
        let snapshot = read_dir_stamps(&dir, &extension);
        Self {
            dir,
            extension,
            snapshot,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files present at the last snapshot, sorted.
    pub fn known_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.snapshot.keys().cloned().collect();
        files.sort();
        files
    }

    pub fn scan(&mut self) -> Vec<FileEvent> {
        let current = read_dir_stamps(&self.dir, &self.extension);

        let mut added: Vec<(PathBuf, Stamp)> = Vec::new();
        let mut events = Vec::new();
        for (path, stamp) in &current {
            match self.snapshot.get(path) {
                Some(old) if old != stamp => events.push(FileEvent::Modified(path.clone())),
                Some(_) => {}
                None => added.push((path.clone(), *stamp)),
            }
        }
        let mut removed: Vec<(PathBuf, Stamp)> = self
            .snapshot
            .iter()
            .filter(|(p, _)| !current.contains_key(*p))
            .map(|(p, s)| (p.clone(), *s))
            .collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        added.sort_by(|a, b| a.0.cmp(&b.0));

        // Removals go first so a rename never briefly leaves two entries.
        let mut ordered = Vec::new();
        for (from, stamp) in removed {
            match added.iter().position(|(_, s)| *s == stamp) {
                Some(idx) => {
                    let (to, _) = added.remove(idx);
                    ordered.push(FileEvent::Renamed { from, to });
                }
                None => ordered.push(FileEvent::Removed(from)),
            }
        }
        ordered.extend(added.into_iter().map(|(p, _)| FileEvent::Created(p)));
        ordered.extend(events);

        self.snapshot = current;
        ordered
    }

    /// Poll on a named thread until `stop` is set, forwarding events to `tx`.
    /// The thread only scans and sends; handling happens on the receiver.
    pub fn spawn(
        mut self,
        interval: Duration,
        tx: mpsc::UnboundedSender<FileEvent>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let label = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scripts".into());
        thread::Builder::new()
            .name(format!("watch-{label}"))
            .spawn(move || {
                log::info!("[scanner] Watching {}", self.dir.display());
                while !stop.load(Ordering::Relaxed) {
                    for event in self.scan() {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    thread::sleep(interval);
                }
                log::debug!("[scanner] Stopped watching {}", self.dir.display());
            })
    }
}

fn read_dir_stamps(dir: &Path, extension: &str) -> HashMap<PathBuf, Stamp> {
    let mut stamps = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("[scanner] cannot read {}: {}", dir.display(), e);
            return stamps;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) if meta.is_file() => {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                stamps.insert(
                    path,
                    Stamp {
                        modified,
                        len: meta.len(),
                    },
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("[scanner] metadata for {}: {}", path.display(), e),
        }
    }
    stamps
}
