//! Rescans the library whenever files appear or disappear under the root.
//!
//! Notifications carry no payload; each one only means "the tree changed".
//! They are funnelled through a channel with room for a single pending
//! trigger, so a burst of events while a scan is running collapses into one
//! follow-up scan.
//!
//! Events that only touch excluded top-level folders or ignored directories
//! (the user data dir) are dropped, since the scanner never looks there.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind,
};
use tokio::{sync::mpsc, task};
use tokio_util::sync::CancellationToken;

use crate::library::Library;

/// Live subscription to filesystem changes. Dropping it stops the watcher.
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
}

impl LibraryWatcher {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for LibraryWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts watching the library root recursively. Changes below any of
/// `ignored` never trigger a rescan.
///
/// Must be called from within a tokio runtime; the rescan loop runs as a
/// spawned task and the scans themselves on the blocking pool.
pub fn watch_library(library: Arc<Library>, ignored: &[PathBuf]) -> Result<LibraryWatcher> {
    let root = library.root().to_path_buf();
    if !root.is_dir() {
        bail!("media root {} is not a directory", root.display());
    }

    let filter = ChangeFilter::new(&root, library.config().excluded_dirs.clone(), ignored);
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if filter.is_relevant(&event) => {
            // A full channel means a rescan is already queued.
            let _ = trigger_tx.try_send(());
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "file watcher error"),
    })
    .context("creating file watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", root.display()))?;
    tracing::info!(root = %root.display(), "watching media root for changes");

    let cancel = CancellationToken::new();
    tokio::spawn(rescan_loop(library, trigger_rx, cancel.clone()));

    Ok(LibraryWatcher {
        _watcher: watcher,
        cancel,
    })
}

/// Additions, removals and renames change the catalogue; content writes and
/// attribute changes do not.
pub fn is_library_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Decides whether an event can change what a scan would return.
struct ChangeFilter {
    roots: Vec<PathBuf>,
    excluded_dirs: Vec<String>,
    ignored: Vec<PathBuf>,
}

impl ChangeFilter {
    fn new(root: &Path, excluded_dirs: Vec<String>, ignored: &[PathBuf]) -> Self {
        Self {
            roots: with_canonical(root),
            excluded_dirs,
            ignored: ignored.iter().flat_map(|dir| with_canonical(dir)).collect(),
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        is_library_change(&event.kind)
            && (event.paths.is_empty() || event.paths.iter().any(|path| self.affects_library(path)))
    }

    fn affects_library(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        let Some(relative) = self
            .roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
        else {
            return true;
        };
        match relative.components().next() {
            Some(Component::Normal(top)) => !top
                .to_str()
                .is_some_and(|top| self.excluded_dirs.iter().any(|dir| dir == top)),
            _ => true,
        }
    }
}

/// The path as given plus its resolved form, which is what events report.
/// Paths that do not exist yet are made absolute without resolving links.
fn with_canonical(path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![path.to_path_buf()];
    if let Ok(resolved) = path.canonicalize().or_else(|_| std::path::absolute(path))
        && resolved != path
    {
        paths.push(resolved);
    }
    paths
}

async fn rescan_loop(
    library: Arc<Library>,
    mut triggers: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                let library = library.clone();
                match task::spawn_blocking(move || library.rescan()).await {
                    Ok(stats) => tracing::info!(
                        channels = stats.channels,
                        videos = stats.videos,
                        "rescanned library after filesystem change"
                    ),
                    Err(err) => tracing::warn!(error = %err, "rescan task failed"),
                }
            }
        }
    }
    tracing::debug!("library watcher stopped");
}
