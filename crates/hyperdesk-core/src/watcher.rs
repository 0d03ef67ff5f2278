//! Filesystem watcher for the hyperbox tree.
//!
//! Translates raw `notify` events into `(created | modified, path)` pairs for
//! every non-directory change under the root, recursively. Directory events
//! and other kinds (removals, metadata churn) are dropped here; policy lives
//! in the controller.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Kind of change reported to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// File appeared
    Created,
    /// File contents changed
    Modified,
}

impl WatchEventKind {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
        }
    }
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked for each file event.
pub type EventCallback = Arc<dyn Fn(WatchEventKind, PathBuf) + Send + Sync>;

/// Recursive watcher over the hyperbox root.
///
/// `start` and `stop` are idempotent. The underlying observer runs its own
/// thread; the callback must not block for long.
pub struct HyperboxWatcher {
    root: PathBuf,
    on_event: EventCallback,
    inner: Mutex<Option<RecommendedWatcher>>,
}

impl HyperboxWatcher {
    /// Create a watcher for `root`, delivering events to `on_event`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, on_event: EventCallback) -> Self {
        Self {
            root: root.into(),
            on_event,
            inner: Mutex::new(None),
        }
    }

    /// The watched root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begin observing. A second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be installed on the root.
    pub fn start(&self) -> notify::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.is_some() {
            return Ok(());
        }
        let on_event = Arc::clone(&self.on_event);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => dispatch(&event, &on_event),
                Err(error) => tracing::warn!("watch error: {error}"),
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        *inner = Some(watcher);
        Ok(())
    }

    /// Stop observing. A call while stopped is a no-op.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner = None;
    }
}

fn dispatch(event: &Event, on_event: &EventCallback) {
    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Modify(_) => WatchEventKind::Modified,
        _ => return,
    };
    for path in &event.paths {
        if path.is_file() {
            on_event(kind, path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_start_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = HyperboxWatcher::new(dir.path(), Arc::new(|_, _| {}));
        watcher.start().unwrap();
        watcher.start().unwrap();
        watcher.stop();
        watcher.stop();
    }

    #[test]
    fn test_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let watcher = HyperboxWatcher::new(
            dir.path(),
            Arc::new(move |kind, path| {
                let _ = tx.send((kind, path));
            }),
        );
        watcher.start().unwrap();

        std::fs::write(dir.path().join("drop.txt"), b"payload").unwrap();

        // Observers coalesce; accept either kind for the new file.
        let (kind, path) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            kind,
            WatchEventKind::Created | WatchEventKind::Modified
        ));
        assert_eq!(path.file_name().unwrap(), "drop.txt");
        watcher.stop();
    }
}
