//! Filesystem change notification.
//!
//! The watcher does not interpret events. Any change outside the system
//! directory sends a rescan request; requests coalesce in a one-slot channel
//! so a burst of writes costs a single scan.

use crate::error::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Watches one folder and requests rescans.
pub struct FolderWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
}

impl FolderWatcher {
    /// Start watching `root`. A `()` is sent on `rescan` after changes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FilesError::Watch`] if the OS watcher cannot start.
    pub fn start(root: &Path, rescan: mpsc::Sender<()>) -> Result<Self> {
        let system_dir = root.join(crate::SYSTEM_DIR);
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if !is_relevant(&event, &system_dir) {
                        return;
                    }
                    // Full channel means a rescan is already pending.
                    let _ = rescan.try_send(());
                }
                Err(e) => tracing::warn!("watcher error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::debug!("watching {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            watcher,
        })
    }

    /// Watched root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.watcher.unwatch(&self.root) {
            tracing::debug!("unwatch {} failed: {}", self.root.display(), e);
        }
    }
}

fn is_relevant(event: &Event, system_dir: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| {
        !p.starts_with(system_dir)
            && !p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(crate::TEMP_PREFIX))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind};
    use std::time::Duration;

    #[test]
    fn test_relevance_filter() {
        let sys = Path::new("/f/.tessera");
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/f/a.txt".into());
        assert!(is_relevant(&create, sys));
        let internal =
            Event::new(EventKind::Create(CreateKind::File)).add_path("/f/.tessera/tmp/x".into());
        assert!(!is_relevant(&internal, sys));
        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path("/f/a.txt".into());
        assert!(!is_relevant(&access, sys));
    }

    #[tokio::test]
    async fn test_write_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let _watcher = FolderWatcher::start(dir.path(), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(got, Ok(Some(()))));
    }
}
