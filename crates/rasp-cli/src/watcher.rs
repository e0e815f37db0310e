//! Plugin directory watcher.
//!
//! Reports changes to `*.js` files so `rasp check --watch` can rebuild and
//! install a new snapshot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Events arriving within this window are folded into one rebuild.
const DEBOUNCE: Duration = Duration::from_millis(200);

pub struct PluginWatcher {
    /// Channel receiver for changed plugin files
    rx: mpsc::Receiver<PathBuf>,
    /// The underlying watcher (kept alive)
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, notify::Error> {
        let dir = dir
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| dir.as_ref().to_path_buf());
        let (tx, rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if let Some(path) = Self::changed_plugin(&event) {
                        let _ = tx.blocking_send(path);
                    }
                }
                Err(e) => {
                    error!("Plugin watcher error: {}", e);
                }
            }
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching plugin directory: {}", dir.display());

        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    fn changed_plugin(event: &Event) -> Option<PathBuf> {
        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
            _ => return None,
        }
        let path = event.paths.first()?;
        if path.extension().is_some_and(|ext| ext == "js") {
            debug!("Plugin change detected: {}", path.display());
            Some(path.clone())
        } else {
            None
        }
    }

    /// Wait for the next burst of changes. `None` once the watcher is gone.
    pub async fn next_change(&mut self) -> Option<PathBuf> {
        let first = self.rx.recv().await?;
        tokio::time::sleep(DEBOUNCE).await;
        let mut last = first;
        while let Ok(path) = self.rx.try_recv() {
            last = path;
        }
        Some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    #[test]
    fn test_only_js_changes_are_reported() {
        let js = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/p/a.js"));
        assert_eq!(PluginWatcher::changed_plugin(&js), Some(PathBuf::from("/p/a.js")));

        let txt = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/p/a.txt"));
        assert_eq!(PluginWatcher::changed_plugin(&txt), None);

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/p/a.js"));
        assert_eq!(PluginWatcher::changed_plugin(&access), None);
    }
}
