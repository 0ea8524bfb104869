//! Keeps a long-lived [`KeyStore`] handle in step with writes made by other
//! processes sharing the same file.
//!
//! notify callbacks arrive on the backend's own thread; they only enqueue a
//! reload request. One consumer thread performs every reload, so readers never
//! race each other over the file.

use crate::error::{KeyStoreError, Result};
use crate::store::KeyStore;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::{OsStr, OsString};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Quiet period that closes a burst of events into a single reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

pub struct StoreWatcher {
    watcher: Option<RecommendedWatcher>,
    worker: Option<JoinHandle<()>>,
}

impl StoreWatcher {
    pub fn spawn(store: Arc<KeyStore>) -> Result<Self> {
        let path = store.path().to_path_buf();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| {
                KeyStoreError::Config(format!("{} does not name a file", path.display()))
            })?
            .to_os_string();

        let (tx, rx) = mpsc::channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if touches_store(&event, &file_name) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("key store watcher error: {e}"),
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let worker = std::thread::Builder::new()
            .name("keystore-reload".into())
            .spawn(move || {
                while rx.recv().is_ok() {
                    // swallow the rest of the burst
                    loop {
                        match rx.recv_timeout(DEBOUNCE) {
                            Ok(()) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    match store.reload() {
                        Ok(()) => debug!("key store reload pass complete"),
                        Err(e) => warn!("key store reload failed, keeping last good contents: {e}"),
                    }
                }
                debug!("key store watcher channel closed");
            })?;

        info!("watching {} for external changes", path.display());
        Ok(Self {
            watcher: Some(watcher),
            worker: Some(worker),
        })
    }
}

impl Drop for StoreWatcher {
    fn drop(&mut self) {
        // dropping the watcher drops the sender, which ends the worker loop
        self.watcher.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("key store reload thread panicked");
            }
        }
    }
}

fn touches_store(event: &Event, file_name: &OsStr) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RenameMode};
    use std::path::PathBuf;
    use std::time::Instant;
    use tempfile::tempdir;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_store_file_events_count() {
        let name = OsStr::new("otr_keystore.ofc");
        assert!(touches_store(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), "/d/otr_keystore.ofc"),
            name
        ));
        assert!(touches_store(
            &event(EventKind::Create(CreateKind::File), "/d/otr_keystore.ofc"),
            name
        ));
        assert!(!touches_store(
            &event(EventKind::Create(CreateKind::File), "/d/.tmpX1y2"),
            name
        ));
        assert!(!touches_store(
            &event(EventKind::Access(AccessKind::Any), "/d/otr_keystore.ofc"),
            name
        ));
    }

    #[test]
    fn picks_up_writes_from_another_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("otr_keystore.ofc");
        let watched = Arc::new(KeyStore::open_path(&path, "pw").unwrap());
        watched.set_string("seed", "1").unwrap();

        let watcher = StoreWatcher::spawn(Arc::clone(&watched)).unwrap();
        let writer = KeyStore::open_path(&path, "pw").unwrap();
        writer.set_string("from.elsewhere", "yes").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while watched.get_string("from.elsewhere").is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(watched.get_string("from.elsewhere").as_deref(), Some("yes"));
        drop(watcher);
    }
}
