//! In-memory view of a mirrored directory tree
//!
//! Maps relative paths to per-path sync state. The client variant is
//! mutated by both the watcher and the scheduler's response handlers, so
//! every method takes the internal lock; iteration hands out a snapshot so
//! callbacks can re-enter the view without deadlocking.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Client-side belief about a path's synchronization with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Server state matches the local digest.
    Synced,
    /// A scheduled operation failed; the watcher will retry.
    Desynced,
    /// A request is in flight; no response integrated yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResource {
    pub synced: SyncState,
    pub exists_on_server: bool,
    pub digest: String,
}

impl ClientResource {
    pub fn new(synced: SyncState, exists_on_server: bool, digest: String) -> Self {
        Self { synced, exists_on_server, digest }
    }

    pub fn with_synced(mut self, synced: SyncState) -> Self {
        self.synced = synced;
        self
    }

    pub fn with_exists_on_server(mut self, exists: bool) -> Self {
        self.exists_on_server = exists;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResource {
    /// True once the final chunk has been received and verified.
    pub synced: bool,
    pub digest: String,
}

impl ServerResource {
    pub fn new(synced: bool, digest: String) -> Self {
        Self { synced, digest }
    }
}

pub struct DirView<R> {
    root: PathBuf,
    entries: Mutex<HashMap<PathBuf, R>>,
}

impl<R: Clone> DirView<R> {
    pub fn new(root: PathBuf) -> Self {
        Self { root, entries: Mutex::new(HashMap::new()) }
    }

    /// The absolute root this view describes.
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn insert_or_assign(&self, relative_path: &Path, rsrc: R) {
        self.entries.lock().insert(relative_path.to_path_buf(), rsrc);
    }

    pub fn erase(&self, relative_path: &Path) -> bool {
        self.entries.lock().remove(relative_path).is_some()
    }

    pub fn contains(&self, relative_path: &Path) -> bool {
        self.entries.lock().contains_key(relative_path)
    }

    pub fn rsrc(&self, relative_path: &Path) -> Option<R> {
        self.entries.lock().get(relative_path).cloned()
    }

    /// Snapshot of all entries; taken under the lock, iterated outside it,
    /// so callers may mutate the view from within the loop.
    pub fn snapshot(&self) -> Vec<(PathBuf, R)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn for_each<F: FnMut(&Path, &R)>(&self, mut fn_: F) {
        for (path, rsrc) in self.snapshot() {
            fn_(&path, &rsrc);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
