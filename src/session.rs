//! Per-connection server session state and the open-stream map

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dir_view::{DirView, ServerResource};

/// The authenticated identity and progress of one client connection.
/// A session cannot observe tree contents before it is both
/// authenticated and listed.
pub struct UserSession {
    id: String,
    username: String,
    ip: String,
    authenticated: bool,
    listed: bool,
    dir: Option<Arc<DirView<ServerResource>>>,
}

impl UserSession {
    pub fn new(ip: String) -> Self {
        Self {
            id: String::new(),
            username: String::new(),
            ip,
            authenticated: false,
            listed: false,
            dir: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn listed(&self) -> bool {
        self.listed
    }

    pub fn set_listed(&mut self, listed: bool) {
        self.listed = listed;
    }

    /// Promote the session after a successful AUTH: record the identity and
    /// bind the per-user directory view.
    pub fn authenticate(&mut self, id: String, username: String, dir_root: PathBuf) {
        self.id = id;
        self.username = username;
        self.authenticated = true;
        self.dir = Some(Arc::new(DirView::new(dir_root)));
    }

    pub fn dir(&self) -> Option<&Arc<DirView<ServerResource>>> {
        self.dir.as_ref()
    }
}

struct OpenStream {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

/// User-keyed append-mode file handles for in-flight multi-chunk
/// transfers. Entries live across many request/response cycles on the same
/// connection; `erase_stream` is called exactly when the final chunk is
/// observed (or at session teardown), never from a destructor.
#[derive(Default)]
pub struct OpenStreams {
    streams: Mutex<HashMap<String, OpenStream>>,
}

impl OpenStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the user's open stream, creating it on first use. Returns the
    /// handle and whether this call opened it (first chunk). A leftover
    /// stream for a different path (an interrupted transfer) is replaced.
    pub fn get_stream(&self, user_id: &str, path: &Path) -> Result<(Arc<Mutex<File>>, bool)> {
        let mut streams = self.streams.lock();
        if let Some(entry) = streams.get(user_id) {
            if entry.path == path {
                return Ok((entry.file.clone(), false));
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let file = Arc::new(Mutex::new(file));
        streams.insert(
            user_id.to_string(),
            OpenStream { file: file.clone(), path: path.to_path_buf() },
        );
        Ok((file, true))
    }

    pub fn erase_stream(&self, user_id: &str) {
        self.streams.lock().remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn session_starts_unauthenticated() {
        let mut user = UserSession::new("127.0.0.1".into());
        assert!(!user.authenticated());
        assert!(!user.listed());
        assert!(user.dir().is_none());

        user.authenticate("abc123".into(), "alice".into(), PathBuf::from("/srv/abc123"));
        assert!(user.authenticated());
        assert_eq!(user.id(), "abc123");
        assert_eq!(user.dir().unwrap().path(), Path::new("/srv/abc123"));
        assert!(!user.listed());
    }

    #[test]
    fn stream_reuse_and_erase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        let streams = OpenStreams::new();

        let (f1, first) = streams.get_stream("u1", &path).unwrap();
        assert!(first);
        f1.lock().write_all(b"chunk1").unwrap();

        let (f2, first) = streams.get_stream("u1", &path).unwrap();
        assert!(!first);
        f2.lock().write_all(b"chunk2").unwrap();

        streams.erase_stream("u1");
        drop((f1, f2));
        assert_eq!(std::fs::read(&path).unwrap(), b"chunk1chunk2");

        // after erase the next fetch opens anew (append mode keeps bytes)
        let (_, first) = streams.get_stream("u1", &path).unwrap();
        assert!(first);
    }

    #[test]
    fn stale_stream_for_other_path_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let streams = OpenStreams::new();

        let (_, first) = streams.get_stream("u1", &a).unwrap();
        assert!(first);
        let (_, first) = streams.get_stream("u1", &b).unwrap();
        assert!(first);
    }
}
