//! Periodic filesystem watcher (client)
//!
//! Polls the watched tree instead of subscribing to OS events: simpler,
//! portable, and tolerant of bulk transient changes. Each tick compares
//! the disk against the view's last-known state and schedules the
//! operations needed to converge.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use crate::digest::file_digest;
use crate::dir_view::{ClientResource, DirView, SyncState};
use crate::scheduler::Scheduler;

/// Populate the view from one synchronous scan of the watched root. Every
/// entry starts out awaiting its first reconciliation.
pub fn initial_scan(dir: &DirView<ClientResource>) -> Result<()> {
    let root = dir.path().to_path_buf();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let absolute_path = entry.path();
        let relative_path = absolute_path.strip_prefix(&root)?;
        let digest = file_digest(absolute_path, relative_path)?;
        dir.insert_or_assign(
            relative_path,
            ClientResource::new(SyncState::Pending, false, digest),
        );
    }
    Ok(())
}

pub struct FileWatcher {
    dir: Arc<DirView<ClientResource>>,
    scheduler: Arc<Scheduler>,
    wait_time: Duration,
}

impl FileWatcher {
    /// Scans the watched root once, then is ready to `start()`.
    pub fn new(
        dir: Arc<DirView<ClientResource>>,
        scheduler: Arc<Scheduler>,
        wait_time: Duration,
    ) -> Result<Self> {
        println!("scanning directory...");
        initial_scan(&dir)?;
        Ok(Self { dir, scheduler, wait_time })
    }

    /// Run the initial sync, then poll forever.
    pub async fn start(self) -> Result<()> {
        self.scheduler.sync().await?;
        loop {
            tokio::time::sleep(self.wait_time).await;
            self.tick();
        }
    }

    /// One reconciliation pass: handle disappeared paths, then walk the
    /// tree for new and changed files. Paths with a response still pending
    /// are left alone.
    pub fn tick(&self) {
        let root = self.dir.path().to_path_buf();

        for (relative_path, rsrc) in self.dir.snapshot() {
            if root.join(&relative_path).exists() {
                continue;
            }
            if rsrc.synced != SyncState::Pending && rsrc.exists_on_server {
                self.scheduler.erase(&relative_path, &rsrc.digest);
            }
        }

        for entry in WalkDir::new(&root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let absolute_path = entry.path();
            let relative_path = match absolute_path.strip_prefix(&root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let digest = match file_digest(absolute_path, relative_path) {
                Ok(digest) => digest,
                // the file may have vanished mid-walk; next tick sees it
                Err(_) => continue,
            };
            self.apply(relative_path, &digest);
        }
    }

    fn apply(&self, relative_path: &Path, digest: &str) {
        match self.dir.rsrc(relative_path) {
            None => self.scheduler.create(relative_path, digest),
            Some(rsrc) => match rsrc.synced {
                SyncState::Synced => {
                    if rsrc.digest != digest {
                        self.scheduler.update(relative_path, digest);
                    }
                }
                SyncState::Desynced => {
                    if rsrc.exists_on_server {
                        self.scheduler.update(relative_path, digest);
                    } else {
                        self.scheduler.create(relative_path, digest);
                    }
                }
                SyncState::Pending => {}
            },
        }
    }
}
