//! Owner of the most recently published scan.
//!
//! Readers grab an `Arc` to the current snapshot and keep using it even if a
//! rescan publishes a newer one in the meantime. Rescans are serialized: a
//! caller that arrives while another scan runs waits for it and then scans
//! again.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::scanner::{Channel, ScanConfig, scan};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub channels: usize,
    pub videos: usize,
}

impl LibraryStats {
    fn of(channels: &[Channel]) -> Self {
        Self {
            channels: channels.len(),
            videos: channels.iter().map(|channel| channel.videos.len()).sum(),
        }
    }
}

pub struct Library {
    root: PathBuf,
    config: ScanConfig,
    snapshot: RwLock<Arc<[Channel]>>,
    scan_lock: Mutex<()>,
}

impl Library {
    /// Creates a library with an empty snapshot. Nothing is read from disk
    /// until [`Library::rescan`] runs.
    pub fn new(root: impl Into<PathBuf>, config: ScanConfig) -> Self {
        Self {
            root: root.into(),
            config,
            snapshot: RwLock::new(Arc::from(Vec::<Channel>::new())),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn channels(&self) -> Arc<[Channel]> {
        self.snapshot.read().clone()
    }

    pub fn find_channel(&self, folder: &str) -> Option<Channel> {
        self.channels()
            .iter()
            .find(|channel| channel.folder == folder)
            .cloned()
    }

    pub fn total_videos(&self) -> usize {
        self.stats().videos
    }

    pub fn stats(&self) -> LibraryStats {
        LibraryStats::of(&self.channels())
    }

    /// Rebuilds the catalogue from disk and publishes it.
    ///
    /// Blocks for the whole scan; async callers should go through
    /// `spawn_blocking`.
    pub fn rescan(&self) -> LibraryStats {
        let _guard = self.scan_lock.lock();
        let channels: Arc<[Channel]> = scan(&self.root, &self.config).into();
        let stats = LibraryStats::of(&channels);
        *self.snapshot.write() = channels;
        stats
    }
}
