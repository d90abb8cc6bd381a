//! Per-node artifact store.
//!
//! One directory per node (`<root>/<own-ip>/`) holding a zip per URL and an
//! `index.txt` listing every stored URL, one per line. The in-memory URL
//! set mirrors the index so ownership filters and cache checks never touch
//! the filesystem. Everything is wiped on shutdown; a node restarts empty
//! and repopulates from its neighbors.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::DashSet;
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};

const INDEX_FILE: &str = "index.txt";

/// Blob store keyed by URL.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    known: DashSet<String>,
}

impl ArtifactStore {
    /// Open (or create) the store directory for a node.
    pub fn open(root: &Path, own_ip: &str) -> ApiResult<Self> {
        let dir = root.join(own_ip);
        fs::create_dir_all(&dir)?;

        let known = DashSet::new();
        let index_path = dir.join(INDEX_FILE);
        match fs::read_to_string(&index_path) {
            Ok(content) => {
                for line in content.lines() {
                    if !line.is_empty() {
                        known.insert(line.to_string());
                    }
                }
            }
            Err(_) => {
                fs::File::create(&index_path)?;
            }
        }

        info!(dir = %dir.display(), urls = known.len(), "Artifact store opened");
        Ok(Self { dir, known })
    }

    /// The node's storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive file name for a URL: scheme stripped, `/` → `_`, `.zip`.
    #[must_use]
    pub fn archive_name(url: &str) -> String {
        let stripped = url
            .split_once("//")
            .map_or(url, |(_, rest)| rest)
            .trim_end_matches('/');
        format!("{}.zip", stripped.replace('/', "_"))
    }

    /// Whether a URL is stored.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.known.contains(url)
    }

    /// Store a blob for a URL. Re-inserting the same URL overwrites the
    /// file and leaves the index untouched, so the operation is idempotent.
    pub fn insert(&self, url: &str, bytes: &[u8]) -> ApiResult<()> {
        let path = self.dir.join(Self::archive_name(url));
        fs::write(&path, bytes)?;

        if self.known.insert(url.to_string()) {
            let mut index = OpenOptions::new()
                .append(true)
                .open(self.dir.join(INDEX_FILE))?;
            index.write_all(url.as_bytes())?;
            index.write_all(b"\n")?;
            debug!(url, "Artifact stored");
        }

        Ok(())
    }

    /// Read a stored blob back.
    pub fn read(&self, url: &str) -> ApiResult<Option<Vec<u8>>> {
        if !self.known.contains(url) {
            return Ok(None);
        }
        match fs::read(self.dir.join(Self::archive_name(url))) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ApiError::Storage(e.to_string())),
        }
    }

    /// All stored URLs.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.known.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of stored URLs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Delete the node's entire storage directory. Called on shutdown.
    pub fn wipe(&self) -> ApiResult<()> {
        self.known.clear();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!(dir = %self.dir.display(), "Storage wiped");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ApiError::Storage(e.to_string())),
        }
    }
}
