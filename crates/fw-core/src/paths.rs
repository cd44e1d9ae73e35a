//! Well-known file locations under the data directory.

use std::path::{Path, PathBuf};

/// Resolved locations of every persistence file the engine touches.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn credentials(&self) -> PathBuf {
        self.root.join("credentials.enc")
    }

    pub fn quota(&self) -> PathBuf {
        self.root.join("quota.json")
    }

    pub fn idempotency(&self) -> PathBuf {
        self.root.join("idempotency.json")
    }

    pub fn mutes(&self) -> PathBuf {
        self.root.join("mutes.json")
    }

    pub fn watchlist(&self) -> PathBuf {
        self.root.join("watchlist.json")
    }

    pub fn scan_state(&self) -> PathBuf {
        self.root.join("scan_state.json")
    }

    pub fn receipts(&self) -> PathBuf {
        self.root.join("actions.log.jsonl")
    }

    pub fn reply_images(&self) -> PathBuf {
        self.root.join("reply-images")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
