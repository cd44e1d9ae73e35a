//! The ordered set of author handles the scanner monitors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct WatchList {
    handles: Mutex<Vec<String>>,
    dirty: AtomicBool,
}

impl WatchList {
    pub fn new(prior: Option<Vec<String>>) -> Self {
        let handles = prior
            .map(|list| normalize_all(&list))
            .unwrap_or_default();
        Self {
            handles: Mutex::new(handles),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the list. Handles are normalized (leading sigil stripped,
    /// whitespace trimmed) and deduplicated case-insensitively, keeping the
    /// first occurrence's order and casing.
    pub fn set(&self, handles: &[String]) {
        *self.lock() = normalize_all(handles);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Split the list into chunks of at most `size` handles, preserving
    /// order.
    pub fn chunks(&self, size: usize) -> Vec<Vec<String>> {
        self.lock()
            .chunks(size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn to_persist(&self) -> Vec<String> {
        self.snapshot()
    }
}

fn normalize_all(handles: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in handles {
        let handle = raw.trim().trim_start_matches('@').to_string();
        if handle.is_empty() {
            continue;
        }
        if seen.insert(handle.to_lowercase()) {
            out.push(handle);
        }
    }
    out
}
