//! Watch-list scanning.
//!
//! Each tick, the watch-list is split into chunks of at most ten handles and
//! each chunk is searched through a rotating account credential. The
//! rotation index and the since-id high-water mark persist across ticks and
//! restarts so the scanner never re-reads old ground.

use crate::shutdown::RunSignal;
use fw_client::factory::ClientProvider;
use fw_client::rest::ApiError;
use fw_core::idempotency::IdempotencyLedger;
use fw_core::types::{Account, ActionKind, Post};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Handles per search query.
pub const CHUNK_SIZE: usize = 10;
/// Items fetched per chunk.
pub const PAGE_SIZE: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("no active account available to scan with")]
    NoScanAccount,
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanState {
    /// Round-robin cursor over active accounts.
    pub rotation_index: usize,
    /// Highest post id observed so far.
    pub since_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A surviving post, annotated with the account whose credential found it.
/// That account is excluded as an action target for this post.
#[derive(Debug, Clone)]
pub struct ScannedPost {
    pub post: Post,
    pub scanned_by: String,
}

/// Per-tick dedup/filter counters, emitted for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanMetrics {
    pub chunks: usize,
    pub fetched: usize,
    pub kept: usize,
    pub dropped_replies: usize,
    pub dropped_reposts: usize,
    pub dropped_covered: usize,
    pub dropped_duplicate: usize,
    pub chunk_errors: usize,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    state: Mutex<ScanState>,
    dirty: AtomicBool,
}

impl Scanner {
    pub fn new(prior: Option<ScanState>) -> Self {
        Self {
            state: Mutex::new(prior.unwrap_or_default()),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn to_persist(&self) -> ScanState {
        self.lock().clone()
    }

    /// Build the search query for one chunk of handles.
    pub fn build_query(handles: &[String]) -> String {
        let froms: Vec<String> = handles.iter().map(|h| format!("from:{h}")).collect();
        format!("{} -is_repost -is_reply", froms.join(" OR "))
    }

    /// Run one scan pass over the watch-list.
    ///
    /// `accounts` must be the active account list in stable order; the
    /// rotation cursor indexes into it. Posts already covered for every
    /// active account and kind are filtered here, before planning.
    pub async fn scan(
        &self,
        chunks: &[Vec<String>],
        accounts: &[Account],
        clients: &dyn ClientProvider,
        idempotency: &IdempotencyLedger,
        signal: &RunSignal,
    ) -> Result<(Vec<ScannedPost>, ScanMetrics), ScanError> {
        let mut metrics = ScanMetrics {
            chunks: chunks.len(),
            ..ScanMetrics::default()
        };
        if chunks.is_empty() {
            debug!("watch-list empty, skipping scan");
            return Ok((Vec::new(), metrics));
        }
        if accounts.is_empty() {
            return Err(ScanError::NoScanAccount);
        }

        let account_ids: Vec<String> = accounts.iter().map(|a| a.id.clone()).collect();
        let rotation_base = self.lock().rotation_index;
        let since_id = self.lock().since_id.clone();

        let mut seen: HashSet<String> = HashSet::new();
        let mut survivors = Vec::new();
        let mut high_water = since_id.clone();

        for (chunk_index, chunk) in chunks.iter().enumerate() {
            if signal.is_halted() {
                break;
            }
            let scan_account = &accounts[(rotation_base + chunk_index) % accounts.len()];
            let query = Self::build_query(chunk);

            let page = match clients.client_for(&scan_account.id).await {
                Ok(client) => {
                    match client
                        .search(&query, since_id.as_deref(), PAGE_SIZE)
                        .await
                    {
                        Ok(response) => response.body,
                        Err(e) => {
                            metrics.chunk_errors += 1;
                            log_chunk_error(&scan_account.id, chunk_index, &e);
                            continue;
                        }
                    }
                }
                Err(e) => {
                    metrics.chunk_errors += 1;
                    warn!(
                        account_id = %scan_account.id,
                        chunk = chunk_index,
                        error = %e,
                        "could not build scan client"
                    );
                    continue;
                }
            };

            if let Some(newest) = &page.newest_id {
                if id_newer(newest, high_water.as_deref()) {
                    high_water = Some(newest.clone());
                }
            }

            for post in page.posts {
                metrics.fetched += 1;
                if id_newer(&post.id, high_water.as_deref()) {
                    high_water = Some(post.id.clone());
                }
                if post.is_reply {
                    metrics.dropped_replies += 1;
                    continue;
                }
                if post.is_repost {
                    metrics.dropped_reposts += 1;
                    continue;
                }
                if !seen.insert(post.id.clone()) {
                    metrics.dropped_duplicate += 1;
                    continue;
                }
                if idempotency.fully_covered(&post.id, &account_ids, &ActionKind::ALL) {
                    metrics.dropped_covered += 1;
                    continue;
                }
                metrics.kept += 1;
                survivors.push(ScannedPost {
                    post,
                    scanned_by: scan_account.id.clone(),
                });
            }
        }

        // Advance the rotation past the chunks consumed this tick and
        // commit the high-water mark.
        {
            let mut state = self.lock();
            state.rotation_index = (rotation_base + chunks.len()) % accounts.len().max(1);
            state.since_id = high_water;
        }
        self.dirty.store(true, Ordering::Release);

        info!(
            chunks = metrics.chunks,
            fetched = metrics.fetched,
            kept = metrics.kept,
            dropped_replies = metrics.dropped_replies,
            dropped_reposts = metrics.dropped_reposts,
            dropped_covered = metrics.dropped_covered,
            dropped_duplicate = metrics.dropped_duplicate,
            chunk_errors = metrics.chunk_errors,
            "scan complete"
        );
        Ok((survivors, metrics))
    }
}

fn log_chunk_error(account_id: &str, chunk: usize, error: &ApiError) {
    warn!(account_id, chunk, error = %error, "chunk search failed");
}

/// Numeric-string ordering for platform post ids: longer ids are newer;
/// equal lengths compare lexicographically.
fn id_newer(candidate: &str, current: Option<&str>) -> bool {
    match current {
        None => true,
        Some(current) => {
            (candidate.len(), candidate) > (current.len(), current)
        }
    }
}
