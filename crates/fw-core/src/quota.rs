//! Action budget accounting: global pack, daily limit, per-kind
//! distribution, and per-account daily allocations.
//!
//! All mutation happens under one mutex with no I/O inside it. The persisted
//! state carries a pending-intent journal: a consume is recorded as pending
//! before the corresponding API call is dispatched, settled on a terminal
//! outcome, and reverted when the outcome shows no action happened. On
//! startup, pending intents with no matching idempotency record are
//! reverted, so a crash between consume and execute neither double-consumes
//! nor leaks budget.

use crate::types::{
    AccountQuota, ActionKind, DailyQuota, KindCounts, PackQuota, QuotaSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors and denial reasons
// ---------------------------------------------------------------------------

/// Why a consume attempt was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The long-horizon pack is exhausted.
    GlobalExhausted,
    /// Today's total budget is spent.
    DailyExhausted,
    /// Today's per-kind share is spent.
    KindExhausted(ActionKind),
    /// The account's daily allocation is spent.
    AccountExhausted,
    /// The account has no allocation (not part of the last recompute).
    Unallocated,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::GlobalExhausted => write!(f, "global pack exhausted"),
            DenyReason::DailyExhausted => write!(f, "daily limit exhausted"),
            DenyReason::KindExhausted(kind) => write!(f, "{kind} share exhausted"),
            DenyReason::AccountExhausted => write!(f, "account daily allocation exhausted"),
            DenyReason::Unallocated => write!(f, "account has no allocation"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded: {0}")]
    Exceeded(DenyReason),
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

/// A consume that has been charged but whose API call has not yet produced a
/// receipt. Flushed to disk before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIntent {
    pub post_id: String,
    pub account_id: String,
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaState {
    pub global_pack: PackQuota,
    pub daily: DailyQuota,
    pub accounts: BTreeMap<String, AccountQuota>,
    pub last_reset_date: String,
    #[serde(default)]
    pub pending: Vec<PendingIntent>,
}

/// Percentage split of the daily limit across kinds. Must sum to 100.
#[derive(Debug, Clone, Copy)]
pub struct KindWeights {
    pub like_pct: u64,
    pub repost_pct: u64,
    pub reply_pct: u64,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            like_pct: 40,
            repost_pct: 10,
            reply_pct: 50,
        }
    }
}

impl KindWeights {
    fn pct(&self, kind: ActionKind) -> u64 {
        match kind {
            ActionKind::Like => self.like_pct,
            ActionKind::Repost => self.repost_pct,
            ActionKind::Reply => self.reply_pct,
        }
    }
}

// ---------------------------------------------------------------------------
// QuotaLedger
// ---------------------------------------------------------------------------

pub struct QuotaLedger {
    state: Mutex<QuotaState>,
    weights: KindWeights,
    dirty: AtomicBool,
}

impl QuotaLedger {
    /// Build a ledger over previously persisted state (or a fresh one).
    pub fn new(pack_total: u64, daily_limit: u64, weights: KindWeights, prior: Option<QuotaState>) -> Self {
        let mut state = prior.unwrap_or_default();
        // Config is authoritative for the budgets; usage carries over.
        state.global_pack.total = pack_total;
        state.daily.limit = daily_limit;
        Self {
            state: Mutex::new(state),
            weights,
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        // Counter state stays consistent even if a holder panicked mid-update
        // is impossible: all updates are single-field arithmetic.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// True when in-memory state has diverged from the last persisted copy.
    /// Clears the flag; the caller is committing to a flush.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Serializable copy of the current state for persistence.
    pub fn to_persist(&self) -> QuotaState {
        self.lock().clone()
    }

    // -- day boundary -------------------------------------------------------

    /// Reset daily counters when the UTC date has changed.
    pub fn reset_if_new_day(&self, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        let mut state = self.lock();
        if state.last_reset_date != today {
            info!(
                previous = %state.last_reset_date,
                today = %today,
                "daily quota reset"
            );
            state.last_reset_date = today;
            state.daily.used = 0;
            state.daily.distribution = KindCounts::default();
            for account in state.accounts.values_mut() {
                account.daily_used = KindCounts::default();
            }
            drop(state);
            self.mark_dirty();
        }
    }

    // -- allocation ---------------------------------------------------------

    /// Distribute the daily limit across active accounts: equal share, with
    /// the remainder going to the accounts added earliest.
    ///
    /// `active` is `(account_id, added_at)` for every account eligible to
    /// act. Accounts no longer present lose their allocation; usage already
    /// recorded today is retained for the invariants.
    pub fn recompute_allocation(&self, active: &[(String, DateTime<Utc>)]) {
        let mut ordered: Vec<&(String, DateTime<Utc>)> = active.iter().collect();
        ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut state = self.lock();
        let n = ordered.len() as u64;
        let (share, remainder) = if n == 0 {
            (0, 0)
        } else {
            (state.daily.limit / n, state.daily.limit % n)
        };

        let mut next = BTreeMap::new();
        for (i, (id, _)) in ordered.iter().enumerate() {
            let bonus = if (i as u64) < remainder { 1 } else { 0 };
            let used = state
                .accounts
                .get(id.as_str())
                .map(|a| a.daily_used)
                .unwrap_or_default();
            next.insert(
                id.clone(),
                AccountQuota {
                    daily_limit: share + bonus,
                    daily_used: used,
                },
            );
        }
        state.accounts = next;
        drop(state);
        self.mark_dirty();
        debug!(accounts = active.len(), "daily allocation recomputed");
    }

    // -- check and consume --------------------------------------------------

    fn kind_cap(&self, daily_limit: u64, kind: ActionKind) -> u64 {
        daily_limit * self.weights.pct(kind) / 100
    }

    fn check(&self, state: &QuotaState, account_id: &str, kind: ActionKind) -> Result<(), DenyReason> {
        if state.global_pack.used >= state.global_pack.total {
            return Err(DenyReason::GlobalExhausted);
        }
        if state.daily.used >= state.daily.limit {
            return Err(DenyReason::DailyExhausted);
        }
        if state.daily.distribution.get(kind) >= self.kind_cap(state.daily.limit, kind) {
            return Err(DenyReason::KindExhausted(kind));
        }
        match state.accounts.get(account_id) {
            None => Err(DenyReason::Unallocated),
            Some(account) if account.daily_used.total() >= account.daily_limit => {
                Err(DenyReason::AccountExhausted)
            }
            Some(_) => Ok(()),
        }
    }

    /// Non-consuming availability check, used by the planner.
    pub fn can_consume(&self, account_id: &str, kind: ActionKind) -> Result<(), DenyReason> {
        let state = self.lock();
        self.check(&state, account_id, kind)
    }

    /// Atomically charge one action and journal it as pending.
    ///
    /// Either every counter moves and the intent is recorded, or nothing
    /// changes and the denial reason is returned.
    pub fn begin(
        &self,
        post_id: &str,
        account_id: &str,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let mut state = self.lock();
        self.check(&state, account_id, kind)
            .map_err(QuotaError::Exceeded)?;

        state.global_pack.used += 1;
        state.daily.used += 1;
        state.daily.distribution.add(kind, 1);
        if let Some(account) = state.accounts.get_mut(account_id) {
            account.daily_used.add(kind, 1);
        }
        state.pending.push(PendingIntent {
            post_id: post_id.to_string(),
            account_id: account_id.to_string(),
            kind,
            at: now,
        });
        drop(state);
        self.mark_dirty();
        Ok(())
    }

    /// Clear the pending intent, keeping the charge. Call after the action
    /// succeeded.
    pub fn settle(&self, post_id: &str, account_id: &str, kind: ActionKind) {
        let mut state = self.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|p| !(p.post_id == post_id && p.account_id == account_id && p.kind == kind));
        let removed = before - state.pending.len();
        drop(state);
        if removed > 0 {
            self.mark_dirty();
        }
    }

    /// Clear the pending intent and return the charge. Call when the action
    /// did not happen (duplicate, rate limit, retryable failure, ...).
    pub fn revert(&self, post_id: &str, account_id: &str, kind: ActionKind) {
        let mut state = self.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|p| !(p.post_id == post_id && p.account_id == account_id && p.kind == kind));
        let removed = (before - state.pending.len()) as u64;
        if removed > 0 {
            state.global_pack.used = state.global_pack.used.saturating_sub(removed);
            state.daily.used = state.daily.used.saturating_sub(removed);
            state.daily.distribution.sub(kind, removed);
            if let Some(account) = state.accounts.get_mut(account_id) {
                account.daily_used.sub(kind, removed);
            }
        }
        drop(state);
        if removed > 0 {
            self.mark_dirty();
        }
    }

    /// Startup reconciliation: revert every journaled intent the recovery
    /// pass cannot match to a completed action.
    ///
    /// `completed` answers whether the `(post, account, kind)` key reached a
    /// terminal success (the idempotency ledger holds it).
    pub fn reconcile_pending<F>(&self, completed: F)
    where
        F: Fn(&PendingIntent) -> bool,
    {
        let stale: Vec<PendingIntent> = {
            let state = self.lock();
            state.pending.clone()
        };
        for intent in stale {
            if completed(&intent) {
                self.settle(&intent.post_id, &intent.account_id, intent.kind);
                debug!(
                    post_id = %intent.post_id,
                    account_id = %intent.account_id,
                    kind = %intent.kind,
                    "pending intent settled against completed action"
                );
            } else {
                warn!(
                    post_id = %intent.post_id,
                    account_id = %intent.account_id,
                    kind = %intent.kind,
                    "reverting pending intent with no completed action"
                );
                self.revert(&intent.post_id, &intent.account_id, intent.kind);
            }
        }
    }

    // -- views --------------------------------------------------------------

    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = self.lock();
        QuotaSnapshot {
            global_pack: state.global_pack,
            daily: state.daily.clone(),
            accounts: state.accounts.clone(),
            last_reset_date: state.last_reset_date.clone(),
        }
    }

    /// True when nothing can be consumed at all: the long-horizon pack or
    /// today's budget is spent.
    pub fn budget_exhausted(&self) -> bool {
        let state = self.lock();
        state.global_pack.used >= state.global_pack.total || state.daily.used >= state.daily.limit
    }
}
