//! Crash-safe record of every action that has already succeeded, keyed by
//! `(post, account, kind)`. Append-only in practice; eviction only through
//! an explicit admin reset.

use crate::types::ActionKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// `post_id → account_id → kind → first_success_timestamp`.
pub type IdempotencyMap = HashMap<String, HashMap<String, HashMap<ActionKind, DateTime<Utc>>>>;

pub struct IdempotencyLedger {
    map: Mutex<IdempotencyMap>,
    dirty: AtomicBool,
}

impl IdempotencyLedger {
    pub fn new(prior: Option<IdempotencyMap>) -> Self {
        Self {
            map: Mutex::new(prior.unwrap_or_default()),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdempotencyMap> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, post_id: &str, account_id: &str, kind: ActionKind) -> bool {
        self.lock()
            .get(post_id)
            .and_then(|by_account| by_account.get(account_id))
            .is_some_and(|by_kind| by_kind.contains_key(&kind))
    }

    /// Record a success. The first timestamp wins; replays keep it.
    pub fn record(&self, post_id: &str, account_id: &str, kind: ActionKind, at: DateTime<Utc>) {
        let mut map = self.lock();
        map.entry(post_id.to_string())
            .or_default()
            .entry(account_id.to_string())
            .or_default()
            .entry(kind)
            .or_insert(at);
        drop(map);
        self.dirty.store(true, Ordering::Release);
    }

    /// True when every `(account, kind)` combination for this post is
    /// already recorded, meaning the post has nothing left to offer.
    pub fn fully_covered(&self, post_id: &str, account_ids: &[String], kinds: &[ActionKind]) -> bool {
        if account_ids.is_empty() || kinds.is_empty() {
            return false;
        }
        let map = self.lock();
        let Some(by_account) = map.get(post_id) else {
            return false;
        };
        account_ids.iter().all(|account| {
            by_account
                .get(account)
                .is_some_and(|by_kind| kinds.iter().all(|kind| by_kind.contains_key(kind)))
        })
    }

    /// Admin reset: drop every record.
    pub fn reset(&self) {
        self.lock().clear();
        self.dirty.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(|a| a.values().map(|k| k.len()).sum::<usize>()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn to_persist(&self) -> IdempotencyMap {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_contains() {
        let ledger = IdempotencyLedger::new(None);
        assert!(!ledger.contains("100", "a1", ActionKind::Like));
        ledger.record("100", "a1", ActionKind::Like, Utc::now());
        assert!(ledger.contains("100", "a1", ActionKind::Like));
        assert!(!ledger.contains("100", "a1", ActionKind::Reply));
        assert!(!ledger.contains("100", "a2", ActionKind::Like));
    }

    #[test]
    fn first_timestamp_wins_on_replay() {
        let ledger = IdempotencyLedger::new(None);
        let first = Utc::now();
        let later = first + chrono::Duration::hours(1);
        ledger.record("100", "a1", ActionKind::Like, first);
        ledger.record("100", "a1", ActionKind::Like, later);
        let map = ledger.to_persist();
        assert_eq!(map["100"]["a1"][&ActionKind::Like], first);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn fully_covered_requires_every_pair() {
        let ledger = IdempotencyLedger::new(None);
        let accounts = vec!["a1".to_string(), "a2".to_string()];
        let kinds = [ActionKind::Like, ActionKind::Repost];
        ledger.record("100", "a1", ActionKind::Like, Utc::now());
        ledger.record("100", "a1", ActionKind::Repost, Utc::now());
        ledger.record("100", "a2", ActionKind::Like, Utc::now());
        assert!(!ledger.fully_covered("100", &accounts, &kinds));

        ledger.record("100", "a2", ActionKind::Repost, Utc::now());
        assert!(ledger.fully_covered("100", &accounts, &kinds));
    }

    #[test]
    fn covered_is_false_for_unknown_post_or_empty_inputs() {
        let ledger = IdempotencyLedger::new(None);
        assert!(!ledger.fully_covered("404", &["a1".to_string()], &[ActionKind::Like]));
        assert!(!ledger.fully_covered("404", &[], &[ActionKind::Like]));
    }

    #[test]
    fn map_serializes_with_kind_keys() {
        let ledger = IdempotencyLedger::new(None);
        ledger.record("100", "a1", ActionKind::Reply, Utc::now());
        let json = serde_json::to_string(&ledger.to_persist()).unwrap();
        assert!(json.contains("\"reply\""));
        let back: IdempotencyMap = serde_json::from_str(&json).unwrap();
        let restored = IdempotencyLedger::new(Some(back));
        assert!(restored.contains("100", "a1", ActionKind::Reply));
    }

    #[test]
    fn reset_clears_everything() {
        let ledger = IdempotencyLedger::new(None);
        ledger.record("100", "a1", ActionKind::Like, Utc::now());
        ledger.reset();
        assert!(ledger.is_empty());
    }
}
