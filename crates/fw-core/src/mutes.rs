//! Per-account dispatch suspensions with reason codes.

use crate::types::{MuteReason, MuteRecord};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

pub struct MuteRegistry {
    map: Mutex<HashMap<String, MuteRecord>>,
    dirty: AtomicBool,
}

impl MuteRegistry {
    pub fn new(prior: Option<HashMap<String, MuteRecord>>) -> Self {
        Self {
            map: Mutex::new(prior.unwrap_or_default()),
            dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MuteRecord>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Suspend an account for `duration` from `now`. Overlapping mutes merge
    /// by taking the later deadline; the reason follows the winning deadline.
    ///
    /// Returns the effective deadline.
    pub fn mute(
        &self,
        account_id: &str,
        duration: Duration,
        reason: MuteReason,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let candidate = now + duration;
        let mut map = self.lock();
        let record = map
            .entry(account_id.to_string())
            .and_modify(|existing| {
                if candidate > existing.until {
                    existing.until = candidate;
                    existing.reason = reason;
                }
            })
            .or_insert(MuteRecord {
                until: candidate,
                reason,
            });
        let until = record.until;
        drop(map);
        self.dirty.store(true, Ordering::Release);
        info!(account_id, %reason, until = %until, "account muted");
        until
    }

    pub fn is_muted(&self, account_id: &str, now: DateTime<Utc>) -> bool {
        self.lock()
            .get(account_id)
            .is_some_and(|record| record.until > now)
    }

    /// The active mute record, if any.
    pub fn active(&self, account_id: &str, now: DateTime<Utc>) -> Option<MuteRecord> {
        self.lock()
            .get(account_id)
            .filter(|record| record.until > now)
            .copied()
    }

    pub fn unmute(&self, account_id: &str) {
        let removed = self.lock().remove(account_id).is_some();
        if removed {
            self.dirty.store(true, Ordering::Release);
            info!(account_id, "account unmuted");
        }
    }

    /// Drop expired records. Called opportunistically on ticks.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, record| record.until > now);
        let pruned = before - map.len();
        drop(map);
        if pruned > 0 {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn to_persist(&self) -> HashMap<String, MuteRecord> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn mute_then_expiry() {
        let registry = MuteRegistry::new(None);
        let t0 = now();
        registry.mute("a1", Duration::minutes(15), MuteReason::RateLimitShort, t0);
        assert!(registry.is_muted("a1", t0 + Duration::minutes(14)));
        assert!(!registry.is_muted("a1", t0 + Duration::minutes(16)));
        assert!(!registry.is_muted("a2", t0));
    }

    #[test]
    fn overlapping_mutes_keep_the_later_deadline() {
        let registry = MuteRegistry::new(None);
        let t0 = now();
        let long = registry.mute("a1", Duration::minutes(30), MuteReason::RateLimitShort, t0);
        let merged = registry.mute("a1", Duration::minutes(5), MuteReason::Explicit, t0);
        assert_eq!(merged, long);
        // The shorter mute did not shrink the window.
        assert!(registry.is_muted("a1", t0 + Duration::minutes(20)));
        assert_eq!(registry.active("a1", t0).unwrap().reason, MuteReason::RateLimitShort);
    }

    #[test]
    fn longer_mute_extends_and_takes_reason() {
        let registry = MuteRegistry::new(None);
        let t0 = now();
        registry.mute("a1", Duration::minutes(5), MuteReason::Explicit, t0);
        registry.mute("a1", Duration::hours(24), MuteReason::RateLimit24h, t0);
        let active = registry.active("a1", t0).unwrap();
        assert_eq!(active.reason, MuteReason::RateLimit24h);
        assert_eq!(active.until, t0 + Duration::hours(24));
    }

    #[test]
    fn prune_drops_only_expired() {
        let registry = MuteRegistry::new(None);
        let t0 = now();
        registry.mute("old", Duration::minutes(1), MuteReason::Explicit, t0);
        registry.mute("live", Duration::hours(1), MuteReason::Explicit, t0);
        registry.prune(t0 + Duration::minutes(5));
        let map = registry.to_persist();
        assert!(!map.contains_key("old"));
        assert!(map.contains_key("live"));
    }

    #[test]
    fn unmute_removes_record() {
        let registry = MuteRegistry::new(None);
        let t0 = now();
        registry.mute("a1", Duration::hours(1), MuteReason::AuthFailed, t0);
        registry.unmute("a1");
        assert!(!registry.is_muted("a1", t0));
    }
}
