//! Observed rate-limit state, per account.
//!
//! The platform reports its limits through response headers; the tracker
//! keeps the latest observation per account plus a local rolling 24-hour
//! action counter.

use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use reqwest::header::HeaderMap;

// ---------------------------------------------------------------------------
// RateLimitInfo — headers from one response
// ---------------------------------------------------------------------------

/// Rate-limit headers observed on a single response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
    pub day_limit: Option<u64>,
    pub day_remaining: Option<u64>,
    pub day_reset: Option<DateTime<Utc>>,
    /// `Retry-After` in seconds, when present.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header_u64(headers, "x-rate-limit-limit"),
            remaining: header_u64(headers, "x-rate-limit-remaining"),
            reset: header_epoch(headers, "x-rate-limit-reset"),
            day_limit: header_u64(headers, "x-24h-limit"),
            day_remaining: header_u64(headers, "x-24h-remaining"),
            day_reset: header_epoch(headers, "x-24h-reset"),
            retry_after_secs: header_u64(headers, "retry-after"),
        }
    }

    /// Best reset hint for mute computation: `Retry-After` wins, then the
    /// short-window reset, then the 24h reset.
    pub fn reset_hint(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(secs) = self.retry_after_secs {
            return Some(now + Duration::seconds(secs as i64));
        }
        self.reset.or(self.day_reset)
    }

    /// True when the 24-hour window is the one that ran dry.
    pub fn day_window_exhausted(&self) -> bool {
        self.day_remaining == Some(0)
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn header_epoch(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_u64(headers, name).and_then(|epoch| Utc.timestamp_opt(epoch as i64, 0).single())
}

// ---------------------------------------------------------------------------
// RateLimitTracker — per-account windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AccountWindow {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
    pub day_limit: Option<u64>,
    pub day_remaining: Option<u64>,
    pub day_reset: Option<DateTime<Utc>>,
    /// Locally counted actions in the rolling 24h window.
    pub actions_24h: u64,
    pub window_started: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct RateLimitTracker {
    windows: DashMap<String, AccountWindow>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Fold one response's headers into the account's window.
    pub fn observe(&self, account_id: &str, info: &RateLimitInfo) {
        let mut window = self.windows.entry(account_id.to_string()).or_default();
        if info.limit.is_some() {
            window.limit = info.limit;
        }
        if info.remaining.is_some() {
            window.remaining = info.remaining;
        }
        if info.reset.is_some() {
            window.reset = info.reset;
        }
        if info.day_limit.is_some() {
            window.day_limit = info.day_limit;
        }
        if info.day_remaining.is_some() {
            window.day_remaining = info.day_remaining;
        }
        if info.day_reset.is_some() {
            window.day_reset = info.day_reset;
        }
    }

    /// Count one performed action into the local 24h window.
    pub fn note_action(&self, account_id: &str, now: DateTime<Utc>) {
        let mut window = self.windows.entry(account_id.to_string()).or_default();
        let rolled_over = window
            .window_started
            .map(|started| now - started >= Duration::hours(24))
            .unwrap_or(true);
        if rolled_over {
            window.window_started = Some(now);
            window.actions_24h = 0;
        }
        window.actions_24h += 1;
    }

    pub fn get(&self, account_id: &str) -> Option<AccountWindow> {
        self.windows.get(account_id).map(|w| w.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn parses_standard_and_day_headers() {
        let info = RateLimitInfo::from_headers(&headers(&[
            ("x-rate-limit-limit", "300"),
            ("x-rate-limit-remaining", "7"),
            ("x-rate-limit-reset", "1700000000"),
            ("x-24h-limit", "1000"),
            ("x-24h-remaining", "0"),
        ]));
        assert_eq!(info.limit, Some(300));
        assert_eq!(info.remaining, Some(7));
        assert_eq!(info.reset.unwrap().timestamp(), 1_700_000_000);
        assert!(info.day_window_exhausted());
    }

    #[test]
    fn missing_headers_yield_none() {
        let info = RateLimitInfo::from_headers(&HeaderMap::new());
        assert_eq!(info, RateLimitInfo::default());
        assert!(!info.day_window_exhausted());
    }

    #[test]
    fn retry_after_wins_reset_hint() {
        let now = Utc::now();
        let info = RateLimitInfo {
            retry_after_secs: Some(120),
            reset: Some(now + Duration::hours(2)),
            ..RateLimitInfo::default()
        };
        assert_eq!(info.reset_hint(now), Some(now + Duration::seconds(120)));
    }

    #[test]
    fn observe_keeps_latest_known_values() {
        let tracker = RateLimitTracker::new();
        tracker.observe(
            "a1",
            &RateLimitInfo {
                limit: Some(300),
                remaining: Some(10),
                ..RateLimitInfo::default()
            },
        );
        // A later response without limit headers must not erase them.
        tracker.observe(
            "a1",
            &RateLimitInfo {
                remaining: Some(9),
                ..RateLimitInfo::default()
            },
        );
        let window = tracker.get("a1").unwrap();
        assert_eq!(window.limit, Some(300));
        assert_eq!(window.remaining, Some(9));
    }

    #[test]
    fn rolling_day_counter_resets_after_24h() {
        let tracker = RateLimitTracker::new();
        let t0 = Utc::now();
        tracker.note_action("a1", t0);
        tracker.note_action("a1", t0 + Duration::hours(1));
        assert_eq!(tracker.get("a1").unwrap().actions_24h, 2);

        tracker.note_action("a1", t0 + Duration::hours(25));
        assert_eq!(tracker.get("a1").unwrap().actions_24h, 1);
    }
}
