//! Maps platform failures onto the engine's recovery taxonomy.
//!
//! The classifier is a pure function: it never mutates state, it only
//! inspects the error, the attempt count, and whether a token refresh was
//! already tried this iteration. The executor applies the returned policy.

use crate::rest::ApiError;
use chrono::{DateTime, Duration, Utc};

/// Floor for rate-limit mutes, even when the reset hint is stale or absent.
pub fn min_rate_limit_mute() -> Duration {
    Duration::minutes(15)
}

/// Exponential backoff parameters for retryable failures.
pub const RETRY_BASE_SECS: u64 = 2;
pub const RETRY_CAP_SECS: u64 = 60;

/// Attempts after which a retryable failure becomes fatal.
pub const MAX_ATTEMPTS: u32 = 3;

/// What the executor should do with a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The provider says the action already happened. Record idempotency,
    /// return the quota charge, receipt as duplicate.
    Duplicate,
    /// Mute the account until the window opens again.
    RateLimited {
        mute: Duration,
        /// The 24-hour window (not the short window) ran dry.
        day_window: bool,
    },
    /// Access token rejected; refresh and retry once.
    AuthExpired,
    /// Refresh already happened and the token is still rejected; the
    /// account needs operator reconnection.
    AuthFatal,
    /// Transient failure; requeue with backoff.
    Retryable { backoff: std::time::Duration },
    /// Unrecoverable for this action; receipt and drop.
    Fatal { detail: String },
}

/// Classify a platform error observed on attempt `attempt` (0-based).
///
/// `refreshed` is true when a token refresh has already been performed for
/// this action; a second 401 then escalates to [`ErrorClass::AuthFatal`].
pub fn classify(error: &ApiError, attempt: u32, refreshed: bool, now: DateTime<Utc>) -> ErrorClass {
    match error {
        ApiError::Status { status, body, rate } => {
            if is_duplicate_body(body) {
                return ErrorClass::Duplicate;
            }
            match status {
                429 => {
                    let until = rate.reset_hint(now);
                    let mute = until
                        .map(|t| t - now)
                        .filter(|d| *d > min_rate_limit_mute())
                        .unwrap_or_else(min_rate_limit_mute);
                    ErrorClass::RateLimited {
                        mute,
                        day_window: rate.day_window_exhausted(),
                    }
                }
                401 => {
                    if refreshed {
                        ErrorClass::AuthFatal
                    } else {
                        ErrorClass::AuthExpired
                    }
                }
                500..=599 => retry_or_fatal(attempt, format!("provider_5xx:{status}")),
                400 => ErrorClass::Fatal {
                    detail: "invalid_request".into(),
                },
                403 => ErrorClass::Fatal {
                    detail: "content_policy_rejected".into(),
                },
                other => ErrorClass::Fatal {
                    detail: format!("unknown_fatal:{other}"),
                },
            }
        }
        ApiError::Timeout => retry_or_fatal(attempt, "provider_timeout".into()),
        ApiError::Network(_) => retry_or_fatal(attempt, "provider_unreachable".into()),
        ApiError::Parse(detail) => ErrorClass::Fatal {
            detail: format!("unparseable_response:{detail}"),
        },
    }
}

fn retry_or_fatal(attempt: u32, detail: String) -> ErrorClass {
    if attempt + 1 >= MAX_ATTEMPTS {
        ErrorClass::Fatal { detail }
    } else {
        ErrorClass::Retryable {
            backoff: backoff_for(attempt),
        }
    }
}

/// `min(base · 2^attempt, cap)` seconds.
pub fn backoff_for(attempt: u32) -> std::time::Duration {
    let secs = RETRY_BASE_SECS.saturating_mul(1u64 << attempt.min(16));
    std::time::Duration::from_secs(secs.min(RETRY_CAP_SECS))
}

fn is_duplicate_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("already liked")
        || lower.contains("already reposted")
        || lower.contains("already retweeted")
        || lower.contains("duplicate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitInfo;

    fn status_error(status: u16, body: &str, rate: RateLimitInfo) -> ApiError {
        ApiError::Status {
            status,
            body: body.into(),
            rate,
        }
    }

    #[test]
    fn rate_limit_uses_reset_hint_when_far() {
        let now = Utc::now();
        let rate = RateLimitInfo {
            reset: Some(now + Duration::minutes(30)),
            ..RateLimitInfo::default()
        };
        match classify(&status_error(429, "", rate), 0, false, now) {
            ErrorClass::RateLimited { mute, day_window } => {
                assert_eq!(mute, Duration::minutes(30));
                assert!(!day_window);
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn rate_limit_floors_at_fifteen_minutes() {
        let now = Utc::now();
        // Reset in the past: the floor applies.
        let rate = RateLimitInfo {
            remaining: Some(0),
            reset: Some(now - Duration::minutes(5)),
            ..RateLimitInfo::default()
        };
        match classify(&status_error(429, "", rate), 0, false, now) {
            ErrorClass::RateLimited { mute, .. } => assert_eq!(mute, min_rate_limit_mute()),
            other => panic!("unexpected class: {other:?}"),
        }

        // No headers at all: still the floor.
        match classify(&status_error(429, "", RateLimitInfo::default()), 0, false, now) {
            ErrorClass::RateLimited { mute, .. } => assert_eq!(mute, min_rate_limit_mute()),
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn day_window_exhaustion_is_flagged() {
        let now = Utc::now();
        let rate = RateLimitInfo {
            day_remaining: Some(0),
            day_reset: Some(now + Duration::hours(20)),
            ..RateLimitInfo::default()
        };
        match classify(&status_error(429, "", rate), 0, false, now) {
            ErrorClass::RateLimited { day_window, .. } => assert!(day_window),
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn first_401_refreshes_second_escalates() {
        let now = Utc::now();
        let err = status_error(401, "unauthorized", RateLimitInfo::default());
        assert_eq!(classify(&err, 0, false, now), ErrorClass::AuthExpired);
        assert_eq!(classify(&err, 0, true, now), ErrorClass::AuthFatal);
    }

    #[test]
    fn duplicate_body_wins_over_status() {
        let now = Utc::now();
        let err = status_error(403, "You have already liked this post", RateLimitInfo::default());
        assert_eq!(classify(&err, 0, false, now), ErrorClass::Duplicate);
    }

    #[test]
    fn server_errors_back_off_then_go_fatal() {
        let now = Utc::now();
        let err = status_error(503, "unavailable", RateLimitInfo::default());
        match classify(&err, 0, false, now) {
            ErrorClass::Retryable { backoff } => {
                assert_eq!(backoff, std::time::Duration::from_secs(2))
            }
            other => panic!("unexpected class: {other:?}"),
        }
        match classify(&err, 1, false, now) {
            ErrorClass::Retryable { backoff } => {
                assert_eq!(backoff, std::time::Duration::from_secs(4))
            }
            other => panic!("unexpected class: {other:?}"),
        }
        assert!(matches!(
            classify(&err, 2, false, now),
            ErrorClass::Fatal { .. }
        ));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_for(10), std::time::Duration::from_secs(RETRY_CAP_SECS));
    }

    #[test]
    fn timeouts_are_retryable() {
        let now = Utc::now();
        assert!(matches!(
            classify(&ApiError::Timeout, 0, false, now),
            ErrorClass::Retryable { .. }
        ));
    }

    #[test]
    fn invalid_request_and_policy_rejections_are_fatal() {
        let now = Utc::now();
        match classify(&status_error(400, "bad", RateLimitInfo::default()), 0, false, now) {
            ErrorClass::Fatal { detail } => assert_eq!(detail, "invalid_request"),
            other => panic!("unexpected class: {other:?}"),
        }
        match classify(&status_error(403, "nope", RateLimitInfo::default()), 0, false, now) {
            ErrorClass::Fatal { detail } => assert_eq!(detail, "content_policy_rejected"),
            other => panic!("unexpected class: {other:?}"),
        }
    }
}
