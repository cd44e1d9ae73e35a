use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// The engagement actions the engine can perform on a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Like,
    Repost,
    Reply,
}

impl ActionKind {
    /// All kinds, in planning order.
    pub const ALL: [ActionKind; 3] = [ActionKind::Like, ActionKind::Repost, ActionKind::Reply];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Like => write!(f, "like"),
            ActionKind::Repost => write!(f, "repost"),
            ActionKind::Reply => write!(f, "reply"),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Credential material for acting as an account.
///
/// Two authentication generations are supported: the legacy 1-leg quadruple
/// and the modern refreshable token pair. The client factory pattern-matches
/// this once when building an API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "auth_kind", rename_all = "snake_case")]
pub enum Credentials {
    Legacy {
        app_key: String,
        app_secret: String,
        access_token: String,
        access_secret: String,
    },
    Modern {
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
        scopes: Vec<String>,
    },
}

impl Credentials {
    pub fn is_modern(&self) -> bool {
        matches!(self, Credentials::Modern { .. })
    }

    /// Time at which the access token expires, for modern credentials.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credentials::Legacy { .. } => None,
            Credentials::Modern { expires_at, .. } => Some(*expires_at),
        }
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RequiresReconnection,
}

/// An authenticated identity usable to perform actions.
///
/// `id` is the platform user id handed back by the connect flow; it is what
/// like/repost calls are issued against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub credentials: Credentials,
    pub added_at: DateTime<Utc>,
    pub status: AccountStatus,
}

impl Account {
    pub fn new(id: impl Into<String>, username: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            credentials,
            added_at: Utc::now(),
            status: AccountStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Post
// ---------------------------------------------------------------------------

/// A discovered post. Ephemeral; only the id feeds the idempotency ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_handle: String,
    pub created_at: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub is_repost: bool,
    #[serde(default)]
    pub is_quote: bool,
}

// ---------------------------------------------------------------------------
// PlannedAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent = 0,
    Normal = 1,
    Low = 2,
}

/// A deferred action waiting in an account queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub post_id: String,
    pub account_id: String,
    pub kind: ActionKind,
    pub scheduled_at: DateTime<Utc>,
    pub priority: Priority,
    pub attempt_count: u32,
    /// Generated text for reply actions; bound to exactly this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    /// Optional local image id attached to a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

// ---------------------------------------------------------------------------
// ActionReceipt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Ok,
    Duplicate,
    RateLimited,
    AuthFailed,
    QuotaBlocked,
    Fatal,
    Cancelled,
}

/// Immutable record of an attempted action and its outcome class.
///
/// One receipt is appended for every planned action that reaches a terminal
/// state; nothing is dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub post_id: String,
    pub account_id: String,
    pub kind: ActionKind,
    pub status: ReceiptStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl ActionReceipt {
    pub fn new(
        post_id: impl Into<String>,
        account_id: impl Into<String>,
        kind: ActionKind,
        status: ReceiptStatus,
    ) -> Self {
        Self {
            post_id: post_id.into(),
            account_id: account_id.into(),
            kind,
            status,
            timestamp: Utc::now(),
            error_class: None,
        }
    }

    pub fn with_error_class(mut self, class: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Quota snapshot types
// ---------------------------------------------------------------------------

/// Per-kind counters used for daily distribution and per-account usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub like: u64,
    pub repost: u64,
    pub reply: u64,
}

impl KindCounts {
    pub fn get(&self, kind: ActionKind) -> u64 {
        match kind {
            ActionKind::Like => self.like,
            ActionKind::Repost => self.repost,
            ActionKind::Reply => self.reply,
        }
    }

    pub fn add(&mut self, kind: ActionKind, n: u64) {
        match kind {
            ActionKind::Like => self.like += n,
            ActionKind::Repost => self.repost += n,
            ActionKind::Reply => self.reply += n,
        }
    }

    pub fn sub(&mut self, kind: ActionKind, n: u64) {
        match kind {
            ActionKind::Like => self.like = self.like.saturating_sub(n),
            ActionKind::Repost => self.repost = self.repost.saturating_sub(n),
            ActionKind::Reply => self.reply = self.reply.saturating_sub(n),
        }
    }

    pub fn total(&self) -> u64 {
        self.like + self.repost + self.reply
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PackQuota {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyQuota {
    pub limit: u64,
    pub used: u64,
    pub distribution: KindCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountQuota {
    pub daily_limit: u64,
    pub daily_used: KindCounts,
}

/// Point-in-time view of the quota ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub global_pack: PackQuota,
    pub daily: DailyQuota,
    pub accounts: BTreeMap<String, AccountQuota>,
    pub last_reset_date: String,
}

// ---------------------------------------------------------------------------
// Mutes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteReason {
    RateLimitShort,
    RateLimit24h,
    AuthFailed,
    Explicit,
}

impl fmt::Display for MuteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuteReason::RateLimitShort => write!(f, "rate_limit_short"),
            MuteReason::RateLimit24h => write!(f, "rate_limit_24h"),
            MuteReason::AuthFailed => write!(f, "auth_failed"),
            MuteReason::Explicit => write!(f, "explicit"),
        }
    }
}

/// A time-bounded suspension of dispatch for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRecord {
    pub until: DateTime<Utc>,
    pub reason: MuteReason,
}
