//! Append-only audit log of action attempts.

use crate::store::{JsonlLog, StoreError};
use crate::types::{ActionKind, ActionReceipt, ReceiptStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Filter for receipt export. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReceiptFilter {
    pub account_id: Option<String>,
    pub kind: Option<ActionKind>,
    pub status: Option<ReceiptStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ReceiptFilter {
    fn matches(&self, receipt: &ActionReceipt) -> bool {
        if let Some(account) = &self.account_id {
            if &receipt.account_id != account {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if receipt.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if receipt.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if receipt.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if receipt.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Durable receipt log backed by a JSONL file.
pub struct ReceiptLog {
    log: JsonlLog,
}

impl ReceiptLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            log: JsonlLog::open(path).await?,
        })
    }

    /// Append one receipt, flushed before returning.
    pub async fn append(&self, receipt: &ActionReceipt) -> Result<(), StoreError> {
        self.log.append(receipt).await
    }

    /// Export receipts matching `filter`, in append order.
    pub async fn export(&self, filter: &ReceiptFilter) -> Result<Vec<ActionReceipt>, StoreError> {
        let all: Vec<ActionReceipt> = self.log.read_all().await?;
        Ok(all.into_iter().filter(|r| filter.matches(r)).collect())
    }

    /// Receipt counts keyed by outcome class, for the status surface.
    pub async fn counts_by_status(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let all: Vec<ActionReceipt> = self.log.read_all().await?;
        let mut counts = BTreeMap::new();
        for receipt in all {
            let key = serde_json::to_value(receipt.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".into());
            *counts.entry(key).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
