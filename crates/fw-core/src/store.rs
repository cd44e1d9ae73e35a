//! File persistence primitives shared by the ledgers.
//!
//! Two shapes of storage back the engine: whole-document JSON files written
//! atomically (write-tmp + rename), and an append-only JSONL log for
//! receipts. JSONL recovery truncates at most one trailing partial line;
//! anything worse is surfaced as corruption and left to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt store file {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },
}

// ---------------------------------------------------------------------------
// Atomic document files
// ---------------------------------------------------------------------------

/// Read a JSON document, returning `None` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON document atomically: serialize, write to a sibling `.tmp`
/// file, then rename over the destination.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &json).await
}

/// Atomically replace `path` with `bytes`.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// JsonlLog
// ---------------------------------------------------------------------------

/// Append-only log of JSON records, one per line.
pub struct JsonlLog {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlLog {
    /// Open (or create) a log file, running crash recovery first.
    ///
    /// A single trailing line that fails to parse (the typical result of a
    /// crash mid-append) is truncated away. A malformed line anywhere else
    /// means the file is corrupt beyond the one-shot recovery and is
    /// rejected.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::recover(&path).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    async fn recover(path: &Path) -> Result<(), StoreError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if text.is_empty() {
            return Ok(());
        }

        let mut keep = 0usize;
        let mut bad_interior = None;
        let mut offset = 0usize;
        let line_count = text.lines().count();
        for (idx, line) in text.lines().enumerate() {
            let line_len = line.len();
            let trimmed = line.trim();
            let parses = trimmed.is_empty()
                || serde_json::from_str::<serde_json::Value>(trimmed).is_ok();
            if parses {
                keep = offset + line_len + 1; // include the newline
            } else if idx + 1 == line_count {
                // trailing partial line: truncate it away below
            } else {
                bad_interior = Some(idx + 1);
                break;
            }
            offset += line_len + 1;
        }

        if let Some(line_no) = bad_interior {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                detail: format!("unparseable record at line {line_no}"),
            });
        }

        if keep < text.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = text.len() - keep,
                "truncating partial trailing record from log"
            );
            tokio::fs::write(path, &text[..keep]).await?;
        } else if !text.ends_with('\n') {
            // Last record parsed but its newline never made it to disk;
            // restore it so the next append starts a fresh line.
            let mut restored = text;
            restored.push('\n');
            tokio::fs::write(path, restored).await?;
        }
        Ok(())
    }

    /// Append one record, flushed to disk before returning.
    pub async fn append<T: Serialize>(&self, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record back, skipping blank lines.
    pub async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            out.push(serde_json::from_str(trimmed).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })?);
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: u32,
    }

    #[tokio::test]
    async fn json_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        assert!(read_json::<Rec>(&path).await.unwrap().is_none());

        write_json_atomic(&path, &Rec { n: 7 }).await.unwrap();
        assert_eq!(read_json::<Rec>(&path).await.unwrap(), Some(Rec { n: 7 }));
        // No tmp file left behind.
        assert!(!path.with_file_name("doc.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        tokio::fs::write(&path, b"{ nope").await.unwrap();
        assert!(matches!(
            read_json::<Rec>(&path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn jsonl_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::open(dir.path().join("a.jsonl")).await.unwrap();
        log.append(&Rec { n: 1 }).await.unwrap();
        log.append(&Rec { n: 2 }).await.unwrap();
        let all: Vec<Rec> = log.read_all().await.unwrap();
        assert_eq!(all, vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[tokio::test]
    async fn jsonl_recovers_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        tokio::fs::write(&path, "{\"n\":1}\n{\"n\":2}\n{\"n\":").await.unwrap();

        let log = JsonlLog::open(&path).await.unwrap();
        let all: Vec<Rec> = log.read_all().await.unwrap();
        assert_eq!(all, vec![Rec { n: 1 }, Rec { n: 2 }]);

        // Appends continue cleanly after recovery.
        log.append(&Rec { n: 3 }).await.unwrap();
        let all: Vec<Rec> = log.read_all().await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn jsonl_interior_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        tokio::fs::write(&path, "{\"n\":1}\ngarbage\n{\"n\":2}\n")
            .await
            .unwrap();
        assert!(matches!(
            JsonlLog::open(&path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
