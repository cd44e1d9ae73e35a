//! Reply text generation.
//!
//! The engine treats text generation as an external, stateless provider: a
//! batch of posts goes in, at most one unique text per post comes out. A
//! failed or empty batch drops the reply actions for that batch; replies are
//! never retried on provider failure.

use async_trait::async_trait;
use fw_core::types::Post;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("provider HTTP error: {0}")]
    Http(String),
    #[error("provider error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("provider returned no usable texts")]
    Empty,
    #[error("unexpected provider response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ReplyError {
    fn from(err: reqwest::Error) -> Self {
        ReplyError::Http(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Style knobs forwarded to the provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StyleConfig {
    pub style: Option<String>,
    pub max_len: usize,
}

/// Generates reply texts for a batch of posts. Stateless per call.
#[async_trait]
pub trait ReplyTextProvider: Send + Sync {
    /// Returns at most `posts.len()` deduplicated texts, each within the
    /// configured length cap.
    async fn generate(&self, posts: &[Post], style: &StyleConfig) -> Result<Vec<String>, ReplyError>;
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    posts: Vec<PostContext<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<&'a str>,
    max_len: usize,
}

#[derive(Debug, Serialize)]
struct PostContext<'a> {
    author: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    texts: Vec<String>,
}

/// Provider backed by a JSON completion endpoint with bearer auth.
pub struct HttpReplyProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpReplyProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ReplyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplyError::Http(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ReplyTextProvider for HttpReplyProvider {
    async fn generate(&self, posts: &[Post], style: &StyleConfig) -> Result<Vec<String>, ReplyError> {
        if posts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateRequest {
            posts: posts
                .iter()
                .map(|p| PostContext {
                    author: &p.author_handle,
                    text: &p.text,
                })
                .collect(),
            style: style.style.as_deref(),
            max_len: style.max_len,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ReplyError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| ReplyError::Parse(e.to_string()))?;
        let texts = postprocess(parsed.texts, posts.len(), style.max_len);
        if texts.is_empty() {
            return Err(ReplyError::Empty);
        }
        debug!(requested = posts.len(), produced = texts.len(), "reply texts generated");
        Ok(texts)
    }
}

/// Dedup (order-preserving), drop blanks, enforce the length cap, and trim
/// the batch to size.
fn postprocess(texts: Vec<String>, batch_len: usize, max_len: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in texts {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let capped = cap_chars(trimmed, max_len);
        if seen.insert(capped.clone()) {
            out.push(capped);
        }
        if out.len() == batch_len {
            break;
        }
    }
    out
}

/// Truncate to `max` characters on a char boundary.
fn cap_chars(text: &str, max: usize) -> String {
    if max == 0 {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

/// Provider used when no generation endpoint is configured: every batch
/// fails, so planned replies are dropped (and logged) rather than sent
/// with placeholder text.
pub struct DisabledReplyProvider;

#[async_trait]
impl ReplyTextProvider for DisabledReplyProvider {
    async fn generate(&self, _posts: &[Post], _style: &StyleConfig) -> Result<Vec<String>, ReplyError> {
        Err(ReplyError::Empty)
    }
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Scripted provider for tests: queued outcomes, popped per call.
#[derive(Default)]
pub struct MockReplyProvider {
    responses: Mutex<VecDeque<Result<Vec<String>, ReplyError>>>,
}

impl MockReplyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<Vec<String>, ReplyError>) {
        self.responses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl ReplyTextProvider for MockReplyProvider {
    async fn generate(&self, posts: &[Post], style: &StyleConfig) -> Result<Vec<String>, ReplyError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(texts)) => Ok(postprocess(texts, posts.len(), style.max_len)),
            Some(Err(e)) => Err(e),
            None => Ok(posts
                .iter()
                .enumerate()
                .map(|(i, p)| format!("mock reply {} to {}", i + 1, p.id))
                .collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Image attachment policy
// ---------------------------------------------------------------------------

/// Optional image attachment for replies: when enabled, each reply draws
/// uniformly and attaches a randomly chosen local image id on success.
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    pub enabled: bool,
    pub probability: f64,
    pub dir: PathBuf,
}

impl ImagePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            probability: 0.0,
            dir: PathBuf::new(),
        }
    }

    /// Decide whether to attach an image, and which.
    pub fn draw(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() >= self.probability {
            return None;
        }
        let ids = self.available_ids();
        if ids.is_empty() {
            warn!(dir = %self.dir.display(), "image attachment enabled but no images found");
            return None;
        }
        let pick = rng.gen_range(0..ids.len());
        Some(ids[pick].clone())
    }

    /// Image ids are file stems under the images directory.
    pub fn available_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        ids
    }
}
