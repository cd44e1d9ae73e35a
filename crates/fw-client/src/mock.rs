//! Scripted in-memory implementation of [`PlatformApi`] for tests.
//!
//! Responses are queued per endpoint and popped in order; when a queue is
//! empty the mock falls back to a benign success. Every call is recorded so
//! tests can assert on traffic shape.

use crate::ratelimit::RateLimitInfo;
use crate::rest::{
    ApiError, ApiResponse, EngagementResult, PlatformApi, PostedReply, SearchPage, UserProfile,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

type Scripted<T> = Mutex<VecDeque<Result<ApiResponse<T>, ApiError>>>;

/// One recorded call: endpoint name plus the interesting argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub endpoint: &'static str,
    pub detail: String,
}

#[derive(Default)]
pub struct MockPlatform {
    search_responses: Scripted<SearchPage>,
    like_responses: Scripted<EngagementResult>,
    repost_responses: Scripted<EngagementResult>,
    reply_responses: Scripted<PostedReply>,
    me_responses: Scripted<UserProfile>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_search(&self, response: Result<ApiResponse<SearchPage>, ApiError>) {
        self.search_responses.lock().unwrap().push_back(response);
    }

    pub fn push_like(&self, response: Result<ApiResponse<EngagementResult>, ApiError>) {
        self.like_responses.lock().unwrap().push_back(response);
    }

    pub fn push_repost(&self, response: Result<ApiResponse<EngagementResult>, ApiError>) {
        self.repost_responses.lock().unwrap().push_back(response);
    }

    pub fn push_reply(&self, response: Result<ApiResponse<PostedReply>, ApiError>) {
        self.reply_responses.lock().unwrap().push_back(response);
    }

    pub fn push_me(&self, response: Result<ApiResponse<UserProfile>, ApiError>) {
        self.me_responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    fn record(&self, endpoint: &'static str, detail: impl Into<String>) {
        self.calls.lock().unwrap().push(RecordedCall {
            endpoint,
            detail: detail.into(),
        });
    }

    fn ok<T>(body: T) -> Result<ApiResponse<T>, ApiError> {
        Ok(ApiResponse {
            body,
            rate: RateLimitInfo::default(),
        })
    }
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn search(
        &self,
        query: &str,
        _since_id: Option<&str>,
        _max_results: u32,
    ) -> Result<ApiResponse<SearchPage>, ApiError> {
        self.record("search", query);
        self.search_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::ok(SearchPage::default()))
    }

    async fn like(&self, _user_id: &str, post_id: &str) -> Result<ApiResponse<EngagementResult>, ApiError> {
        self.record("like", post_id);
        self.like_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::ok(EngagementResult { done: true }))
    }

    async fn repost(
        &self,
        _user_id: &str,
        post_id: &str,
    ) -> Result<ApiResponse<EngagementResult>, ApiError> {
        self.record("repost", post_id);
        self.repost_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::ok(EngagementResult { done: true }))
    }

    async fn reply(
        &self,
        _text: &str,
        in_reply_to: &str,
        _media_id: Option<&str>,
    ) -> Result<ApiResponse<PostedReply>, ApiError> {
        self.record("reply", in_reply_to);
        self.reply_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::ok(PostedReply { id: "reply-1".into() }))
    }

    async fn me(&self) -> Result<ApiResponse<UserProfile>, ApiError> {
        self.record("me", "");
        self.me_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Self::ok(UserProfile {
                    id: "mock-user".into(),
                    username: "mock".into(),
                })
            })
    }
}
