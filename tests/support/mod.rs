//! Scripted in-memory transport shared by the behavior tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use margin_core::{
    Backoff, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, RetryPolicy,
    ServiceConfig, StreamingResponse,
};
use serde_json::Value;

pub const BASE_URL: &str = "http://test.local/api/margin-analysis";

/// Canned reply for a scripted route.
#[derive(Debug, Clone)]
pub enum Reply {
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    Error(HttpError),
}

impl Reply {
    pub fn json(body: Value) -> Self {
        Self::Status {
            status: 200,
            body: body.to_string(),
            retry_after: None,
        }
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: body.to_owned(),
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::raw(status, "")
    }

    pub fn too_many_requests(retry_after: Duration) -> Self {
        Self::Status {
            status: 429,
            body: String::new(),
            retry_after: Some(retry_after),
        }
    }

    pub fn connect_error() -> Self {
        Self::Error(HttpError::connect("connection refused"))
    }
}

#[derive(Debug)]
struct Rule {
    method: HttpMethod,
    path: String,
    body_contains: Option<String>,
    queued: VecDeque<Reply>,
    repeat: Option<Reply>,
}

impl Rule {
    fn matches(&self, method: HttpMethod, path: &str, body: &str) -> bool {
        self.method == method
            && self.path == path
            && self
                .body_contains
                .as_deref()
                .map_or(true, |needle| body.contains(needle))
            && (!self.queued.is_empty() || self.repeat.is_some())
    }

    fn next_reply(&mut self) -> Option<Reply> {
        self.queued.pop_front().or_else(|| self.repeat.clone())
    }
}

/// Transport double: replies come from scripted rules, every request is
/// recorded. Later rules take precedence over earlier ones.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    rules: Mutex<Vec<Rule>>,
    streams: Mutex<Vec<(String, Vec<String>)>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, rule: Rule) {
        self.rules.lock().expect("rules lock").push(rule);
    }

    /// Answer every matching request with `reply`.
    pub fn always(&self, method: HttpMethod, path: &str, reply: Reply) {
        self.push(Rule {
            method,
            path: path.to_owned(),
            body_contains: None,
            queued: VecDeque::new(),
            repeat: Some(reply),
        });
    }

    /// Like [`Self::always`], restricted to bodies containing `needle`.
    pub fn always_when_body_contains(
        &self,
        method: HttpMethod,
        path: &str,
        needle: &str,
        reply: Reply,
    ) {
        self.push(Rule {
            method,
            path: path.to_owned(),
            body_contains: Some(needle.to_owned()),
            queued: VecDeque::new(),
            repeat: Some(reply),
        });
    }

    /// Replies consumed in order; the last one repeats.
    pub fn sequence(&self, method: HttpMethod, path: &str, replies: Vec<Reply>) {
        let mut queued: VecDeque<Reply> = replies.into();
        let repeat = queued.pop_back();
        self.push(Rule {
            method,
            path: path.to_owned(),
            body_contains: None,
            queued,
            repeat,
        });
    }

    /// Streamed body delivered as the given chunks.
    pub fn stream(&self, path: &str, chunks: &[&str]) {
        self.streams.lock().expect("streams lock").push((
            path.to_owned(),
            chunks.iter().map(|chunk| (*chunk).to_owned()).collect(),
        ));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency lock") = Some(latency);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls_to(&self, method: HttpMethod, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == method && path_of(&request.url) == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    fn reply_for(&self, request: &HttpRequest) -> Reply {
        let path = path_of(&request.url);
        let body = request.body.clone().unwrap_or_default();
        let mut rules = self.rules.lock().expect("rules lock");
        rules
            .iter_mut()
            .rev()
            .find(|rule| rule.matches(request.method, &path, &body))
            .and_then(Rule::next_reply)
            .unwrap_or_else(|| Reply::raw(404, r#"{"error":"not scripted"}"#))
    }
}

fn path_of(url: &str) -> String {
    match url.strip_prefix(BASE_URL).unwrap_or(url) {
        "" => String::from("/"),
        path => path.to_owned(),
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            let reply = self.reply_for(&request);

            let latency = *self.latency.lock().expect("latency lock");
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            match reply {
                Reply::Status {
                    status,
                    body,
                    retry_after,
                } => Ok(HttpResponse {
                    status,
                    status_text: String::new(),
                    retry_after,
                    body,
                }),
                Reply::Error(error) => Err(error),
            }
        })
    }

    fn execute_stream<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StreamingResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let path = path_of(&request.url);
            self.requests
                .lock()
                .expect("requests lock")
                .push(request);

            let chunks = self
                .streams
                .lock()
                .expect("streams lock")
                .iter()
                .rev()
                .find(|(stream_path, _)| *stream_path == path)
                .map(|(_, chunks)| chunks.clone());

            match chunks {
                Some(chunks) => Ok(StreamingResponse {
                    status: 200,
                    status_text: String::from("OK"),
                    chunks: Box::pin(futures::stream::iter(
                        chunks.into_iter().map(|chunk| Ok(chunk.into_bytes())),
                    )),
                }),
                None => Ok(StreamingResponse {
                    status: 404,
                    status_text: String::from("Not Found"),
                    chunks: Box::pin(futures::stream::empty()),
                }),
            }
        })
    }
}

/// Retry policy with millisecond delays so tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Backoff::Fixed {
            delay: Duration::from_millis(1),
        },
        rate_limit_factor: 1.0,
    }
}

/// Config pointed at [`BASE_URL`] with fast retries and no bulk delay.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        base_url: String::from(BASE_URL),
        retry: fast_retry(3),
        batch_window: Duration::from_millis(5),
        bulk_batch_delay: Duration::from_millis(1),
        ..ServiceConfig::default()
    }
}
