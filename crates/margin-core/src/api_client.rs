//! HTTP client for the margin analysis API.
//!
//! Every call goes through the same pipeline:
//!
//! ```text
//! cache lookup ─▶ coalescer ─▶ rate limiter ─▶ concurrency cap ─▶ transport
//!      ▲                                                             │
//!      └──────────────── decoded 2xx body written back ◀─────────────┘
//! ```
//!
//! Retries and circuit breaking are layered on top by the service; the
//! client itself makes exactly one network attempt per call.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batching::RequestCoalescer;
use crate::cache::CacheStore;
use crate::config::ServiceConfig;
use crate::domain::{QuoteAnalysis, QuoteId};
use crate::error::ApiError;
use crate::http_client::{default_headers, HttpAuth, HttpClient, HttpMethod, HttpRequest};
use crate::throttling::{RateLimitConfig, RequestPriority, RequestScheduler};

const QUOTE_ANALYSIS_TTL: Duration = Duration::from_secs(5 * 60);

/// Longest streamed record accepted before the stream is abandoned.
const MAX_STREAM_RECORD_BYTES: usize = 4 * 1024 * 1024;

pub const PREDICTIONS_ENDPOINT: &str = "/predictions";

/// Per-call options.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub priority: RequestPriority,
    /// Share the network call with identical concurrent requests.
    pub batchable: bool,
    /// Overrides the default cache TTL for this response.
    pub cache_ttl: Option<Duration>,
    /// Read and write the response cache.
    pub cache: bool,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            body: None,
            priority: RequestPriority::Medium,
            batchable: false,
            cache_ttl: None,
            cache: true,
            timeout: None,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::default()
        }
    }

    /// A write: never cached.
    pub fn mutation(method: HttpMethod, body: Option<Value>) -> Self {
        Self {
            method,
            body,
            cache: false,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn batchable(mut self) -> Self {
        self.batchable = true;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request counts by wall-clock latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatencyBuckets {
    pub under_100ms: u64,
    pub under_500ms: u64,
    pub under_1s: u64,
    pub under_5s: u64,
    pub over_5s: u64,
}

impl LatencyBuckets {
    fn record(&mut self, elapsed: Duration) {
        let bucket = match elapsed.as_millis() {
            0..=99 => &mut self.under_100ms,
            100..=499 => &mut self.under_500ms,
            500..=999 => &mut self.under_1s,
            1_000..=4_999 => &mut self.under_5s,
            _ => &mut self.over_5s,
        };
        *bucket += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiMetrics {
    /// Calls to [`ApiClient::request`] and [`ApiClient::stream_large_dataset`].
    pub total_requests: u64,
    /// Calls that reached the transport.
    pub network_requests: u64,
    pub cache_hits: u64,
    pub coalesced_requests: u64,
    /// Calls delayed or rejected by the client-side rate limiter.
    pub rate_limited: u64,
    pub errors: u64,
    pub queued: usize,
    pub average_latency_ms: f64,
    pub latency: LatencyBuckets,
}

#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    network_requests: u64,
    cache_hits: u64,
    errors: u64,
    latency_total: Duration,
    latency: LatencyBuckets,
}

#[derive(Debug, Clone)]
struct ClientSettings {
    enable_caching: bool,
    enable_batching: bool,
    request_timeout: Duration,
    batch_window: Duration,
}

impl ClientSettings {
    fn from_config(config: &ServiceConfig) -> Self {
        Self {
            enable_caching: config.enable_caching,
            enable_batching: config.enable_batching,
            request_timeout: config.request_timeout,
            batch_window: config.batch_window,
        }
    }
}

/// Cached, rate-limited and coalescing client for the margin analysis API.
pub struct ApiClient {
    base_url: String,
    auth: HttpAuth,
    http: Arc<dyn HttpClient>,
    cache: CacheStore,
    scheduler: RequestScheduler,
    coalescer: RequestCoalescer,
    permits: RwLock<(usize, Arc<Semaphore>)>,
    settings: RwLock<ClientSettings>,
    stats: Mutex<ApiStats>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(config: &ServiceConfig, http: Arc<dyn HttpClient>) -> Self {
        let max_concurrent = config.max_concurrent_requests.max(1);
        Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth: HttpAuth::from_token(config.auth_token.as_deref()),
            http,
            cache: CacheStore::with_capacity(config.default_cache_ttl, config.cache_max_entries),
            scheduler: RequestScheduler::new(config.rate_limit),
            coalescer: RequestCoalescer::new(),
            permits: RwLock::new((max_concurrent, Arc::new(Semaphore::new(max_concurrent)))),
            settings: RwLock::new(ClientSettings::from_config(config)),
            stats: Mutex::new(ApiStats::default()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Response cache shared with the service.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn stats(&self) -> MutexGuard<'_, ApiStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> ClientSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits.read().unwrap_or_else(PoisonError::into_inner).1)
    }

    /// Re-read the tunables from `config`. Calls already in flight keep
    /// the settings they started with.
    pub async fn configure(&self, config: &ServiceConfig) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) =
            ClientSettings::from_config(config);

        let max_concurrent = config.max_concurrent_requests.max(1);
        {
            let mut permits = self.permits.write().unwrap_or_else(PoisonError::into_inner);
            if permits.0 != max_concurrent {
                *permits = (max_concurrent, Arc::new(Semaphore::new(max_concurrent)));
            }
        }

        self.cache.set_default_ttl(config.default_cache_ttl).await;
        self.scheduler.set_rate_limit(config.rate_limit);
    }

    /// Applies to requests that have not yet been admitted.
    pub fn set_rate_limit(&self, config: RateLimitConfig) {
        self.scheduler.set_rate_limit(config);
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        self.scheduler.config()
    }

    /// Issue one call to `endpoint` (relative to the base url) and decode the
    /// 2xx body into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        match self.cached(endpoint, &options).await {
            Some(hit) => Ok(hit),
            None => self.fetch(endpoint, options).await,
        }
    }

    /// Cache lookup alone. `None` when caching is off for the call, on a
    /// miss, or when the cached value no longer decodes into `T`.
    pub async fn cached<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Option<T> {
        if !(options.cache && self.settings().enable_caching) {
            return None;
        }

        let key = cache_key(options.method, endpoint, options.body.as_ref());
        let value = self.cache.get_value(&key).await?;
        match decode::<T>(endpoint, value) {
            Ok(typed) => {
                let mut stats = self.stats();
                stats.total_requests += 1;
                stats.cache_hits += 1;
                Some(typed)
            }
            Err(error) => {
                warn!(endpoint, %error, "cached response no longer decodes; refetching");
                self.cache.invalidate(&key).await;
                None
            }
        }
    }

    /// Network path of [`Self::request`]: skips the cache read but still
    /// writes a successful response back.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.stats().total_requests += 1;
        let settings = self.settings();
        let use_cache = options.cache && settings.enable_caching;
        let key = cache_key(options.method, endpoint, options.body.as_ref());

        let result = if options.batchable && settings.enable_batching {
            self.coalescer
                .run(&key, settings.batch_window, || {
                    self.dispatch(endpoint, &options, &settings)
                })
                .await
        } else {
            self.dispatch(endpoint, &options, &settings).await
        };

        let outcome = result.and_then(|value| {
            let typed = decode::<T>(endpoint, value.clone())?;
            Ok((typed, value))
        });

        match outcome {
            Ok((typed, value)) => {
                if use_cache {
                    self.cache.put_value(key, value, options.cache_ttl).await;
                }
                Ok(typed)
            }
            Err(error) => {
                self.stats().errors += 1;
                debug!(endpoint, kind = %error.kind(), error = %error.message(), "request failed");
                Err(error)
            }
        }
    }

    async fn dispatch(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        settings: &ClientSettings,
    ) -> Result<Value, ApiError> {
        self.scheduler.acquire(options.priority).await?;

        let semaphore = self.semaphore();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| ApiError::unknown("request pool closed"))?;

        let timeout = options.timeout.unwrap_or(settings.request_timeout);
        let request = self
            .build_request(endpoint, options.method, options.body.as_ref())?
            .with_timeout(Some(timeout));

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.http.execute(request)).await;
        self.record_latency(started.elapsed());

        let response = match outcome {
            Err(_) => {
                return Err(ApiError::timeout(format!(
                    "{endpoint} did not respond within {}ms",
                    timeout.as_millis()
                )))
            }
            Ok(result) => result?,
        };

        if !response.is_success() {
            return Err(response.to_error());
        }

        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&response.body).map_err(|error| {
            ApiError::invalid_response(format!("{endpoint} returned malformed JSON: {error}"))
        })
    }

    fn build_request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        body: Option<&Value>,
    ) -> Result<HttpRequest, ApiError> {
        let mut request = HttpRequest::new(method, join_url(&self.base_url, endpoint))
            .with_headers(default_headers(&self.auth))
            .with_header("x-request-id", Uuid::new_v4().to_string());

        if let Some(body) = body {
            let encoded = serde_json::to_string(body).map_err(|error| {
                ApiError::validation(format!("request body could not be encoded: {error}"))
            })?;
            request = request.with_body(encoded);
        }
        Ok(request)
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut stats = self.stats();
        stats.network_requests += 1;
        stats.latency_total += elapsed;
        stats.latency.record(elapsed);
    }

    /// AI analysis for one quote: `POST /predictions` at high priority.
    pub async fn analyze_quote(&self, quote_id: &QuoteId) -> Result<QuoteAnalysis, ApiError> {
        self.request(PREDICTIONS_ENDPOINT, quote_analysis_options(quote_id))
            .await
    }

    /// Streams newline-delimited JSON records from `endpoint` into
    /// `on_record` as they arrive. Returning `ControlFlow::Break` stops the
    /// download. Returns the number of records delivered.
    pub async fn stream_large_dataset<T, F>(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        mut on_record: F,
    ) -> Result<usize, ApiError>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> ControlFlow<()>,
    {
        self.stats().total_requests += 1;
        let result = self.stream_inner(endpoint, body, &mut on_record).await;
        if let Err(error) = &result {
            self.stats().errors += 1;
            warn!(endpoint, kind = %error.kind(), error = %error.message(), "stream failed");
        }
        result
    }

    async fn stream_inner<T, F>(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        on_record: &mut F,
    ) -> Result<usize, ApiError>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> ControlFlow<()>,
    {
        self.scheduler.acquire(RequestPriority::Low).await?;
        let semaphore = self.semaphore();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| ApiError::unknown("request pool closed"))?;

        let method = if body.is_some() {
            HttpMethod::Post
        } else {
            HttpMethod::Get
        };
        let request = self
            .build_request(endpoint, method, body)?
            .with_header("accept", "application/x-ndjson")
            .with_timeout(None);

        let started = Instant::now();
        let response = self.http.execute_stream(request).await?;
        self.record_latency(started.elapsed());

        if !(200..300).contains(&response.status) {
            return Err(ApiError::from_status(response.status, &response.status_text));
        }

        let mut chunks = response.chunks;
        let mut lines = LineSplitter::new(MAX_STREAM_RECORD_BYTES);
        let mut delivered = 0usize;

        while let Some(chunk) = chunks.next().await {
            lines.push(&chunk?);

            while let Some(line) = lines.next_line() {
                if let Some(record) = decode_line::<T>(endpoint, line)? {
                    delivered += 1;
                    if on_record(record).is_break() {
                        debug!(endpoint, delivered, "stream cancelled by consumer");
                        return Ok(delivered);
                    }
                }
            }

            if lines.is_over_limit() {
                return Err(ApiError::invalid_response(format!(
                    "{endpoint} streamed a record longer than {MAX_STREAM_RECORD_BYTES} bytes"
                )));
            }
        }

        if let Some(record) = decode_line::<T>(endpoint, lines.remainder())? {
            delivered += 1;
            let _ = on_record(record);
        }

        debug!(endpoint, delivered, "stream complete");
        Ok(delivered)
    }

    pub fn metrics(&self) -> ApiMetrics {
        let stats = self.stats();
        let average_latency_ms = if stats.network_requests == 0 {
            0.0
        } else {
            stats.latency_total.as_secs_f64() * 1_000.0 / stats.network_requests as f64
        };

        ApiMetrics {
            total_requests: stats.total_requests,
            network_requests: stats.network_requests,
            cache_hits: stats.cache_hits,
            coalesced_requests: self.coalescer.coalesced_count(),
            rate_limited: self.scheduler.throttled_count(),
            errors: stats.errors,
            queued: self.scheduler.waiting_len(),
            average_latency_ms,
            latency: stats.latency,
        }
    }

    /// Drops cached responses, pending batches and counters.
    pub async fn reset(&self) {
        self.cache.clear().await;
        self.coalescer.clear();
        self.scheduler.reset_metrics();
        *self.stats() = ApiStats::default();
        debug!("api client reset");
    }
}

/// Options used for `POST /predictions`.
pub fn quote_analysis_options(quote_id: &QuoteId) -> RequestOptions {
    RequestOptions::post(json!({ "quote_id": quote_id }))
        .with_priority(RequestPriority::High)
        .with_cache_ttl(QUOTE_ANALYSIS_TTL)
        .batchable()
}

/// `METHOD:endpoint:body`, with object keys in sorted order.
pub fn cache_key(method: HttpMethod, endpoint: &str, body: Option<&Value>) -> String {
    let body = body.map_or_else(|| String::from("null"), canonical_json);
    format!("{method}:{endpoint}:{body}")
}

fn canonical_json(value: &Value) -> String {
    // serde_json's default map is ordered, so objects already serialize with
    // sorted keys.
    value.to_string()
}

fn join_url(base_url: &str, endpoint: &str) -> String {
    match endpoint.trim_start_matches('/') {
        "" => base_url.to_owned(),
        path => format!("{base_url}/{path}"),
    }
}

/// Path segment for ids embedded in endpoints such as `/alerts/{id}`.
pub fn path_segment(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

fn decode<T: DeserializeOwned>(endpoint: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|error| {
        ApiError::invalid_response(format!(
            "{endpoint} returned an unexpected payload: {error}"
        ))
    })
}

fn decode_line<T: DeserializeOwned>(endpoint: &str, line: &[u8]) -> Result<Option<T>, ApiError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(trimmed).map(Some).map_err(|error| {
        ApiError::invalid_response(format!("{endpoint} streamed a malformed record: {error}"))
    })
}

/// Splits streamed bytes into newline-terminated records. Each byte is
/// scanned once; the consumed prefix is dropped on the next push.
#[derive(Debug)]
struct LineSplitter {
    pending: Vec<u8>,
    start: usize,
    scanned: usize,
    max_line: usize,
}

impl LineSplitter {
    fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            start: 0,
            scanned: 0,
            max_line,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.pending.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<&[u8]> {
        match self.pending[self.scanned..].iter().position(|byte| *byte == b'\n') {
            Some(offset) => {
                let newline = self.scanned + offset;
                let line = &self.pending[self.start..newline];
                self.start = newline + 1;
                self.scanned = self.start;
                Some(line)
            }
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    /// The unterminated tail has outgrown `max_line`.
    fn is_over_limit(&self) -> bool {
        self.pending.len() - self.start > self.max_line
    }

    fn remainder(&self) -> &[u8] {
        &self.pending[self.start..]
    }
}
