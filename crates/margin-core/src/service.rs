//! # Margin Analysis Service
//!
//! Facade composing the [`ApiClient`], the response cache and the
//! [`ErrorHandler`] into one method per business query.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──initialize()──▶ Ready ──cleanup()──▶ Uninitialized
//! ```
//!
//! `initialize` applies the configured rate limit, warms the configured
//! datasets and starts the periodic cache sweep. It runs at most once per
//! lifecycle even under concurrent callers; every business method calls it
//! transparently.
//!
//! ## Resilience
//!
//! Most queries retry transient failures with the configured policy.
//! Quote analysis and anomaly detection run behind named circuit breakers
//! instead, so a failing model service is not hammered. With offline support
//! enabled, a query that fails with a transient, timeout or circuit-open
//! error returns the last good response for the same request.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api_client::{
    cache_key, path_segment, quote_analysis_options, ApiClient, ApiMetrics, RequestOptions,
    PREDICTIONS_ENDPOINT,
};
use crate::cache::{CacheMetrics, CacheStore};
use crate::config::{ConfigUpdate, ServiceConfig, WarmDataset};
use crate::domain::{
    AdvancedAnalytics, AiInsights, Alert, AlertUpdate, AnalyticsParams, AnomalyReport, Approval,
    ApprovalDecision, ApprovalRequest, BusinessReport, FeedbackReceipt, MarginAnalysis,
    MarginAnalysisParams, MarginRecord, MlModelCatalog, NewAlert, PredictionFeedback,
    QuoteAnalysis, QuoteId, SearchQuery, SearchResults, TrainingJob, TrainingRequest,
};
use crate::error::{ApiError, ConfigError, ErrorContext, ErrorKind, ServiceError, ValidationError};
use crate::error_handler::{ErrorHandler, ErrorMetrics, QuoteAnalysisFallback};
use crate::http_client::{HttpClient, HttpMethod, ReqwestHttpClient};

const MINUTE: Duration = Duration::from_secs(60);

const QUOTE_ANALYSIS_CIRCUIT: &str = "quote_analysis";
const ANOMALY_DETECTION_CIRCUIT: &str = "anomaly_detection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Uninitialized,
    Ready,
}

/// Result for one quote of [`MarginAnalysisService::analyze_bulk_quotes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BulkQuoteOutcome {
    Analyzed(QuoteAnalysis),
    Fallback(QuoteAnalysisFallback),
}

impl BulkQuoteOutcome {
    /// The analysis, or its placeholder on failure.
    pub fn analysis(&self) -> &QuoteAnalysis {
        match self {
            Self::Analyzed(analysis) => analysis,
            Self::Fallback(fallback) => &fallback.fallback_data,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// Point-in-time view of every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub state: ServiceState,
    pub cache: CacheMetrics,
    pub errors: ErrorMetrics,
    pub api: ApiMetrics,
    pub offline_snapshots: usize,
    /// Current configuration with the auth token redacted.
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, Copy)]
enum Resilience {
    Retry,
    Circuit(&'static str),
}

pub struct MarginAnalysisService {
    config: RwLock<ServiceConfig>,
    api: ApiClient,
    errors: ErrorHandler,
    state: RwLock<ServiceState>,
    lifecycle: tokio::sync::Mutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    offline: Mutex<HashMap<String, Value>>,
}

impl std::fmt::Debug for MarginAnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarginAnalysisService")
            .field("state", &self.state())
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}

impl MarginAnalysisService {
    pub fn new(config: ServiceConfig, http: Arc<dyn HttpClient>) -> Result<Self, ConfigError> {
        config.validate()?;
        let api = ApiClient::new(&config, http);
        let errors = ErrorHandler::new(config.retry.clone(), config.circuit_breaker);

        Ok(Self {
            config: RwLock::new(config),
            api,
            errors,
            state: RwLock::new(ServiceState::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
            sweeper: Mutex::new(None),
            offline: Mutex::new(HashMap::new()),
        })
    }

    /// Service configured from `MARGIN_*` variables over reqwest.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ServiceConfig::from_env()?, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn config(&self) -> ServiceConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.errors
    }

    fn cache(&self) -> &CacheStore {
        self.api.cache()
    }

    fn offline(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.offline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One-time setup. Later calls return immediately until [`Self::cleanup`].
    pub async fn initialize(&self) {
        if self.state() == ServiceState::Ready {
            return;
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ServiceState::Ready {
            return;
        }

        let config = self.config();
        self.api.set_rate_limit(config.rate_limit);

        let mut warmed = 0usize;
        for dataset in &config.warm_up {
            if self.warm_cache(*dataset).await {
                warmed += 1;
            }
        }

        self.start_sweeper(config.cache_sweep_interval);
        self.set_state(ServiceState::Ready);
        info!(
            base_url = %self.api.base_url(),
            warmed,
            requested = config.warm_up.len(),
            "margin analysis service initialized"
        );
    }

    pub async fn ensure_initialized(&self) {
        if self.state() != ServiceState::Ready {
            self.initialize().await;
        }
    }

    fn start_sweeper(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }

        let cache = self.cache().clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.clear_expired().await;
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        });

        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Pre-load `dataset` into the cache. Failures are logged, not raised.
    pub async fn warm_cache(&self, dataset: WarmDataset) -> bool {
        let ttl = self.config().default_cache_ttl;
        self.cache()
            .warm(dataset.cache_key(), Some(ttl), || {
                self.api
                    .request::<BusinessReport>(dataset.endpoint(), RequestOptions::get().without_cache())
            })
            .await
    }

    /// Dataset loaded by [`Self::warm_cache`], if still fresh.
    pub async fn warmed_dataset(&self, dataset: WarmDataset) -> Option<BusinessReport> {
        self.cache().get(dataset.cache_key()).await
    }

    async fn run<T, F, Fut>(
        &self,
        context: ErrorContext,
        resilience: Resilience,
        snapshot_key: Option<String>,
        call: F,
    ) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.ensure_initialized().await;
        let config = self.config();

        let result = match resilience {
            Resilience::Retry => {
                self.errors
                    .with_retry(context, Some(&config.retry), call)
                    .await
            }
            Resilience::Circuit(circuit) => {
                self.errors
                    .with_circuit_breaker(circuit, context, call)
                    .await
            }
        };

        let snapshot_key = snapshot_key.filter(|_| config.enable_offline_support);
        match (result, snapshot_key) {
            (Ok(value), Some(key)) => {
                if let Ok(snapshot) = serde_json::to_value(&value) {
                    self.offline().insert(key, snapshot);
                }
                Ok(value)
            }
            (Ok(value), None) => Ok(value),
            (Err(error), Some(key)) if serves_offline(error.kind()) => {
                match self.offline_snapshot::<T>(&key) {
                    Some(value) => {
                        warn!(
                            key = %key,
                            kind = %error.kind(),
                            "upstream unavailable; serving offline snapshot"
                        );
                        Ok(value)
                    }
                    None => Err(error.into()),
                }
            }
            (Err(error), _) => Err(error.into()),
        }
    }

    fn offline_snapshot<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let snapshot = self.offline().get(key).cloned()?;
        serde_json::from_value(snapshot).ok()
    }

    async fn query<T>(
        &self,
        endpoint: &str,
        options: RequestOptions,
        context: ErrorContext,
        resilience: Resilience,
    ) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ensure_initialized().await;
        // Only the network call sits behind retries and circuits; a cached
        // answer is served even while its circuit is open.
        if let Some(hit) = self.api.cached::<T>(endpoint, &options).await {
            return Ok(hit);
        }

        let snapshot_key = options
            .cache
            .then(|| cache_key(options.method, endpoint, options.body.as_ref()));

        self.run(context, resilience, snapshot_key, || {
            self.api.fetch::<T>(endpoint, options.clone())
        })
        .await
    }

    pub async fn fetch_margin_analysis(
        &self,
        params: &MarginAnalysisParams,
    ) -> Result<MarginAnalysis, ServiceError> {
        self.query(
            "/",
            RequestOptions::post(to_body(params)?).with_cache_ttl(5 * MINUTE),
            ErrorContext::new("fetch_margin_analysis").with_param("period", params.period),
            Resilience::Retry,
        )
        .await
    }

    pub async fn intelligent_search(
        &self,
        query: &SearchQuery,
    ) -> Result<SearchResults, ServiceError> {
        self.query(
            "/intelligent-search",
            RequestOptions::post(to_body(query)?).with_cache_ttl(5 * MINUTE),
            ErrorContext::new("intelligent_search").with_param("query", &query.query),
            Resilience::Retry,
        )
        .await
    }

    /// AI analysis for one quote, behind the `quote_analysis` circuit.
    pub async fn analyze_quote_with_ai(
        &self,
        quote_id: &QuoteId,
    ) -> Result<QuoteAnalysis, ServiceError> {
        self.query(
            PREDICTIONS_ENDPOINT,
            quote_analysis_options(quote_id),
            ErrorContext::new("analyze_quote_with_ai").with_param("quote_id", quote_id),
            Resilience::Circuit(QUOTE_ANALYSIS_CIRCUIT),
        )
        .await
    }

    /// Like [`Self::analyze_quote_with_ai`], but failures become a fallback.
    pub async fn analyze_quote_or_fallback(&self, quote_id: &QuoteId) -> BulkQuoteOutcome {
        match self.analyze_quote_with_ai(quote_id).await {
            Ok(analysis) => BulkQuoteOutcome::Analyzed(analysis),
            Err(error) => BulkQuoteOutcome::Fallback(
                self.errors
                    .handle_quote_analysis_error(&error.to_api_error(), quote_id),
            ),
        }
    }

    /// Analyzes every quote; the result holds one entry per distinct id.
    ///
    /// Quotes are processed in chunks of `bulk_batch_size`, concurrently
    /// within a chunk, with `bulk_batch_delay` between chunks.
    pub async fn analyze_bulk_quotes(
        &self,
        quote_ids: &[QuoteId],
    ) -> Result<HashMap<QuoteId, BulkQuoteOutcome>, ServiceError> {
        if quote_ids.is_empty() {
            return Err(ValidationError::EmptyBulkRequest.into());
        }
        self.ensure_initialized().await;

        let config = self.config();
        let mut seen = HashSet::new();
        let unique: Vec<&QuoteId> = quote_ids.iter().filter(|id| seen.insert(*id)).collect();

        let mut outcomes = HashMap::with_capacity(unique.len());
        for (index, chunk) in unique.chunks(config.bulk_batch_size.max(1)).enumerate() {
            if index > 0 && !config.bulk_batch_delay.is_zero() {
                tokio::time::sleep(config.bulk_batch_delay).await;
            }

            let analyzed = futures::future::join_all(chunk.iter().map(|quote_id| async move {
                ((*quote_id).clone(), self.analyze_quote_or_fallback(quote_id).await)
            }))
            .await;
            outcomes.extend(analyzed);
        }

        let fallbacks = outcomes.values().filter(|outcome| outcome.is_fallback()).count();
        info!(quotes = outcomes.len(), fallbacks, "bulk quote analysis complete");
        Ok(outcomes)
    }

    pub async fn get_advanced_analytics(
        &self,
        params: &AnalyticsParams,
    ) -> Result<AdvancedAnalytics, ServiceError> {
        self.query(
            "/advanced-analytics",
            RequestOptions::post(to_body(params)?).with_cache_ttl(10 * MINUTE),
            analytics_context("get_advanced_analytics", params),
            Resilience::Retry,
        )
        .await
    }

    pub async fn get_ai_insights(&self, params: &AnalyticsParams) -> Result<AiInsights, ServiceError> {
        self.query(
            "/ai-insights",
            RequestOptions::post(to_body(params)?).with_cache_ttl(15 * MINUTE),
            analytics_context("get_ai_insights", params),
            Resilience::Retry,
        )
        .await
    }

    /// Anomaly scan, behind the `anomaly_detection` circuit.
    pub async fn detect_margin_anomalies(
        &self,
        params: &AnalyticsParams,
    ) -> Result<AnomalyReport, ServiceError> {
        self.query(
            "/anomaly-detection",
            RequestOptions::post(to_body(params)?).with_cache_ttl(5 * MINUTE),
            analytics_context("detect_margin_anomalies", params),
            Resilience::Circuit(ANOMALY_DETECTION_CIRCUIT),
        )
        .await
    }

    pub async fn get_ml_models(&self) -> Result<MlModelCatalog, ServiceError> {
        self.query(
            "/ml-models",
            RequestOptions::get().with_cache_ttl(30 * MINUTE).batchable(),
            ErrorContext::new("get_ml_models"),
            Resilience::Retry,
        )
        .await
    }

    /// Starts a training job and drops the cached model catalog.
    pub async fn train_ml_model(
        &self,
        request: &TrainingRequest,
    ) -> Result<TrainingJob, ServiceError> {
        if request.model_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "model_id" }.into());
        }

        let job = self
            .query(
                "/ml-models/train",
                RequestOptions::mutation(HttpMethod::Post, Some(to_body(request)?)),
                ErrorContext::new("train_ml_model").with_param("model_id", &request.model_id),
                Resilience::Retry,
            )
            .await?;

        self.invalidate_endpoint("/ml-models").await;
        Ok(job)
    }

    pub async fn submit_feedback(
        &self,
        feedback: &PredictionFeedback,
    ) -> Result<FeedbackReceipt, ServiceError> {
        self.query(
            "/feedback",
            RequestOptions::mutation(HttpMethod::Post, Some(to_body(feedback)?)),
            ErrorContext::new("submit_feedback").with_param("quote_id", &feedback.quote_id),
            Resilience::Retry,
        )
        .await
    }

    pub async fn get_optimization_suggestions(
        &self,
        params: &AnalyticsParams,
    ) -> Result<BusinessReport, ServiceError> {
        self.report(
            "/optimization-suggestions",
            "get_optimization_suggestions",
            params,
            15 * MINUTE,
        )
        .await
    }

    pub async fn get_competitive_analysis(
        &self,
        params: &AnalyticsParams,
    ) -> Result<BusinessReport, ServiceError> {
        self.report(
            "/competitive-analysis",
            "get_competitive_analysis",
            params,
            30 * MINUTE,
        )
        .await
    }

    pub async fn get_tangram_services(
        &self,
        params: &AnalyticsParams,
    ) -> Result<BusinessReport, ServiceError> {
        self.report("/tangram-services", "get_tangram_services", params, 30 * MINUTE)
            .await
    }

    pub async fn get_steelcase_partnership(
        &self,
        params: &AnalyticsParams,
    ) -> Result<BusinessReport, ServiceError> {
        self.report(
            "/steelcase-partnership",
            "get_steelcase_partnership",
            params,
            60 * MINUTE,
        )
        .await
    }

    pub async fn get_customer_cda_analysis(
        &self,
        params: &AnalyticsParams,
    ) -> Result<BusinessReport, ServiceError> {
        self.report(
            "/real-customer-cda-analysis",
            "get_customer_cda_analysis",
            params,
            15 * MINUTE,
        )
        .await
    }

    async fn report(
        &self,
        endpoint: &str,
        operation: &'static str,
        params: &AnalyticsParams,
        ttl: Duration,
    ) -> Result<BusinessReport, ServiceError> {
        self.query(
            endpoint,
            RequestOptions::post(to_body(params)?).with_cache_ttl(ttl),
            analytics_context(operation, params),
            Resilience::Retry,
        )
        .await
    }

    pub async fn list_alerts(&self) -> Result<Vec<Alert>, ServiceError> {
        self.query(
            "/alerts",
            RequestOptions::get().with_cache_ttl(2 * MINUTE),
            ErrorContext::new("list_alerts"),
            Resilience::Retry,
        )
        .await
    }

    pub async fn create_alert(&self, alert: &NewAlert) -> Result<Alert, ServiceError> {
        let created = self
            .query(
                "/alerts",
                RequestOptions::mutation(HttpMethod::Post, Some(to_body(alert)?)),
                ErrorContext::new("create_alert").with_param("metric", &alert.metric),
                Resilience::Retry,
            )
            .await?;
        self.invalidate_endpoint("/alerts").await;
        Ok(created)
    }

    pub async fn update_alert(
        &self,
        alert_id: &str,
        update: &AlertUpdate,
    ) -> Result<Alert, ServiceError> {
        let endpoint = format!("/alerts/{}", required_id(alert_id, "alert_id")?);
        let updated = self
            .query(
                &endpoint,
                RequestOptions::mutation(HttpMethod::Put, Some(to_body(update)?)),
                ErrorContext::new("update_alert").with_param("alert_id", alert_id),
                Resilience::Retry,
            )
            .await?;
        self.invalidate_endpoint("/alerts").await;
        Ok(updated)
    }

    pub async fn delete_alert(&self, alert_id: &str) -> Result<(), ServiceError> {
        let endpoint = format!("/alerts/{}", required_id(alert_id, "alert_id")?);
        self.query::<Value>(
            &endpoint,
            RequestOptions::mutation(HttpMethod::Delete, None),
            ErrorContext::new("delete_alert").with_param("alert_id", alert_id),
            Resilience::Retry,
        )
        .await?;
        self.invalidate_endpoint("/alerts").await;
        Ok(())
    }

    pub async fn list_approvals(&self) -> Result<Vec<Approval>, ServiceError> {
        self.query(
            "/approvals",
            RequestOptions::get().with_cache_ttl(2 * MINUTE),
            ErrorContext::new("list_approvals"),
            Resilience::Retry,
        )
        .await
    }

    pub async fn submit_approval(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Approval, ServiceError> {
        let approval = self
            .query(
                "/approvals",
                RequestOptions::mutation(HttpMethod::Post, Some(to_body(request)?)),
                ErrorContext::new("submit_approval").with_param("quote_id", &request.quote_id),
                Resilience::Retry,
            )
            .await?;
        self.invalidate_endpoint("/approvals").await;
        Ok(approval)
    }

    pub async fn decide_approval(
        &self,
        approval_id: &str,
        decision: &ApprovalDecision,
    ) -> Result<Approval, ServiceError> {
        let endpoint = format!("/approvals/{}", required_id(approval_id, "approval_id")?);
        let approval = self
            .query(
                &endpoint,
                RequestOptions::mutation(HttpMethod::Put, Some(to_body(decision)?)),
                ErrorContext::new("decide_approval")
                    .with_param("approval_id", approval_id)
                    .with_param("approved", decision.approved),
                Resilience::Retry,
            )
            .await?;
        self.invalidate_endpoint("/approvals").await;
        Ok(approval)
    }

    /// Streams margin records from `/export` without buffering the dataset.
    /// Returning `ControlFlow::Break` from `on_record` stops the download.
    pub async fn stream_margin_dataset<F>(
        &self,
        params: &MarginAnalysisParams,
        on_record: F,
    ) -> Result<usize, ServiceError>
    where
        F: FnMut(MarginRecord) -> ControlFlow<()>,
    {
        self.ensure_initialized().await;
        let body = to_body(params)?;
        let delivered = self
            .api
            .stream_large_dataset("/export", Some(&body), on_record)
            .await
            .map_err(|error| {
                error.with_context(
                    ErrorContext::new("stream_margin_dataset").with_param("period", params.period),
                )
            })?;
        Ok(delivered)
    }

    /// Drops every cached read of `endpoint` along with its offline snapshots.
    async fn invalidate_endpoint(&self, endpoint: &str) {
        let mut removed = 0;
        for method in [HttpMethod::Get, HttpMethod::Post] {
            let prefix = format!("{method}:{endpoint}:");
            removed += self.cache().invalidate_prefix(&prefix).await;
            self.offline().retain(|key, _| !key.starts_with(&prefix));
        }
        debug!(endpoint, removed, "invalidated cached reads");
    }

    pub async fn system_metrics(&self) -> SystemMetrics {
        SystemMetrics {
            state: self.state(),
            cache: self.cache().metrics().await,
            errors: self.errors.error_metrics(),
            api: self.api.metrics(),
            offline_snapshots: self.offline().len(),
            config: self.config().redacted(),
        }
    }

    /// Applies a partial update; the rate limit and client tunables take
    /// effect for subsequent requests.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<(), ServiceError> {
        let next = update.apply_to(&self.config())?;

        self.api.configure(&next).await;
        self.errors.set_default_policy(next.retry.clone());
        self.errors.set_circuit_config(next.circuit_breaker);
        if !next.enable_offline_support {
            self.offline().clear();
        }

        info!(
            enable_caching = next.enable_caching,
            enable_batching = next.enable_batching,
            enable_offline_support = next.enable_offline_support,
            max_concurrent_requests = next.max_concurrent_requests,
            "service configuration updated"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    /// Clears caches and metrics and returns to `Uninitialized`; the next
    /// business call initializes again.
    pub async fn cleanup(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        self.stop_sweeper();
        self.api.reset().await;
        self.offline().clear();
        self.errors.reset_metrics();
        self.set_state(ServiceState::Uninitialized);
        info!("margin analysis service cleaned up");
    }
}

impl Drop for MarginAnalysisService {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

fn serves_offline(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::CircuitOpen
    )
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|error| {
        ApiError::validation(format!("request body could not be encoded: {error}")).into()
    })
}

fn required_id(id: &str, field: &'static str) -> Result<String, ValidationError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(path_segment(id))
}

fn analytics_context(operation: &str, params: &AnalyticsParams) -> ErrorContext {
    let context = ErrorContext::new(operation).with_param("period", params.period);
    match &params.group_by {
        Some(group_by) => context.with_param("group_by", group_by),
        None => context,
    }
}
