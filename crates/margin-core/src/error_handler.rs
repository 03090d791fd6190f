//! Retry, circuit breaking and failure bookkeeping around async operations.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitRegistry, CircuitSnapshot};
use crate::domain::{QuoteAnalysis, QuoteId, UtcDateTime};
use crate::error::{ApiError, ErrorContext, ErrorKind};
use crate::retry::RetryPolicy;

const MAX_RECENT_ERRORS: usize = 100;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub operation: String,
    pub context: BTreeMap<String, String>,
    pub kind: ErrorKind,
    pub message: String,
    pub recorded_at: UtcDateTime,
    /// 0 for the first attempt.
    pub retry_count: u32,
}

/// Rolling failure counts for dashboards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub total_errors: u64,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    pub retries: u64,
    pub fallbacks_served: u64,
    pub recent: Vec<ErrorRecord>,
    pub circuits: Vec<CircuitSnapshot>,
}

impl ErrorMetrics {
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct ErrorStats {
    total_errors: u64,
    by_kind: BTreeMap<ErrorKind, u64>,
    retries: u64,
    fallbacks_served: u64,
    recent: VecDeque<ErrorRecord>,
}

/// Structured description of a failure, suitable for a UI notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub user_message: String,
    pub retryable: bool,
    pub quote_id: QuoteId,
    pub occurred_at: UtcDateTime,
}

/// Degraded result for a quote whose analysis failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteAnalysisFallback {
    pub fallback_data: QuoteAnalysis,
    pub error_info: ErrorInfo,
}

/// Wraps operations with retry and circuit-breaker policies and keeps
/// per-kind failure metrics. One instance per service.
#[derive(Debug)]
pub struct ErrorHandler {
    default_policy: RwLock<RetryPolicy>,
    circuits: CircuitRegistry,
    stats: Mutex<ErrorStats>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreakerConfig::default())
    }
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy, circuit_config: CircuitBreakerConfig) -> Self {
        Self {
            default_policy: RwLock::new(policy),
            circuits: CircuitRegistry::new(circuit_config),
            stats: Mutex::new(ErrorStats::default()),
        }
    }

    fn stats(&self) -> MutexGuard<'_, ErrorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_policy(&self) -> RetryPolicy {
        self.default_policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_default_policy(&self, policy: RetryPolicy) {
        *self
            .default_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn circuit(&self, name: &str) -> std::sync::Arc<CircuitBreaker> {
        self.circuits.get(name)
    }

    /// Runs `operation` until it succeeds or the policy's attempt budget for
    /// the failure kind is spent. The final error carries `context`.
    pub async fn with_retry<T, F, Fut>(
        &self,
        context: ErrorContext,
        policy: Option<&RetryPolicy>,
        mut operation: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let policy = policy.cloned().unwrap_or_else(|| self.default_policy());
        let mut attempt: u32 = 0;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation = %context.operation, attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            self.record(&context, &error, attempt);

            let budget = policy.attempts_for(error.kind());
            if attempt + 1 >= budget {
                warn!(
                    operation = %context.operation,
                    kind = %error.kind(),
                    attempts = attempt + 1,
                    error = %error.message(),
                    "giving up"
                );
                return Err(error.with_context(context));
            }

            let delay = policy.delay_for(&error, attempt);
            warn!(
                operation = %context.operation,
                kind = %error.kind(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "operation failed; retrying"
            );
            self.stats().retries += 1;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Runs `operation` behind the circuit named `circuit`. While the circuit
    /// is open the operation is not invoked. Failures are recorded and
    /// returned under `context`.
    pub async fn with_circuit_breaker<T, F, Fut>(
        &self,
        circuit: &str,
        context: ErrorContext,
        operation: F,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let breaker = self.circuits.get(circuit);
        let context = context.with_param("circuit", circuit);

        if !breaker.allow_request() {
            let error = ApiError::circuit_open(circuit).with_context(context.clone());
            self.record(&context, &error, 0);
            debug!(circuit, operation = %context.operation, "circuit open; failing fast");
            return Err(error);
        }

        let mut guard = OutcomeGuard {
            breaker: &breaker,
            settled: false,
        };
        let result = operation().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.kind().counts_against_circuit() {
                    breaker.record_failure();
                } else {
                    // The upstream answered; a bad request says nothing about its health.
                    breaker.record_success();
                }
                self.record(&context, &error, 0);
                Err(error.with_context(context))
            }
        }
    }

    /// Placeholder analysis plus error details for the quote analysis path.
    pub fn handle_quote_analysis_error(
        &self,
        error: &ApiError,
        quote_id: &QuoteId,
    ) -> QuoteAnalysisFallback {
        self.stats().fallbacks_served += 1;
        warn!(
            quote_id = %quote_id,
            kind = %error.kind(),
            error = %error.message(),
            "serving fallback quote analysis"
        );

        QuoteAnalysisFallback {
            fallback_data: QuoteAnalysis::fallback(quote_id.clone()),
            error_info: ErrorInfo {
                kind: error.kind(),
                message: error.message().to_owned(),
                user_message: user_message(error.kind()).to_owned(),
                retryable: error.retryable(),
                quote_id: quote_id.clone(),
                occurred_at: UtcDateTime::now(),
            },
        }
    }

    pub fn error_metrics(&self) -> ErrorMetrics {
        let stats = self.stats();
        ErrorMetrics {
            total_errors: stats.total_errors,
            by_kind: stats.by_kind.clone(),
            retries: stats.retries,
            fallbacks_served: stats.fallbacks_served,
            recent: stats.recent.iter().cloned().collect(),
            circuits: self.circuits.snapshots(),
        }
    }

    /// Clears counters and closes every circuit.
    pub fn reset_metrics(&self) {
        *self.stats() = ErrorStats::default();
        self.circuits.reset();
    }

    pub fn set_circuit_config(&self, config: CircuitBreakerConfig) {
        self.circuits.set_config(config);
    }

    fn record(&self, context: &ErrorContext, error: &ApiError, retry_count: u32) {
        let mut stats = self.stats();
        stats.total_errors += 1;
        *stats.by_kind.entry(error.kind()).or_insert(0) += 1;

        if stats.recent.len() == MAX_RECENT_ERRORS {
            stats.recent.pop_front();
        }
        stats.recent.push_back(ErrorRecord {
            operation: context.operation.clone(),
            context: context.params.clone(),
            kind: error.kind(),
            message: error.message().to_owned(),
            recorded_at: UtcDateTime::now(),
            retry_count,
        });
    }
}

/// Releases a half-open trial if the wrapped future is dropped before it settles.
struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial();
        }
    }
}

fn user_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::CircuitOpen => {
            "Quote analysis is temporarily paused after repeated failures. Please retry in a moment."
        }
        ErrorKind::RateLimited => "Too many requests right now. Please retry shortly.",
        ErrorKind::Timeout => "The analysis service took too long to respond. Please retry.",
        ErrorKind::Validation => "This quote could not be analyzed. Check the quote details.",
        ErrorKind::InvalidResponse => "The analysis service returned an unexpected response.",
        ErrorKind::Transient | ErrorKind::Unknown => {
            "Quote analysis is unavailable right now. Please retry."
        }
    }
}
