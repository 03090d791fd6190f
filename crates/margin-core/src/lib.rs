//! # Margin Core
//!
//! Client-side request orchestration for the margin analysis API.
//!
//! ## Overview
//!
//! This crate sits between an application and the remote
//! `/api/margin-analysis` service and shields callers from its failures:
//!
//! - **TTL response cache** with warm-up, bounded size and hit/miss metrics
//! - **Retry with backoff** classified by a typed error taxonomy
//! - **Named circuit breakers** for the AI-backed endpoints
//! - **Rate limiting** with priority admission and a concurrency cap
//! - **Request coalescing** of identical in-flight calls
//! - **NDJSON streaming** with cooperative cancellation
//! - **Service facade** with one typed method per business query
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api_client`] | Cached, rate-limited, coalescing API client |
//! | [`batching`] | In-flight request coalescer |
//! | [`cache`] | TTL cache store |
//! | [`circuit_breaker`] | Per-name circuit breakers |
//! | [`config`] | Service configuration (file, env, partial updates) |
//! | [`domain`] | Request parameters and response schemas |
//! | [`error`] | Error taxonomy and error types |
//! | [`error_handler`] | Retry, circuit wrapping, error metrics and fallbacks |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`retry`] | Backoff strategies and retry policy |
//! | [`service`] | The [`MarginAnalysisService`] facade |
//! | [`throttling`] | Rate limiter with priorities |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use margin_core::{MarginAnalysisParams, MarginAnalysisService, Period, ReqwestHttpClient, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     margin_core::init_logging();
//!
//!     let service = MarginAnalysisService::new(
//!         ServiceConfig::from_env()?,
//!         Arc::new(ReqwestHttpClient::new()),
//!     )?;
//!     service.initialize().await;
//!
//!     let report = service
//!         .fetch_margin_analysis(&MarginAnalysisParams::for_period(Period::ThisMonth))
//!         .await?;
//!     println!("margin: {:.1}%", report.margin_percent);
//!
//!     service.cleanup().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │  Application             │
//! └────────────┬─────────────┘
//!              │
//!              ▼
//! ┌──────────────────────────┐     ┌──────────────────┐
//! │  MarginAnalysisService   │────▶│  ErrorHandler    │
//! │  (facade, lifecycle)     │     │  retry / circuit │
//! └────────────┬─────────────┘     └──────────────────┘
//!              │
//!              ▼
//! ┌──────────────────────────┐     ┌──────────────────┐
//! │  ApiClient               │────▶│  CacheStore      │
//! │  limiter, coalescer      │     └──────────────────┘
//! └────────────┬─────────────┘
//!              │
//!              ▼
//! ┌──────────────────────────┐
//! │  HttpClient              │
//! │  (reqwest / test double) │
//! └──────────────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Business methods return [`ServiceError`]; its [`ErrorKind`] tells the
//! caller what to do:
//!
//! ```rust
//! use margin_core::{ErrorKind, ServiceError};
//!
//! fn notify(error: &ServiceError) -> &'static str {
//!     match error.kind() {
//!         ErrorKind::CircuitOpen | ErrorKind::RateLimited => "try again shortly",
//!         ErrorKind::Validation => "check your input",
//!         _ => "service unavailable",
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - The bearer token is never logged and is redacted from metrics
//! - Ids embedded in paths are percent-encoded
//! - Inputs are validated before any request is issued

pub mod api_client;
pub mod batching;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod error_handler;
pub mod http_client;
pub mod logging;
pub mod retry;
pub mod service;
pub mod throttling;

// API client
pub use api_client::{ApiClient, ApiMetrics, LatencyBuckets, RequestOptions};

// Caching
pub use cache::{CacheMetrics, CacheStore};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

// Configuration
pub use config::{ConfigUpdate, ServiceConfig, WarmDataset, DEFAULT_BASE_URL};

// Domain models
pub use domain::{
    AdvancedAnalytics, AiInsights, Alert, AlertUpdate, AnalyticsParams, AnomalyReport, Approval,
    ApprovalDecision, ApprovalRequest, BusinessReport, FeedbackReceipt, Insight, MarginAnalysis,
    MarginAnalysisParams, MarginAnomaly, MarginRecord, MlModel, MlModelCatalog, NewAlert, Period,
    PredictionFeedback, QuoteAnalysis, QuoteId, SearchQuery, SearchResults, TrainingJob,
    TrainingRequest, UtcDateTime,
};

// Error types
pub use error::{ApiError, ConfigError, ErrorContext, ErrorKind, ServiceError, ValidationError};

// Error handling
pub use error_handler::{ErrorHandler, ErrorInfo, ErrorMetrics, ErrorRecord, QuoteAnalysisFallback};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient, StreamingResponse,
};

// Logging
pub use logging::init_logging;

// Retry logic
pub use retry::{Backoff, RetryPolicy};

// Service facade
pub use service::{BulkQuoteOutcome, MarginAnalysisService, ServiceState, SystemMetrics};

// Throttling
pub use throttling::{RateLimitConfig, RateLimitPolicy, RequestPriority, RequestScheduler};
