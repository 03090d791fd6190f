//! # Domain Models
//!
//! Request parameters and response schemas for the margin analysis API.
//!
//! Responses are validated at the boundary: decoding into these types is the
//! schema check, and a body that does not decode surfaces as an
//! `invalid_response` error instead of an untyped payload. Fields the client
//! does not interpret are preserved in each type's `extra` map.
//!
//! | Type | Endpoint |
//! |------|----------|
//! | [`MarginAnalysis`] | root query |
//! | [`SearchResults`] | `/intelligent-search` |
//! | [`QuoteAnalysis`] | `/predictions` |
//! | [`AdvancedAnalytics`] | `/advanced-analytics` |
//! | [`AiInsights`] | `/ai-insights` |
//! | [`AnomalyReport`] | `/anomaly-detection` |
//! | [`MlModelCatalog`], [`TrainingJob`] | `/ml-models`, `/ml-models/train` |
//! | [`BusinessReport`] | optimization, competitive and partnership endpoints |
//! | [`Alert`], [`Approval`] | alert and approval CRUD |

mod params;
mod quote;
mod reports;
mod timestamp;
mod workflow;

pub use params::{AnalyticsParams, MarginAnalysisParams, Period, SearchQuery};
pub use quote::{QuoteAnalysis, QuoteId};
pub use reports::{
    AdvancedAnalytics, AiInsights, AnomalyReport, BusinessReport, Insight, MarginAnalysis,
    MarginAnomaly, MarginRecord, MlModel, MlModelCatalog, SearchResults,
};
pub use timestamp::UtcDateTime;
pub use workflow::{
    Alert, AlertUpdate, Approval, ApprovalDecision, ApprovalRequest, FeedbackReceipt, NewAlert,
    PredictionFeedback, TrainingJob, TrainingRequest,
};
