//! Payloads for the write paths: alerts, approvals, feedback and model training.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{QuoteId, ValidationError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    #[serde(default)]
    pub active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlert {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<String>,
}

impl NewAlert {
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        threshold: f64,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let metric = metric.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "name" });
        }
        if metric.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "metric" });
        }
        Ok(Self {
            name,
            metric,
            threshold,
            comparison: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub quote_id: QuoteId,
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub quote_id: QuoteId,
    pub requested_margin: f64,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// User rating of a prediction, sent to `/feedback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionFeedback {
    pub quote_id: QuoteId,
    pub rating: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl PredictionFeedback {
    /// `rating` must be between 1 and 5.
    pub fn new(quote_id: QuoteId, rating: u8) -> Result<Self, ValidationError> {
        if !(1..=5).contains(&rating) {
            return Err(ValidationError::RatingOutOfRange { value: rating });
        }
        Ok(Self {
            quote_id,
            rating,
            comment: None,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReceipt {
    #[serde(default)]
    pub accepted: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
