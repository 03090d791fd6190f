use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ValidationError;

const MAX_QUOTE_ID_LEN: usize = 64;

/// Dealer quote identifier, trimmed and validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QuoteId(String);

impl QuoteId {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyQuoteId);
        }

        let len = trimmed.chars().count();
        if len > MAX_QUOTE_ID_LEN {
            return Err(ValidationError::QuoteIdTooLong {
                len,
                max: MAX_QUOTE_ID_LEN,
            });
        }

        for (index, ch) in trimmed.chars().enumerate() {
            let valid = ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.');
            if !valid {
                return Err(ValidationError::QuoteIdInvalidChar { ch, index });
            }
        }

        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QuoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for QuoteId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for QuoteId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<QuoteId> for String {
    fn from(value: QuoteId) -> Self {
        value.0
    }
}

/// AI prediction for a single quote, as returned by `/predictions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteAnalysis {
    pub quote_id: QuoteId,
    #[serde(default)]
    pub predicted_margin: Option<f64>,
    #[serde(default)]
    pub win_probability: Option<f64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Set on placeholder results produced when the real analysis failed.
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuoteAnalysis {
    /// Structurally valid placeholder: no prediction, zero confidence.
    pub fn fallback(quote_id: QuoteId) -> Self {
        Self {
            quote_id,
            predicted_margin: None,
            win_probability: None,
            confidence: 0.0,
            risk_level: Some(String::from("unknown")),
            recommendations: vec![String::from(
                "AI analysis unavailable; review this quote manually or retry later",
            )],
            is_fallback: true,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_trims_quote_id() {
        let parsed = QuoteId::parse("  Q-2024.001 ").expect("quote id should parse");
        assert_eq!(parsed.as_str(), "Q-2024.001");
    }

    #[test]
    fn rejects_empty_and_invalid_ids() {
        assert_eq!(QuoteId::parse("   "), Err(ValidationError::EmptyQuoteId));
        assert!(matches!(
            QuoteId::parse("Q 1"),
            Err(ValidationError::QuoteIdInvalidChar { ch: ' ', index: 1 })
        ));
        assert!(matches!(
            QuoteId::parse(&"x".repeat(65)),
            Err(ValidationError::QuoteIdTooLong { len: 65, .. })
        ));
    }

    #[test]
    fn analysis_keeps_unknown_fields() {
        let analysis: QuoteAnalysis = serde_json::from_value(json!({
            "quote_id": "Q1",
            "predicted_margin": 31.5,
            "confidence": 0.82,
            "model_version": "gbm-7"
        }))
        .expect("valid analysis");

        assert_eq!(analysis.predicted_margin, Some(31.5));
        assert!(!analysis.is_fallback);
        assert_eq!(analysis.extra.get("model_version"), Some(&json!("gbm-7")));
    }

    #[test]
    fn analysis_without_quote_id_is_rejected() {
        let result = serde_json::from_value::<QuoteAnalysis>(json!({ "confidence": 0.5 }));
        assert!(result.is_err());
    }

    #[test]
    fn fallback_is_marked() {
        let fallback = QuoteAnalysis::fallback(QuoteId::parse("Q9").expect("valid"));

        assert!(fallback.is_fallback);
        assert_eq!(fallback.confidence, 0.0);
        assert!(fallback.predicted_margin.is_none());
    }
}
