//! Response schemas for the read-only analysis endpoints.
//!
//! Each type pins the fields the client relies on and keeps everything else
//! in a flattened `extra` map, so new server fields never break decoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One vendor/customer line of a margin report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRecord {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    pub revenue: f64,
    pub cost: f64,
    #[serde(default)]
    pub margin_percent: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MarginRecord {
    /// Server-provided margin when present, otherwise computed from revenue and cost.
    pub fn margin_percent(&self) -> Option<f64> {
        self.margin_percent.or_else(|| {
            (self.revenue != 0.0).then(|| (self.revenue - self.cost) / self.revenue * 100.0)
        })
    }
}

/// Response of the root margin analysis query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginAnalysis {
    #[serde(default)]
    pub total_revenue: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub margin_percent: f64,
    #[serde(default)]
    pub records: Vec<MarginRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedAnalytics {
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub trends: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInsights {
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginAnomaly {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub deviation: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    #[serde(default)]
    pub anomalies: Vec<MarginAnomaly>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModelCatalog {
    #[serde(default)]
    pub models: Vec<MlModel>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Opaque report for the business-specific endpoints (optimization,
/// competitive, Tangram, Steelcase, CDA) whose shape is owned by the server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessReport(pub Map<String, Value>);

impl BusinessReport {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn margin_percent_falls_back_to_revenue_and_cost() {
        let record: MarginRecord = serde_json::from_value(json!({
            "vendor": "Steelcase",
            "revenue": 200.0,
            "cost": 150.0
        }))
        .expect("valid record");

        assert_eq!(record.margin_percent(), Some(25.0));
    }

    #[test]
    fn zero_revenue_has_no_margin() {
        let record: MarginRecord =
            serde_json::from_value(json!({"revenue": 0, "cost": 10})).expect("valid record");

        assert_eq!(record.margin_percent(), None);
    }

    #[test]
    fn report_without_required_field_is_rejected() {
        let result = serde_json::from_value::<AnomalyReport>(json!({
            "anomalies": [{"severity": "high"}]
        }));

        assert!(result.is_err(), "anomaly without description must not decode");
    }

    #[test]
    fn business_report_must_be_an_object() {
        assert!(serde_json::from_value::<BusinessReport>(json!([1, 2])).is_err());
        let report: BusinessReport =
            serde_json::from_value(json!({"partnership_tier": "gold"})).expect("object");
        assert_eq!(report.get("partnership_tier"), Some(&json!("gold")));
    }
}
