use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a symptom check as rendered by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub disease: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub doctor_specialty: Option<String>,
    #[serde(default)]
    pub precautions: Vec<String>,
    /// Display form, e.g. "87.5%" or "N/A"
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default, rename = "conf_num")]
    pub confidence_percent: Option<f64>,
    #[serde(default)]
    pub selected_symptoms: Vec<String>,
}

impl Prediction {
    pub fn specialty_display(&self) -> &str {
        self.doctor_specialty.as_deref().unwrap_or("General Physician")
    }

    pub fn confidence_display(&self) -> String {
        match (self.confidence_percent, self.confidence.as_deref()) {
            (Some(pct), _) => format!("{:.1}%", pct),
            (None, Some(text)) if !text.is_empty() => text.to_string(),
            _ => "N/A".to_string(),
        }
    }
}

/// A past prediction from `/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub prediction: Prediction,
    /// Kept raw; the backend is not consistent about the format
    #[serde(default)]
    pub created_at: Option<String>,
}

impl PredictionRecord {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }
}
