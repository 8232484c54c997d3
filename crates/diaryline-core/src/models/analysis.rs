use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Server-side state of a diary's AI analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    /// Parse a status string as sent by the backend (`PENDING`, `PROCESSING`, ...).
    /// Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(AnalysisStatus::Pending),
            "PROCESSING" => Some(AnalysisStatus::Processing),
            "COMPLETED" => Some(AnalysisStatus::Completed),
            "FAILED" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "PENDING",
            AnalysisStatus::Processing => "PROCESSING",
            AnalysisStatus::Completed => "COMPLETED",
            AnalysisStatus::Failed => "FAILED",
        }
    }

    /// No further polling happens once a job reaches a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub intensity: Option<f64>,
}

/// Analysis status payload from `GET /api/diaries/{id}/analysis`.
///
/// Before the job exists server-side the endpoint returns `{}`, which
/// deserializes to a report with no status. Unset fields arrive as explicit
/// `null`s.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    #[serde(default)]
    pub diary_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub emotions: Vec<Emotion>,
    #[serde(default)]
    pub coaching: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Fields this client does not model, kept for display.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AnalysisReport {
    /// Report carrying only the status, with the raw payload kept in `extra`.
    /// Used when the rest of the body does not decode.
    pub fn status_only(status: AnalysisStatus, raw: serde_json::Value) -> Self {
        let extra = match raw {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            status: Some(status.as_str().to_string()),
            extra,
            ..Self::default()
        }
    }

    pub fn state(&self) -> Option<AnalysisStatus> {
        self.status.as_deref().and_then(AnalysisStatus::parse)
    }

    /// `updatedAt` as UTC. Accepts RFC 3339 and zone-less ISO timestamps,
    /// the latter assumed to be UTC.
    pub fn updated_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.updated_at.as_deref()?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Strongest emotion by intensity, if any were reported.
    pub fn dominant_emotion(&self) -> Option<&Emotion> {
        self.emotions.iter().max_by(|a, b| {
            a.intensity
                .unwrap_or(0.0)
                .total_cmp(&b.intensity.unwrap_or(0.0))
        })
    }
}

/// Treat an explicit `null` like a missing field.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
