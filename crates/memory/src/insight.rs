//! Insights surfaced by the engine (currently: unit conflicts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightStatus {
    Active,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub session_id: String,
    /// Currently only `conflict`.
    pub kind: String,
    pub message: String,
    /// Referenced unit ids (never shared references).
    pub unit_ids: Vec<String>,
    /// The evolves edge that raised this insight, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub status: InsightStatus,
    pub updated_at: DateTime<Utc>,
}
