//! Core domain model for ASR: sites, opportunities, suggestions and fix entities.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "asr-core";

/// Opaque audit-defined payload carried by findings and suggestions.
pub type SuggestionData = Map<String, Value>;

/// Actor tag stamped on records mutated by the engine.
pub struct UpdatedBy;

impl UpdatedBy {
    pub const SYSTEM: &'static str = "system";
}

/// Payload flags marking a suggestion as already deployed to the edge.
pub const DEPLOYED_FLAGS: [&str; 2] = ["tokowakaDeployed", "edgeDeployed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionStatus {
    New,
    PendingValidation,
    Approved,
    InProgress,
    Fixed,
    Rejected,
    Skipped,
    Outdated,
    Error,
}

impl SuggestionStatus {
    pub const ALL: [SuggestionStatus; 9] = [
        SuggestionStatus::New,
        SuggestionStatus::PendingValidation,
        SuggestionStatus::Approved,
        SuggestionStatus::InProgress,
        SuggestionStatus::Fixed,
        SuggestionStatus::Rejected,
        SuggestionStatus::Skipped,
        SuggestionStatus::Outdated,
        SuggestionStatus::Error,
    ];

    /// Status given to a freshly detected finding.
    pub fn initial(requires_validation: bool) -> Self {
        if requires_validation {
            SuggestionStatus::PendingValidation
        } else {
            SuggestionStatus::New
        }
    }

    /// Statuses that are already decided (by a human or a previous run) and
    /// must never be auto-outdated when their finding disappears.
    pub fn is_protected_from_outdating(self) -> bool {
        matches!(
            self,
            SuggestionStatus::Outdated
                | SuggestionStatus::Fixed
                | SuggestionStatus::Error
                | SuggestionStatus::Skipped
                | SuggestionStatus::Rejected
                | SuggestionStatus::Approved
                | SuggestionStatus::InProgress
                | SuggestionStatus::PendingValidation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SuggestionStatus::New => "NEW",
            SuggestionStatus::PendingValidation => "PENDING_VALIDATION",
            SuggestionStatus::Approved => "APPROVED",
            SuggestionStatus::InProgress => "IN_PROGRESS",
            SuggestionStatus::Fixed => "FIXED",
            SuggestionStatus::Rejected => "REJECTED",
            SuggestionStatus::Skipped => "SKIPPED",
            SuggestionStatus::Outdated => "OUTDATED",
            SuggestionStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown suggestion status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for SuggestionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SuggestionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    New,
    InProgress,
    Ignored,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixEntityStatus {
    Pending,
    Deployed,
    Published,
    Failed,
    RolledBack,
}

/// Site-level policy flags consulted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub base_url: String,
    #[serde(default)]
    pub requires_validation: bool,
}

/// Grouping of suggestions for one site and finding type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub site_id: Uuid,
    pub audit_id: Option<Uuid>,
    pub opportunity_type: String,
    pub origin: String,
    pub title: String,
    pub description: Option<String>,
    pub status: OpportunityStatus,
    #[serde(default)]
    pub data: SuggestionData,
    #[serde(default)]
    pub tags: Vec<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation payload for an opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub site_id: Uuid,
    pub audit_id: Option<Uuid>,
    pub opportunity_type: String,
    pub origin: String,
    pub title: String,
    pub description: Option<String>,
    pub status: OpportunityStatus,
    #[serde(default)]
    pub data: SuggestionData,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Persistent, status-tracked record derived from a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub suggestion_type: String,
    pub rank: i64,
    pub status: SuggestionStatus,
    #[serde(default)]
    pub data: SuggestionData,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Suggestion {
    /// True when the payload records an edge deployment of this suggestion.
    pub fn is_deployed(&self) -> bool {
        DEPLOYED_FLAGS
            .iter()
            .any(|flag| self.data.get(*flag).is_some_and(is_truthy))
    }

    pub fn url(&self) -> Option<&str> {
        self.data.get("url").and_then(Value::as_str)
    }
}

/// Creation payload for a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSuggestion {
    pub suggestion_type: String,
    pub rank: i64,
    pub status: SuggestionStatus,
    pub data: SuggestionData,
}

impl NewSuggestion {
    pub fn new(suggestion_type: impl Into<String>, data: SuggestionData) -> Self {
        Self {
            suggestion_type: suggestion_type.into(),
            rank: 0,
            status: SuggestionStatus::New,
            data,
        }
    }

    pub fn with_rank(mut self, rank: i64) -> Self {
        self.rank = rank;
        self
    }
}

/// Concrete remediation artifact tied to one or more suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixEntity {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub fix_type: String,
    pub status: FixEntityStatus,
    #[serde(default)]
    pub change_details: SuggestionData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Creation payload for a fix entity; `suggestion_ids` are weak references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFixEntity {
    pub fix_type: String,
    pub status: FixEntityStatus,
    #[serde(default)]
    pub change_details: SuggestionData,
    pub suggestion_ids: Vec<Uuid>,
}

/// JavaScript-style truthiness, used for loosely typed payload flags.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Builds a payload map from a JSON object literal; non-objects yield an empty map.
pub fn data_from_value(value: Value) -> SuggestionData {
    match value {
        Value::Object(map) => map,
        _ => SuggestionData::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suggestion_with(data: Value) -> Suggestion {
        let now = Utc::now();
        Suggestion {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            suggestion_type: "CONTENT_UPDATE".into(),
            rank: 0,
            status: SuggestionStatus::New,
            data: data_from_value(data),
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let text = serde_json::to_string(&SuggestionStatus::PendingValidation).unwrap();
        assert_eq!(text, "\"PENDING_VALIDATION\"");
        let back: SuggestionStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(back, SuggestionStatus::InProgress);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("outdated".parse::<SuggestionStatus>().unwrap(), SuggestionStatus::Outdated);
        assert_eq!(" SKIPPED ".parse::<SuggestionStatus>().unwrap(), SuggestionStatus::Skipped);
        assert!("GONE".parse::<SuggestionStatus>().is_err());
    }

    #[test]
    fn only_new_is_outdatable() {
        let outdatable: Vec<_> = SuggestionStatus::ALL
            .into_iter()
            .filter(|s| !s.is_protected_from_outdating())
            .collect();
        assert_eq!(outdatable, vec![SuggestionStatus::New]);
    }

    #[test]
    fn initial_status_follows_validation_flag() {
        assert_eq!(SuggestionStatus::initial(true), SuggestionStatus::PendingValidation);
        assert_eq!(SuggestionStatus::initial(false), SuggestionStatus::New);
    }

    #[test]
    fn deployed_flags_use_truthiness() {
        assert!(suggestion_with(json!({"tokowakaDeployed": 1700000000})).is_deployed());
        assert!(suggestion_with(json!({"edgeDeployed": true})).is_deployed());
        assert!(!suggestion_with(json!({"edgeDeployed": false})).is_deployed());
        assert!(!suggestion_with(json!({"tokowakaDeployed": null})).is_deployed());
        assert!(!suggestion_with(json!({"tokowakaDeployed": ""})).is_deployed());
        assert!(!suggestion_with(json!({"url": "https://a.test"})).is_deployed());
    }

    #[test]
    fn url_reads_string_field() {
        let s = suggestion_with(json!({"url": "https://a.test/page"}));
        assert_eq!(s.url(), Some("https://a.test/page"));
        assert_eq!(suggestion_with(json!({"url": 3})).url(), None);
    }
}
