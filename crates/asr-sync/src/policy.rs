//! Identity, data-merge and status-merge strategies for suggestion sync.

use std::collections::HashMap;

use asr_core::{NewSuggestion, Suggestion, SuggestionData, SuggestionStatus};
use serde_json::Value;

/// Derives a finding's stable identity from its payload.
pub type KeyFn = dyn Fn(&SuggestionData) -> String + Send + Sync;

/// Combines an existing suggestion's payload with the matching finding's payload.
pub type MergeDataFn = dyn Fn(&SuggestionData, &SuggestionData) -> SuggestionData + Send + Sync;

/// Returns the status a matched suggestion should move to, or `None` to keep it.
pub type MergeStatusFn =
    dyn Fn(&Suggestion, &SuggestionData, &StatusContext) -> Option<SuggestionStatus> + Send + Sync;

/// Maps an unmatched finding to a suggestion creation payload.
pub type BuildSuggestionFn = dyn Fn(&SuggestionData) -> NewSuggestion + Send + Sync;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusContext {
    pub requires_validation: bool,
}

/// Shallow merge: fields of `new` win, fields only in `existing` survive.
pub fn default_merge_data(existing: &SuggestionData, new: &SuggestionData) -> SuggestionData {
    let mut merged = existing.clone();
    for (key, value) in new {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

pub fn keep_same_data(existing: &SuggestionData, _new: &SuggestionData) -> SuggestionData {
    existing.clone()
}

pub fn keep_latest_data(_existing: &SuggestionData, new: &SuggestionData) -> SuggestionData {
    new.clone()
}

/// `REJECTED` is sticky; a reappearing `OUTDATED` finding goes back to review.
pub fn default_merge_status(
    existing: &Suggestion,
    _new: &SuggestionData,
    ctx: &StatusContext,
) -> Option<SuggestionStatus> {
    match existing.status {
        SuggestionStatus::Rejected => None,
        SuggestionStatus::Outdated => Some(SuggestionStatus::initial(ctx.requires_validation)),
        _ => None,
    }
}

/// Key function reading one payload field; strings are used verbatim,
/// other values by their JSON text, a missing field as the empty string.
pub fn key_by_field(field: &'static str) -> impl Fn(&SuggestionData) -> String + Send + Sync {
    move |data| match data.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Indexes findings by key; on duplicate keys the last finding wins. The
/// returned order lists each key once, at its first occurrence.
pub(crate) fn index_findings<'d>(
    findings: &'d [SuggestionData],
    build_key: &KeyFn,
) -> (Vec<String>, HashMap<String, &'d SuggestionData>) {
    let mut order = Vec::new();
    let mut by_key = HashMap::with_capacity(findings.len());
    for data in findings {
        let key = build_key(data);
        if by_key.insert(key.clone(), data).is_none() {
            order.push(key);
        }
    }
    (order, by_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asr_core::data_from_value;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn suggestion(status: SuggestionStatus) -> Suggestion {
        let now = Utc::now();
        Suggestion {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            suggestion_type: "CONTENT_UPDATE".into(),
            rank: 0,
            status,
            data: data_from_value(json!({"url": "https://a.test"})),
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn default_merge_keeps_existing_only_fields() {
        let existing = data_from_value(json!({"url": "u", "note": "keep", "alt": "old"}));
        let new = data_from_value(json!({"url": "u", "alt": "new"}));
        let merged = default_merge_data(&existing, &new);
        assert_eq!(merged, data_from_value(json!({"url": "u", "note": "keep", "alt": "new"})));
    }

    #[test]
    fn keep_variants() {
        let existing = data_from_value(json!({"a": 1, "b": 2}));
        let new = data_from_value(json!({"a": 3}));
        assert_eq!(keep_same_data(&existing, &new), existing);
        assert_eq!(keep_latest_data(&existing, &new), new);
    }

    #[test]
    fn rejected_never_changes() {
        let ctx = StatusContext { requires_validation: true };
        let s = suggestion(SuggestionStatus::Rejected);
        assert_eq!(default_merge_status(&s, &s.data, &ctx), None);
    }

    #[test]
    fn outdated_reopens_per_validation_flag() {
        let s = suggestion(SuggestionStatus::Outdated);
        assert_eq!(
            default_merge_status(&s, &s.data, &StatusContext { requires_validation: false }),
            Some(SuggestionStatus::New)
        );
        assert_eq!(
            default_merge_status(&s, &s.data, &StatusContext { requires_validation: true }),
            Some(SuggestionStatus::PendingValidation)
        );
    }

    #[test]
    fn other_statuses_are_left_alone() {
        let ctx = StatusContext::default();
        for status in [
            SuggestionStatus::New,
            SuggestionStatus::Approved,
            SuggestionStatus::InProgress,
            SuggestionStatus::Fixed,
            SuggestionStatus::Skipped,
        ] {
            let s = suggestion(status);
            assert_eq!(default_merge_status(&s, &s.data, &ctx), None, "{status}");
        }
    }

    #[test]
    fn field_keys_and_last_write_wins() {
        let key = key_by_field("url");
        let findings = vec![
            data_from_value(json!({"url": "a", "v": 1})),
            data_from_value(json!({"url": "b"})),
            data_from_value(json!({"url": "a", "v": 2})),
            data_from_value(json!({"url": 7})),
        ];
        let (order, by_key) = index_findings(&findings, &key);
        assert_eq!(order, vec!["a", "b", "7"]);
        assert_eq!(by_key["a"]["v"], json!(2));
        assert_eq!(key(&data_from_value(json!({}))), "");
    }
}
