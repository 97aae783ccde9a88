//! Diffs a fresh finding set against an opportunity's suggestions and
//! applies the result: outdate, update, create.

use std::collections::{HashMap, HashSet};

use asr_core::{Opportunity, Suggestion, SuggestionData, SuggestionStatus, UpdatedBy};
use asr_storage::BatchItemError;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::policy::{
    default_merge_data, default_merge_status, index_findings, BuildSuggestionFn, KeyFn,
    MergeDataFn, MergeStatusFn,
};
use crate::{ReconcileContext, SyncError};

/// Restricts outdating to suggestions whose subject was re-examined this run.
pub struct ScrapedFilter<'a> {
    subjects: HashSet<String>,
    subject_of: Option<&'a KeyFn>,
}

impl<'a> ScrapedFilter<'a> {
    /// Subjects are matched against the suggestion's `url` field.
    pub fn by_url(subjects: impl IntoIterator<Item = String>) -> Self {
        Self {
            subjects: subjects.into_iter().collect(),
            subject_of: None,
        }
    }

    pub fn with_subject(subjects: impl IntoIterator<Item = String>, subject_of: &'a KeyFn) -> Self {
        Self {
            subjects: subjects.into_iter().collect(),
            subject_of: Some(subject_of),
        }
    }

    pub fn covers(&self, suggestion: &Suggestion) -> bool {
        match self.subject_of {
            Some(subject_of) => self.subjects.contains(&subject_of(&suggestion.data)),
            None => suggestion
                .url()
                .is_some_and(|url| self.subjects.contains(url)),
        }
    }
}

/// Inputs of one synchronization call.
pub struct SyncRequest<'a> {
    pub opportunity: &'a Opportunity,
    pub new_data: Vec<SuggestionData>,
    pub build_key: &'a KeyFn,
    pub map_new_suggestion: &'a BuildSuggestionFn,
    pub merge_data: &'a MergeDataFn,
    pub merge_status: &'a MergeStatusFn,
    /// Falls back to the configured outdated status.
    pub outdated_status: Option<SuggestionStatus>,
    pub scraped_filter: Option<ScrapedFilter<'a>>,
    /// Already-fetched suggestions; skips the store read when present.
    pub existing: Option<Vec<Suggestion>>,
}

impl<'a> SyncRequest<'a> {
    pub fn new(
        opportunity: &'a Opportunity,
        new_data: Vec<SuggestionData>,
        build_key: &'a KeyFn,
        map_new_suggestion: &'a BuildSuggestionFn,
    ) -> Self {
        Self {
            opportunity,
            new_data,
            build_key,
            map_new_suggestion,
            merge_data: &default_merge_data,
            merge_status: &default_merge_status,
            outdated_status: None,
            scraped_filter: None,
            existing: None,
        }
    }

    pub fn with_merge_data(mut self, merge_data: &'a MergeDataFn) -> Self {
        self.merge_data = merge_data;
        self
    }

    pub fn with_merge_status(mut self, merge_status: &'a MergeStatusFn) -> Self {
        self.merge_status = merge_status;
        self
    }

    pub fn with_outdated_status(mut self, status: SuggestionStatus) -> Self {
        self.outdated_status = Some(status);
        self
    }

    pub fn with_scraped_filter(mut self, filter: ScrapedFilter<'a>) -> Self {
        self.scraped_filter = Some(filter);
        self
    }

    pub fn with_existing(mut self, existing: Vec<Suggestion>) -> Self {
        self.existing = Some(existing);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub created: usize,
    pub updated: usize,
    pub update_failures: usize,
    pub outdated: usize,
    pub outdate_failed: bool,
    pub create_errors: Vec<BatchItemError>,
}

/// Keys of a finding batch.
pub fn finding_keys(new_data: &[SuggestionData], build_key: &KeyFn) -> HashSet<String> {
    new_data.iter().map(|data| build_key(data)).collect()
}

pub async fn sync_suggestions(
    ctx: ReconcileContext<'_>,
    request: SyncRequest<'_>,
) -> Result<SyncOutcome, SyncError> {
    let span = info_span!(
        "sync_suggestions",
        opportunity_id = %request.opportunity.id,
        site_id = %ctx.site.id
    );
    run_sync(ctx, request).instrument(span).await
}

async fn run_sync(
    ctx: ReconcileContext<'_>,
    request: SyncRequest<'_>,
) -> Result<SyncOutcome, SyncError> {
    let SyncRequest {
        opportunity,
        new_data,
        build_key,
        map_new_suggestion,
        merge_data,
        merge_status,
        outdated_status,
        scraped_filter,
        existing,
    } = request;

    let existing = match existing {
        Some(existing) => existing,
        None => ctx.store.suggestions_for_opportunity(opportunity.id).await?,
    };
    let (new_order, new_by_key) = index_findings(&new_data, build_key);

    let mut outcome = SyncOutcome::default();

    let outdated_status = outdated_status.unwrap_or(ctx.config.outdated_status);
    let to_outdate = outdating_candidates(&existing, &new_by_key, build_key, scraped_filter.as_ref());
    if !to_outdate.is_empty() {
        match ctx.store.bulk_update_status(&to_outdate, outdated_status).await {
            Ok(()) => {
                outcome.outdated = to_outdate.len();
                info!(count = to_outdate.len(), status = %outdated_status, "marked disappeared suggestions");
            }
            Err(err) => {
                outcome.outdate_failed = true;
                error!(count = to_outdate.len(), error = %err, "failed to mark disappeared suggestions");
            }
        }
    }

    let status_ctx = ctx.status_context();
    let updates = existing.iter().filter_map(|suggestion| {
        let finding = *new_by_key.get(&build_key(&suggestion.data))?;
        let mut updated = suggestion.clone();
        updated.data = merge_data(&suggestion.data, finding);
        if let Some(status) = merge_status(suggestion, finding, &status_ctx) {
            updated.status = status;
        }
        updated.updated_by = Some(UpdatedBy::SYSTEM.to_string());
        Some(async move {
            let id = updated.id;
            (id, ctx.store.save_suggestion(&updated).await)
        })
    });
    for (id, result) in join_all(updates).await {
        match result {
            Ok(_) => outcome.updated += 1,
            Err(err) => {
                outcome.update_failures += 1;
                error!(suggestion_id = %id, error = %err, "failed to update suggestion");
            }
        }
    }

    let existing_keys: HashSet<String> = existing.iter().map(|s| build_key(&s.data)).collect();
    let initial_status = SuggestionStatus::initial(ctx.site.requires_validation);
    let drafts: Vec<_> = new_order
        .iter()
        .filter(|key| !existing_keys.contains(*key))
        .map(|key| {
            let mut draft = map_new_suggestion(new_by_key[key]);
            draft.status = initial_status;
            draft
        })
        .collect();

    if !drafts.is_empty() {
        let requested = drafts.len();
        let result = ctx.store.add_suggestions(opportunity.id, drafts).await?;
        outcome.created = result.created_items.len();
        debug!(requested, created = outcome.created, "created suggestions");

        if !result.error_items.is_empty() {
            report_create_errors(&result.error_items, ctx.config.max_logged_errors);

            if result.created_items.is_empty() {
                let sample = result.error_items[0].message.clone();
                return Err(SyncError::CreateFailed {
                    site_id: ctx.site.id,
                    failed: result.error_items.len(),
                    sample,
                });
            }
            warn!(
                created = result.created_items.len(),
                failed = result.error_items.len(),
                "partial success creating suggestions"
            );
            outcome.create_errors = result.error_items;
        }
    }

    Ok(outcome)
}

/// Existing suggestions that disappeared and are still undecided.
fn outdating_candidates(
    existing: &[Suggestion],
    new_by_key: &HashMap<String, &SuggestionData>,
    build_key: &KeyFn,
    scraped_filter: Option<&ScrapedFilter<'_>>,
) -> Vec<Uuid> {
    existing
        .iter()
        .filter(|s| !new_by_key.contains_key(&build_key(&s.data)))
        .filter(|s| !s.status.is_protected_from_outdating())
        .filter(|s| !s.is_deployed())
        .filter(|s| scraped_filter.map_or(true, |filter| filter.covers(s)))
        .map(|s| s.id)
        .collect()
}

fn report_create_errors(errors: &[BatchItemError], max_logged: usize) {
    let total = errors.len();
    error!(failed = total, "errors while creating suggestions");
    for (i, item) in errors.iter().take(max_logged).enumerate() {
        error!(index = item.index, "create error {}/{}: {}", i + 1, total, item.message);
    }
    if total > max_logged {
        error!("... and {} more errors", total - max_logged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::key_by_field;
    use crate::ReconcileConfig;
    use asr_core::{data_from_value, NewSuggestion, OpportunityStatus, Site};
    use asr_storage::{MemoryStore, OpportunityStore, SuggestionStore};
    use serde_json::json;
    use tracing_test::traced_test;

    fn build(data: &SuggestionData) -> NewSuggestion {
        NewSuggestion::new("CONTENT_UPDATE", data.clone())
    }

    async fn seeded() -> (MemoryStore, Opportunity, Site) {
        let store = MemoryStore::new();
        let site = Site {
            id: Uuid::new_v4(),
            base_url: "https://example.test".into(),
            requires_validation: false,
        };
        let opportunity = store
            .create_opportunity(asr_core::NewOpportunity {
                site_id: site.id,
                audit_id: None,
                opportunity_type: "alt-text".into(),
                origin: "AUTOMATION".into(),
                title: "Missing alt text".into(),
                description: None,
                status: OpportunityStatus::New,
                data: Default::default(),
                tags: vec![],
            })
            .await
            .unwrap();
        (store, opportunity, site)
    }

    #[test]
    fn scraped_filter_by_url_needs_a_url() {
        let now = chrono::Utc::now();
        let mut s = Suggestion {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            suggestion_type: "CONTENT_UPDATE".into(),
            rank: 0,
            status: SuggestionStatus::New,
            data: data_from_value(json!({"url": "https://a.test/x"})),
            updated_by: None,
            created_at: now,
            updated_at: now,
        };
        let filter = ScrapedFilter::by_url(vec!["https://a.test/x".to_string()]);
        assert!(filter.covers(&s));
        s.data = data_from_value(json!({"pageUrl": "https://a.test/x"}));
        assert!(!filter.covers(&s));

        let page = key_by_field("pageUrl");
        let custom = ScrapedFilter::with_subject(vec!["https://a.test/x".to_string()], &page);
        assert!(custom.covers(&s));
    }

    #[tokio::test]
    #[traced_test]
    async fn partial_create_failure_logs_and_continues() {
        let (store, opportunity, site) = seeded().await;
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);
        let key = key_by_field("url");
        let builder = |data: &SuggestionData| {
            if data.get("broken").is_some() {
                NewSuggestion::new("CONTENT_UPDATE", SuggestionData::new())
            } else {
                build(data)
            }
        };

        let outcome = sync_suggestions(
            ctx,
            SyncRequest::new(
                &opportunity,
                vec![
                    data_from_value(json!({"url": "https://a.test/1"})),
                    data_from_value(json!({"url": "https://a.test/2", "broken": true})),
                ],
                &key,
                &builder,
            ),
        )
        .await
        .expect("partial success must not fail the call");

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.create_errors.len(), 1);
        assert!(logs_contain("partial success creating suggestions"));
        assert!(logs_contain("create error 1/1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn error_log_is_capped() {
        let (store, opportunity, site) = seeded().await;
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);
        let key = key_by_field("url");
        let builder = |data: &SuggestionData| {
            if data.get("ok").is_some() {
                build(data)
            } else {
                NewSuggestion::new("CONTENT_UPDATE", SuggestionData::new())
            }
        };
        let mut findings: Vec<_> = (0..7)
            .map(|i| data_from_value(json!({ "url": format!("https://a.test/{i}") })))
            .collect();
        findings.push(data_from_value(json!({"url": "https://a.test/ok", "ok": true})));

        let outcome = sync_suggestions(ctx, SyncRequest::new(&opportunity, findings, &key, &builder))
            .await
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.create_errors.len(), 7);
        assert!(logs_contain("create error 5/7"));
        assert!(!logs_contain("create error 6/7"));
        assert!(logs_contain("and 2 more errors"));
    }

    #[tokio::test]
    async fn total_create_failure_surfaces_sample_error() {
        let (store, opportunity, site) = seeded().await;
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);
        let key = key_by_field("url");
        let builder = |_: &SuggestionData| NewSuggestion::new("CONTENT_UPDATE", SuggestionData::new());

        let err = sync_suggestions(
            ctx,
            SyncRequest::new(
                &opportunity,
                vec![data_from_value(json!({"url": "https://a.test/1"}))],
                &key,
                &builder,
            ),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::CreateFailed { failed: 1, .. }));
        assert!(err.to_string().contains("suggestion data must not be empty"));
    }

    #[tokio::test]
    async fn duplicate_keys_create_one_suggestion_with_last_data() {
        let (store, opportunity, site) = seeded().await;
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);
        let key = key_by_field("url");

        let outcome = sync_suggestions(
            ctx,
            SyncRequest::new(
                &opportunity,
                vec![
                    data_from_value(json!({"url": "https://a.test/1", "alt": "first"})),
                    data_from_value(json!({"url": "https://a.test/1", "alt": "second"})),
                ],
                &key,
                &build,
            ),
        )
        .await
        .unwrap();

        assert_eq!(outcome.created, 1);
        let stored = store.suggestions_for_opportunity(opportunity.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data["alt"], json!("second"));
    }

    #[tokio::test]
    async fn new_suggestions_start_pending_when_site_requires_validation() {
        let (store, opportunity, mut site) = seeded().await;
        site.requires_validation = true;
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);
        let key = key_by_field("url");

        sync_suggestions(
            ctx,
            SyncRequest::new(
                &opportunity,
                vec![data_from_value(json!({"url": "https://a.test/1"}))],
                &key,
                &build,
            ),
        )
        .await
        .unwrap();

        let stored = store.suggestions_for_opportunity(opportunity.id).await.unwrap();
        assert_eq!(stored[0].status, SuggestionStatus::PendingValidation);
    }

    #[tokio::test]
    async fn custom_outdated_status_and_keep_same_data() {
        let (store, opportunity, site) = seeded().await;
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);
        let key = key_by_field("url");
        let seed = vec![
            data_from_value(json!({"url": "https://a.test/1", "alt": "v1"})),
            data_from_value(json!({"url": "https://a.test/2"})),
        ];
        sync_suggestions(ctx, SyncRequest::new(&opportunity, seed, &key, &build))
            .await
            .unwrap();

        let outcome = sync_suggestions(
            ctx,
            SyncRequest::new(
                &opportunity,
                vec![data_from_value(json!({"url": "https://a.test/1", "alt": "v2"}))],
                &key,
                &build,
            )
            .with_merge_data(&crate::policy::keep_same_data)
            .with_outdated_status(SuggestionStatus::Skipped),
        )
        .await
        .unwrap();

        assert_eq!(outcome.outdated, 1);
        let stored = store.suggestions_for_opportunity(opportunity.id).await.unwrap();
        let first = stored.iter().find(|s| s.url() == Some("https://a.test/1")).unwrap();
        let second = stored.iter().find(|s| s.url() == Some("https://a.test/2")).unwrap();
        assert_eq!(first.data["alt"], json!("v1"));
        assert_eq!(first.updated_by.as_deref(), Some(UpdatedBy::SYSTEM));
        assert_eq!(second.status, SuggestionStatus::Skipped);
    }
}
