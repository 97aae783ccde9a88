//! Promotes suggestions whose finding disappeared and whose fix is verified
//! to `FIXED`, recording fix entities for them.

use std::collections::HashSet;

use asr_core::{NewFixEntity, Opportunity, Suggestion, SuggestionStatus, UpdatedBy};
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::settle_bounded;
use crate::policy::KeyFn;
use crate::ReconcileContext;

/// Checks whether the issue behind a disappeared suggestion was really fixed.
#[async_trait]
pub trait FixVerifier: Send + Sync {
    async fn is_issue_fixed(&self, suggestion: &Suggestion) -> anyhow::Result<bool>;
}

/// Builds the fix entity recorded for a suggestion promoted to `FIXED`.
/// `Ok(None)` means no fix entity for this suggestion.
pub trait FixEntityBuilder: Send + Sync {
    fn build(
        &self,
        suggestion: &Suggestion,
        opportunity: &Opportunity,
        author_only: bool,
    ) -> anyhow::Result<Option<NewFixEntity>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuggestionOutcome {
    StillOpen,
    CheckFailed(String),
    Fixed,
    FixedWithFixEntity,
    PersistFailed(String),
    FixEntityFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<(Uuid, SuggestionOutcome)>,
    /// Suggestions as saved after promotion to `FIXED`.
    pub fixed: Vec<Suggestion>,
    pub fix_entities_created: usize,
    pub fix_entity_errors: Vec<String>,
}

impl ReconcileReport {
    pub fn checked(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcome_of(&self, suggestion_id: Uuid) -> Option<&SuggestionOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == suggestion_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Existing suggestions whose key is absent from the current finding keys.
pub fn disappeared_suggestions(
    existing: &[Suggestion],
    current_keys: &HashSet<String>,
    build_key: &KeyFn,
) -> Vec<Suggestion> {
    existing
        .iter()
        .filter(|s| !current_keys.contains(&build_key(&s.data)))
        .cloned()
        .collect()
}

/// Best-effort: every failure is logged and recorded in the report.
pub async fn reconcile_disappeared_suggestions(
    ctx: ReconcileContext<'_>,
    opportunity: &Opportunity,
    disappeared: &[Suggestion],
    verifier: &dyn FixVerifier,
    builder: &dyn FixEntityBuilder,
    author_only: bool,
) -> ReconcileReport {
    let span = info_span!("reconcile_disappeared", opportunity_id = %opportunity.id);
    run_reconcile(ctx, opportunity, disappeared, verifier, builder, author_only)
        .instrument(span)
        .await
}

async fn run_reconcile(
    ctx: ReconcileContext<'_>,
    opportunity: &Opportunity,
    disappeared: &[Suggestion],
    verifier: &dyn FixVerifier,
    builder: &dyn FixEntityBuilder,
    author_only: bool,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let candidates: Vec<&Suggestion> = disappeared
        .iter()
        .filter(|s| s.status == SuggestionStatus::New)
        .collect();
    if candidates.is_empty() {
        debug!("no undecided disappeared suggestions to verify");
        return report;
    }

    let checks: Vec<_> = candidates
        .iter()
        .map(|suggestion| move || verifier.is_issue_fixed(suggestion))
        .collect();
    let verdicts = settle_bounded(checks, ctx.config.check_concurrency).await;

    let mut verified = Vec::new();
    for (suggestion, verdict) in candidates.into_iter().zip(verdicts) {
        match verdict {
            Ok(true) => verified.push(suggestion),
            Ok(false) => report.outcomes.push((suggestion.id, SuggestionOutcome::StillOpen)),
            Err(err) => {
                warn!(suggestion_id = %suggestion.id, error = %err, "fix check failed");
                report
                    .outcomes
                    .push((suggestion.id, SuggestionOutcome::CheckFailed(err.to_string())));
            }
        }
    }

    let promotions = verified
        .into_iter()
        .map(|suggestion| promote(ctx, opportunity, suggestion, builder, author_only));
    let mut payloads = Vec::new();
    for (id, outcome, saved, payload) in join_all(promotions).await {
        report.outcomes.push((id, outcome));
        report.fixed.extend(saved);
        payloads.extend(payload);
    }
    info!(
        checked = report.checked(),
        fixed = report.fixed.len(),
        "verified disappeared suggestions"
    );

    if !payloads.is_empty() {
        match ctx.store.add_fix_entities(opportunity.id, payloads).await {
            Ok(result) => {
                report.fix_entities_created = result.created_items.len();
                for item in &result.error_items {
                    error!(index = item.index, error = %item.message, "fix entity rejected");
                }
                report
                    .fix_entity_errors
                    .extend(result.error_items.into_iter().map(|item| item.message));
            }
            Err(err) => {
                error!(error = %err, "failed to add fix entities");
                report.fix_entity_errors.push(err.to_string());
            }
        }
    }

    report
}

async fn promote(
    ctx: ReconcileContext<'_>,
    opportunity: &Opportunity,
    suggestion: &Suggestion,
    builder: &dyn FixEntityBuilder,
    author_only: bool,
) -> (Uuid, SuggestionOutcome, Option<Suggestion>, Option<NewFixEntity>) {
    let mut fixed = suggestion.clone();
    fixed.status = SuggestionStatus::Fixed;
    fixed.updated_by = Some(UpdatedBy::SYSTEM.to_string());

    let saved = match ctx.store.save_suggestion(&fixed).await {
        Ok(saved) => saved,
        Err(err) => {
            error!(suggestion_id = %suggestion.id, error = %err, "failed to mark suggestion fixed");
            return (
                suggestion.id,
                SuggestionOutcome::PersistFailed(err.to_string()),
                None,
                None,
            );
        }
    };

    match ctx.store.fix_entities_for_suggestion(saved.id).await {
        Ok(linked) if !linked.is_empty() => {
            debug!(suggestion_id = %saved.id, "fix entity already recorded");
            return (saved.id, SuggestionOutcome::Fixed, Some(saved), None);
        }
        Ok(_) => {}
        Err(err) => {
            warn!(suggestion_id = %saved.id, error = %err, "could not look up existing fix entities");
        }
    }

    match builder.build(&saved, opportunity, author_only) {
        Ok(Some(payload)) => (saved.id, SuggestionOutcome::FixedWithFixEntity, Some(saved), Some(payload)),
        Ok(None) => (saved.id, SuggestionOutcome::Fixed, Some(saved), None),
        Err(err) => {
            error!(suggestion_id = %saved.id, error = %err, "failed to build fix entity");
            (
                saved.id,
                SuggestionOutcome::FixEntityFailed(err.to_string()),
                Some(saved),
                None,
            )
        }
    }
}
