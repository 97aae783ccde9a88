//! Promotes `DEPLOYED` fix entities to `PUBLISHED` once every linked
//! suggestion is confirmed resolved on production.

use std::collections::HashSet;

use asr_core::{FixEntity, FixEntityStatus, Suggestion};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::settle_bounded;
use crate::policy::KeyFn;
use crate::ReconcileContext;

/// Checks a suggestion's remediation against the live site.
#[async_trait]
pub trait ProductionVerifier: Send + Sync {
    async fn is_resolved_on_production(&self, suggestion: &Suggestion) -> anyhow::Result<bool>;
}

/// Keys found in the current run; a linked suggestion whose key is still
/// present cannot be resolved, so verification is skipped.
#[derive(Clone, Copy)]
pub struct FastPath<'a> {
    pub current_keys: &'a HashSet<String>,
    pub build_key: &'a KeyFn,
}

impl FastPath<'_> {
    fn still_detected(&self, suggestion: &Suggestion) -> bool {
        self.current_keys.contains(&(self.build_key)(&suggestion.data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotResolved {
    NoLinkedSuggestions,
    LinkLookupFailed(String),
    MissingSuggestion(Uuid),
    SuggestionLookupFailed { suggestion_id: Uuid, message: String },
    StillDetected(Uuid),
    NotLive(Uuid),
    VerificationFailed { suggestion_id: Uuid, message: String },
    CheckFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    NotResolved(NotResolved),
    PersistFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub deployed: usize,
    pub outcomes: Vec<(Uuid, PublishOutcome)>,
    /// Set when the stage could not run at all.
    pub failure: Option<String>,
}

impl PublishReport {
    pub fn published(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == PublishOutcome::Published)
            .count()
    }

    pub fn outcome_of(&self, fix_entity_id: Uuid) -> Option<&PublishOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == fix_entity_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Best-effort: never fails, problems are logged and reported.
pub async fn publish_deployed_fix_entities(
    ctx: ReconcileContext<'_>,
    opportunity_id: Uuid,
    verifier: &dyn ProductionVerifier,
    fast_path: Option<FastPath<'_>>,
) -> PublishReport {
    let span = info_span!("publish_deployed_fix_entities", %opportunity_id);
    run_publish(ctx, opportunity_id, verifier, fast_path)
        .instrument(span)
        .await
}

async fn run_publish(
    ctx: ReconcileContext<'_>,
    opportunity_id: Uuid,
    verifier: &dyn ProductionVerifier,
    fast_path: Option<FastPath<'_>>,
) -> PublishReport {
    let mut report = PublishReport::default();

    let deployed = match ctx
        .store
        .fix_entities_by_status(opportunity_id, FixEntityStatus::Deployed)
        .await
    {
        Ok(deployed) => deployed,
        Err(err) => {
            error!(error = %err, "failed to load deployed fix entities");
            report.failure = Some(err.to_string());
            return report;
        }
    };
    report.deployed = deployed.len();
    if deployed.is_empty() {
        debug!("no deployed fix entities");
        return report;
    }

    let limit = ctx.config.check_concurrency;
    let checks: Vec<_> = deployed
        .iter()
        .map(|fix| {
            move || async move {
                Ok::<_, anyhow::Error>(check_resolution(ctx, fix, verifier, fast_path, limit).await)
            }
        })
        .collect();
    let verdicts = settle_bounded(checks, limit).await;

    let mut resolved = Vec::new();
    for (fix, verdict) in deployed.iter().zip(verdicts) {
        match verdict {
            Ok(Ok(())) => resolved.push(fix),
            Ok(Err(reason)) => {
                debug!(fix_entity_id = %fix.id, ?reason, "fix entity not resolved");
                report
                    .outcomes
                    .push((fix.id, PublishOutcome::NotResolved(reason)));
            }
            Err(err) => {
                warn!(fix_entity_id = %fix.id, error = %err, "fix entity check failed");
                report.outcomes.push((
                    fix.id,
                    PublishOutcome::NotResolved(NotResolved::CheckFailed(err.to_string())),
                ));
            }
        }
    }

    let saves = resolved.into_iter().map(|fix| async move {
        let mut published = fix.clone();
        published.status = FixEntityStatus::Published;
        published.published_at = Some(Utc::now());
        (fix.id, ctx.store.save_fix_entity(&published).await)
    });
    for (id, result) in join_all(saves).await {
        match result {
            Ok(_) => report.outcomes.push((id, PublishOutcome::Published)),
            Err(err) => {
                error!(fix_entity_id = %id, error = %err, "failed to publish fix entity");
                report
                    .outcomes
                    .push((id, PublishOutcome::PersistFailed(err.to_string())));
            }
        }
    }

    info!(
        deployed = report.deployed,
        published = report.published(),
        "published verified fix entities"
    );
    report
}

async fn check_resolution(
    ctx: ReconcileContext<'_>,
    fix: &FixEntity,
    verifier: &dyn ProductionVerifier,
    fast_path: Option<FastPath<'_>>,
    limit: usize,
) -> Result<(), NotResolved> {
    let ids = ctx
        .store
        .suggestion_ids_for_fix_entity(fix.id)
        .await
        .map_err(|err| NotResolved::LinkLookupFailed(err.to_string()))?;
    if ids.is_empty() {
        return Err(NotResolved::NoLinkedSuggestions);
    }

    let mut suggestions = Vec::with_capacity(ids.len());
    for id in ids {
        match ctx.store.suggestion_by_id(id).await {
            Ok(Some(suggestion)) => suggestions.push(suggestion),
            Ok(None) => return Err(NotResolved::MissingSuggestion(id)),
            Err(err) => {
                warn!(suggestion_id = %id, error = %err, "failed to load linked suggestion");
                return Err(NotResolved::SuggestionLookupFailed {
                    suggestion_id: id,
                    message: err.to_string(),
                });
            }
        }
    }

    if let Some(fast_path) = fast_path {
        if let Some(still) = suggestions.iter().find(|s| fast_path.still_detected(s)) {
            return Err(NotResolved::StillDetected(still.id));
        }
    }

    let checks: Vec<_> = suggestions
        .iter()
        .map(|suggestion| move || verifier.is_resolved_on_production(suggestion))
        .collect();
    let verdicts = settle_bounded(checks, limit).await;

    for (suggestion, verdict) in suggestions.iter().zip(verdicts) {
        match verdict {
            Ok(true) => {}
            Ok(false) => return Err(NotResolved::NotLive(suggestion.id)),
            Err(err) => {
                return Err(NotResolved::VerificationFailed {
                    suggestion_id: suggestion.id,
                    message: err.to_string(),
                })
            }
        }
    }
    Ok(())
}
