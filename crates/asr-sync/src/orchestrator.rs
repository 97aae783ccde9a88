//! One-call pipeline: reconcile disappeared suggestions, publish verified
//! fix entities, then synchronize, sharing a single suggestion fetch.

use tracing::{info, info_span, Instrument};

use crate::publish::{publish_deployed_fix_entities, FastPath, ProductionVerifier, PublishReport};
use crate::reconcile::{
    disappeared_suggestions, reconcile_disappeared_suggestions, FixEntityBuilder, FixVerifier,
    ReconcileReport,
};
use crate::synchronizer::{finding_keys, sync_suggestions, SyncOutcome, SyncRequest};
use crate::{ReconcileContext, SyncError};

/// Optional stage callbacks; a missing callback skips its stage.
#[derive(Clone, Copy, Default)]
pub struct PublishHooks<'a> {
    pub fix_verifier: Option<&'a dyn FixVerifier>,
    pub fix_entity_builder: Option<&'a dyn FixEntityBuilder>,
    pub production_verifier: Option<&'a dyn ProductionVerifier>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub author_only: bool,
    pub reconcile: Option<ReconcileReport>,
    pub publish: Option<PublishReport>,
    pub sync: SyncOutcome,
}

pub async fn sync_suggestions_with_publish_detection(
    ctx: ReconcileContext<'_>,
    request: SyncRequest<'_>,
    hooks: PublishHooks<'_>,
) -> Result<PipelineOutcome, SyncError> {
    let span = info_span!(
        "sync_with_publish_detection",
        opportunity_id = %request.opportunity.id,
        opportunity_type = %request.opportunity.opportunity_type
    );
    run_pipeline(ctx, request, hooks).instrument(span).await
}

async fn run_pipeline(
    ctx: ReconcileContext<'_>,
    mut request: SyncRequest<'_>,
    hooks: PublishHooks<'_>,
) -> Result<PipelineOutcome, SyncError> {
    let opportunity = request.opportunity;
    let author_only = ctx.config.is_author_only(&opportunity.opportunity_type);

    let mut existing = match request.existing.take() {
        Some(existing) => existing,
        None => ctx.store.suggestions_for_opportunity(opportunity.id).await?,
    };
    let current_keys = finding_keys(&request.new_data, request.build_key);

    let reconcile = match (hooks.fix_verifier, hooks.fix_entity_builder) {
        (Some(verifier), Some(builder)) => {
            let disappeared = disappeared_suggestions(&existing, &current_keys, request.build_key);
            let report = reconcile_disappeared_suggestions(
                ctx,
                opportunity,
                &disappeared,
                verifier,
                builder,
                author_only,
            )
            .await;
            // Later stages must see the promoted statuses.
            for fixed in &report.fixed {
                if let Some(slot) = existing.iter_mut().find(|s| s.id == fixed.id) {
                    *slot = fixed.clone();
                }
            }
            Some(report)
        }
        _ => None,
    };

    let publish = match hooks.production_verifier {
        Some(_) if author_only => {
            info!("author-only opportunity; deployed fixes are terminal, skipping publication");
            None
        }
        Some(verifier) => {
            let fast_path = FastPath {
                current_keys: &current_keys,
                build_key: request.build_key,
            };
            Some(publish_deployed_fix_entities(ctx, opportunity.id, verifier, Some(fast_path)).await)
        }
        None => None,
    };

    request.existing = Some(existing);
    let sync = sync_suggestions(ctx, request).await?;

    Ok(PipelineOutcome {
        author_only,
        reconcile,
        publish,
        sync,
    })
}
