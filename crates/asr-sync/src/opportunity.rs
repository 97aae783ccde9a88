//! Find-or-create of the opportunity an audit run reports into.

use asr_core::{NewOpportunity, Opportunity, OpportunityStatus, SuggestionData, UpdatedBy};
use tracing::{debug, info};
use uuid::Uuid;

use crate::policy::default_merge_data;
use crate::{ReconcileContext, SyncError};

/// Audit-supplied description of the opportunity for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityProps {
    pub opportunity_type: String,
    pub audit_id: Option<Uuid>,
    pub origin: String,
    pub title: String,
    pub description: Option<String>,
    pub data: SuggestionData,
    pub tags: Vec<String>,
}

/// Extra match condition between a candidate opportunity and the new props.
pub type OpportunityMatcher = dyn Fn(&Opportunity, &OpportunityProps) -> bool + Send + Sync;

/// Reuses the site's open opportunity of the same type (refreshing it from
/// `props`) or creates a new one in `NEW` status.
pub async fn convert_to_opportunity(
    ctx: ReconcileContext<'_>,
    props: OpportunityProps,
    matcher: Option<&OpportunityMatcher>,
) -> Result<Opportunity, SyncError> {
    let mut open = ctx
        .store
        .opportunities_by_site_and_status(ctx.site.id, OpportunityStatus::New)
        .await?;
    open.extend(
        ctx.store
            .opportunities_by_site_and_status(ctx.site.id, OpportunityStatus::InProgress)
            .await?,
    );

    let found = open.into_iter().find(|candidate| {
        candidate.opportunity_type == props.opportunity_type
            && matcher.map_or(true, |matches| matches(candidate, &props))
    });

    match found {
        Some(mut opportunity) => {
            opportunity.data = default_merge_data(&opportunity.data, &props.data);
            opportunity.title = props.title;
            opportunity.description = props.description;
            opportunity.tags = props.tags;
            if props.audit_id.is_some() {
                opportunity.audit_id = props.audit_id;
            }
            opportunity.updated_by = Some(UpdatedBy::SYSTEM.to_string());
            let saved = ctx.store.save_opportunity(&opportunity).await?;
            debug!(opportunity_id = %saved.id, "refreshed existing opportunity");
            Ok(saved)
        }
        None => {
            let created = ctx
                .store
                .create_opportunity(NewOpportunity {
                    site_id: ctx.site.id,
                    audit_id: props.audit_id,
                    opportunity_type: props.opportunity_type,
                    origin: props.origin,
                    title: props.title,
                    description: props.description,
                    status: OpportunityStatus::New,
                    data: props.data,
                    tags: props.tags,
                })
                .await?;
            info!(opportunity_id = %created.id, opportunity_type = %created.opportunity_type, "created opportunity");
            Ok(created)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconcileConfig;
    use asr_core::{data_from_value, Site};
    use asr_storage::{MemoryStore, OpportunityStore};
    use serde_json::json;

    fn props(title: &str, data: serde_json::Value) -> OpportunityProps {
        OpportunityProps {
            opportunity_type: "broken-backlinks".into(),
            audit_id: Some(Uuid::new_v4()),
            origin: "AUTOMATION".into(),
            title: title.into(),
            description: Some("Fix broken backlinks".into()),
            data: data_from_value(data),
            tags: vec!["SEO".into()],
        }
    }

    #[tokio::test]
    async fn creates_then_reuses_open_opportunity() {
        let store = MemoryStore::new();
        let site = Site {
            id: Uuid::new_v4(),
            base_url: "https://example.test".into(),
            requires_validation: false,
        };
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);

        let first = convert_to_opportunity(ctx, props("v1", json!({"a": 1, "keep": true})), None)
            .await
            .unwrap();
        assert_eq!(first.status, OpportunityStatus::New);

        let second = convert_to_opportunity(ctx, props("v2", json!({"a": 2})), None)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.title, "v2");
        assert_eq!(second.data, data_from_value(json!({"a": 2, "keep": true})));
        assert_eq!(second.updated_by.as_deref(), Some(UpdatedBy::SYSTEM));
    }

    #[tokio::test]
    async fn resolved_or_unmatched_opportunities_are_not_reused() {
        let store = MemoryStore::new();
        let site = Site {
            id: Uuid::new_v4(),
            base_url: "https://example.test".into(),
            requires_validation: false,
        };
        let config = ReconcileConfig::default();
        let ctx = ReconcileContext::new(&store, &site, &config);

        let mut resolved = convert_to_opportunity(ctx, props("old", json!({})), None)
            .await
            .unwrap();
        resolved.status = OpportunityStatus::Resolved;
        store.save_opportunity(&resolved).await.unwrap();

        let fresh = convert_to_opportunity(ctx, props("new", json!({"page": "/a"})), None)
            .await
            .unwrap();
        assert_ne!(fresh.id, resolved.id);

        let by_page = |candidate: &Opportunity, props: &OpportunityProps| {
            candidate.data.get("page") == props.data.get("page")
        };
        let other_page = convert_to_opportunity(ctx, props("other", json!({"page": "/b"})), Some(&by_page))
            .await
            .unwrap();
        assert_ne!(other_page.id, fresh.id);
    }
}
