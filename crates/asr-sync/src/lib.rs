//! Suggestion reconciliation engine: keeps an opportunity's suggestions and
//! fix entities in step with each new audit run.

use asr_core::Site;
use asr_storage::{Store, StoreError};
use thiserror::Error;
use uuid::Uuid;

pub mod config;
pub mod executor;
pub mod opportunity;
pub mod orchestrator;
pub mod policy;
pub mod publish;
pub mod reconcile;
pub mod synchronizer;

pub use config::{ConfigError, ReconcileConfig};
pub use executor::{settle_bounded, DEFAULT_CHECK_CONCURRENCY};
pub use opportunity::{convert_to_opportunity, OpportunityMatcher, OpportunityProps};
pub use orchestrator::{sync_suggestions_with_publish_detection, PipelineOutcome, PublishHooks};
pub use policy::{
    default_merge_data, default_merge_status, key_by_field, keep_latest_data, keep_same_data,
    BuildSuggestionFn, KeyFn, MergeDataFn, MergeStatusFn, StatusContext,
};
pub use publish::{
    publish_deployed_fix_entities, FastPath, NotResolved, ProductionVerifier, PublishOutcome,
    PublishReport,
};
pub use reconcile::{
    disappeared_suggestions, reconcile_disappeared_suggestions, FixEntityBuilder, FixVerifier,
    ReconcileReport, SuggestionOutcome,
};
pub use synchronizer::{sync_suggestions, ScrapedFilter, SyncOutcome, SyncRequest};

pub const CRATE_NAME: &str = "asr-sync";

/// Dependencies handed to every engine entry point.
#[derive(Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub store: &'a dyn Store,
    pub site: &'a Site,
    pub config: &'a ReconcileConfig,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(store: &'a dyn Store, site: &'a Site, config: &'a ReconcileConfig) -> Self {
        Self {
            store,
            site,
            config,
        }
    }

    pub fn status_context(&self) -> StatusContext {
        StatusContext {
            requires_validation: self.site.requires_validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to create suggestions for site {site_id} ({failed} errors). Sample error: {sample}")]
    CreateFailed {
        site_id: Uuid,
        failed: usize,
        sample: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
