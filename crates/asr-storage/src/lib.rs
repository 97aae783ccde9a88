//! Store contracts for opportunities, suggestions and fix entities, plus an
//! in-memory implementation.

use asr_core::{
    FixEntity, FixEntityStatus, NewFixEntity, NewOpportunity, NewSuggestion, Opportunity,
    OpportunityStatus, Suggestion, SuggestionStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "asr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("rejected by store: {0}")]
    Rejected(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One item of a batch create that the store refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub index: usize,
    pub message: String,
}

/// Outcome of a batch create: some items may land while others error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateResult<T> {
    pub created_items: Vec<T>,
    pub error_items: Vec<BatchItemError>,
}

impl<T> Default for BatchCreateResult<T> {
    fn default() -> Self {
        Self {
            created_items: Vec::new(),
            error_items: Vec::new(),
        }
    }
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn opportunities_by_site_and_status(
        &self,
        site_id: Uuid,
        status: OpportunityStatus,
    ) -> StoreResult<Vec<Opportunity>>;

    async fn create_opportunity(&self, draft: NewOpportunity) -> StoreResult<Opportunity>;

    async fn save_opportunity(&self, opportunity: &Opportunity) -> StoreResult<Opportunity>;
}

#[async_trait]
pub trait SuggestionStore: Send + Sync {
    async fn suggestions_for_opportunity(&self, opportunity_id: Uuid) -> StoreResult<Vec<Suggestion>>;

    async fn suggestion_by_id(&self, id: Uuid) -> StoreResult<Option<Suggestion>>;

    async fn add_suggestions(
        &self,
        opportunity_id: Uuid,
        drafts: Vec<NewSuggestion>,
    ) -> StoreResult<BatchCreateResult<Suggestion>>;

    async fn bulk_update_status(&self, ids: &[Uuid], status: SuggestionStatus) -> StoreResult<()>;

    async fn save_suggestion(&self, suggestion: &Suggestion) -> StoreResult<Suggestion>;
}

#[async_trait]
pub trait FixEntityStore: Send + Sync {
    async fn fix_entities_by_status(
        &self,
        opportunity_id: Uuid,
        status: FixEntityStatus,
    ) -> StoreResult<Vec<FixEntity>>;

    async fn add_fix_entities(
        &self,
        opportunity_id: Uuid,
        drafts: Vec<NewFixEntity>,
    ) -> StoreResult<BatchCreateResult<FixEntity>>;

    async fn suggestion_ids_for_fix_entity(&self, fix_entity_id: Uuid) -> StoreResult<Vec<Uuid>>;

    async fn fix_entities_for_suggestion(&self, suggestion_id: Uuid) -> StoreResult<Vec<FixEntity>>;

    async fn save_fix_entity(&self, fix_entity: &FixEntity) -> StoreResult<FixEntity>;
}

/// Everything the reconciliation engine needs from persistence.
pub trait Store: OpportunityStore + SuggestionStore + FixEntityStore {}

impl<T> Store for T where T: OpportunityStore + SuggestionStore + FixEntityStore {}

/// Link between a fix entity and one suggestion it remediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixLink {
    pub fix_entity_id: Uuid,
    pub suggestion_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub opportunities: Vec<Opportunity>,
    pub suggestions: Vec<Suggestion>,
    pub fix_entities: Vec<FixEntity>,
    pub fix_links: Vec<FixLink>,
}

/// In-process store; records keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }

    /// Inserts a suggestion verbatim, bypassing batch validation. Intended for seeding.
    pub async fn insert_suggestion(&self, suggestion: Suggestion) {
        self.state.lock().await.suggestions.push(suggestion);
    }

    /// Inserts a fix entity together with its suggestion links. Intended for seeding.
    pub async fn insert_fix_entity(&self, fix_entity: FixEntity, suggestion_ids: &[Uuid]) {
        let mut state = self.state.lock().await;
        for suggestion_id in suggestion_ids {
            state.fix_links.push(FixLink {
                fix_entity_id: fix_entity.id,
                suggestion_id: *suggestion_id,
            });
        }
        state.fix_entities.push(fix_entity);
    }
}

fn validate_new_suggestion(draft: &NewSuggestion) -> Result<(), String> {
    if draft.data.is_empty() {
        return Err("suggestion data must not be empty".to_string());
    }
    if draft.suggestion_type.trim().is_empty() {
        return Err("suggestion type is required".to_string());
    }
    Ok(())
}

fn validate_new_fix_entity(draft: &NewFixEntity) -> Result<(), String> {
    if draft.suggestion_ids.is_empty() {
        return Err("fix entity must reference at least one suggestion".to_string());
    }
    if draft.fix_type.trim().is_empty() {
        return Err("fix entity type is required".to_string());
    }
    Ok(())
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn opportunities_by_site_and_status(
        &self,
        site_id: Uuid,
        status: OpportunityStatus,
    ) -> StoreResult<Vec<Opportunity>> {
        let state = self.state.lock().await;
        Ok(state
            .opportunities
            .iter()
            .filter(|o| o.site_id == site_id && o.status == status)
            .cloned()
            .collect())
    }

    async fn create_opportunity(&self, draft: NewOpportunity) -> StoreResult<Opportunity> {
        if draft.opportunity_type.trim().is_empty() {
            return Err(StoreError::Rejected("opportunity type is required".into()));
        }
        let now = Utc::now();
        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            site_id: draft.site_id,
            audit_id: draft.audit_id,
            opportunity_type: draft.opportunity_type,
            origin: draft.origin,
            title: draft.title,
            description: draft.description,
            status: draft.status,
            data: draft.data,
            tags: draft.tags,
            updated_by: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.opportunities.push(opportunity.clone());
        Ok(opportunity)
    }

    async fn save_opportunity(&self, opportunity: &Opportunity) -> StoreResult<Opportunity> {
        let mut state = self.state.lock().await;
        let slot = state
            .opportunities
            .iter_mut()
            .find(|o| o.id == opportunity.id)
            .ok_or(StoreError::NotFound {
                entity: "opportunity",
                id: opportunity.id,
            })?;
        *slot = opportunity.clone();
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }
}

#[async_trait]
impl SuggestionStore for MemoryStore {
    async fn suggestions_for_opportunity(&self, opportunity_id: Uuid) -> StoreResult<Vec<Suggestion>> {
        let state = self.state.lock().await;
        Ok(state
            .suggestions
            .iter()
            .filter(|s| s.opportunity_id == opportunity_id)
            .cloned()
            .collect())
    }

    async fn suggestion_by_id(&self, id: Uuid) -> StoreResult<Option<Suggestion>> {
        let state = self.state.lock().await;
        Ok(state.suggestions.iter().find(|s| s.id == id).cloned())
    }

    async fn add_suggestions(
        &self,
        opportunity_id: Uuid,
        drafts: Vec<NewSuggestion>,
    ) -> StoreResult<BatchCreateResult<Suggestion>> {
        let mut state = self.state.lock().await;
        if !state.opportunities.iter().any(|o| o.id == opportunity_id) {
            return Err(StoreError::NotFound {
                entity: "opportunity",
                id: opportunity_id,
            });
        }

        let now = Utc::now();
        let mut result = BatchCreateResult::default();
        for (index, draft) in drafts.into_iter().enumerate() {
            if let Err(message) = validate_new_suggestion(&draft) {
                result.error_items.push(BatchItemError { index, message });
                continue;
            }
            let suggestion = Suggestion {
                id: Uuid::new_v4(),
                opportunity_id,
                suggestion_type: draft.suggestion_type,
                rank: draft.rank,
                status: draft.status,
                data: draft.data,
                updated_by: None,
                created_at: now,
                updated_at: now,
            };
            state.suggestions.push(suggestion.clone());
            result.created_items.push(suggestion);
        }
        debug!(
            %opportunity_id,
            created = result.created_items.len(),
            errors = result.error_items.len(),
            "memory store batch create"
        );
        Ok(result)
    }

    async fn bulk_update_status(&self, ids: &[Uuid], status: SuggestionStatus) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(missing) = ids
            .iter()
            .find(|id| !state.suggestions.iter().any(|s| s.id == **id))
        {
            return Err(StoreError::NotFound {
                entity: "suggestion",
                id: *missing,
            });
        }
        let now = Utc::now();
        for suggestion in state.suggestions.iter_mut().filter(|s| ids.contains(&s.id)) {
            suggestion.status = status;
            suggestion.updated_at = now;
        }
        Ok(())
    }

    async fn save_suggestion(&self, suggestion: &Suggestion) -> StoreResult<Suggestion> {
        let mut state = self.state.lock().await;
        let slot = state
            .suggestions
            .iter_mut()
            .find(|s| s.id == suggestion.id)
            .ok_or(StoreError::NotFound {
                entity: "suggestion",
                id: suggestion.id,
            })?;
        *slot = suggestion.clone();
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }
}

#[async_trait]
impl FixEntityStore for MemoryStore {
    async fn fix_entities_by_status(
        &self,
        opportunity_id: Uuid,
        status: FixEntityStatus,
    ) -> StoreResult<Vec<FixEntity>> {
        let state = self.state.lock().await;
        Ok(state
            .fix_entities
            .iter()
            .filter(|f| f.opportunity_id == opportunity_id && f.status == status)
            .cloned()
            .collect())
    }

    async fn add_fix_entities(
        &self,
        opportunity_id: Uuid,
        drafts: Vec<NewFixEntity>,
    ) -> StoreResult<BatchCreateResult<FixEntity>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut result = BatchCreateResult::default();
        for (index, draft) in drafts.into_iter().enumerate() {
            if let Err(message) = validate_new_fix_entity(&draft) {
                result.error_items.push(BatchItemError { index, message });
                continue;
            }
            let fix_entity = FixEntity {
                id: Uuid::new_v4(),
                opportunity_id,
                fix_type: draft.fix_type,
                status: draft.status,
                change_details: draft.change_details,
                created_at: now,
                updated_at: now,
                published_at: None,
            };
            for suggestion_id in draft.suggestion_ids {
                state.fix_links.push(FixLink {
                    fix_entity_id: fix_entity.id,
                    suggestion_id,
                });
            }
            state.fix_entities.push(fix_entity.clone());
            result.created_items.push(fix_entity);
        }
        Ok(result)
    }

    async fn suggestion_ids_for_fix_entity(&self, fix_entity_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .fix_links
            .iter()
            .filter(|link| link.fix_entity_id == fix_entity_id)
            .map(|link| link.suggestion_id)
            .collect())
    }

    async fn fix_entities_for_suggestion(&self, suggestion_id: Uuid) -> StoreResult<Vec<FixEntity>> {
        let state = self.state.lock().await;
        Ok(state
            .fix_links
            .iter()
            .filter(|link| link.suggestion_id == suggestion_id)
            .filter_map(|link| state.fix_entities.iter().find(|f| f.id == link.fix_entity_id))
            .cloned()
            .collect())
    }

    async fn save_fix_entity(&self, fix_entity: &FixEntity) -> StoreResult<FixEntity> {
        let mut state = self.state.lock().await;
        let slot = state
            .fix_entities
            .iter_mut()
            .find(|f| f.id == fix_entity.id)
            .ok_or(StoreError::NotFound {
                entity: "fix entity",
                id: fix_entity.id,
            })?;
        *slot = fix_entity.clone();
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }
}
