use async_trait::async_trait;
use thiserror::Error;

use deckhand_core::chrono::{DateTime, Utc};
use deckhand_core::domain::generation::{
    GenerationJob, GenerationJobId, GenerationTransitionEvent,
};
use deckhand_core::domain::knowledge::{Battlecard, CompanyProfile, KnowledgeBase, Product};
use deckhand_core::domain::opportunity::{DealContextItem, Opportunity, OpportunityId};
use deckhand_core::domain::organization::{Organization, OrganizationId};
use deckhand_core::domain::proposal::{Proposal, ProposalId};
use deckhand_core::domain::slide::Slide;
use deckhand_core::errors::DomainError;
use deckhand_core::generation_engine::TransitionResult;

pub mod generation_queue;
pub mod knowledge;
pub mod memory;
pub mod opportunity;
pub mod organization;
pub mod proposal;
mod rows;
#[cfg(test)]
pub(crate) mod test_support;

pub use generation_queue::SqlGenerationJobRepository;
pub use knowledge::SqlKnowledgeRepository;
pub use memory::{
    InMemoryGenerationJobRepository, InMemoryKnowledgeRepository, InMemoryOpportunityRepository,
    InMemoryOrganizationRepository, InMemoryProposalRepository,
};
pub use opportunity::SqlOpportunityRepository;
pub use organization::SqlOrganizationRepository;
pub use proposal::SqlProposalRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn find_by_id(&self, id: &OrganizationId)
        -> Result<Option<Organization>, RepositoryError>;
    async fn save(&self, organization: Organization) -> Result<(), RepositoryError>;
}

/// Organization-scoped reference data used as generation context.
#[async_trait]
pub trait KnowledgeRepository: Send + Sync {
    /// Company profile plus active products and battlecards, ordered by name.
    async fn load_knowledge_base(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<KnowledgeBase, RepositoryError>;
    async fn save_company_profile(&self, profile: CompanyProfile) -> Result<(), RepositoryError>;
    async fn save_product(&self, product: Product) -> Result<(), RepositoryError>;
    async fn save_battlecard(&self, battlecard: Battlecard) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    async fn find_by_id(&self, id: &OpportunityId) -> Result<Option<Opportunity>, RepositoryError>;
    async fn save(&self, opportunity: Opportunity) -> Result<(), RepositoryError>;
    /// Fails with `Conflict` while any proposal references the opportunity.
    async fn delete(&self, id: &OpportunityId) -> Result<(), RepositoryError>;
    async fn list_deal_context(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<DealContextItem>, RepositoryError>;
    async fn add_deal_context(&self, item: DealContextItem) -> Result<(), RepositoryError>;
}

/// Proposal rows. Terminal writes are single conditional updates so that
/// status, slides and error message always change together.
#[async_trait]
pub trait ProposalRepository: Send + Sync {
    async fn find_by_id(&self, id: &ProposalId) -> Result<Option<Proposal>, RepositoryError>;

    /// Newest version first.
    async fn list_for_opportunity(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<Proposal>, RepositoryError>;

    /// Inserts a `queued` proposal carrying the next version for its opportunity.
    async fn create_next_version(
        &self,
        id: ProposalId,
        organization_id: OrganizationId,
        opportunity_id: OpportunityId,
        prompt: String,
        now: DateTime<Utc>,
    ) -> Result<Proposal, RepositoryError>;

    /// `queued -> generating`. Returns false when the row was not queued.
    async fn mark_generating(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// `generating -> complete` with the full deck. Returns false when the
    /// row was not generating.
    async fn complete(
        &self,
        id: &ProposalId,
        slides: &[Slide],
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Any non-terminal status `-> error`. Returns false when the row was
    /// already terminal.
    async fn fail(
        &self,
        id: &ProposalId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait GenerationJobRepository: Send + Sync {
    /// Persists a freshly created job and its audit event. Fails with
    /// `Conflict` when the proposal already has a queued or running job.
    async fn enqueue(&self, created: TransitionResult) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &GenerationJobId)
        -> Result<Option<GenerationJob>, RepositoryError>;

    /// Most recently created job for the proposal, in any state.
    async fn find_latest_for_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Option<GenerationJob>, RepositoryError>;

    /// Oldest queued jobs first.
    async fn list_queued(&self, limit: u32) -> Result<Vec<GenerationJob>, RepositoryError>;

    async fn list_running(&self) -> Result<Vec<GenerationJob>, RepositoryError>;

    /// Writes a state transition if the stored row still carries
    /// `expected_version`. Returns false when another writer got there first.
    async fn apply_transition(
        &self,
        expected_version: u32,
        result: TransitionResult,
    ) -> Result<bool, RepositoryError>;

    /// Writes stage and progress message for a running job. Returns false
    /// once the job has left the running state.
    async fn update_stage(&self, job: &GenerationJob) -> Result<bool, RepositoryError>;

    async fn list_transitions(
        &self,
        job_id: &GenerationJobId,
    ) -> Result<Vec<GenerationTransitionEvent>, RepositoryError>;
}
