use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use deckhand_core::chrono::{DateTime, Utc};
use deckhand_core::domain::generation::{
    GenerationJob, GenerationJobId, GenerationJobState, GenerationTransitionEvent,
};
use deckhand_core::domain::knowledge::{Battlecard, CompanyProfile, KnowledgeBase, Product};
use deckhand_core::domain::opportunity::{DealContextItem, Opportunity, OpportunityId};
use deckhand_core::domain::organization::{Organization, OrganizationId};
use deckhand_core::domain::proposal::{Proposal, ProposalId, ProposalStatus};
use deckhand_core::domain::slide::Slide;
use deckhand_core::generation_engine::TransitionResult;

use super::{
    GenerationJobRepository, KnowledgeRepository, OpportunityRepository, OrganizationRepository,
    ProposalRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryOrganizationRepository {
    organizations: RwLock<HashMap<String, Organization>>,
}

#[async_trait::async_trait]
impl OrganizationRepository for InMemoryOrganizationRepository {
    async fn find_by_id(
        &self,
        id: &OrganizationId,
    ) -> Result<Option<Organization>, RepositoryError> {
        let organizations = self.organizations.read().await;
        Ok(organizations.get(&id.0).cloned())
    }

    async fn save(&self, organization: Organization) -> Result<(), RepositoryError> {
        let mut organizations = self.organizations.write().await;
        organizations.insert(organization.id.0.clone(), organization);
        Ok(())
    }
}

#[derive(Default)]
struct KnowledgeState {
    profiles: HashMap<String, CompanyProfile>,
    products: HashMap<String, Product>,
    battlecards: HashMap<String, Battlecard>,
}

#[derive(Default)]
pub struct InMemoryKnowledgeRepository {
    state: RwLock<KnowledgeState>,
}

#[async_trait::async_trait]
impl KnowledgeRepository for InMemoryKnowledgeRepository {
    async fn load_knowledge_base(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<KnowledgeBase, RepositoryError> {
        let state = self.state.read().await;

        let mut products: Vec<_> = state
            .products
            .values()
            .filter(|product| product.active && &product.organization_id == organization_id)
            .cloned()
            .collect();
        products.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.0.cmp(&b.id.0)));

        let mut battlecards: Vec<_> = state
            .battlecards
            .values()
            .filter(|card| card.active && &card.organization_id == organization_id)
            .cloned()
            .collect();
        battlecards.sort_by(|a, b| {
            a.competitor_name.cmp(&b.competitor_name).then_with(|| a.id.cmp(&b.id))
        });

        Ok(KnowledgeBase {
            company_profile: state.profiles.get(&organization_id.0).cloned(),
            products,
            battlecards,
        })
    }

    async fn save_company_profile(&self, profile: CompanyProfile) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.profiles.insert(profile.organization_id.0.clone(), profile);
        Ok(())
    }

    async fn save_product(&self, product: Product) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.products.insert(product.id.0.clone(), product);
        Ok(())
    }

    async fn save_battlecard(&self, battlecard: Battlecard) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.battlecards.insert(battlecard.id.clone(), battlecard);
        Ok(())
    }
}

/// Proposal store. Clones share the same rows so an opportunity store can
/// enforce the delete restriction against it.
#[derive(Clone, Default)]
pub struct InMemoryProposalRepository {
    proposals: Arc<RwLock<HashMap<String, Proposal>>>,
}

impl InMemoryProposalRepository {
    async fn has_proposals_for(&self, opportunity_id: &OpportunityId) -> bool {
        let proposals = self.proposals.read().await;
        proposals.values().any(|proposal| &proposal.opportunity_id == opportunity_id)
    }

    async fn update_status<F>(&self, id: &ProposalId, apply: F) -> Result<bool, RepositoryError>
    where
        F: FnOnce(&mut Proposal) -> Result<(), deckhand_core::DomainError> + Send,
    {
        let mut proposals = self.proposals.write().await;
        let Some(stored) = proposals.get_mut(&id.0) else {
            return Ok(false);
        };
        if stored.status.is_terminal() {
            return Ok(false);
        }

        let mut candidate = stored.clone();
        match apply(&mut candidate) {
            Ok(()) => {
                *stored = candidate;
                Ok(true)
            }
            Err(deckhand_core::DomainError::InvalidProposalTransition { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl ProposalRepository for InMemoryProposalRepository {
    async fn find_by_id(&self, id: &ProposalId) -> Result<Option<Proposal>, RepositoryError> {
        let proposals = self.proposals.read().await;
        Ok(proposals.get(&id.0).cloned())
    }

    async fn list_for_opportunity(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<Proposal>, RepositoryError> {
        let proposals = self.proposals.read().await;
        let mut listed: Vec<_> = proposals
            .values()
            .filter(|proposal| &proposal.opportunity_id == opportunity_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(listed)
    }

    async fn create_next_version(
        &self,
        id: ProposalId,
        organization_id: OrganizationId,
        opportunity_id: OpportunityId,
        prompt: String,
        now: DateTime<Utc>,
    ) -> Result<Proposal, RepositoryError> {
        let mut proposals = self.proposals.write().await;
        if proposals.contains_key(&id.0) {
            return Err(RepositoryError::Conflict(format!("proposal {id} already exists")));
        }

        let version = proposals
            .values()
            .filter(|proposal| proposal.opportunity_id == opportunity_id)
            .map(|proposal| proposal.version)
            .max()
            .unwrap_or(0)
            + 1;
        let proposal =
            Proposal::new_queued(id, organization_id, opportunity_id, version, prompt, now);
        proposals.insert(proposal.id.0.clone(), proposal.clone());
        Ok(proposal)
    }

    async fn mark_generating(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.update_status(id, |proposal| proposal.transition_to(ProposalStatus::Generating, now))
            .await
    }

    async fn complete(
        &self,
        id: &ProposalId,
        slides: &[Slide],
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let slides = slides.to_vec();
        self.update_status(id, move |proposal| proposal.complete(slides, now)).await
    }

    async fn fail(
        &self,
        id: &ProposalId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let message = message.to_string();
        self.update_status(id, move |proposal| proposal.fail(message, now)).await
    }
}

#[derive(Default)]
pub struct InMemoryOpportunityRepository {
    opportunities: RwLock<HashMap<String, Opportunity>>,
    deal_context: RwLock<Vec<DealContextItem>>,
    proposals: Option<InMemoryProposalRepository>,
}

impl InMemoryOpportunityRepository {
    /// Deletes are refused while `proposals` holds a row for the opportunity.
    pub fn with_proposals(proposals: InMemoryProposalRepository) -> Self {
        Self { proposals: Some(proposals), ..Self::default() }
    }
}

#[async_trait::async_trait]
impl OpportunityRepository for InMemoryOpportunityRepository {
    async fn find_by_id(&self, id: &OpportunityId) -> Result<Option<Opportunity>, RepositoryError> {
        let opportunities = self.opportunities.read().await;
        Ok(opportunities.get(&id.0).cloned())
    }

    async fn save(&self, opportunity: Opportunity) -> Result<(), RepositoryError> {
        let mut opportunities = self.opportunities.write().await;
        opportunities.insert(opportunity.id.0.clone(), opportunity);
        Ok(())
    }

    async fn delete(&self, id: &OpportunityId) -> Result<(), RepositoryError> {
        if let Some(proposals) = &self.proposals {
            if proposals.has_proposals_for(id).await {
                return Err(RepositoryError::Conflict(format!(
                    "opportunity {id} has proposals and cannot be deleted"
                )));
            }
        }

        let mut opportunities = self.opportunities.write().await;
        if opportunities.remove(&id.0).is_none() {
            return Err(RepositoryError::NotFound(format!("opportunity {id}")));
        }
        self.deal_context.write().await.retain(|item| &item.opportunity_id != id);
        Ok(())
    }

    async fn list_deal_context(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<DealContextItem>, RepositoryError> {
        let items = self.deal_context.read().await;
        let mut listed: Vec<_> =
            items.iter().filter(|item| &item.opportunity_id == opportunity_id).cloned().collect();
        listed.sort_by(|a, b| b.effective_at().cmp(&a.effective_at()).then_with(|| a.id.cmp(&b.id)));
        Ok(listed)
    }

    async fn add_deal_context(&self, item: DealContextItem) -> Result<(), RepositoryError> {
        self.deal_context.write().await.push(item);
        Ok(())
    }
}

#[derive(Default)]
struct JobState {
    jobs: HashMap<String, GenerationJob>,
    transitions: Vec<GenerationTransitionEvent>,
}

#[derive(Default)]
pub struct InMemoryGenerationJobRepository {
    state: RwLock<JobState>,
}

#[async_trait::async_trait]
impl GenerationJobRepository for InMemoryGenerationJobRepository {
    async fn enqueue(&self, created: TransitionResult) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let job = created.job;
        let has_active = state
            .jobs
            .values()
            .any(|existing| existing.proposal_id == job.proposal_id && existing.state.is_active());
        if has_active {
            return Err(RepositoryError::Conflict(format!(
                "proposal {} already has an active generation job",
                job.proposal_id
            )));
        }

        state.jobs.insert(job.id.0.clone(), job);
        state.transitions.push(created.transition);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &GenerationJobId,
    ) -> Result<Option<GenerationJob>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id.0).cloned())
    }

    async fn find_latest_for_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Option<GenerationJob>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| &job.proposal_id == proposal_id)
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn list_queued(&self, limit: u32) -> Result<Vec<GenerationJob>, RepositoryError> {
        let state = self.state.read().await;
        let mut queued: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.state == GenerationJobState::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|job| job.created_at);
        queued.truncate(limit as usize);
        Ok(queued)
    }

    async fn list_running(&self) -> Result<Vec<GenerationJob>, RepositoryError> {
        let state = self.state.read().await;
        let mut running: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.state == GenerationJobState::Running)
            .cloned()
            .collect();
        running.sort_by_key(|job| job.claimed_at);
        Ok(running)
    }

    async fn apply_transition(
        &self,
        expected_version: u32,
        result: TransitionResult,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let current_version = match state.jobs.get(&result.job.id.0) {
            Some(stored) => stored.state_version,
            None => return Ok(false),
        };
        if current_version != expected_version {
            return Ok(false);
        }

        state.jobs.insert(result.job.id.0.clone(), result.job);
        state.transitions.push(result.transition);
        Ok(true)
    }

    async fn update_stage(&self, job: &GenerationJob) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.jobs.get_mut(&job.id.0) else {
            return Ok(false);
        };
        if stored.state != GenerationJobState::Running {
            return Ok(false);
        }

        stored.stage = job.stage;
        stored.progress_message = job.progress_message.clone();
        stored.updated_at = job.updated_at;
        Ok(true)
    }

    async fn list_transitions(
        &self,
        job_id: &GenerationJobId,
    ) -> Result<Vec<GenerationTransitionEvent>, RepositoryError> {
        let state = self.state.read().await;
        let mut transitions: Vec<_> =
            state.transitions.iter().filter(|event| &event.job_id == job_id).cloned().collect();
        transitions.sort_by_key(|event| (event.state_version, event.occurred_at));
        Ok(transitions)
    }
}
