use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use deckhand_agent::context::ContextAssembler;
use deckhand_agent::generator::{GenerationSettings, ProposalGenerator};
use deckhand_agent::llm::factory::ProviderFactory;
use deckhand_agent::llm::{LlmProvider, ScriptedProvider};
use deckhand_agent::retry::RetryPolicy;
use deckhand_agent::selector::ProviderSelector;
use deckhand_core::config::AppConfig;
use deckhand_core::domain::generation::GenerationRequest;
use deckhand_core::domain::opportunity::{Opportunity, OpportunityId};
use deckhand_core::domain::organization::{Organization, OrganizationId, PlanTier, ProviderId};
use deckhand_core::domain::proposal::{Proposal, ProposalId};
use deckhand_core::domain::slide::{Slide, SlideContent};
use deckhand_core::generation_engine::GenerationEngine;
use deckhand_core::progress::ProgressPolicy;
use deckhand_db::repositories::{
    InMemoryGenerationJobRepository, InMemoryKnowledgeRepository, InMemoryOpportunityRepository,
    InMemoryOrganizationRepository, InMemoryProposalRepository, OpportunityRepository,
    OrganizationRepository, ProposalRepository,
};

use crate::api::ApiState;
use crate::queue::GenerationQueue;
use crate::worker::{GenerationWorker, WorkerSettings};

pub const ORG: &str = "org-1";
pub const OTHER_ORG: &str = "org-2";
pub const OPPORTUNITY: &str = "opp-1";
pub const PROMPT: &str = "Create a proposal for Acme Corp, 50 users, annual billing";

pub const OUTLINE: &str = r#"{"slides": [{"title": "Acme Corp", "type": "title"}, {"title": "Pricing", "type": "table"}]}"#;
pub const TITLE_SLIDE: &str = r#"{"type": "title", "title": "Acme Corp", "content": {"heading": "Acme Corp", "subheading": "Annual plan"}}"#;
pub const TABLE_SLIDE: &str = "```json\n{\"type\": \"table\", \"title\": \"Pricing\", \"content\": {\"headers\": [\"Plan\", \"Annual\"], \"rows\": [[\"Pro x50\", \"$60,000\"]]}}\n```";

/// Hands out the two scripted backends by id.
struct ScriptedFactory {
    default: Arc<ScriptedProvider>,
    premium: Arc<ScriptedProvider>,
}

impl ProviderFactory for ScriptedFactory {
    fn create(&self, provider_id: ProviderId) -> Arc<dyn LlmProvider> {
        match provider_id {
            ProviderId::Anthropic => self.default.clone(),
            ProviderId::Bedrock => self.premium.clone(),
        }
    }
}

pub struct Harness {
    pub organizations: Arc<InMemoryOrganizationRepository>,
    pub opportunities: Arc<InMemoryOpportunityRepository>,
    pub proposals: Arc<InMemoryProposalRepository>,
    pub jobs: Arc<InMemoryGenerationJobRepository>,
    pub provider: Arc<ScriptedProvider>,
    pub premium: Arc<ScriptedProvider>,
    pub selector: Arc<ProviderSelector>,
    pub assembler: Arc<ContextAssembler>,
    pub queue: Arc<GenerationQueue>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_engine(GenerationEngine::new()).await
    }

    pub async fn with_engine(engine: GenerationEngine) -> Self {
        let organizations = Arc::new(InMemoryOrganizationRepository::default());
        let proposals = Arc::new(InMemoryProposalRepository::default());
        let opportunities =
            Arc::new(InMemoryOpportunityRepository::with_proposals(proposals.as_ref().clone()));
        let knowledge = Arc::new(InMemoryKnowledgeRepository::default());
        let jobs = Arc::new(InMemoryGenerationJobRepository::default());

        for (id, tier, preference) in [
            (ORG, PlanTier::Professional, None),
            (OTHER_ORG, PlanTier::Enterprise, Some(ProviderId::Bedrock)),
        ] {
            organizations
                .save(Organization {
                    id: OrganizationId(id.to_string()),
                    name: format!("{id} inc"),
                    plan_tier: tier,
                    provider_preference: preference,
                })
                .await
                .expect("seed organization");
        }
        opportunities
            .save(Opportunity {
                id: OpportunityId(OPPORTUNITY.to_string()),
                organization_id: OrganizationId(ORG.to_string()),
                name: "Acme Corp".to_string(),
                description: Some("50 seat rollout".to_string()),
                expected_value: Some(Decimal::new(6_000_000, 2)),
                close_date: NaiveDate::from_ymd_opt(2026, 12, 31),
                stage: "open".to_string(),
            })
            .await
            .expect("seed opportunity");

        let provider = Arc::new(ScriptedProvider::new(ProviderId::Anthropic));
        let premium = Arc::new(ScriptedProvider::new(ProviderId::Bedrock));
        let factory =
            Arc::new(ScriptedFactory { default: provider.clone(), premium: premium.clone() });
        let selector = Arc::new(ProviderSelector::new(
            organizations.clone(),
            factory,
            &AppConfig::default().llm,
        ));
        let assembler = Arc::new(ContextAssembler::new(opportunities.clone(), knowledge));
        let queue = Arc::new(GenerationQueue::new(engine, jobs.clone(), proposals.clone()));

        Self {
            organizations,
            opportunities,
            proposals,
            jobs,
            provider,
            premium,
            selector,
            assembler,
            queue,
        }
    }

    pub async fn create_proposal(&self, id: &str) -> Proposal {
        self.proposals
            .create_next_version(
                ProposalId(id.to_string()),
                OrganizationId(ORG.to_string()),
                OpportunityId(OPPORTUNITY.to_string()),
                PROMPT.to_string(),
                Utc::now(),
            )
            .await
            .expect("create proposal")
    }

    pub fn request(&self, proposal: &Proposal) -> GenerationRequest {
        GenerationRequest {
            proposal_id: proposal.id.clone(),
            organization_id: proposal.organization_id.clone(),
            opportunity_id: proposal.opportunity_id.clone(),
            prompt: proposal.prompt.clone(),
        }
    }

    pub async fn script_happy_path(&self) {
        self.provider.push_response(OUTLINE).await;
        self.provider.push_response(TITLE_SLIDE).await;
        self.provider.push_response(TABLE_SLIDE).await;
    }

    pub fn worker(&self) -> GenerationWorker {
        let generator = ProposalGenerator::new(GenerationSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..GenerationSettings::default()
        });
        GenerationWorker::new(
            "worker-test",
            self.queue.clone(),
            self.selector.clone(),
            self.assembler.clone(),
            Arc::new(generator),
            WorkerSettings {
                concurrency: 1,
                poll_interval: Duration::from_millis(5),
                stale_check_interval: Duration::from_millis(50),
            },
        )
    }

    pub fn api_state(&self, progress: ProgressPolicy) -> ApiState {
        ApiState {
            proposals: self.proposals.clone(),
            opportunities: self.opportunities.clone(),
            queue: self.queue.clone(),
            selector: self.selector.clone(),
            progress,
        }
    }
}

pub fn deck(count: u32) -> Vec<Slide> {
    (1..=count)
        .map(|number| {
            Slide::new(number, format!("Slide {number}"), SlideContent::Text {
                body: format!("Body {number}"),
            })
        })
        .collect()
}
