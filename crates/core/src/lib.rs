pub mod config;
pub mod domain;
pub mod errors;
pub mod generation_engine;
pub mod progress;

pub use chrono;

pub use domain::generation::{
    GenerationJob, GenerationJobId, GenerationJobState, GenerationRequest,
    GenerationTransitionEvent, JobStage, JobStageKind, JobStatus,
};
pub use domain::knowledge::{Battlecard, CompanyProfile, KnowledgeBase, Product, ProductId};
pub use domain::opportunity::{DealContextItem, DealContextSource, Opportunity, OpportunityId};
pub use domain::organization::{Organization, OrganizationId, PlanTier, ProviderId};
pub use domain::proposal::{Proposal, ProposalId, ProposalStatus};
pub use domain::slide::{Slide, SlideContent, SlideDraft, SlideType};
pub use errors::DomainError;
pub use generation_engine::{GenerationEngine, GenerationEngineConfig, GenerationEngineError};
pub use progress::{ProgressEvent, ProgressObserver, ProgressPolicy, ProgressSnapshot};
