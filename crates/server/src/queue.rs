//! Generation queue facade.
//!
//! Pairs the deterministic [`GenerationEngine`] with the job and proposal
//! repositories. Every terminal outcome writes the proposal row first and
//! the job record second, so a reader that checks the job before the
//! proposal never sees a finished job next to an unfinished proposal.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use deckhand_core::domain::generation::{
    GenerationJob, GenerationJobId, GenerationRequest, JobStage, JobStatus,
};
use deckhand_core::domain::proposal::ProposalId;
use deckhand_core::domain::slide::Slide;
use deckhand_core::generation_engine::{GenerationEngine, GenerationEngineError, INTERRUPTED_MESSAGE};
use deckhand_db::repositories::{GenerationJobRepository, ProposalRepository};
use deckhand_db::RepositoryError;

/// How many queued jobs a single claim attempt looks at.
const CLAIM_SCAN_LIMIT: u32 = 8;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("proposal {0} already has an active generation job")]
    AlreadyActive(ProposalId),
    #[error("job {0} is no longer owned by this worker")]
    Lost(GenerationJobId),
    #[error(transparent)]
    Engine(#[from] GenerationEngineError),
    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for QueueError {
    fn from(error: RepositoryError) -> Self {
        Self::Repository(error)
    }
}

pub struct GenerationQueue {
    engine: GenerationEngine,
    jobs: Arc<dyn GenerationJobRepository>,
    proposals: Arc<dyn ProposalRepository>,
}

impl GenerationQueue {
    pub fn new(
        engine: GenerationEngine,
        jobs: Arc<dyn GenerationJobRepository>,
        proposals: Arc<dyn ProposalRepository>,
    ) -> Self {
        Self { engine, jobs, proposals }
    }

    pub fn engine(&self) -> &GenerationEngine {
        &self.engine
    }

    /// Queues one job for the proposal. A second enqueue while a job is
    /// queued or running is rejected with [`QueueError::AlreadyActive`].
    pub async fn enqueue_proposal_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationJobId, QueueError> {
        let proposal_id = request.proposal_id.clone();
        let created = self.engine.create_job(request, Utc::now());
        let job_id = created.job.id.clone();

        match self.jobs.enqueue(created).await {
            Ok(()) => {}
            Err(error) if error.is_conflict() => {
                warn!(
                    event_name = "generation.enqueue.rejected",
                    correlation_id = %proposal_id,
                    "generation already active for proposal"
                );
                return Err(QueueError::AlreadyActive(proposal_id));
            }
            Err(error) => return Err(error.into()),
        }

        info!(
            event_name = "generation.enqueued",
            correlation_id = %proposal_id,
            job_id = %job_id.0,
            "generation job enqueued"
        );
        Ok(job_id)
    }

    /// Current progress record, or `None` when the job has not been created
    /// or its record has expired. Callers then read the proposal status.
    pub async fn get_proposal_job_status(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Option<JobStatus>, QueueError> {
        let job = self.jobs.find_latest_for_proposal(proposal_id).await?;
        Ok(job.and_then(|job| self.engine.visible_status(&job, Utc::now())))
    }

    /// Moves a proposal whose job could not be queued straight to `error`.
    pub async fn abandon_unqueued(
        &self,
        proposal_id: &ProposalId,
        message: &str,
    ) -> Result<bool, QueueError> {
        Ok(self.proposals.fail(proposal_id, message, Utc::now()).await?)
    }

    /// Claims the oldest queued job this worker can win and marks its
    /// proposal as generating.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<GenerationJob>, QueueError> {
        for job in self.jobs.list_queued(CLAIM_SCAN_LIMIT).await? {
            let expected_version = job.state_version;
            let claimed = self.engine.claim_job(job, worker_id, Utc::now())?;
            let job = claimed.job.clone();
            if !self.jobs.apply_transition(expected_version, claimed).await? {
                continue;
            }

            if !self.proposals.mark_generating(&job.proposal_id, Utc::now()).await? {
                warn!(
                    event_name = "generation.claim.proposal_not_queued",
                    correlation_id = %job.proposal_id,
                    job_id = %job.id.0,
                    "claimed job's proposal is no longer queued"
                );
                self.close_job(job, "proposal is no longer queued", "proposal_state").await?;
                continue;
            }

            info!(
                event_name = "generation.claimed",
                correlation_id = %job.proposal_id,
                job_id = %job.id.0,
                worker_id,
                attempt = job.attempt_count,
                "generation job claimed"
            );
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Writes a forward stage update and returns the updated job.
    pub async fn record_stage(
        &self,
        job: &GenerationJob,
        stage: JobStage,
        message: Option<String>,
    ) -> Result<GenerationJob, QueueError> {
        let advanced = self.engine.advance_stage(job.clone(), stage, message, Utc::now())?;
        if !self.jobs.update_stage(&advanced).await? {
            return Err(QueueError::Lost(job.id.clone()));
        }
        Ok(advanced)
    }

    pub async fn finish_success(
        &self,
        job: GenerationJob,
        slides: &[Slide],
    ) -> Result<(), QueueError> {
        if !self.proposals.complete(&job.proposal_id, slides, Utc::now()).await? {
            return Err(QueueError::Lost(job.id));
        }

        let expected_version = job.state_version;
        let completed = self.engine.complete_job(job, slides.len(), Utc::now())?;
        let job_id = completed.job.id.clone();
        if !self.jobs.apply_transition(expected_version, completed).await? {
            return Err(QueueError::Lost(job_id));
        }
        Ok(())
    }

    /// Fails the proposal with `message` (already user-safe) and closes the
    /// job. Returns false when the proposal had already reached a terminal
    /// status.
    pub async fn finish_failure(
        &self,
        job: GenerationJob,
        message: &str,
        error_class: &str,
    ) -> Result<bool, QueueError> {
        let failed = self.proposals.fail(&job.proposal_id, message, Utc::now()).await?;
        self.close_job(job, message, error_class).await?;
        Ok(failed)
    }

    /// Fails every running job whose claim outlived the claim timeout. Such
    /// jobs are never re-run; a retry is a new proposal version.
    pub async fn recover_stale(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let stale = self.engine.find_stale_jobs(self.jobs.list_running().await?, now);

        let mut recovered = 0;
        for job in stale {
            let proposal_id = job.proposal_id.clone();
            let claimed_by = job.claimed_by.clone().unwrap_or_default();
            self.proposals.fail(&proposal_id, INTERRUPTED_MESSAGE, now).await?;

            let expected_version = job.state_version;
            let result = self.engine.recover_stale_job(job, now)?;
            if self.jobs.apply_transition(expected_version, result).await? {
                recovered += 1;
                warn!(
                    event_name = "generation.stale_claim.recovered",
                    correlation_id = %proposal_id,
                    claimed_by = %claimed_by,
                    "abandoned generation job failed"
                );
            }
        }
        Ok(recovered)
    }

    async fn close_job(
        &self,
        job: GenerationJob,
        message: &str,
        error_class: &str,
    ) -> Result<(), QueueError> {
        let expected_version = job.state_version;
        let failed = self.engine.fail_job(job, message, error_class, Utc::now())?;
        let job_id = failed.job.id.clone();
        if !self.jobs.apply_transition(expected_version, failed).await? {
            return Err(QueueError::Lost(job_id));
        }
        Ok(())
    }
}
