//! Deterministic generation queue engine
//!
//! State machine for proposal generation jobs. Every queue transition yields
//! an audit event, and stage updates are only accepted in forward order so
//! that any reader observes a non-decreasing stage sequence.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::domain::generation::{
    GenerationJob, GenerationJobId, GenerationJobState, GenerationRequest,
    GenerationTransitionEvent, GenerationTransitionId, JobStage, JobStatus,
};

/// Message persisted on jobs failed by stale-claim recovery.
pub const INTERRUPTED_MESSAGE: &str = "generation was interrupted";

#[derive(Clone, Debug)]
pub struct GenerationEngineConfig {
    /// How long a claim may be held before the job is considered abandoned
    pub claim_timeout_seconds: i64,
    /// How long a finished job's progress record stays readable
    pub progress_retention_seconds: i64,
}

impl Default for GenerationEngineConfig {
    fn default() -> Self {
        Self { claim_timeout_seconds: 900, progress_retention_seconds: 300 }
    }
}

impl From<&WorkerConfig> for GenerationEngineConfig {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            claim_timeout_seconds: worker.claim_timeout_secs as i64,
            progress_retention_seconds: worker.progress_retention_secs as i64,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GenerationEngineError {
    #[error("invalid job transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: GenerationJobState, to: GenerationJobState, reason: String },
    #[error("stage regression on job {job_id}: {from:?} -> {to:?}")]
    StageRegression { job_id: String, from: JobStage, to: JobStage },
    #[error("claim conflict: job {0} already claimed by {1}")]
    ClaimConflict(String, String),
}

/// A job paired with the audit event describing how it got there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionResult {
    pub job: GenerationJob,
    pub transition: GenerationTransitionEvent,
}

#[derive(Clone, Debug, Default)]
pub struct GenerationEngine {
    config: GenerationEngineConfig,
}

impl GenerationEngine {
    pub fn new() -> Self {
        Self::with_config(GenerationEngineConfig::default())
    }

    pub fn with_config(config: GenerationEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GenerationEngineConfig {
        &self.config
    }

    /// Builds the queued job for a request. Persisting it is the caller's
    /// job, and the store is responsible for rejecting a second active job
    /// for the same proposal.
    pub fn create_job(&self, request: GenerationRequest, now: DateTime<Utc>) -> TransitionResult {
        let job = GenerationJob {
            id: GenerationJobId(Uuid::new_v4().to_string()),
            proposal_id: request.proposal_id,
            organization_id: request.organization_id,
            opportunity_id: request.opportunity_id,
            prompt: request.prompt,
            state: GenerationJobState::Queued,
            stage: JobStage::Queued,
            progress_message: None,
            attempt_count: 0,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            error_class: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let transition = self.transition_event(
            &job,
            None,
            "job_enqueued",
            None,
            serde_json::json!({
                "prompt_sha256": Self::hash_prompt(&job.prompt),
                "organization_id": job.organization_id.0,
            }),
            "api",
            now,
        );

        TransitionResult { job, transition }
    }

    /// Queued -> Running.
    pub fn claim_job(
        &self,
        mut job: GenerationJob,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, GenerationEngineError> {
        let worker_id = worker_id.into();

        match job.state {
            GenerationJobState::Queued => {}
            GenerationJobState::Running => {
                return Err(GenerationEngineError::ClaimConflict(
                    job.id.0.clone(),
                    job.claimed_by.clone().unwrap_or_default(),
                ));
            }
            GenerationJobState::Completed | GenerationJobState::Failed => {
                return Err(GenerationEngineError::InvalidTransition {
                    from: job.state,
                    to: GenerationJobState::Running,
                    reason: "job already in terminal state".to_string(),
                });
            }
        }

        let from_state = job.state;
        job.state = GenerationJobState::Running;
        job.attempt_count += 1;
        job.claimed_by = Some(worker_id.clone());
        job.claimed_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        let transition = self.transition_event(
            &job,
            Some(from_state),
            "job_claimed",
            None,
            serde_json::json!({
                "worker_id": worker_id,
                "claim_timeout_seconds": self.config.claim_timeout_seconds,
            }),
            &worker_id,
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    /// Records forward progress on a running job. Re-reporting the current
    /// stage is accepted; moving backwards or onto a terminal stage is not.
    pub fn advance_stage(
        &self,
        mut job: GenerationJob,
        stage: JobStage,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<GenerationJob, GenerationEngineError> {
        if job.state != GenerationJobState::Running {
            return Err(GenerationEngineError::InvalidTransition {
                from: job.state,
                to: GenerationJobState::Running,
                reason: "stage updates require a running job".to_string(),
            });
        }
        if stage.is_terminal() || !job.stage.precedes_or_equals(&stage) {
            return Err(GenerationEngineError::StageRegression {
                job_id: job.id.0.clone(),
                from: job.stage,
                to: stage,
            });
        }

        job.stage = stage;
        job.progress_message = message;
        job.updated_at = now;
        Ok(job)
    }

    /// Running -> Completed.
    pub fn complete_job(
        &self,
        mut job: GenerationJob,
        slide_count: usize,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, GenerationEngineError> {
        self.validate_transition(&job, GenerationJobState::Completed)?;

        let from_state = job.state;
        job.state = GenerationJobState::Completed;
        job.stage = JobStage::Complete;
        job.progress_message = Some(format!("generated {slide_count} slides"));
        job.state_version += 1;
        job.updated_at = now;
        job.finished_at = Some(now);

        let transition = self.transition_event(
            &job,
            Some(from_state),
            "job_completed",
            None,
            serde_json::json!({ "slide_count": slide_count, "attempt_count": job.attempt_count }),
            &job.claimed_by.clone().unwrap_or_else(|| "system".to_string()),
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    /// Queued|Running -> Failed. There is no retry at this level; a failed
    /// job is final and a new attempt is a new proposal version.
    pub fn fail_job(
        &self,
        mut job: GenerationJob,
        error: impl Into<String>,
        error_class: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, GenerationEngineError> {
        self.validate_transition(&job, GenerationJobState::Failed)?;

        let error = error.into();
        let error_class = error_class.into();
        let from_state = job.state;
        let failed_stage = job.stage;

        job.state = GenerationJobState::Failed;
        job.stage = JobStage::Error;
        job.progress_message = Some(error.clone());
        job.last_error = Some(error.clone());
        job.error_class = Some(error_class.clone());
        job.state_version += 1;
        job.updated_at = now;
        job.finished_at = Some(now);

        let transition = self.transition_event(
            &job,
            Some(from_state),
            "job_failed",
            Some(error_class.clone()),
            serde_json::json!({
                "error": error,
                "error_class": error_class,
                "failed_stage": failed_stage.kind().as_str(),
                "slide_index": failed_stage.slide_index(),
            }),
            &job.claimed_by.clone().unwrap_or_else(|| "system".to_string()),
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    /// Running jobs that have reported no progress for longer than the claim
    /// timeout. Claiming and every stage update refresh `updated_at`, so a
    /// long generation that keeps advancing is never reclaimed.
    pub fn find_stale_jobs(
        &self,
        jobs: Vec<GenerationJob>,
        reference_time: DateTime<Utc>,
    ) -> Vec<GenerationJob> {
        let stale_threshold = reference_time - Duration::seconds(self.config.claim_timeout_seconds);

        jobs.into_iter()
            .filter(|job| {
                let last_progress = job.claimed_at.map_or(job.updated_at, |claimed_at| {
                    claimed_at.max(job.updated_at)
                });
                job.state == GenerationJobState::Running && last_progress < stale_threshold
            })
            .collect()
    }

    pub fn recover_stale_job(
        &self,
        job: GenerationJob,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, GenerationEngineError> {
        self.fail_job(job, INTERRUPTED_MESSAGE, "stale_claim", now)
    }

    /// The progress record a reader may see for this job, if any. Active jobs
    /// are always visible; finished ones only within the retention window.
    pub fn visible_status(&self, job: &GenerationJob, now: DateTime<Utc>) -> Option<JobStatus> {
        if job.state.is_active() {
            return Some(job.status());
        }
        let finished_at = job.finished_at.unwrap_or(job.updated_at);
        let retention = Duration::seconds(self.config.progress_retention_seconds);
        (now - finished_at <= retention).then(|| job.status())
    }

    fn validate_transition(
        &self,
        job: &GenerationJob,
        to_state: GenerationJobState,
    ) -> Result<(), GenerationEngineError> {
        let valid = matches!(
            (job.state, to_state),
            (GenerationJobState::Queued, GenerationJobState::Running)
                | (GenerationJobState::Running, GenerationJobState::Completed)
                | (GenerationJobState::Running, GenerationJobState::Failed)
                | (GenerationJobState::Queued, GenerationJobState::Failed)
        );

        if valid {
            Ok(())
        } else {
            Err(GenerationEngineError::InvalidTransition {
                from: job.state,
                to: to_state,
                reason: format!("cannot transition from {:?} to {:?}", job.state, to_state),
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn transition_event(
        &self,
        job: &GenerationJob,
        from_state: Option<GenerationJobState>,
        reason: &str,
        error_class: Option<String>,
        decision_context: serde_json::Value,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> GenerationTransitionEvent {
        GenerationTransitionEvent {
            id: GenerationTransitionId(Uuid::new_v4().to_string()),
            job_id: job.id.clone(),
            proposal_id: job.proposal_id.clone(),
            from_state,
            to_state: job.state,
            transition_reason: reason.to_string(),
            error_class,
            decision_context_json: decision_context.to_string(),
            actor_id: actor_id.to_string(),
            state_version: job.state_version,
            occurred_at: now,
        }
    }

    fn hash_prompt(prompt: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
