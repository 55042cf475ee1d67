//! Background generation worker.
//!
//! Pulls queued jobs, runs provider selection, context assembly and the
//! generator for each, and records the outcome. One proposal is always
//! generated sequentially; `concurrency` slots run different proposals side
//! by side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};

use deckhand_agent::context::{ContextAssembler, ContextBudget};
use deckhand_agent::generator::{
    GeneratedDeck, GenerationError, ProposalGenerator, StageReporter,
};
use deckhand_agent::selector::ProviderSelector;
use deckhand_core::config::WorkerConfig;
use deckhand_core::domain::generation::{GenerationJob, GenerationRequest, JobStage};

use crate::queue::{GenerationQueue, QueueError};

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub concurrency: u32,
    pub poll_interval: Duration,
    pub stale_check_interval: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stale_check_interval: Duration::from_secs((config.claim_timeout_secs / 4).max(1)),
        }
    }
}

/// Outcome of one pass over the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Idle,
    Completed,
    Failed,
}

pub struct GenerationWorker {
    worker_id: String,
    queue: Arc<GenerationQueue>,
    selector: Arc<ProviderSelector>,
    assembler: Arc<ContextAssembler>,
    generator: Arc<ProposalGenerator>,
    settings: WorkerSettings,
}

impl GenerationWorker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<GenerationQueue>,
        selector: Arc<ProviderSelector>,
        assembler: Arc<ContextAssembler>,
        generator: Arc<ProposalGenerator>,
        settings: WorkerSettings,
    ) -> Self {
        Self { worker_id: worker_id.into(), queue, selector, assembler, generator, settings }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs until `shutdown` flips to true. A job already in flight is
    /// finished before its slot exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            event_name = "system.worker.started",
            correlation_id = "worker",
            worker_id = %self.worker_id,
            concurrency = self.settings.concurrency,
            "generation worker started"
        );

        let slots = (0..self.settings.concurrency.max(1)).map(|slot| {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run_slot(slot, shutdown).await })
        });
        for joined in join_all(slots).await {
            if let Err(join_error) = joined {
                error!(
                    event_name = "system.worker.slot_panicked",
                    correlation_id = "worker",
                    error = %join_error,
                    "worker slot terminated abnormally"
                );
            }
        }

        info!(
            event_name = "system.worker.stopped",
            correlation_id = "worker",
            worker_id = %self.worker_id,
            "generation worker stopped"
        );
    }

    async fn run_slot(&self, slot: u32, mut shutdown: watch::Receiver<bool>) {
        let mut next_stale_check = Instant::now();
        while !*shutdown.borrow() {
            // Only the first slot sweeps abandoned claims.
            if slot == 0 && Instant::now() >= next_stale_check {
                self.recover_stale().await;
                next_stale_check = Instant::now() + self.settings.stale_check_interval;
            }

            let idle = match self.run_once().await {
                Ok(JobOutcome::Idle) => true,
                Ok(_) => false,
                Err(error) => {
                    error!(
                        event_name = "generation.worker.poll_failed",
                        correlation_id = "worker",
                        worker_id = %self.worker_id,
                        error = %error,
                        "worker poll failed"
                    );
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    async fn recover_stale(&self) {
        match self.queue.recover_stale().await {
            Ok(0) => {}
            Ok(recovered) => warn!(
                event_name = "generation.stale_claim.sweep",
                correlation_id = "worker",
                recovered,
                "recovered abandoned generation jobs"
            ),
            Err(error) => error!(
                event_name = "generation.stale_claim.sweep_failed",
                correlation_id = "worker",
                error = %error,
                "stale claim sweep failed"
            ),
        }
    }

    /// Claims and processes at most one job.
    pub async fn run_once(&self) -> Result<JobOutcome, QueueError> {
        match self.queue.claim_next(&self.worker_id).await? {
            Some(job) => self.process(job).await,
            None => Ok(JobOutcome::Idle),
        }
    }

    async fn process(&self, job: GenerationJob) -> Result<JobOutcome, QueueError> {
        let correlation_id = job.proposal_id.0.clone();
        let request = job.request();
        let started = Instant::now();
        let reporter = JobProgressReporter { queue: &self.queue, job: Mutex::new(job) };

        let result = self.generate(&request, &reporter).await;

        let job = reporter.job.into_inner();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(deck) => {
                self.queue.finish_success(job, &deck.slides).await?;
                info!(
                    event_name = "generation.completed",
                    correlation_id = %correlation_id,
                    provider = %deck.provider_id,
                    slide_count = deck.slides.len(),
                    input_tokens = deck.usage.input_tokens,
                    output_tokens = deck.usage.output_tokens,
                    elapsed_ms,
                    "proposal generated"
                );
                Ok(JobOutcome::Completed)
            }
            Err(generation_error) => {
                let message = generation_error.user_message();
                warn!(
                    event_name = "generation.failed",
                    correlation_id = %correlation_id,
                    error_class = generation_error.error_class(),
                    error = %generation_error,
                    elapsed_ms,
                    "proposal generation failed"
                );
                self.queue.finish_failure(job, &message, generation_error.error_class()).await?;
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        reporter: &JobProgressReporter<'_>,
    ) -> Result<GeneratedDeck, GenerationError> {
        let provider = self.selector.select(&request.organization_id).await?;
        let budget =
            ContextBudget::for_provider(&provider.metadata(), &self.generator.settings().options);
        let context = self.assembler.assemble(request, budget).await?;
        self.generator.generate(provider.as_ref(), request, &context, reporter).await
    }
}

/// Writes generator stage transitions into the job record.
struct JobProgressReporter<'a> {
    queue: &'a GenerationQueue,
    job: Mutex<GenerationJob>,
}

#[async_trait]
impl StageReporter for JobProgressReporter<'_> {
    async fn report(&self, stage: JobStage, message: Option<String>) -> Result<(), GenerationError> {
        let mut job = self.job.lock().await;
        let updated = self
            .queue
            .record_stage(&job, stage, message)
            .await
            .map_err(|error| GenerationError::Infrastructure(error.to_string()))?;
        info!(
            event_name = "generation.stage",
            correlation_id = %updated.proposal_id,
            stage = stage.kind().as_str(),
            slide_index = stage.slide_index(),
            total_slides = stage.total_slides(),
            "generation stage advanced"
        );
        *job = updated;
        Ok(())
    }
}
