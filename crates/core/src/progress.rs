//! Progress observer for a single proposal.
//!
//! The observer is fed snapshots of the proposal and its job record and
//! decides which event, if any, a client should see next. It emits a
//! progress event only when the stage moves forward and at most one terminal
//! event over its lifetime. Transport (SSE, polling) lives in the server.

use serde::Serialize;

use crate::config::ProgressConfig;
use crate::domain::generation::{JobStage, JobStageKind, JobStatus};
use crate::domain::proposal::{ProposalId, ProposalStatus};

pub const TIMEOUT_MESSAGE: &str = "timed out waiting for proposal generation to finish";
pub const GENERIC_FAILURE_MESSAGE: &str = "proposal generation failed";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        stage: JobStageKind,
        #[serde(rename = "slideIndex", skip_serializing_if = "Option::is_none")]
        slide_index: Option<u32>,
        #[serde(rename = "totalSlides", skip_serializing_if = "Option::is_none")]
        total_slides: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Complete {
        #[serde(rename = "proposalId")]
        proposal_id: ProposalId,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    /// Frame body as written after `data: ` on the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"failed to encode progress event"}"#.to_string()
        })
    }
}

/// What a reader saw on one poll. Read the job record before the proposal
/// row: the worker writes the proposal terminal state first, so this order
/// never pairs a terminal job stage with a stale non-terminal proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub proposal_status: ProposalStatus,
    pub error_message: Option<String>,
    pub job: Option<JobStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressPolicy {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self { poll_interval_ms: 1_000, max_wait_ms: 120_000 }
    }
}

impl From<&ProgressConfig> for ProgressPolicy {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            poll_interval_ms: config.poll_interval_ms,
            max_wait_ms: config.max_wait_secs.saturating_mul(1_000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProgressObserver {
    proposal_id: ProposalId,
    last_stage: Option<JobStage>,
    finished: bool,
}

impl ProgressObserver {
    pub fn new(proposal_id: ProposalId) -> Self {
        Self { proposal_id, last_stage: None, finished: false }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_stage(&self) -> Option<JobStage> {
        self.last_stage
    }

    pub fn observe(&mut self, snapshot: &ProgressSnapshot) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        match snapshot.proposal_status {
            ProposalStatus::Complete => {
                return Some(self.finish(ProgressEvent::Complete {
                    proposal_id: self.proposal_id.clone(),
                }));
            }
            ProposalStatus::Error => {
                let message = snapshot
                    .error_message
                    .clone()
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string());
                return Some(self.finish(ProgressEvent::Error { message }));
            }
            ProposalStatus::Draft | ProposalStatus::Queued | ProposalStatus::Generating => {}
        }

        let (stage, message) = match snapshot.job.as_ref().and_then(|job| {
            job.job_stage().map(|stage| (stage, job.message.clone()))
        }) {
            Some((stage, _)) if stage.is_terminal() => return None,
            Some(found) => found,
            None => (Self::stage_from_status(snapshot.proposal_status), None),
        };

        let forward = match self.last_stage {
            None => true,
            Some(last) => last != stage && last.precedes_or_equals(&stage),
        };
        if !forward {
            return None;
        }

        self.last_stage = Some(stage);
        Some(ProgressEvent::Progress {
            stage: stage.kind(),
            slide_index: stage.slide_index(),
            total_slides: stage.total_slides(),
            message,
        })
    }

    /// Terminal event for a wall-clock timeout. Does nothing once finished.
    pub fn time_out(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        Some(self.finish(ProgressEvent::Error { message: TIMEOUT_MESSAGE.to_string() }))
    }

    /// Terminal event for a failed poll. The proposal itself is untouched.
    pub fn poll_failed(&mut self, message: impl Into<String>) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        Some(self.finish(ProgressEvent::Error { message: message.into() }))
    }

    fn finish(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.finished = true;
        event
    }

    fn stage_from_status(status: ProposalStatus) -> JobStage {
        match status {
            ProposalStatus::Generating => JobStage::Outline,
            _ => JobStage::Queued,
        }
    }
}
