use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::opportunity::OpportunityId;
use crate::domain::organization::OrganizationId;
use crate::domain::proposal::ProposalId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationJobId(pub String);

impl std::fmt::Display for GenerationJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationTransitionId(pub String);

/// Queue-level lifecycle of a job row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationJobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl GenerationJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Active jobs count toward the one-job-per-proposal limit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Step within one generation attempt.
///
/// Stages form a chain: `Queued < Outline < Slide(1) < ... < Slide(n) < terminal`.
/// [`JobStage::precedes_or_equals`] exposes that order to readers that must
/// never move backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStage {
    Queued,
    Outline,
    Slide { slide_index: u32, total_slides: u32 },
    Complete,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStageKind {
    Queued,
    Outline,
    Slides,
    Complete,
    Error,
}

impl JobStageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Outline => "outline",
            Self::Slides => "slides",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "outline" => Some(Self::Outline),
            "slides" => Some(Self::Slides),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl JobStage {
    pub fn kind(&self) -> JobStageKind {
        match self {
            Self::Queued => JobStageKind::Queued,
            Self::Outline => JobStageKind::Outline,
            Self::Slide { .. } => JobStageKind::Slides,
            Self::Complete => JobStageKind::Complete,
            Self::Error => JobStageKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    fn rank(&self) -> (u8, u32) {
        match self {
            Self::Queued => (0, 0),
            Self::Outline => (1, 0),
            Self::Slide { slide_index, .. } => (2, *slide_index),
            Self::Complete | Self::Error => (3, 0),
        }
    }

    /// Partial order over stages of one attempt. The two terminal stages are
    /// incomparable with each other.
    pub fn compare(&self, other: &JobStage) -> Option<Ordering> {
        if self.is_terminal() && other.is_terminal() && self != other {
            return None;
        }
        Some(self.rank().cmp(&other.rank()))
    }

    pub fn precedes_or_equals(&self, other: &JobStage) -> bool {
        matches!(self.compare(other), Some(Ordering::Less | Ordering::Equal))
    }

    /// Rebuilds a stage from its stored columns.
    pub fn from_parts(
        kind: JobStageKind,
        slide_index: Option<u32>,
        total_slides: Option<u32>,
    ) -> Option<Self> {
        match kind {
            JobStageKind::Queued => Some(Self::Queued),
            JobStageKind::Outline => Some(Self::Outline),
            JobStageKind::Slides => match (slide_index, total_slides) {
                (Some(slide_index), Some(total_slides))
                    if slide_index >= 1 && slide_index <= total_slides =>
                {
                    Some(Self::Slide { slide_index, total_slides })
                }
                _ => None,
            },
            JobStageKind::Complete => Some(Self::Complete),
            JobStageKind::Error => Some(Self::Error),
        }
    }

    pub fn slide_index(&self) -> Option<u32> {
        match self {
            Self::Slide { slide_index, .. } => Some(*slide_index),
            _ => None,
        }
    }

    pub fn total_slides(&self) -> Option<u32> {
        match self {
            Self::Slide { total_slides, .. } => Some(*total_slides),
            _ => None,
        }
    }
}

/// Read model returned by `get_proposal_job_status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub stage: JobStageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slide_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_slides: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobStatus {
    pub fn new(stage: JobStage, message: Option<String>) -> Self {
        Self {
            stage: stage.kind(),
            slide_index: stage.slide_index(),
            total_slides: stage.total_slides(),
            message,
        }
    }

    pub fn job_stage(&self) -> Option<JobStage> {
        JobStage::from_parts(self.stage, self.slide_index, self.total_slides)
    }
}

/// Payload handed to the worker for one proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub proposal_id: ProposalId,
    pub organization_id: OrganizationId,
    pub opportunity_id: OpportunityId,
    pub prompt: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationJob {
    pub id: GenerationJobId,
    pub proposal_id: ProposalId,
    pub organization_id: OrganizationId,
    pub opportunity_id: OpportunityId,
    pub prompt: String,
    pub state: GenerationJobState,
    pub stage: JobStage,
    pub progress_message: Option<String>,
    pub attempt_count: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn request(&self) -> GenerationRequest {
        GenerationRequest {
            proposal_id: self.proposal_id.clone(),
            organization_id: self.organization_id.clone(),
            opportunity_id: self.opportunity_id.clone(),
            prompt: self.prompt.clone(),
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::new(self.stage, self.progress_message.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTransitionEvent {
    pub id: GenerationTransitionId,
    pub job_id: GenerationJobId,
    pub proposal_id: ProposalId,
    pub from_state: Option<GenerationJobState>,
    pub to_state: GenerationJobState,
    pub transition_reason: String,
    pub error_class: Option<String>,
    pub decision_context_json: String,
    pub actor_id: String,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{GenerationJobState, JobStage, JobStageKind, JobStatus};

    #[test]
    fn stages_follow_generation_order() {
        let chain = [
            JobStage::Queued,
            JobStage::Outline,
            JobStage::Slide { slide_index: 1, total_slides: 3 },
            JobStage::Slide { slide_index: 2, total_slides: 3 },
            JobStage::Slide { slide_index: 3, total_slides: 3 },
            JobStage::Complete,
        ];

        for pair in chain.windows(2) {
            assert_eq!(pair[0].compare(&pair[1]), Some(Ordering::Less), "{pair:?}");
        }
        assert!(JobStage::Slide { slide_index: 2, total_slides: 3 }
            .precedes_or_equals(&JobStage::Error));
        assert!(!JobStage::Slide { slide_index: 3, total_slides: 5 }
            .precedes_or_equals(&JobStage::Slide { slide_index: 2, total_slides: 5 }));
    }

    #[test]
    fn terminal_stages_are_incomparable() {
        assert_eq!(JobStage::Complete.compare(&JobStage::Error), None);
        assert!(!JobStage::Complete.precedes_or_equals(&JobStage::Error));
        assert!(JobStage::Error.precedes_or_equals(&JobStage::Error));
    }

    #[test]
    fn slide_stage_requires_consistent_counts() {
        assert_eq!(JobStage::from_parts(JobStageKind::Slides, Some(0), Some(3)), None);
        assert_eq!(JobStage::from_parts(JobStageKind::Slides, Some(4), Some(3)), None);
        assert_eq!(JobStage::from_parts(JobStageKind::Slides, None, Some(3)), None);
        assert_eq!(
            JobStage::from_parts(JobStageKind::Slides, Some(2), Some(3)),
            Some(JobStage::Slide { slide_index: 2, total_slides: 3 })
        );
    }

    #[test]
    fn job_status_serializes_slide_counters_only_for_slide_stage() {
        let outline = serde_json::to_value(JobStatus::new(JobStage::Outline, None)).expect("json");
        assert_eq!(outline, serde_json::json!({ "stage": "outline" }));

        let slide = serde_json::to_value(JobStatus::new(
            JobStage::Slide { slide_index: 2, total_slides: 5 },
            None,
        ))
        .expect("json");
        assert_eq!(slide["slideIndex"], 2);
        assert_eq!(slide["totalSlides"], 5);
    }

    #[test]
    fn job_state_round_trips_from_storage_encoding() {
        for state in [
            GenerationJobState::Queued,
            GenerationJobState::Running,
            GenerationJobState::Completed,
            GenerationJobState::Failed,
        ] {
            assert_eq!(GenerationJobState::parse(state.as_str()), Some(state));
        }
        assert!(GenerationJobState::Running.is_active());
        assert!(!GenerationJobState::Failed.is_active());
    }
}
