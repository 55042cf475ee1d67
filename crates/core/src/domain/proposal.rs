use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::opportunity::OpportunityId;
use crate::domain::organization::OrganizationId;
use crate::domain::slide::Slide;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub String);

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Queued,
    Generating,
    Complete,
    Error,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "queued" => Some(Self::Queued),
            "generating" => Some(Self::Generating),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Queued)
                | (Self::Queued, Self::Generating)
                | (Self::Generating, Self::Complete)
                | (Self::Draft, Self::Error)
                | (Self::Queued, Self::Error)
                | (Self::Generating, Self::Error)
        )
    }
}

/// One versioned deck for an opportunity.
///
/// `slides` is non-empty exactly when the status is `Complete`, and
/// `error_message` is set exactly when the status is `Error`. Both are only
/// ever written together with the terminal status, through [`Proposal::complete`]
/// and [`Proposal::fail`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub organization_id: OrganizationId,
    pub opportunity_id: OpportunityId,
    pub version: u32,
    pub status: ProposalStatus,
    pub prompt: String,
    pub slides: Vec<Slide>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new_queued(
        id: ProposalId,
        organization_id: OrganizationId,
        opportunity_id: OpportunityId,
        version: u32,
        prompt: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            organization_id,
            opportunity_id,
            version,
            status: ProposalStatus::Queued,
            prompt: prompt.into(),
            slides: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition_to(
        &mut self,
        next: ProposalStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if next == ProposalStatus::Complete || next == ProposalStatus::Error {
            return Err(DomainError::InvariantViolation(format!(
                "terminal status `{}` must be set through complete() or fail()",
                next.as_str()
            )));
        }
        self.ensure_transition(next)?;
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, slides: Vec<Slide>, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_transition(ProposalStatus::Complete)?;
        if slides.is_empty() {
            return Err(DomainError::InvariantViolation(
                "a complete proposal must carry at least one slide".to_string(),
            ));
        }
        crate::domain::slide::validate_deck(&slides)?;

        self.status = ProposalStatus::Complete;
        self.slides = slides;
        self.error_message = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_transition(ProposalStatus::Error)?;
        let message = message.into();
        let message = if message.trim().is_empty() {
            "proposal generation failed".to_string()
        } else {
            message
        };

        self.status = ProposalStatus::Error;
        self.slides = Vec::new();
        self.error_message = Some(message);
        self.updated_at = now;
        Ok(())
    }

    /// Checks the status/slides/error_message coupling.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        let complete = self.status == ProposalStatus::Complete;
        let errored = self.status == ProposalStatus::Error;

        if complete != !self.slides.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "proposal {} has status `{}` with {} slides",
                self.id,
                self.status.as_str(),
                self.slides.len()
            )));
        }
        if errored != self.error_message.is_some() {
            return Err(DomainError::InvariantViolation(format!(
                "proposal {} has status `{}` but error_message presence is {}",
                self.id,
                self.status.as_str(),
                self.error_message.is_some()
            )));
        }
        Ok(())
    }

    fn ensure_transition(&self, next: ProposalStatus) -> Result<(), DomainError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidProposalTransition { from: self.status, to: next })
        }
    }
}
