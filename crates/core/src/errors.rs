use thiserror::Error;

use crate::domain::proposal::ProposalStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid proposal transition from {from:?} to {to:?}")]
    InvalidProposalTransition { from: ProposalStatus, to: ProposalStatus },
    #[error("invalid slide: {0}")]
    InvalidSlide(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}
