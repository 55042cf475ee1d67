use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::organization::OrganizationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpportunityId(pub String);

impl std::fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub description: Option<String>,
    pub expected_value: Option<Decimal>,
    pub close_date: Option<NaiveDate>,
    pub stage: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealContextSource {
    Note,
    Email,
    Transcript,
    Document,
}

impl DealContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Email => "email",
            Self::Transcript => "transcript",
            Self::Document => "document",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Note => "Note",
            Self::Email => "Email",
            Self::Transcript => "Call transcript",
            Self::Document => "Document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "note" => Some(Self::Note),
            "email" => Some(Self::Email),
            "transcript" => Some(Self::Transcript),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Free-text artifact attached to an opportunity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealContextItem {
    pub id: String,
    pub opportunity_id: OpportunityId,
    pub source: DealContextSource,
    pub name: Option<String>,
    pub content: String,
    /// When the underlying conversation or document happened, if known.
    pub occurred_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DealContextItem {
    /// Timestamp used for newest-first ordering.
    pub fn effective_at(&self) -> DateTime<Utc> {
        self.occurred_at.unwrap_or(self.created_at)
    }
}
