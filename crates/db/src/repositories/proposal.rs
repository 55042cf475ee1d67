use deckhand_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use deckhand_core::domain::opportunity::OpportunityId;
use deckhand_core::domain::organization::OrganizationId;
use deckhand_core::domain::proposal::{Proposal, ProposalId, ProposalStatus};
use deckhand_core::domain::slide::{validate_deck, Slide};
use deckhand_core::errors::DomainError;

use super::rows::{conflict_on_unique, parse_timestamp, parse_u32};
use super::{ProposalRepository, RepositoryError};
use crate::DbPool;

const PROPOSAL_COLUMNS: &str = "id, organization_id, opportunity_id, version, status, prompt,
    slides_json, error_message, created_at, updated_at";

pub struct SqlProposalRepository {
    pool: DbPool,
}

impl SqlProposalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProposalRepository for SqlProposalRepository {
    async fn find_by_id(&self, id: &ProposalId) -> Result<Option<Proposal>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {PROPOSAL_COLUMNS} FROM proposal WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(proposal_from_row).transpose()
    }

    async fn list_for_opportunity(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<Proposal>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposal WHERE opportunity_id = ? ORDER BY version DESC"
        ))
        .bind(&opportunity_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(proposal_from_row).collect()
    }

    async fn create_next_version(
        &self,
        id: ProposalId,
        organization_id: OrganizationId,
        opportunity_id: OpportunityId,
        prompt: String,
        now: DateTime<Utc>,
    ) -> Result<Proposal, RepositoryError> {
        let timestamp = now.to_rfc3339();
        // Version allocation and insert are one statement; the unique
        // (opportunity_id, version) index rejects a concurrent duplicate.
        sqlx::query(
            "INSERT INTO proposal (
                id, organization_id, opportunity_id, version, status, prompt,
                slides_json, error_message, created_at, updated_at
             )
             SELECT ?, ?, ?, COALESCE(MAX(version), 0) + 1, 'queued', ?, NULL, NULL, ?, ?
             FROM proposal
             WHERE opportunity_id = ?",
        )
        .bind(&id.0)
        .bind(&organization_id.0)
        .bind(&opportunity_id.0)
        .bind(&prompt)
        .bind(&timestamp)
        .bind(&timestamp)
        .bind(&opportunity_id.0)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            conflict_on_unique(
                error,
                format!("a proposal version for opportunity {opportunity_id} was created concurrently"),
            )
        })?;

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("proposal {id} after insert")))
    }

    async fn mark_generating(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE proposal SET status = 'generating', updated_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: &ProposalId,
        slides: &[Slide],
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        if slides.is_empty() {
            return Err(DomainError::InvariantViolation(
                "a complete proposal must carry at least one slide".to_string(),
            )
            .into());
        }
        validate_deck(slides)?;
        let slides_json = serde_json::to_string(slides)
            .map_err(|error| RepositoryError::Decode(format!("could not encode slides: {error}")))?;

        let result = sqlx::query(
            "UPDATE proposal
             SET status = 'complete', slides_json = ?, error_message = NULL, updated_at = ?
             WHERE id = ? AND status = 'generating'",
        )
        .bind(slides_json)
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        id: &ProposalId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let message =
            if message.trim().is_empty() { "proposal generation failed" } else { message };

        let result = sqlx::query(
            "UPDATE proposal
             SET status = 'error', slides_json = NULL, error_message = ?, updated_at = ?
             WHERE id = ? AND status IN ('draft', 'queued', 'generating')",
        )
        .bind(message)
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn proposal_from_row(row: SqliteRow) -> Result<Proposal, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ProposalStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown proposal status `{status_raw}`")))?;

    let slides = match row.try_get::<Option<String>, _>("slides_json")? {
        Some(raw) => serde_json::from_str::<Vec<Slide>>(&raw).map_err(|error| {
            RepositoryError::Decode(format!("invalid slides_json: {error}"))
        })?,
        None => Vec::new(),
    };

    let proposal = Proposal {
        id: ProposalId(row.try_get("id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        opportunity_id: OpportunityId(row.try_get("opportunity_id")?),
        version: parse_u32("version", row.try_get("version")?)?,
        status,
        prompt: row.try_get("prompt")?,
        slides,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    };
    proposal.check_invariants()?;
    Ok(proposal)
}
