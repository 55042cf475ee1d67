use deckhand_core::chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use deckhand_core::domain::organization::{Organization, OrganizationId, PlanTier, ProviderId};

use super::{OrganizationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOrganizationRepository {
    pool: DbPool,
}

impl SqlOrganizationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OrganizationRepository for SqlOrganizationRepository {
    async fn find_by_id(
        &self,
        id: &OrganizationId,
    ) -> Result<Option<Organization>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, plan_tier, provider_preference
             FROM organization
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(organization_from_row).transpose()
    }

    async fn save(&self, organization: Organization) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO organization (id, name, plan_tier, provider_preference, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                plan_tier = excluded.plan_tier,
                provider_preference = excluded.provider_preference,
                updated_at = excluded.updated_at",
        )
        .bind(&organization.id.0)
        .bind(&organization.name)
        .bind(organization.plan_tier.as_str())
        .bind(organization.provider_preference.as_ref().map(ProviderId::as_str))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn organization_from_row(row: SqliteRow) -> Result<Organization, RepositoryError> {
    let tier_raw = row.try_get::<String, _>("plan_tier")?;
    let plan_tier = PlanTier::parse(&tier_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown plan tier `{tier_raw}`")))?;

    let provider_preference = row
        .try_get::<Option<String>, _>("provider_preference")?
        .map(|value| {
            ProviderId::parse(&value).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown provider preference `{value}`"))
            })
        })
        .transpose()?;

    Ok(Organization {
        id: OrganizationId(row.try_get("id")?),
        name: row.try_get("name")?,
        plan_tier,
        provider_preference,
    })
}
