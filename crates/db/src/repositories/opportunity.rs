use std::str::FromStr;

use deckhand_core::chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use deckhand_core::domain::opportunity::{
    DealContextItem, DealContextSource, Opportunity, OpportunityId,
};
use deckhand_core::domain::organization::OrganizationId;

use super::rows::{
    conflict_on_foreign_key, parse_optional_date, parse_optional_timestamp, parse_timestamp,
};
use super::{OpportunityRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOpportunityRepository {
    pool: DbPool,
}

impl SqlOpportunityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OpportunityRepository for SqlOpportunityRepository {
    async fn find_by_id(&self, id: &OpportunityId) -> Result<Option<Opportunity>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, organization_id, name, description, expected_value, close_date, stage
             FROM opportunity
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(opportunity_from_row).transpose()
    }

    async fn save(&self, opportunity: Opportunity) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO opportunity (
                id, organization_id, name, description, expected_value, close_date, stage,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                expected_value = excluded.expected_value,
                close_date = excluded.close_date,
                stage = excluded.stage,
                updated_at = excluded.updated_at",
        )
        .bind(&opportunity.id.0)
        .bind(&opportunity.organization_id.0)
        .bind(&opportunity.name)
        .bind(opportunity.description.as_deref())
        .bind(opportunity.expected_value.map(|value| value.to_string()))
        .bind(opportunity.close_date.map(|date| date.format("%Y-%m-%d").to_string()))
        .bind(&opportunity.stage)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &OpportunityId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM opportunity WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                conflict_on_foreign_key(
                    error,
                    format!("opportunity {id} has proposals and cannot be deleted"),
                )
            })?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("opportunity {id}")));
        }
        Ok(())
    }

    async fn list_deal_context(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<DealContextItem>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, opportunity_id, source, name, content, occurred_at, created_at
             FROM deal_context_item
             WHERE opportunity_id = ?
             ORDER BY COALESCE(occurred_at, created_at) DESC, id ASC",
        )
        .bind(&opportunity_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(deal_context_from_row).collect()
    }

    async fn add_deal_context(&self, item: DealContextItem) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO deal_context_item (
                id, opportunity_id, source, name, content, occurred_at, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.opportunity_id.0)
        .bind(item.source.as_str())
        .bind(item.name.as_deref())
        .bind(&item.content)
        .bind(item.occurred_at.map(|value| value.to_rfc3339()))
        .bind(item.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn opportunity_from_row(row: SqliteRow) -> Result<Opportunity, RepositoryError> {
    let expected_value = row
        .try_get::<Option<String>, _>("expected_value")?
        .map(|raw| {
            Decimal::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid expected_value `{raw}`: {error}"))
            })
        })
        .transpose()?;

    Ok(Opportunity {
        id: OpportunityId(row.try_get("id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        expected_value,
        close_date: parse_optional_date("close_date", row.try_get("close_date")?)?,
        stage: row.try_get("stage")?,
    })
}

fn deal_context_from_row(row: SqliteRow) -> Result<DealContextItem, RepositoryError> {
    let source_raw = row.try_get::<String, _>("source")?;
    let source = DealContextSource::parse(&source_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown deal context source `{source_raw}`")))?;

    Ok(DealContextItem {
        id: row.try_get("id")?,
        opportunity_id: OpportunityId(row.try_get("opportunity_id")?),
        source,
        name: row.try_get("name")?,
        content: row.try_get("content")?,
        occurred_at: parse_optional_timestamp("occurred_at", row.try_get("occurred_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use deckhand_core::chrono::NaiveDate;
    use deckhand_core::domain::opportunity::{
        DealContextItem, DealContextSource, Opportunity, OpportunityId,
    };
    use deckhand_core::domain::organization::OrganizationId;
    use rust_decimal::Decimal;

    use super::SqlOpportunityRepository;
    use crate::repositories::test_support::{parse_ts, seed_opportunity, setup_pool};
    use crate::repositories::{OpportunityRepository, RepositoryError};

    #[tokio::test]
    async fn opportunity_round_trip_keeps_value_and_close_date() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-seed").await;
        let repo = SqlOpportunityRepository::new(pool.clone());

        let opportunity = Opportunity {
            id: OpportunityId("opp-2".to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            name: "Globex rollout".to_string(),
            description: None,
            expected_value: Some(Decimal::from_str("60000.00").expect("decimal")),
            close_date: NaiveDate::from_ymd_opt(2026, 6, 30),
            stage: "negotiation".to_string(),
        };
        repo.save(opportunity.clone()).await.expect("save");

        assert_eq!(repo.find_by_id(&opportunity.id).await.expect("find"), Some(opportunity));
        pool.close().await;
    }

    #[tokio::test]
    async fn deal_context_lists_newest_first() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-1").await;
        let repo = SqlOpportunityRepository::new(pool.clone());
        let opportunity_id = OpportunityId("opp-1".to_string());

        for (id, occurred) in [
            ("dc-old", "2026-01-05T10:00:00+00:00"),
            ("dc-new", "2026-02-20T10:00:00+00:00"),
            ("dc-mid", "2026-02-01T10:00:00+00:00"),
        ] {
            repo.add_deal_context(DealContextItem {
                id: id.to_string(),
                opportunity_id: opportunity_id.clone(),
                source: DealContextSource::Email,
                name: Some(format!("{id} thread")),
                content: "Customer asked about SSO pricing".to_string(),
                occurred_at: Some(parse_ts(occurred)),
                created_at: parse_ts("2026-02-21T00:00:00+00:00"),
            })
            .await
            .expect("add deal context");
        }

        let items = repo.list_deal_context(&opportunity_id).await.expect("list");
        let ids: Vec<_> = items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["dc-new", "dc-mid", "dc-old"]);
        pool.close().await;
    }

    #[tokio::test]
    async fn delete_is_blocked_once_a_proposal_exists() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-1").await;
        let repo = SqlOpportunityRepository::new(pool.clone());

        sqlx::query(
            "INSERT INTO proposal (id, organization_id, opportunity_id, version, status, prompt, created_at, updated_at)
             VALUES ('P-1', 'org-1', 'opp-1', 1, 'queued', 'deck', '2026-03-01T00:00:00+00:00', '2026-03-01T00:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .expect("insert proposal");

        let error = repo.delete(&OpportunityId("opp-1".to_string())).await.expect_err("restricted");
        assert!(
            matches!(error, RepositoryError::Conflict(ref message) if message.contains("has proposals")),
            "unexpected error: {error:?}"
        );

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunity WHERE id = 'opp-1'")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(remaining, 1);
        pool.close().await;
    }
}
