use deckhand_core::chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use deckhand_core::domain::knowledge::{
    Battlecard, CompanyProfile, KnowledgeBase, Product, ProductId,
};
use deckhand_core::domain::organization::OrganizationId;

use super::rows::{encode_string_list, parse_string_list};
use super::{KnowledgeRepository, RepositoryError};
use crate::DbPool;

pub struct SqlKnowledgeRepository {
    pool: DbPool,
}

impl SqlKnowledgeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl KnowledgeRepository for SqlKnowledgeRepository {
    async fn load_knowledge_base(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<KnowledgeBase, RepositoryError> {
        let profile_row = sqlx::query(
            "SELECT organization_id, company_name, overview, value_proposition,
                    differentiators_json, target_market
             FROM company_profile
             WHERE organization_id = ?",
        )
        .bind(&organization_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let product_rows = sqlx::query(
            "SELECT id, organization_id, name, description, pricing, features_json, active
             FROM product
             WHERE organization_id = ? AND active = 1
             ORDER BY name ASC, id ASC",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        let battlecard_rows = sqlx::query(
            "SELECT id, organization_id, competitor_name, strengths_json, weaknesses_json,
                    differentiators_json, active
             FROM battlecard
             WHERE organization_id = ? AND active = 1
             ORDER BY competitor_name ASC, id ASC",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(KnowledgeBase {
            company_profile: profile_row.map(profile_from_row).transpose()?,
            products: product_rows.into_iter().map(product_from_row).collect::<Result<_, _>>()?,
            battlecards: battlecard_rows
                .into_iter()
                .map(battlecard_from_row)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn save_company_profile(&self, profile: CompanyProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO company_profile (
                organization_id, company_name, overview, value_proposition,
                differentiators_json, target_market, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(organization_id) DO UPDATE SET
                company_name = excluded.company_name,
                overview = excluded.overview,
                value_proposition = excluded.value_proposition,
                differentiators_json = excluded.differentiators_json,
                target_market = excluded.target_market,
                updated_at = excluded.updated_at",
        )
        .bind(&profile.organization_id.0)
        .bind(&profile.company_name)
        .bind(profile.overview.as_deref())
        .bind(profile.value_proposition.as_deref())
        .bind(encode_string_list(&profile.differentiators)?)
        .bind(profile.target_market.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_product(&self, product: Product) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO product (
                id, organization_id, name, description, pricing, features_json, active,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                pricing = excluded.pricing,
                features_json = excluded.features_json,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&product.id.0)
        .bind(&product.organization_id.0)
        .bind(&product.name)
        .bind(product.description.as_deref())
        .bind(product.pricing.as_deref())
        .bind(encode_string_list(&product.features)?)
        .bind(product.active)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_battlecard(&self, battlecard: Battlecard) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO battlecard (
                id, organization_id, competitor_name, strengths_json, weaknesses_json,
                differentiators_json, active, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                competitor_name = excluded.competitor_name,
                strengths_json = excluded.strengths_json,
                weaknesses_json = excluded.weaknesses_json,
                differentiators_json = excluded.differentiators_json,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&battlecard.id)
        .bind(&battlecard.organization_id.0)
        .bind(&battlecard.competitor_name)
        .bind(encode_string_list(&battlecard.strengths)?)
        .bind(encode_string_list(&battlecard.weaknesses)?)
        .bind(encode_string_list(&battlecard.differentiators)?)
        .bind(battlecard.active)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn profile_from_row(row: SqliteRow) -> Result<CompanyProfile, RepositoryError> {
    Ok(CompanyProfile {
        organization_id: OrganizationId(row.try_get("organization_id")?),
        company_name: row.try_get("company_name")?,
        overview: row.try_get("overview")?,
        value_proposition: row.try_get("value_proposition")?,
        differentiators: parse_string_list(
            "differentiators_json",
            row.try_get("differentiators_json")?,
        )?,
        target_market: row.try_get("target_market")?,
    })
}

fn product_from_row(row: SqliteRow) -> Result<Product, RepositoryError> {
    Ok(Product {
        id: ProductId(row.try_get("id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        pricing: row.try_get("pricing")?,
        features: parse_string_list("features_json", row.try_get("features_json")?)?,
        active: row.try_get("active")?,
    })
}

fn battlecard_from_row(row: SqliteRow) -> Result<Battlecard, RepositoryError> {
    Ok(Battlecard {
        id: row.try_get("id")?,
        organization_id: OrganizationId(row.try_get("organization_id")?),
        competitor_name: row.try_get("competitor_name")?,
        strengths: parse_string_list("strengths_json", row.try_get("strengths_json")?)?,
        weaknesses: parse_string_list("weaknesses_json", row.try_get("weaknesses_json")?)?,
        differentiators: parse_string_list(
            "differentiators_json",
            row.try_get("differentiators_json")?,
        )?,
        active: row.try_get("active")?,
    })
}
