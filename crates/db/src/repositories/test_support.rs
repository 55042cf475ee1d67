use deckhand_core::chrono::{DateTime, Utc};
use deckhand_core::domain::opportunity::{Opportunity, OpportunityId};
use deckhand_core::domain::organization::{Organization, OrganizationId, PlanTier};

use super::{OpportunityRepository, OrganizationRepository};
use super::{SqlOpportunityRepository, SqlOrganizationRepository};
use crate::{connect_with_settings, migrations, DbPool};

pub(crate) async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

pub(crate) async fn seed_opportunity(pool: &DbPool, organization: &str, opportunity: &str) {
    SqlOrganizationRepository::new(pool.clone())
        .save(Organization {
            id: OrganizationId(organization.to_string()),
            name: format!("{organization} inc"),
            plan_tier: PlanTier::Starter,
            provider_preference: None,
        })
        .await
        .expect("seed organization");

    SqlOpportunityRepository::new(pool.clone())
        .save(Opportunity {
            id: OpportunityId(opportunity.to_string()),
            organization_id: OrganizationId(organization.to_string()),
            name: "Acme Corp expansion".to_string(),
            description: Some("50 users, annual billing".to_string()),
            expected_value: None,
            close_date: None,
            stage: "open".to_string(),
        })
        .await
        .expect("seed opportunity");
}

pub(crate) fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
}
