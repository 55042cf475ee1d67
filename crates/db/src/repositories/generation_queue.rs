use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use deckhand_core::domain::generation::{
    GenerationJob, GenerationJobId, GenerationJobState, GenerationTransitionEvent,
    GenerationTransitionId, JobStage, JobStageKind,
};
use deckhand_core::domain::opportunity::OpportunityId;
use deckhand_core::domain::organization::OrganizationId;
use deckhand_core::domain::proposal::ProposalId;
use deckhand_core::generation_engine::TransitionResult;

use super::rows::{
    conflict_on_unique, parse_optional_timestamp, parse_optional_u32, parse_timestamp, parse_u32,
};
use super::{GenerationJobRepository, RepositoryError};
use crate::DbPool;

const JOB_COLUMNS: &str = "id, proposal_id, organization_id, opportunity_id, prompt, state,
    stage, slide_index, total_slides, progress_message, attempt_count, claimed_by, claimed_at,
    last_error, error_class, state_version, created_at, updated_at, finished_at";

pub struct SqlGenerationJobRepository {
    pool: DbPool,
}

impl SqlGenerationJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GenerationJobRepository for SqlGenerationJobRepository {
    async fn enqueue(&self, created: TransitionResult) -> Result<(), RepositoryError> {
        let job = &created.job;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO generation_job (
                id, proposal_id, organization_id, opportunity_id, prompt, state,
                stage, slide_index, total_slides, progress_message, attempt_count, claimed_by,
                claimed_at, last_error, error_class, state_version, created_at, updated_at,
                finished_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id.0)
        .bind(&job.proposal_id.0)
        .bind(&job.organization_id.0)
        .bind(&job.opportunity_id.0)
        .bind(&job.prompt)
        .bind(job.state.as_str())
        .bind(job.stage.kind().as_str())
        .bind(job.stage.slide_index().map(i64::from))
        .bind(job.stage.total_slides().map(i64::from))
        .bind(job.progress_message.as_deref())
        .bind(i64::from(job.attempt_count))
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(|value| value.to_rfc3339()))
        .bind(job.last_error.as_deref())
        .bind(job.error_class.as_deref())
        .bind(i64::from(job.state_version))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.finished_at.map(|value| value.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(|error| {
            conflict_on_unique(
                error,
                format!("proposal {} already has an active generation job", job.proposal_id),
            )
        })?;

        insert_transition(&mut tx, &created.transition).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &GenerationJobId,
    ) -> Result<Option<GenerationJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM generation_job WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn find_latest_for_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Option<GenerationJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_job
             WHERE proposal_id = ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1"
        ))
        .bind(&proposal_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn list_queued(&self, limit: u32) -> Result<Vec<GenerationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_job
             WHERE state = 'queued'
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_running(&self) -> Result<Vec<GenerationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_job
             WHERE state = 'running'
             ORDER BY claimed_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn apply_transition(
        &self,
        expected_version: u32,
        result: TransitionResult,
    ) -> Result<bool, RepositoryError> {
        let job = &result.job;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE generation_job SET
                state = ?,
                stage = ?,
                slide_index = ?,
                total_slides = ?,
                progress_message = ?,
                attempt_count = ?,
                claimed_by = ?,
                claimed_at = ?,
                last_error = ?,
                error_class = ?,
                state_version = ?,
                updated_at = ?,
                finished_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(job.state.as_str())
        .bind(job.stage.kind().as_str())
        .bind(job.stage.slide_index().map(i64::from))
        .bind(job.stage.total_slides().map(i64::from))
        .bind(job.progress_message.as_deref())
        .bind(i64::from(job.attempt_count))
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(|value| value.to_rfc3339()))
        .bind(job.last_error.as_deref())
        .bind(job.error_class.as_deref())
        .bind(i64::from(job.state_version))
        .bind(job.updated_at.to_rfc3339())
        .bind(job.finished_at.map(|value| value.to_rfc3339()))
        .bind(&job.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_transition(&mut tx, &result.transition).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update_stage(&self, job: &GenerationJob) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE generation_job
             SET stage = ?, slide_index = ?, total_slides = ?, progress_message = ?, updated_at = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(job.stage.kind().as_str())
        .bind(job.stage.slide_index().map(i64::from))
        .bind(job.stage.total_slides().map(i64::from))
        .bind(job.progress_message.as_deref())
        .bind(job.updated_at.to_rfc3339())
        .bind(&job.id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_transitions(
        &self,
        job_id: &GenerationJobId,
    ) -> Result<Vec<GenerationTransitionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                job_id,
                proposal_id,
                from_state,
                to_state,
                transition_reason,
                error_class,
                decision_context_json,
                actor_id,
                state_version,
                occurred_at
             FROM generation_job_transition
             WHERE job_id = ?
             ORDER BY state_version ASC, occurred_at ASC",
        )
        .bind(&job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

async fn insert_transition(
    tx: &mut Transaction<'_, Sqlite>,
    transition: &GenerationTransitionEvent,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO generation_job_transition (
            id,
            job_id,
            proposal_id,
            from_state,
            to_state,
            transition_reason,
            error_class,
            decision_context_json,
            actor_id,
            state_version,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transition.id.0)
    .bind(&transition.job_id.0)
    .bind(&transition.proposal_id.0)
    .bind(transition.from_state.as_ref().map(GenerationJobState::as_str))
    .bind(transition.to_state.as_str())
    .bind(&transition.transition_reason)
    .bind(transition.error_class.as_deref())
    .bind(&transition.decision_context_json)
    .bind(&transition.actor_id)
    .bind(i64::from(transition.state_version))
    .bind(transition.occurred_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn job_from_row(row: SqliteRow) -> Result<GenerationJob, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = GenerationJobState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job state `{state_raw}`")))?;

    let stage_raw = row.try_get::<String, _>("stage")?;
    let stage_kind = JobStageKind::parse(&stage_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job stage `{stage_raw}`")))?;
    let slide_index = parse_optional_u32("slide_index", row.try_get("slide_index")?)?;
    let total_slides = parse_optional_u32("total_slides", row.try_get("total_slides")?)?;
    let stage = JobStage::from_parts(stage_kind, slide_index, total_slides).ok_or_else(|| {
        RepositoryError::Decode(format!(
            "inconsistent slide counters for stage `{stage_raw}`: {slide_index:?}/{total_slides:?}"
        ))
    })?;

    Ok(GenerationJob {
        id: GenerationJobId(row.try_get("id")?),
        proposal_id: ProposalId(row.try_get("proposal_id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        opportunity_id: OpportunityId(row.try_get("opportunity_id")?),
        prompt: row.try_get("prompt")?,
        state,
        stage,
        progress_message: row.try_get("progress_message")?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        last_error: row.try_get("last_error")?,
        error_class: row.try_get("error_class")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<GenerationTransitionEvent, RepositoryError> {
    let from_state = row
        .try_get::<Option<String>, _>("from_state")?
        .map(|value| {
            GenerationJobState::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown from_state `{value}`")))
        })
        .transpose()?;

    let to_state_raw = row.try_get::<String, _>("to_state")?;
    let to_state = GenerationJobState::parse(&to_state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown to_state `{to_state_raw}`")))?;

    Ok(GenerationTransitionEvent {
        id: GenerationTransitionId(row.try_get("id")?),
        job_id: GenerationJobId(row.try_get("job_id")?),
        proposal_id: ProposalId(row.try_get("proposal_id")?),
        from_state,
        to_state,
        transition_reason: row.try_get("transition_reason")?,
        error_class: row.try_get("error_class")?,
        decision_context_json: row.try_get("decision_context_json")?,
        actor_id: row.try_get("actor_id")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use deckhand_core::chrono::{DateTime, Utc};
    use deckhand_core::domain::generation::{GenerationJobState, GenerationRequest, JobStage};
    use deckhand_core::domain::opportunity::OpportunityId;
    use deckhand_core::domain::organization::OrganizationId;
    use deckhand_core::domain::proposal::ProposalId;
    use deckhand_core::generation_engine::GenerationEngine;

    use super::SqlGenerationJobRepository;
    use crate::repositories::test_support::{parse_ts, seed_opportunity, setup_pool};
    use crate::repositories::{
        GenerationJobRepository, ProposalRepository, RepositoryError, SqlProposalRepository,
    };
    use crate::DbPool;

    async fn seed_proposal(pool: &DbPool, id: &str) -> ProposalId {
        SqlProposalRepository::new(pool.clone())
            .create_next_version(
                ProposalId(id.to_string()),
                OrganizationId("org-1".to_string()),
                OpportunityId("opp-1".to_string()),
                "Create a proposal for Acme Corp".to_string(),
                Utc::now(),
            )
            .await
            .expect("seed proposal")
            .id
    }

    fn request(proposal_id: &ProposalId) -> GenerationRequest {
        GenerationRequest {
            proposal_id: proposal_id.clone(),
            organization_id: OrganizationId("org-1".to_string()),
            opportunity_id: OpportunityId("opp-1".to_string()),
            prompt: "Create a proposal for Acme Corp".to_string(),
        }
    }

    fn at(value: &str) -> DateTime<Utc> {
        parse_ts(value)
    }

    #[tokio::test]
    async fn second_active_job_for_same_proposal_is_a_conflict() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-1").await;
        let proposal_id = seed_proposal(&pool, "P-1").await;
        let other_id = seed_proposal(&pool, "P-2").await;
        let repo = SqlGenerationJobRepository::new(pool.clone());
        let engine = GenerationEngine::new();

        repo.enqueue(engine.create_job(request(&proposal_id), Utc::now())).await.expect("first");
        let error = repo
            .enqueue(engine.create_job(request(&proposal_id), Utc::now()))
            .await
            .expect_err("duplicate must be rejected");
        assert!(matches!(error, RepositoryError::Conflict(_)));

        repo.enqueue(engine.create_job(request(&other_id), Utc::now()))
            .await
            .expect("other proposals are independent");
        pool.close().await;
    }

    #[tokio::test]
    async fn finished_job_frees_the_proposal_slot() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-1").await;
        let proposal_id = seed_proposal(&pool, "P-1").await;
        let repo = SqlGenerationJobRepository::new(pool.clone());
        let engine = GenerationEngine::new();

        let created = engine.create_job(request(&proposal_id), Utc::now());
        let job = created.job.clone();
        repo.enqueue(created).await.expect("enqueue");
        let failed = engine.fail_job(job.clone(), "enqueue rolled back", "infra", Utc::now()).unwrap();
        assert!(repo.apply_transition(job.state_version, failed).await.expect("fail job"));

        repo.enqueue(engine.create_job(request(&proposal_id), Utc::now()))
            .await
            .expect("slot is free once the earlier job is terminal");
        pool.close().await;
    }

    #[tokio::test]
    async fn claim_is_optimistic_and_audited() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-1").await;
        let proposal_id = seed_proposal(&pool, "P-1").await;
        let repo = SqlGenerationJobRepository::new(pool.clone());
        let engine = GenerationEngine::new();

        repo.enqueue(engine.create_job(request(&proposal_id), at("2026-03-01T10:00:00+00:00")))
            .await
            .expect("enqueue");

        let queued = repo.list_queued(10).await.expect("list queued");
        assert_eq!(queued.len(), 1);
        let job = queued[0].clone();

        let first = engine.claim_job(job.clone(), "worker-a", Utc::now()).unwrap();
        let second = engine.claim_job(job.clone(), "worker-b", Utc::now()).unwrap();
        assert!(repo.apply_transition(job.state_version, first).await.expect("claim a"));
        assert!(
            !repo.apply_transition(job.state_version, second).await.expect("claim b"),
            "stale version must lose"
        );

        let stored = repo.find_by_id(&job.id).await.expect("find").expect("exists");
        assert_eq!(stored.state, GenerationJobState::Running);
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-a"));
        assert!(repo.list_queued(10).await.expect("list").is_empty());

        let transitions = repo.list_transitions(&job.id).await.expect("transitions");
        let reasons: Vec<_> = transitions.iter().map(|t| t.transition_reason.as_str()).collect();
        assert_eq!(reasons, vec!["job_enqueued", "job_claimed"]);
        pool.close().await;
    }

    #[tokio::test]
    async fn stage_updates_persist_until_job_finishes() {
        let pool = setup_pool().await;
        seed_opportunity(&pool, "org-1", "opp-1").await;
        let proposal_id = seed_proposal(&pool, "P-1").await;
        let repo = SqlGenerationJobRepository::new(pool.clone());
        let engine = GenerationEngine::new();

        let created = engine.create_job(request(&proposal_id), Utc::now());
        let job = created.job.clone();
        repo.enqueue(created).await.expect("enqueue");
        let claimed = engine.claim_job(job.clone(), "worker-a", Utc::now()).unwrap();
        let running = claimed.job.clone();
        repo.apply_transition(job.state_version, claimed).await.expect("claim");

        let sliding = engine
            .advance_stage(
                running,
                JobStage::Slide { slide_index: 2, total_slides: 4 },
                Some("Pricing".to_string()),
                Utc::now(),
            )
            .unwrap();
        assert!(repo.update_stage(&sliding).await.expect("update stage"));

        let latest =
            repo.find_latest_for_proposal(&proposal_id).await.expect("latest").expect("exists");
        assert_eq!(latest.stage, JobStage::Slide { slide_index: 2, total_slides: 4 });
        assert_eq!(latest.progress_message.as_deref(), Some("Pricing"));

        let completed = engine.complete_job(sliding.clone(), 4, Utc::now()).unwrap();
        assert!(repo.apply_transition(sliding.state_version, completed).await.expect("complete"));
        assert!(!repo.update_stage(&sliding).await.expect("late update"), "terminal job is frozen");

        let latest =
            repo.find_latest_for_proposal(&proposal_id).await.expect("latest").expect("exists");
        assert_eq!(latest.stage, JobStage::Complete);
        pool.close().await;
    }
}
