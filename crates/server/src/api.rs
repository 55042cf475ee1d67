//! HTTP API for proposal generation.
//!
//! The request path only creates proposal rows and reads them back. Status,
//! slides and error messages are written by the worker, with one exception:
//! a proposal whose job could not be queued is failed immediately so it never
//! sits in `queued` forever.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use deckhand_agent::selector::ProviderSelector;
use deckhand_core::domain::generation::{GenerationRequest, JobStatus};
use deckhand_core::domain::opportunity::{Opportunity, OpportunityId};
use deckhand_core::domain::organization::OrganizationId;
use deckhand_core::domain::proposal::{Proposal, ProposalId, ProposalStatus};
use deckhand_core::domain::slide::Slide;
use deckhand_core::progress::{ProgressEvent, ProgressObserver, ProgressPolicy, ProgressSnapshot};
use deckhand_db::repositories::{OpportunityRepository, ProposalRepository};

use crate::queue::GenerationQueue;

pub const ENQUEUE_FAILED_MESSAGE: &str =
    "Proposal generation could not be started. Please try again.";
const PROGRESS_READ_FAILED_MESSAGE: &str = "proposal progress could not be read";

#[derive(Clone)]
pub struct ApiState {
    pub proposals: Arc<dyn ProposalRepository>,
    pub opportunities: Arc<dyn OpportunityRepository>,
    pub queue: Arc<GenerationQueue>,
    pub selector: Arc<ProviderSelector>,
    pub progress: ProgressPolicy,
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProposalRequest {
    #[serde(rename = "organizationId")]
    pub organization_id: String,
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct OpportunitySummary {
    pub id: OpportunityId,
    pub name: String,
    pub description: Option<String>,
}

/// Persisted proposal as the UI consumes it. `slides` is only populated
/// for complete proposals.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalView {
    pub id: ProposalId,
    pub version: u32,
    pub status: ProposalStatus,
    pub prompt: String,
    pub slides: Vec<Slide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub opportunity: Option<OpportunitySummary>,
}

impl ProposalView {
    fn new(proposal: Proposal, opportunity: Option<&Opportunity>) -> Self {
        Self {
            id: proposal.id,
            version: proposal.version,
            status: proposal.status,
            prompt: proposal.prompt,
            slides: proposal.slides,
            error_message: proposal.error_message,
            created_at: proposal.created_at,
            opportunity: opportunity.map(|opportunity| OpportunitySummary {
                id: opportunity.id.clone(),
                name: opportunity.name.clone(),
                description: opportunity.description.clone(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub organization_id: OrganizationId,
    pub invalidated: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(rename = "proposalId", skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: message.into(), proposal_id: None }))
}

fn internal_error(context: &str, error: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    error!(event_name = "api.internal_error", context, error = %error, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/v1/opportunities/{opportunity_id}/proposals",
            post(create_proposal).get(list_proposals),
        )
        .route("/api/v1/proposals/{proposal_id}", get(get_proposal))
        .route("/api/v1/proposals/{proposal_id}/job", get(get_job_status))
        .route("/api/v1/proposals/{proposal_id}/events", get(stream_progress))
        .route(
            "/api/v1/organizations/{organization_id}/provider-cache/invalidate",
            post(invalidate_provider_cache),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Creates the next proposal version for an opportunity and queues its
/// generation.
async fn create_proposal(
    State(state): State<ApiState>,
    Path(opportunity_id): Path<String>,
    Json(body): Json<CreateProposalRequest>,
) -> ApiResult<(StatusCode, Json<ProposalView>)> {
    let prompt = body.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "prompt must not be empty"));
    }
    let organization_id = OrganizationId(body.organization_id);
    let opportunity_id = OpportunityId(opportunity_id);

    let opportunity = state
        .opportunities
        .find_by_id(&opportunity_id)
        .await
        .map_err(|error| internal_error("opportunity lookup", error))?
        .filter(|opportunity| opportunity.organization_id == organization_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "opportunity not found"))?;

    let proposal = state
        .proposals
        .create_next_version(
            ProposalId(Uuid::new_v4().to_string()),
            organization_id.clone(),
            opportunity_id.clone(),
            prompt.clone(),
            Utc::now(),
        )
        .await
        .map_err(|error| internal_error("proposal create", error))?;

    info!(
        event_name = "api.proposal.created",
        correlation_id = %proposal.id,
        opportunity_id = %opportunity_id,
        version = proposal.version,
        "proposal created"
    );

    let request = GenerationRequest {
        proposal_id: proposal.id.clone(),
        organization_id,
        opportunity_id,
        prompt,
    };
    if let Err(enqueue_error) = state.queue.enqueue_proposal_generation(request).await {
        error!(
            event_name = "api.proposal.enqueue_failed",
            correlation_id = %proposal.id,
            error = %enqueue_error,
            "proposal generation could not be queued"
        );
        if let Err(fail_error) =
            state.queue.abandon_unqueued(&proposal.id, ENQUEUE_FAILED_MESSAGE).await
        {
            error!(
                event_name = "api.proposal.abandon_failed",
                correlation_id = %proposal.id,
                error = %fail_error,
                "could not mark unqueued proposal as failed"
            );
        }
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError {
                error: ENQUEUE_FAILED_MESSAGE.to_string(),
                proposal_id: Some(proposal.id),
            }),
        ));
    }

    Ok((StatusCode::ACCEPTED, Json(ProposalView::new(proposal, Some(&opportunity)))))
}

async fn list_proposals(
    State(state): State<ApiState>,
    Path(opportunity_id): Path<String>,
) -> ApiResult<Json<Vec<ProposalView>>> {
    let opportunity_id = OpportunityId(opportunity_id);
    let opportunity = state
        .opportunities
        .find_by_id(&opportunity_id)
        .await
        .map_err(|error| internal_error("opportunity lookup", error))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "opportunity not found"))?;

    let proposals = state
        .proposals
        .list_for_opportunity(&opportunity_id)
        .await
        .map_err(|error| internal_error("proposal list", error))?;

    Ok(Json(
        proposals
            .into_iter()
            .map(|proposal| ProposalView::new(proposal, Some(&opportunity)))
            .collect(),
    ))
}

async fn get_proposal(
    State(state): State<ApiState>,
    Path(proposal_id): Path<String>,
) -> ApiResult<Json<ProposalView>> {
    let proposal = find_proposal(&state, &ProposalId(proposal_id)).await?;
    let opportunity = state
        .opportunities
        .find_by_id(&proposal.opportunity_id)
        .await
        .map_err(|error| internal_error("opportunity lookup", error))?;

    Ok(Json(ProposalView::new(proposal, opportunity.as_ref())))
}

/// Current job progress record, or `null` once it has expired or before the
/// job exists. Clients then fall back to the proposal status.
async fn get_job_status(
    State(state): State<ApiState>,
    Path(proposal_id): Path<String>,
) -> ApiResult<Json<Option<JobStatus>>> {
    let status = state
        .queue
        .get_proposal_job_status(&ProposalId(proposal_id))
        .await
        .map_err(|error| internal_error("job status", error))?;
    Ok(Json(status))
}

async fn stream_progress(
    State(state): State<ApiState>,
    Path(proposal_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let proposal = find_proposal(&state, &ProposalId(proposal_id)).await?;

    let events = progress_events(
        Arc::clone(&state.proposals),
        Arc::clone(&state.queue),
        proposal.id,
        state.progress,
    )
    .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn invalidate_provider_cache(
    State(state): State<ApiState>,
    Path(organization_id): Path<String>,
) -> Json<InvalidateResponse> {
    let organization_id = OrganizationId(organization_id);
    let invalidated = state.selector.invalidate(&organization_id).await;
    Json(InvalidateResponse { organization_id, invalidated })
}

async fn find_proposal(state: &ApiState, proposal_id: &ProposalId) -> ApiResult<Proposal> {
    state
        .proposals
        .find_by_id(proposal_id)
        .await
        .map_err(|error| internal_error("proposal lookup", error))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "proposal not found"))
}

// ---------------------------------------------------------------------------
// Progress channel
// ---------------------------------------------------------------------------

/// Polls the job record (falling back to the proposal row) and yields each
/// forward stage change, then exactly one terminal event. The stream always
/// ends within `policy.max_wait_ms`; timing out never touches the proposal.
pub fn progress_events(
    proposals: Arc<dyn ProposalRepository>,
    queue: Arc<GenerationQueue>,
    proposal_id: ProposalId,
    policy: ProgressPolicy,
) -> impl Stream<Item = ProgressEvent> + Send {
    async_stream::stream! {
        let poll_interval = Duration::from_millis(policy.poll_interval_ms.max(1));
        let deadline = Instant::now() + Duration::from_millis(policy.max_wait_ms);
        let mut observer = ProgressObserver::new(proposal_id.clone());

        loop {
            let event = match read_snapshot(proposals.as_ref(), &queue, &proposal_id).await {
                Ok(snapshot) => observer.observe(&snapshot),
                Err(message) => observer.poll_failed(message),
            };
            if let Some(event) = event {
                yield event;
            }
            if observer.is_finished() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    event_name = "progress.stream.timed_out",
                    correlation_id = %proposal_id,
                    max_wait_ms = policy.max_wait_ms,
                    "progress stream reached its wall-clock bound"
                );
                if let Some(event) = observer.time_out() {
                    yield event;
                }
                break;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Reads the job record before the proposal row. See [`ProgressSnapshot`].
async fn read_snapshot(
    proposals: &dyn ProposalRepository,
    queue: &GenerationQueue,
    proposal_id: &ProposalId,
) -> Result<ProgressSnapshot, String> {
    let job = queue.get_proposal_job_status(proposal_id).await.map_err(|error| {
        warn!(
            event_name = "progress.poll_failed",
            correlation_id = %proposal_id,
            error = %error,
            "job status read failed"
        );
        PROGRESS_READ_FAILED_MESSAGE.to_string()
    })?;
    let proposal = proposals
        .find_by_id(proposal_id)
        .await
        .map_err(|error| {
            warn!(
                event_name = "progress.poll_failed",
                correlation_id = %proposal_id,
                error = %error,
                "proposal read failed"
            );
            PROGRESS_READ_FAILED_MESSAGE.to_string()
        })?
        .ok_or_else(|| "proposal not found".to_string())?;

    Ok(ProgressSnapshot {
        proposal_status: proposal.status,
        error_message: proposal.error_message,
        job,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Json, Router,
    };
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use deckhand_core::domain::generation::{
        GenerationJob, GenerationJobId, GenerationTransitionEvent, JobStageKind,
    };
    use deckhand_core::domain::organization::OrganizationId;
    use deckhand_core::domain::proposal::{ProposalId, ProposalStatus};
    use deckhand_core::generation_engine::{GenerationEngine, TransitionResult};
    use deckhand_core::progress::{ProgressEvent, ProgressPolicy, TIMEOUT_MESSAGE};
    use deckhand_db::repositories::{GenerationJobRepository, ProposalRepository};
    use deckhand_db::RepositoryError;

    use super::{internal_error, progress_events, router, ApiState, ENQUEUE_FAILED_MESSAGE};
    use crate::queue::GenerationQueue;
    use crate::test_support::{Harness, OPPORTUNITY, ORG, OTHER_ORG, PROMPT};

    fn fast_progress() -> ProgressPolicy {
        ProgressPolicy { poll_interval_ms: 5, max_wait_ms: 5_000 }
    }

    fn app(harness: &Harness) -> Router {
        router(harness.api_state(fast_progress()))
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).expect("request")).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json") };
        (status, value)
    }

    async fn create(app: Router, organization_id: &str, prompt: &str) -> (StatusCode, Value) {
        send(
            app,
            Method::POST,
            &format!("/api/v1/opportunities/{OPPORTUNITY}/proposals"),
            Some(json!({ "organizationId": organization_id, "prompt": prompt })),
        )
        .await
    }

    /// Ranks progress events so tests can check they never move backwards.
    fn rank(event: &ProgressEvent) -> (u8, u32) {
        match event {
            ProgressEvent::Progress { stage, slide_index, .. } => match stage {
                JobStageKind::Queued => (0, 0),
                JobStageKind::Outline => (1, 0),
                JobStageKind::Slides => (2, slide_index.unwrap_or(0)),
                JobStageKind::Complete | JobStageKind::Error => (3, 0),
            },
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. } => (3, 0),
        }
    }

    #[tokio::test]
    async fn create_generate_and_read_back_proposal() {
        let harness = Harness::new().await;
        harness.script_happy_path().await;

        let (status, created) = create(app(&harness), ORG, PROMPT).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(created["status"], "queued");
        assert_eq!(created["version"], 1);
        assert_eq!(created["slides"], json!([]));
        assert_eq!(created["opportunity"]["name"], "Acme Corp");
        let id = created["id"].as_str().expect("id").to_string();

        let (_, job) =
            send(app(&harness), Method::GET, &format!("/api/v1/proposals/{id}/job"), None).await;
        assert_eq!(job["stage"], "queued");

        harness.worker().run_once().await.expect("worker");

        let (status, proposal) =
            send(app(&harness), Method::GET, &format!("/api/v1/proposals/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(proposal["status"], "complete");
        assert_eq!(proposal["slides"][0]["slideNumber"], 1);
        assert_eq!(proposal["slides"][1]["type"], "table");
        assert!(proposal.get("errorMessage").is_none());

        let (_, job) =
            send(app(&harness), Method::GET, &format!("/api/v1/proposals/{id}/job"), None).await;
        assert_eq!(job["stage"], "complete");
    }

    #[tokio::test]
    async fn create_rejects_blank_prompt_and_foreign_opportunities() {
        let harness = Harness::new().await;

        let (status, _) = create(app(&harness), ORG, "   ").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = create(app(&harness), OTHER_ORG, PROMPT).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "opportunity not found");

        let (status, _) = send(
            app(&harness),
            Method::POST,
            "/api/v1/opportunities/missing/proposals",
            Some(json!({ "organizationId": ORG, "prompt": PROMPT })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let listed = harness
            .proposals
            .list_for_opportunity(&deckhand_core::OpportunityId(OPPORTUNITY.to_string()))
            .await
            .expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn versions_are_listed_newest_first() {
        let harness = Harness::new().await;
        create(app(&harness), ORG, PROMPT).await;
        create(app(&harness), ORG, "Same deal, but monthly billing").await;

        let (status, listed) = send(
            app(&harness),
            Method::GET,
            &format!("/api/v1/opportunities/{OPPORTUNITY}/proposals"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let versions: Vec<u64> =
            listed.as_array().expect("array").iter().filter_map(|p| p["version"].as_u64()).collect();
        assert_eq!(versions, vec![2, 1]);
    }

    #[tokio::test]
    async fn unknown_proposal_reads_are_not_found() {
        let harness = Harness::new().await;
        for uri in ["/api/v1/proposals/nope", "/api/v1/proposals/nope/events"] {
            let response = app(&harness)
                .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }

        let (status, job) =
            send(app(&harness), Method::GET, "/api/v1/proposals/nope/job", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job, Value::Null);
    }

    #[tokio::test]
    async fn finished_proposal_stream_emits_single_terminal_frame() {
        let harness = Harness::new().await;
        harness.script_happy_path().await;
        let (_, created) = create(app(&harness), ORG, PROMPT).await;
        let id = created["id"].as_str().expect("id").to_string();
        harness.worker().run_once().await.expect("worker");

        let response = app(&harness)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/proposals/{id}/events"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        let frames: Vec<&str> =
            text.split("\n\n").filter_map(|frame| frame.strip_prefix("data: ")).collect();
        assert_eq!(frames.len(), 1, "{text}");
        let frame: Value = serde_json::from_str(frames[0]).expect("frame json");
        assert_eq!(frame, json!({ "type": "complete", "proposalId": id }));
    }

    #[tokio::test]
    async fn live_stream_is_monotonic_and_ends_with_one_terminal_event() {
        let harness = Harness::new().await;
        harness.script_happy_path().await;
        let proposal = harness.create_proposal("P-live").await;
        harness.queue.enqueue_proposal_generation(harness.request(&proposal)).await.expect("enqueue");

        let events = progress_events(
            harness.proposals.clone(),
            harness.queue.clone(),
            proposal.id.clone(),
            ProgressPolicy { poll_interval_ms: 1, max_wait_ms: 5_000 },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Arc::new(harness.worker()).run(shutdown_rx));

        let events: Vec<ProgressEvent> = events.collect().await;
        shutdown_tx.send(true).expect("shutdown");
        worker.await.expect("worker");

        let terminal: Vec<_> = events.iter().filter(|event| event.is_terminal()).collect();
        assert_eq!(terminal, vec![&ProgressEvent::Complete { proposal_id: proposal.id }]);
        assert!(events.last().is_some_and(ProgressEvent::is_terminal));
        for pair in events.windows(2) {
            assert!(rank(&pair[0]) < rank(&pair[1]), "{pair:?}");
        }
    }

    #[tokio::test]
    async fn stalled_generation_times_out_without_touching_proposal() {
        let harness = Harness::new().await;
        let proposal = harness.create_proposal("P-stalled").await;
        harness.queue.enqueue_proposal_generation(harness.request(&proposal)).await.expect("enqueue");
        harness.queue.claim_next("worker-gone").await.expect("claim").expect("job");

        let events: Vec<ProgressEvent> = progress_events(
            harness.proposals.clone(),
            harness.queue.clone(),
            proposal.id.clone(),
            ProgressPolicy { poll_interval_ms: 5, max_wait_ms: 40 },
        )
        .collect()
        .await;

        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Error { message: TIMEOUT_MESSAGE.to_string() })
        );
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);

        let stored = harness.proposals.find_by_id(&proposal.id).await.expect("read").expect("row");
        assert_eq!(stored.status, ProposalStatus::Generating);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn provider_cache_invalidation_drops_cached_handle() {
        let harness = Harness::new().await;
        harness.selector.select(&OrganizationId(ORG.to_string())).await.expect("select");
        assert_eq!(harness.selector.cached_len().await, 1);

        let (status, body) = send(
            app(&harness),
            Method::POST,
            &format!("/api/v1/organizations/{ORG}/provider-cache/invalidate"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "organizationId": ORG, "invalidated": true }));
        assert_eq!(harness.selector.cached_len().await, 0);
    }

    /// Job store whose backend is down.
    struct UnavailableJobs;

    #[async_trait]
    impl GenerationJobRepository for UnavailableJobs {
        async fn enqueue(&self, _created: TransitionResult) -> Result<(), RepositoryError> {
            Err(RepositoryError::Decode("queue backend unavailable".to_string()))
        }

        async fn find_by_id(
            &self,
            _id: &GenerationJobId,
        ) -> Result<Option<GenerationJob>, RepositoryError> {
            Ok(None)
        }

        async fn find_latest_for_proposal(
            &self,
            _proposal_id: &ProposalId,
        ) -> Result<Option<GenerationJob>, RepositoryError> {
            Ok(None)
        }

        async fn list_queued(&self, _limit: u32) -> Result<Vec<GenerationJob>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn list_running(&self) -> Result<Vec<GenerationJob>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn apply_transition(
            &self,
            _expected_version: u32,
            _result: TransitionResult,
        ) -> Result<bool, RepositoryError> {
            Ok(false)
        }

        async fn update_stage(&self, _job: &GenerationJob) -> Result<bool, RepositoryError> {
            Ok(false)
        }

        async fn list_transitions(
            &self,
            _job_id: &GenerationJobId,
        ) -> Result<Vec<GenerationTransitionEvent>, RepositoryError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn enqueue_failure_fails_the_new_proposal_immediately() {
        let harness = Harness::new().await;
        let state = ApiState {
            queue: Arc::new(GenerationQueue::new(
                GenerationEngine::new(),
                Arc::new(UnavailableJobs),
                harness.proposals.clone(),
            )),
            ..harness.api_state(fast_progress())
        };

        let (status, body) = create(router(state), ORG, PROMPT).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], ENQUEUE_FAILED_MESSAGE);

        let id = ProposalId(body["proposalId"].as_str().expect("proposal id").to_string());
        let stored = harness.proposals.find_by_id(&id).await.expect("read").expect("row");
        assert_eq!(stored.status, ProposalStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some(ENQUEUE_FAILED_MESSAGE));
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        let (status, Json(body)) = internal_error("proposal create", "database is locked");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "internal error");
        assert!(body.proposal_id.is_none());
    }
}
