use std::time::Duration;

use async_trait::async_trait;
use relational_core::{
    sample_pair, DialogueBackend, GenerationError, ScriptedBackend, UtteranceRequest,
};

use super::*;

fn small_config() -> EngineConfig {
    EngineConfig {
        max_turns: 8,
        max_concurrency: 4,
        retry_backoff_ms: 1,
        bootstrap_resamples: 20,
        ..EngineConfig::default()
    }
}

fn test_state() -> AppState {
    let mut engine = EngineApi::from_config(small_config()).expect("config");
    engine.attach_in_memory_store().expect("store");
    AppState::new(engine)
}

fn request(n: usize, seed: u64, batch_id: &str) -> BatchRequest {
    let (a, b) = sample_pair();
    let mut request = BatchRequest::new(a, b, n, seed);
    request.batch_id = Some(batch_id.to_string());
    request
}

/// Sleeps before every utterance so a batch stays running long enough to poke at.
struct SlowBackend {
    delay: Duration,
}

#[async_trait]
impl DialogueBackend for SlowBackend {
    async fn generate_utterance(&self, request: UtteranceRequest<'_>) -> Result<String, GenerationError> {
        tokio::time::sleep(self.delay).await;
        ScriptedBackend.generate_utterance(request).await
    }
}

async fn wait_finished(state: &AppState, batch_id: &str) -> BatchStatusReport {
    for _ in 0..1_000 {
        let report = get_batch_status(Path(batch_id.to_string()), State(state.clone()))
            .await
            .expect("status")
            .0;
        if report.state == BatchState::Finished {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} did not finish");
}

#[tokio::test]
async fn created_batch_finishes_and_serves_every_view() {
    let state = test_state();
    let (status, Json(accepted)) = create_batch(State(state.clone()), Json(request(5, 17, "batch-a")))
        .await
        .expect("accepted");
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted.state, BatchState::Running);
    assert_eq!(accepted.progress.total, 5);

    let report = wait_finished(&state, "batch-a").await;
    assert_eq!(report.status, Some(BatchStatus::Completed));
    assert_eq!(report.progress.completed, 5);
    assert_eq!(report.error, None);

    let Json(result) = get_batch_result(Path("batch-a".to_string()), State(state.clone()))
        .await
        .expect("result");
    assert_eq!(result.n_simulations, 5);
    assert_eq!(result.base_seed, 17);

    let Json(analysis) = get_batch_analysis(Path("batch-a".to_string()), State(state.clone()))
        .await
        .expect("analysis");
    assert_eq!(analysis.batch_id, "batch-a");

    let Json(timeline) = get_timeline(Path(("batch-a".to_string(), 2)), State(state.clone()))
        .await
        .expect("timeline");
    assert_eq!(timeline, result.timelines[2]);

    let missing = get_timeline(Path(("batch-a".to_string(), 9)), State(state.clone()))
        .await
        .expect_err("out of range");
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.error.error_code, ErrorCode::TimelineNotFound);

    let Json(listed) = list_batches(State(state.clone()), Query(ListBatchesQuery { limit: None }))
        .await
        .expect("list");
    assert!(listed.running.is_empty());
    assert_eq!(listed.batches.len(), 1);
    assert_eq!(listed.batches[0].batch_id, "batch-a");
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_scheduling() {
    let state = test_state();

    let mut incomplete = request(3, 1, "batch-bad");
    incomplete
        .profile_b
        .values
        .remove(&VulnerabilityAxis::Power);
    let error = create_batch(State(state.clone()), Json(incomplete))
        .await
        .expect_err("incomplete profile");
    assert_eq!(error.status, StatusCode::BAD_REQUEST);
    assert_eq!(error.error.error_code, ErrorCode::InvalidProfile);

    let error = create_batch(State(state.clone()), Json(request(0, 1, "batch-empty")))
        .await
        .expect_err("empty batch");
    assert_eq!(error.status, StatusCode::BAD_REQUEST);
    assert_eq!(error.error.error_code, ErrorCode::InvalidRequest);

    assert!(state.inner.lock().await.batches.is_empty());
}

#[tokio::test]
async fn unknown_batch_is_not_found_everywhere() {
    let state = test_state();
    let id = || Path("batch-missing".to_string());

    let status = get_batch_status(id(), State(state.clone())).await.expect_err("status");
    assert_eq!(status.status, StatusCode::NOT_FOUND);
    assert_eq!(status.error.error_code, ErrorCode::BatchNotFound);

    let result = get_batch_result(id(), State(state.clone())).await.expect_err("result");
    assert_eq!(result.status, StatusCode::NOT_FOUND);

    let cancel = cancel_batch(id(), State(state.clone())).await.expect_err("cancel");
    assert_eq!(cancel.status, StatusCode::NOT_FOUND);

    let delete = delete_batch(id(), State(state.clone())).await.expect_err("delete");
    assert_eq!(delete.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn running_batch_conflicts_until_cancelled() {
    let mut engine = EngineApi::with_backend(
        small_config(),
        Arc::new(SlowBackend {
            delay: Duration::from_millis(100),
        }),
    )
    .expect("config");
    engine.attach_in_memory_store().expect("store");
    let state = AppState::new(engine);

    create_batch(State(state.clone()), Json(request(4, 5, "batch-slow")))
        .await
        .expect("accepted");

    let duplicate = create_batch(State(state.clone()), Json(request(4, 5, "batch-slow")))
        .await
        .expect_err("duplicate");
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let early = get_batch_result(Path("batch-slow".to_string()), State(state.clone()))
        .await
        .expect_err("still running");
    assert_eq!(early.status, StatusCode::CONFLICT);
    assert_eq!(early.error.error_code, ErrorCode::BatchStateConflict);

    let delete = delete_batch(Path("batch-slow".to_string()), State(state.clone()))
        .await
        .expect_err("running");
    assert_eq!(delete.status, StatusCode::CONFLICT);

    let Json(cancelled) = cancel_batch(Path("batch-slow".to_string()), State(state.clone()))
        .await
        .expect("cancel");
    assert_eq!(cancelled.state, BatchState::Running);

    // No timeline reaches its last turn before the flag is seen.
    let report = wait_finished(&state, "batch-slow").await;
    assert_eq!(report.status, Some(BatchStatus::Failed));
    assert!(report.error.is_some());

    let failed = get_batch_result(Path("batch-slow".to_string()), State(state.clone()))
        .await
        .expect_err("no result");
    assert_eq!(failed.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(failed.error.error_code, ErrorCode::BatchFailed);

    let again = cancel_batch(Path("batch-slow".to_string()), State(state.clone()))
        .await
        .expect_err("already finished");
    assert_eq!(again.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn finished_batch_is_served_from_store_after_restart() {
    let state = test_state();
    create_batch(State(state.clone()), Json(request(3, 40, "batch-stored")))
        .await
        .expect("accepted");
    wait_finished(&state, "batch-stored").await;
    let Json(live) = get_batch_result(Path("batch-stored".to_string()), State(state.clone()))
        .await
        .expect("live result");

    state.inner.lock().await.batches.clear();

    let Json(report) = get_batch_status(Path("batch-stored".to_string()), State(state.clone()))
        .await
        .expect("stored status");
    assert_eq!(report.state, BatchState::Finished);
    assert_eq!(report.status, Some(live.status));
    assert_eq!(report.base_seed, 40);
    assert_eq!(report.progress.total, 3);

    let Json(stored) = get_batch_result(Path("batch-stored".to_string()), State(state.clone()))
        .await
        .expect("stored result");
    assert_eq!(stored, live);

    let Json(timeline) = get_timeline(Path(("batch-stored".to_string(), 0)), State(state.clone()))
        .await
        .expect("stored timeline");
    assert_eq!(timeline, live.timelines[0]);

    let Json(deleted) = delete_batch(Path("batch-stored".to_string()), State(state.clone()))
        .await
        .expect("delete");
    assert!(deleted.deleted);
    let gone = get_batch_status(Path("batch-stored".to_string()), State(state.clone()))
        .await
        .expect_err("deleted");
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn persisted_batch_keeps_only_counters_in_memory() {
    let state = test_state();
    create_batch(State(state.clone()), Json(request(4, 23, "batch-lean")))
        .await
        .expect("accepted");
    let report = wait_finished(&state, "batch-lean").await;
    assert_eq!(report.progress.completed, 4);

    {
        let inner = state.inner.lock().await;
        let entry = inner.batches.get("batch-lean").expect("tracked");
        assert_eq!(entry.state, BatchState::Finished);
        assert!(entry.status.is_some());
        assert!(entry.outcome.is_none());
    }

    let Json(result) = get_batch_result(Path("batch-lean".to_string()), State(state.clone()))
        .await
        .expect("served from store");
    assert_eq!(result.n_simulations, 4);
    let Json(timeline) = get_timeline(Path(("batch-lean".to_string(), 1)), State(state.clone()))
        .await
        .expect("timeline from store");
    assert_eq!(timeline, result.timelines[1]);
}

#[tokio::test]
async fn batch_without_store_is_served_from_memory() {
    let state = AppState::new(EngineApi::from_config(small_config()).expect("config"));
    create_batch(State(state.clone()), Json(request(2, 8, "batch-volatile")))
        .await
        .expect("accepted");
    wait_finished(&state, "batch-volatile").await;

    assert!(state.inner.lock().await.batches["batch-volatile"].outcome.is_some());
    let Json(result) = get_batch_result(Path("batch-volatile".to_string()), State(state.clone()))
        .await
        .expect("live result");
    assert_eq!(result.n_simulations, 2);
}

#[tokio::test]
async fn profile_validation_reports_each_party() {
    let (a, b) = sample_pair();
    let Json(response) = validate_profiles(Json(ValidateProfilesRequest {
        profile_a: a.clone(),
        profile_b: Some(b.clone()),
    }))
    .await;
    assert!(response.valid);
    assert_eq!(response.profiles.len(), 2);
    assert_eq!(
        response.shared_axes,
        shared_top_axes(&a, &b)
            .into_iter()
            .map(|(axis, _)| axis)
            .collect::<Vec<_>>()
    );

    let mut broken = b;
    broken.entropy_tolerance = 1.5;
    let Json(response) = validate_profiles(Json(ValidateProfilesRequest {
        profile_a: a,
        profile_b: Some(broken),
    }))
    .await;
    assert!(!response.valid);
    assert!(response.profiles[0].valid);
    assert_eq!(response.profiles[1].party, Speaker::AgentB);
    assert!(response.profiles[1].error.is_some());
    assert!(response.shared_axes.is_empty());
}

#[test]
fn stream_messages_carry_type_and_batch() {
    let report = BatchStatusReport {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        batch_id: "batch-x".to_string(),
        base_seed: 1,
        state: BatchState::Finished,
        status: Some(BatchStatus::Completed),
        progress: ProgressEvent::new("batch-x", 2, 0, 2),
        error: None,
    };

    let finished = StreamMessage::finished(&report);
    assert!(finished.is_terminal());
    let encoded = serde_json::to_value(&finished).expect("encode");
    assert_eq!(encoded["type"], "batch.finished");
    assert_eq!(encoded["batch_id"], "batch-x");
    assert_eq!(encoded["payload"]["status"], "completed");

    let progress = StreamMessage::progress(&ProgressEvent::new("batch-x", 1, 0, 2));
    assert!(!progress.is_terminal());
    assert_eq!(progress.payload["completed"], 1);
}
