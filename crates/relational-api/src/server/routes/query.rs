#[derive(Debug, Deserialize)]
struct ListBatchesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ListBatchesResponse {
    schema_version: String,
    running: Vec<BatchStatusReport>,
    batches: Vec<PersistedBatchSummary>,
}

async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<ListBatchesQuery>,
) -> Result<Json<ListBatchesResponse>, HttpApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let inner = state.inner.lock().await;
    let mut running = inner
        .batches
        .iter()
        .filter(|(_, entry)| entry.state == BatchState::Running)
        .map(|(batch_id, entry)| entry.report(batch_id))
        .collect::<Vec<_>>();
    running.sort_by(|left, right| left.batch_id.cmp(&right.batch_id));

    let batches = inner
        .engine
        .list_batches(limit)
        .map_err(HttpApiError::from_persistence)?;

    Ok(Json(ListBatchesResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        running,
        batches,
    }))
}

async fn get_batch_status(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchStatusReport>, HttpApiError> {
    let inner = state.inner.lock().await;
    Ok(Json(status_report(&inner, &batch_id)?))
}

async fn get_batch_result(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SimulationResult>, HttpApiError> {
    let inner = state.inner.lock().await;
    let result = match lookup_finished(&inner, &batch_id)? {
        FinishedBatch::Live(outcome) => outcome.result.clone(),
        FinishedBatch::Stored => inner
            .engine
            .load_result(&batch_id)
            .map_err(HttpApiError::from_persistence)?
            .ok_or_else(|| HttpApiError::batch_not_found(&batch_id))?,
    };

    Ok(Json(result))
}

async fn get_batch_analysis(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchAnalysis>, HttpApiError> {
    let inner = state.inner.lock().await;
    let analysis = match lookup_finished(&inner, &batch_id)? {
        FinishedBatch::Live(outcome) => outcome.analysis.clone(),
        FinishedBatch::Stored => inner
            .engine
            .load_analysis(&batch_id)
            .map_err(HttpApiError::from_persistence)?
            .ok_or_else(|| HttpApiError::batch_not_found(&batch_id))?,
    };

    Ok(Json(analysis))
}
