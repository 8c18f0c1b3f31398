async fn create_batch(
    State(state): State<AppState>,
    Json(mut request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchStatusReport>), HttpApiError> {
    if request.n == 0 || request.n > MAX_BATCH_SIZE {
        return Err(HttpApiError::invalid_request(
            format!("n must be in [1, {MAX_BATCH_SIZE}]"),
            Some(format!("n={}", request.n)),
        ));
    }
    if request.max_turns == Some(0) {
        return Err(HttpApiError::invalid_request(
            "max_turns must be >= 1",
            Some("max_turns=0".to_string()),
        ));
    }
    validate_pair(&request.profile_a, &request.profile_b).map_err(HttpApiError::invalid_profile)?;

    let batch_id = request
        .batch_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| RelationalMonteCarloRunner::default_batch_id(&request));
    request.batch_id = Some(batch_id.clone());

    let cancel = CancelHandle::new();
    let counters = Arc::new(ProgressCounters::new(request.n));
    let report = {
        let mut inner = state.inner.lock().await;
        let running = inner
            .batches
            .get(&batch_id)
            .is_some_and(|entry| entry.state == BatchState::Running);
        if running {
            return Err(HttpApiError::state_conflict("batch is already running", &batch_id));
        }

        let entry = BatchEntry::running(request.base_seed, cancel.clone(), Arc::clone(&counters));
        let report = entry.report(&batch_id);
        inner.batches.insert(batch_id.clone(), entry);
        report
    };

    info!(batch_id = %batch_id, n = request.n, base_seed = request.base_seed, "server.batch_accepted");
    broadcast_messages(&state, vec![StreamMessage::status(&report)]);
    tokio::spawn(execute_batch(state.clone(), request, cancel, counters));

    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// Timelines in flight finish their current turn; the batch then reports what completed.
async fn cancel_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchStatusReport>, HttpApiError> {
    let inner = state.inner.lock().await;
    let Some(entry) = inner.batches.get(&batch_id) else {
        return match inner.engine.load_summary(&batch_id) {
            Ok(Some(_)) => Err(HttpApiError::state_conflict("batch already finished", &batch_id)),
            Ok(None) => Err(HttpApiError::batch_not_found(&batch_id)),
            Err(err) => Err(HttpApiError::from_persistence(err)),
        };
    };

    if entry.state != BatchState::Running {
        return Err(HttpApiError::state_conflict("batch already finished", &batch_id));
    }

    entry.cancel.cancel();
    info!(batch_id = %batch_id, "server.batch_cancel_requested");
    Ok(Json(entry.report(&batch_id)))
}

#[derive(Debug, Serialize)]
struct DeleteBatchResponse {
    schema_version: String,
    batch_id: String,
    deleted: bool,
}

async fn delete_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DeleteBatchResponse>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    if inner
        .batches
        .get(&batch_id)
        .is_some_and(|entry| entry.state == BatchState::Running)
    {
        return Err(HttpApiError::state_conflict(
            "cancel the batch before deleting it",
            &batch_id,
        ));
    }

    let in_memory = inner.batches.remove(&batch_id).is_some();
    let stored = inner
        .engine
        .delete_batch(&batch_id)
        .map_err(HttpApiError::from_persistence)?;
    if !in_memory && !stored {
        return Err(HttpApiError::batch_not_found(&batch_id));
    }

    Ok(Json(DeleteBatchResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        batch_id,
        deleted: true,
    }))
}
