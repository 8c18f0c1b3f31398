fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET,POST,DELETE,OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("3600"),
    );
}

fn default_sqlite_path() -> String {
    std::env::var("RELATIONAL_SQLITE_PATH")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string())
}

/// Status of a batch this process is tracking, else of one found in the store.
fn status_report(inner: &ServerInner, batch_id: &str) -> Result<BatchStatusReport, HttpApiError> {
    if let Some(entry) = inner.batches.get(batch_id) {
        return Ok(entry.report(batch_id));
    }

    let summary = inner
        .engine
        .load_summary(batch_id)
        .map_err(HttpApiError::from_persistence)?
        .ok_or_else(|| HttpApiError::batch_not_found(batch_id))?;

    Ok(stored_report(summary))
}

fn stored_report(summary: PersistedBatchSummary) -> BatchStatusReport {
    let excluded = summary.n_requested.saturating_sub(summary.n_simulations);
    BatchStatusReport {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        progress: ProgressEvent::new(
            summary.batch_id.as_str(),
            summary.n_requested,
            excluded,
            summary.n_requested,
        ),
        batch_id: summary.batch_id,
        base_seed: summary.base_seed,
        state: BatchState::Finished,
        status: Some(summary.status),
        error: summary.error,
    }
}

/// Where a finished batch's payload lives.
enum FinishedBatch {
    Live(Arc<BatchOutcome>),
    Stored,
}

fn lookup_finished(inner: &ServerInner, batch_id: &str) -> Result<FinishedBatch, HttpApiError> {
    if let Some(entry) = inner.batches.get(batch_id) {
        if entry.state == BatchState::Running {
            return Err(HttpApiError::state_conflict("batch is still running", batch_id));
        }
        if entry.status == Some(BatchStatus::Failed) {
            return Err(HttpApiError::batch_failed(batch_id, entry.error.clone()));
        }
        if let Some(outcome) = entry.outcome.as_ref() {
            return Ok(FinishedBatch::Live(Arc::clone(outcome)));
        }
        return Ok(FinishedBatch::Stored);
    }

    let summary = inner
        .engine
        .load_summary(batch_id)
        .map_err(HttpApiError::from_persistence)?
        .ok_or_else(|| HttpApiError::batch_not_found(batch_id))?;
    if summary.status == BatchStatus::Failed {
        return Err(HttpApiError::batch_failed(batch_id, summary.error));
    }

    Ok(FinishedBatch::Stored)
}
