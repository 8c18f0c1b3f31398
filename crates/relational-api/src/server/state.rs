#[derive(Clone)]
struct AppState {
    inner: Arc<Mutex<ServerInner>>,
    runner: Arc<RelationalMonteCarloRunner>,
    analyzer: Arc<BatchAnalyzer>,
    stream_tx: broadcast::Sender<StreamMessage>,
}

impl AppState {
    fn new(engine: EngineApi) -> Self {
        let (stream_tx, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);
        Self {
            runner: engine.runner(),
            analyzer: engine.analyzer(),
            inner: Arc::new(Mutex::new(ServerInner {
                engine,
                batches: HashMap::new(),
            })),
            stream_tx,
        }
    }
}

struct ServerInner {
    engine: EngineApi,
    batches: HashMap<String, BatchEntry>,
}

/// Batch started by this server process.
struct BatchEntry {
    base_seed: u64,
    cancel: CancelHandle,
    progress: Arc<ProgressCounters>,
    state: BatchState,
    status: Option<BatchStatus>,
    error: Option<String>,
    /// Held only while the store cannot serve this batch.
    outcome: Option<Arc<BatchOutcome>>,
}

impl BatchEntry {
    fn running(base_seed: u64, cancel: CancelHandle, progress: Arc<ProgressCounters>) -> Self {
        Self {
            base_seed,
            cancel,
            progress,
            state: BatchState::Running,
            status: None,
            error: None,
            outcome: None,
        }
    }

    fn report(&self, batch_id: &str) -> BatchStatusReport {
        BatchStatusReport {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            batch_id: batch_id.to_string(),
            base_seed: self.base_seed,
            state: self.state,
            status: self.status,
            progress: self.progress.snapshot(batch_id),
            error: self.error.clone(),
        }
    }
}

/// Latest progress of one batch, written from the runner's sink.
#[derive(Debug)]
struct ProgressCounters {
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl ProgressCounters {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn record(&self, event: &ProgressEvent) {
        self.completed.fetch_max(event.completed, Ordering::Relaxed);
        self.failed.fetch_max(event.failed, Ordering::Relaxed);
    }

    fn snapshot(&self, batch_id: &str) -> ProgressEvent {
        ProgressEvent::new(
            batch_id,
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.total,
        )
    }
}

/// Progress sink that updates the batch counters and fans out to stream clients.
struct StreamingProgress {
    counters: Arc<ProgressCounters>,
    stream_tx: broadcast::Sender<StreamMessage>,
}

impl ProgressSink for StreamingProgress {
    fn emit(&self, event: ProgressEvent) {
        self.counters.record(&event);
        let _ = self.stream_tx.send(StreamMessage::progress(&event));
    }
}

/// Run a batch to completion and publish its terminal state.
async fn execute_batch(
    state: AppState,
    request: BatchRequest,
    cancel: CancelHandle,
    counters: Arc<ProgressCounters>,
) {
    let batch_id = request.batch_id.clone().unwrap_or_default();
    let (base_seed, n) = (request.base_seed, request.n);
    let sink = StreamingProgress {
        counters,
        stream_tx: state.stream_tx.clone(),
    };

    let outcome = match state.runner.run(request, &sink, cancel).await {
        Ok(result) => {
            let analyzer = Arc::clone(&state.analyzer);
            tokio::task::spawn_blocking(move || {
                let analysis = analyzer.analyze(&result);
                BatchOutcome { result, analysis }
            })
            .await
            .map_err(|err| format!("analysis task failed: {err}"))
        }
        Err(error) => Err(error.to_string()),
    };

    let messages = {
        let mut inner = state.inner.lock().await;
        let persisted = match &outcome {
            Ok(outcome) => inner.engine.record_outcome_if_enabled(outcome),
            Err(message) => {
                inner
                    .engine
                    .record_failure_if_enabled(&batch_id, base_seed, n, message);
                false
            }
        };
        let persistence_warning = inner.engine.last_persistence_error().map(str::to_string);

        let Some(entry) = inner.batches.get_mut(&batch_id) else {
            return;
        };
        entry.state = BatchState::Finished;
        match outcome {
            Ok(outcome) => {
                info!(batch_id = %batch_id, status = %outcome.result.status, "server.batch_finished");
                entry.status = Some(outcome.result.status);
                if !persisted {
                    entry.outcome = Some(Arc::new(outcome));
                }
            }
            Err(message) => {
                warn!(batch_id = %batch_id, error = %message, "server.batch_failed");
                entry.status = Some(BatchStatus::Failed);
                entry.error = Some(message);
            }
        }

        let mut messages = Vec::new();
        if let Some(warning) = persistence_warning {
            messages.push(StreamMessage::warning(&batch_id, warning));
        }
        messages.push(StreamMessage::finished(&entry.report(&batch_id)));
        messages
    };

    broadcast_messages(&state, messages);
}

fn broadcast_messages(state: &AppState, messages: Vec<StreamMessage>) {
    for message in messages {
        let _ = state.stream_tx.send(message);
    }
}
