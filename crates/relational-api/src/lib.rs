//! In-process batch facade with SQLite persistence and the HTTP surface.

mod persistence;
mod server;

use std::path::Path;
use std::sync::Arc;

use contracts::{
    BatchAnalysis, BatchRequest, EngineConfig, SimulationResult, Timeline,
};
use relational_core::{
    BatchAnalyzer, BatchError, CancelHandle, DialogueBackend, ProgressSink,
    RelationalMonteCarloRunner, ScriptedBackend,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use persistence::SqliteRunStore;
pub use persistence::{PersistedBatchSummary, PersistenceError};
pub use server::{serve, ServerError};

/// A finished batch together with its post-hoc analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub result: SimulationResult,
    pub analysis: BatchAnalysis,
}

#[derive(Debug)]
struct PersistenceState {
    store: SqliteRunStore,
    persisted_batch_count: usize,
}

pub struct EngineApi {
    runner: Arc<RelationalMonteCarloRunner>,
    analyzer: Arc<BatchAnalyzer>,
    persistence: Option<PersistenceState>,
    last_persistence_error: Option<String>,
}

impl EngineApi {
    /// Engine backed by the built-in scripted dialogue backend.
    pub fn from_config(config: EngineConfig) -> Result<Self, BatchError> {
        Self::with_backend(config, Arc::new(ScriptedBackend))
    }

    pub fn with_backend(
        config: EngineConfig,
        backend: Arc<dyn DialogueBackend>,
    ) -> Result<Self, BatchError> {
        let analyzer = BatchAnalyzer::new(&config);
        let runner = RelationalMonteCarloRunner::new(config, backend)?;
        Ok(Self {
            runner: Arc::new(runner),
            analyzer: Arc::new(analyzer),
            persistence: None,
            last_persistence_error: None,
        })
    }

    pub fn attach_sqlite_store(&mut self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let store = SqliteRunStore::open(path)?;
        self.attach(store);
        Ok(())
    }

    pub fn attach_in_memory_store(&mut self) -> Result<(), PersistenceError> {
        let store = SqliteRunStore::open_in_memory()?;
        self.attach(store);
        Ok(())
    }

    fn attach(&mut self, store: SqliteRunStore) {
        self.persistence = Some(PersistenceState {
            store,
            persisted_batch_count: 0,
        });
    }

    pub fn config(&self) -> &EngineConfig {
        self.runner.config()
    }

    /// Shared handle for running batches outside this facade's borrow.
    pub fn runner(&self) -> Arc<RelationalMonteCarloRunner> {
        Arc::clone(&self.runner)
    }

    pub fn analyzer(&self) -> Arc<BatchAnalyzer> {
        Arc::clone(&self.analyzer)
    }

    /// Run one batch, analyze it and persist the outcome when a store is attached.
    ///
    /// A failed batch is recorded in the store before the error is returned.
    /// Persistence failures never fail the batch; they surface through
    /// [`EngineApi::last_persistence_error`].
    pub async fn simulate(
        &mut self,
        mut request: BatchRequest,
        progress: &dyn ProgressSink,
        cancel: CancelHandle,
    ) -> Result<BatchOutcome, BatchError> {
        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| RelationalMonteCarloRunner::default_batch_id(&request));
        request.batch_id = Some(batch_id.clone());
        let (base_seed, n) = (request.base_seed, request.n);

        match self.runner.run(request, progress, cancel).await {
            Ok(result) => {
                let outcome = BatchOutcome {
                    analysis: self.analyzer.analyze(&result),
                    result,
                };
                self.record_outcome_if_enabled(&outcome);
                Ok(outcome)
            }
            Err(error) => {
                self.record_failure_if_enabled(&batch_id, base_seed, n, &error.to_string());
                Err(error)
            }
        }
    }

    pub fn record_outcome(&mut self, outcome: &BatchOutcome) -> Result<(), PersistenceError> {
        let Some(state) = self.persistence.as_mut() else {
            return Err(PersistenceError::NotAttached);
        };

        state
            .store
            .save_result(&outcome.result, Some(&outcome.analysis))?;
        state.persisted_batch_count += 1;
        self.last_persistence_error = None;
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        batch_id: &str,
        base_seed: u64,
        n_requested: usize,
        message: &str,
    ) -> Result<(), PersistenceError> {
        let Some(state) = self.persistence.as_mut() else {
            return Err(PersistenceError::NotAttached);
        };

        state
            .store
            .save_failure(batch_id, base_seed, n_requested, message)?;
        state.persisted_batch_count += 1;
        self.last_persistence_error = None;
        Ok(())
    }

    pub fn list_batches(&self, limit: usize) -> Result<Vec<PersistedBatchSummary>, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };

        state.store.list_batches(limit)
    }

    pub fn load_summary(&self, batch_id: &str) -> Result<Option<PersistedBatchSummary>, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };

        state.store.load_summary(batch_id)
    }

    pub fn load_result(&self, batch_id: &str) -> Result<Option<SimulationResult>, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };

        state.store.load_result(batch_id)
    }

    pub fn load_analysis(&self, batch_id: &str) -> Result<Option<BatchAnalysis>, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };

        state.store.load_analysis(batch_id)
    }

    pub fn load_timeline(&self, batch_id: &str, index: usize) -> Result<Option<Timeline>, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };

        state.store.load_timeline(batch_id, index)
    }

    pub fn delete_batch(&mut self, batch_id: &str) -> Result<bool, PersistenceError> {
        let Some(state) = self.persistence.as_mut() else {
            return Err(PersistenceError::NotAttached);
        };

        state.store.delete_batch(batch_id)
    }

    /// Batches written through this facade since the store was attached.
    pub fn persisted_batch_count(&self) -> usize {
        self.persistence
            .as_ref()
            .map_or(0, |state| state.persisted_batch_count)
    }

    pub fn last_persistence_error(&self) -> Option<&str> {
        self.last_persistence_error.as_deref()
    }

    /// Returns whether the outcome is now readable back from the store.
    pub(crate) fn record_outcome_if_enabled(&mut self, outcome: &BatchOutcome) -> bool {
        if self.persistence.is_none() {
            return false;
        }

        match self.record_outcome(outcome) {
            Ok(()) => true,
            Err(err) => {
                warn!(batch_id = %outcome.result.batch_id, error = %err, "persistence.save_failed");
                self.last_persistence_error = Some(err.to_string());
                false
            }
        }
    }

    pub(crate) fn record_failure_if_enabled(
        &mut self,
        batch_id: &str,
        base_seed: u64,
        n_requested: usize,
        message: &str,
    ) {
        if self.persistence.is_none() {
            return;
        }

        if let Err(err) = self.record_failure(batch_id, base_seed, n_requested, message) {
            warn!(batch_id = %batch_id, error = %err, "persistence.save_failed");
            self.last_persistence_error = Some(err.to_string());
        }
    }
}
