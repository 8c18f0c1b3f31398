use std::fmt;
use std::path::Path;

use contracts::{
    BatchAnalysis, BatchStatus, SimulationResult, Timeline, SCHEMA_VERSION_V1,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBatchSummary {
    pub batch_id: String,
    #[serde(with = "contracts::serde_u64_string")]
    pub base_seed: u64,
    pub status: BatchStatus,
    pub n_requested: usize,
    pub n_simulations: usize,
    pub homeostasis_rate: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum PersistenceError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    NotAttached,
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::NotAttached => write!(f, "sqlite store is not attached"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

#[derive(Debug)]
pub struct SqliteRunStore {
    conn: Connection,
}

impl SqliteRunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.conn.pragma_update(None, "foreign_keys", "ON")?;
        store.migrate()?;
        Ok(store)
    }

    /// Replace the stored record of a finished batch, timelines included.
    pub fn save_result(
        &mut self,
        result: &SimulationResult,
        analysis: Option<&BatchAnalysis>,
    ) -> Result<(), PersistenceError> {
        let result_json = serde_json::to_string(result)?;
        let analysis_json = analysis.map(serde_json::to_string).transpose()?;

        let tx = self.conn.transaction()?;
        upsert_batch(
            &tx,
            &BatchRow {
                batch_id: &result.batch_id,
                base_seed: result.base_seed,
                status: result.status,
                n_requested: result.n_requested,
                n_simulations: result.n_simulations,
                homeostasis_rate: Some(result.homeostasis_rate),
                error: None,
                result_json: Some(result_json),
                analysis_json,
            },
        )?;

        tx.execute(
            "DELETE FROM timelines WHERE batch_id = ?1",
            params![result.batch_id.as_str()],
        )?;
        for timeline in &result.timelines {
            let payload_json = serde_json::to_string(timeline)?;
            tx.execute(
                "INSERT OR IGNORE INTO timelines (
                    batch_id,
                    timeline_index,
                    timeline_id,
                    seed,
                    crisis_axis,
                    crisis_severity,
                    reached_homeostasis,
                    collapsed_at_turn,
                    payload_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    result.batch_id.as_str(),
                    i64::try_from(timeline.index).unwrap_or(i64::MAX),
                    timeline.timeline_id.as_str(),
                    timeline.seed.to_string(),
                    timeline.crisis_axis.as_str(),
                    timeline.crisis_severity,
                    if timeline.reached_homeostasis { 1_i64 } else { 0_i64 },
                    timeline.collapsed_at_turn.map(i64::from),
                    payload_json,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Record a batch that produced no result.
    pub fn save_failure(
        &mut self,
        batch_id: &str,
        base_seed: u64,
        n_requested: usize,
        message: &str,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        upsert_batch(
            &tx,
            &BatchRow {
                batch_id,
                base_seed,
                status: BatchStatus::Failed,
                n_requested,
                n_simulations: 0,
                homeostasis_rate: None,
                error: Some(message),
                result_json: None,
                analysis_json: None,
            },
        )?;
        tx.execute(
            "DELETE FROM timelines WHERE batch_id = ?1",
            params![batch_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn batch_exists(&self, batch_id: &str) -> Result<bool, PersistenceError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM batches WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Most recently stored batches first.
    pub fn list_batches(&self, limit: usize) -> Result<Vec<PersistedBatchSummary>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SUMMARY_COLUMNS} FROM batches ORDER BY updated_seq DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(
            params![i64::try_from(limit).unwrap_or(i64::MAX)],
            SummaryRow::read,
        )?;

        let mut batches = Vec::new();
        for row in rows {
            batches.push(row?.into_summary()?);
        }

        Ok(batches)
    }

    pub fn load_summary(&self, batch_id: &str) -> Result<Option<PersistedBatchSummary>, PersistenceError> {
        let row = self
            .conn
            .query_row(
                &format!("{SUMMARY_COLUMNS} FROM batches WHERE batch_id = ?1"),
                params![batch_id],
                SummaryRow::read,
            )
            .optional()?;

        row.map(SummaryRow::into_summary).transpose()
    }

    pub fn load_result(&self, batch_id: &str) -> Result<Option<SimulationResult>, PersistenceError> {
        let payload: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT result_json FROM batches WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str::<SimulationResult>(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn load_analysis(&self, batch_id: &str) -> Result<Option<BatchAnalysis>, PersistenceError> {
        let payload: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT analysis_json FROM batches WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str::<BatchAnalysis>(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn load_timeline(&self, batch_id: &str, index: usize) -> Result<Option<Timeline>, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM timelines WHERE batch_id = ?1 AND timeline_index = ?2",
                params![batch_id, i64::try_from(index).unwrap_or(i64::MAX)],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<Timeline>(&raw)?)),
            None => Ok(None),
        }
    }

    /// Returns whether a batch was removed. Timelines go with it.
    pub fn delete_batch(&mut self, batch_id: &str) -> Result<bool, PersistenceError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM timelines WHERE batch_id = ?1", params![batch_id])?;
        let removed = tx.execute("DELETE FROM batches WHERE batch_id = ?1", params![batch_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT PRIMARY KEY,
                schema_version TEXT NOT NULL,
                base_seed TEXT NOT NULL,
                status TEXT NOT NULL,
                n_requested INTEGER NOT NULL,
                n_simulations INTEGER NOT NULL,
                homeostasis_rate REAL,
                error TEXT,
                result_json TEXT,
                analysis_json TEXT,
                updated_seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS timelines (
                batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
                timeline_index INTEGER NOT NULL,
                timeline_id TEXT NOT NULL,
                seed TEXT NOT NULL,
                crisis_axis TEXT NOT NULL,
                crisis_severity REAL NOT NULL,
                reached_homeostasis INTEGER NOT NULL,
                collapsed_at_turn INTEGER,
                payload_json TEXT NOT NULL,
                PRIMARY KEY (batch_id, timeline_index)
            );

            CREATE INDEX IF NOT EXISTS idx_batches_updated ON batches(updated_seq);
            CREATE INDEX IF NOT EXISTS idx_timelines_batch_axis ON timelines(batch_id, crisis_axis);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name) VALUES(1, 'initial_v1')",
            [],
        )?;

        Ok(())
    }
}

const SUMMARY_COLUMNS: &str =
    "SELECT batch_id, base_seed, status, n_requested, n_simulations, homeostasis_rate, error";

struct SummaryRow {
    batch_id: String,
    base_seed: String,
    status: String,
    n_requested: i64,
    n_simulations: i64,
    homeostasis_rate: Option<f64>,
    error: Option<String>,
}

impl SummaryRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: row.get(0)?,
            base_seed: row.get(1)?,
            status: row.get(2)?,
            n_requested: row.get(3)?,
            n_simulations: row.get(4)?,
            homeostasis_rate: row.get(5)?,
            error: row.get(6)?,
        })
    }

    fn into_summary(self) -> Result<PersistedBatchSummary, PersistenceError> {
        Ok(PersistedBatchSummary {
            batch_id: self.batch_id,
            base_seed: self.base_seed.parse::<u64>().unwrap_or_default(),
            status: parse_status(&self.status)?,
            n_requested: usize::try_from(self.n_requested).unwrap_or_default(),
            n_simulations: usize::try_from(self.n_simulations).unwrap_or_default(),
            homeostasis_rate: self.homeostasis_rate,
            error: self.error,
        })
    }
}

struct BatchRow<'a> {
    batch_id: &'a str,
    base_seed: u64,
    status: BatchStatus,
    n_requested: usize,
    n_simulations: usize,
    homeostasis_rate: Option<f64>,
    error: Option<&'a str>,
    result_json: Option<String>,
    analysis_json: Option<String>,
}

fn upsert_batch(tx: &rusqlite::Transaction<'_>, row: &BatchRow<'_>) -> Result<(), PersistenceError> {
    // Logical write order; list_batches sorts on it instead of wall-clock time.
    let next_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(updated_seq), 0) + 1 FROM batches",
        [],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO batches (
            batch_id,
            schema_version,
            base_seed,
            status,
            n_requested,
            n_simulations,
            homeostasis_rate,
            error,
            result_json,
            analysis_json,
            updated_seq
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(batch_id) DO UPDATE SET
            schema_version = excluded.schema_version,
            base_seed = excluded.base_seed,
            status = excluded.status,
            n_requested = excluded.n_requested,
            n_simulations = excluded.n_simulations,
            homeostasis_rate = excluded.homeostasis_rate,
            error = excluded.error,
            result_json = excluded.result_json,
            analysis_json = excluded.analysis_json,
            updated_seq = excluded.updated_seq",
        params![
            row.batch_id,
            SCHEMA_VERSION_V1,
            row.base_seed.to_string(),
            row.status.to_string(),
            i64::try_from(row.n_requested).unwrap_or(i64::MAX),
            i64::try_from(row.n_simulations).unwrap_or(i64::MAX),
            row.homeostasis_rate,
            row.error,
            row.result_json.as_deref(),
            row.analysis_json.as_deref(),
            next_seq,
        ],
    )?;

    Ok(())
}

fn parse_status(raw: &str) -> Result<BatchStatus, PersistenceError> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}
