//! SQLite job store shared by workers on one host or a shared filesystem

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio_rusqlite::Connection as AsyncConnection;
use tracing::info;
use uuid::Uuid;

use super::{orphan_cutoff, JobStore, StoreHealth, SCHEMA_VERSION};
use crate::config::SearchConfig;
use crate::engine_state::SwarmEngineState;
use crate::error::{SearchError, SearchResult};
use crate::types::{
    CompletionReason, Job, JobCompletionReason, JobId, JobResults, JobStatus, Model, ModelId, ModelParams,
    ModelStatus, WorkerId,
};

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str =
    "id, config, status, completion_reason, completion_message, engine_state, engine_version, results, created_at";

const MODEL_COLUMNS: &str = "id, job_id, params, status, completion_reason, result, progress_score, error_message, \
     records_processed, last_update_ms, owner, restarts, created_at";

/// SQLite implementation of [`JobStore`]
pub struct SqliteJobStore {
    connection: Arc<AsyncConnection>,
}

impl SqliteJobStore {
    /// Open (or create) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SearchResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SearchError::storage(format!("Failed to create database directory: {}", e)))?;
        }
        let connection = AsyncConnection::open(db_path)
            .await
            .map_err(|e| SearchError::storage(format!("Failed to open SQLite database: {}", e)))?;
        Self::configure(connection).await
    }

    /// Private in-memory database, mostly for tests
    pub async fn open_in_memory() -> SearchResult<Self> {
        let connection = AsyncConnection::open_in_memory()
            .await
            .map_err(|e| SearchError::storage(format!("Failed to open SQLite database: {}", e)))?;
        Self::configure(connection).await
    }

    async fn configure(connection: AsyncConnection) -> SearchResult<Self> {
        connection
            .call(|conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
                conn.pragma_update(None, "foreign_keys", true)?;
                Ok(())
            })
            .await?;
        Ok(Self {
            connection: Arc::new(connection),
        })
    }

    async fn init_schema(&self) -> SearchResult<()> {
        self.connection
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS schema_info (
                        version INTEGER PRIMARY KEY,
                        created_at TEXT NOT NULL,
                        description TEXT
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS jobs (
                        id TEXT PRIMARY KEY,
                        config TEXT NOT NULL,
                        status TEXT NOT NULL,
                        completion_reason TEXT,
                        completion_message TEXT,
                        engine_state TEXT NOT NULL,
                        engine_version INTEGER NOT NULL DEFAULT 0,
                        results TEXT,
                        created_at TEXT NOT NULL
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS models (
                        id TEXT PRIMARY KEY,
                        job_id TEXT NOT NULL,
                        slot_key TEXT NOT NULL,
                        params TEXT NOT NULL,
                        status TEXT NOT NULL,
                        completion_reason TEXT,
                        result REAL,
                        progress_score REAL,
                        error_message TEXT,
                        records_processed INTEGER NOT NULL DEFAULT 0,
                        last_update_ms INTEGER NOT NULL,
                        owner TEXT NOT NULL,
                        restarts INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL,
                        FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_models_slot ON models(job_id, slot_key)",
                    [],
                )?;
                conn.execute(
                    "CREATE INDEX IF NOT EXISTS idx_models_job_status ON models(job_id, status)",
                    [],
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO schema_info (version, created_at, description)
                     VALUES (?1, ?2, ?3)",
                    params![SCHEMA_VERSION, Utc::now().to_rfc3339(), "Jobs and models with slot uniqueness"],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| SearchError::storage(format!("Failed to initialize schema: {}", e)))
    }

    async fn job_exists(&self, job_id: JobId) -> SearchResult<bool> {
        let id = job_id.to_string();
        let found = self
            .connection
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
                    .optional()?
                    .is_some())
            })
            .await?;
        Ok(found)
    }
}

/// Columns of a `jobs` row before decoding
struct JobRow {
    id: String,
    config: String,
    status: String,
    completion_reason: Option<String>,
    completion_message: Option<String>,
    engine_state: String,
    engine_version: i64,
    results: Option<String>,
    created_at: String,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            config: row.get(1)?,
            status: row.get(2)?,
            completion_reason: row.get(3)?,
            completion_message: row.get(4)?,
            engine_state: row.get(5)?,
            engine_version: row.get(6)?,
            results: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> SearchResult<Job> {
        let mut engine_state: SwarmEngineState = serde_json::from_str(&self.engine_state)?;
        engine_state.version = self.engine_version as u64;
        Ok(Job {
            id: parse_uuid(&self.id)?,
            config: serde_json::from_str(&self.config)?,
            status: decode_enum(&self.status)?,
            completion_reason: self.completion_reason.as_deref().map(decode_enum).transpose()?,
            completion_message: self.completion_message,
            engine_state,
            results: self.results.as_deref().map(serde_json::from_str).transpose()?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Columns of a `models` row before decoding
struct ModelRow {
    id: String,
    job_id: String,
    params: String,
    status: String,
    completion_reason: Option<String>,
    result: Option<f64>,
    progress_score: Option<f64>,
    error_message: Option<String>,
    records_processed: i64,
    last_update_ms: i64,
    owner: String,
    restarts: i64,
    created_at: String,
}

impl ModelRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            params: row.get(2)?,
            status: row.get(3)?,
            completion_reason: row.get(4)?,
            result: row.get(5)?,
            progress_score: row.get(6)?,
            error_message: row.get(7)?,
            records_processed: row.get(8)?,
            last_update_ms: row.get(9)?,
            owner: row.get(10)?,
            restarts: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn decode(self) -> SearchResult<Model> {
        Ok(Model {
            id: parse_uuid(&self.id)?,
            job_id: parse_uuid(&self.job_id)?,
            params: serde_json::from_str(&self.params)?,
            status: decode_enum(&self.status)?,
            completion_reason: self.completion_reason.as_deref().map(decode_enum).transpose()?,
            result: self.result,
            progress_score: self.progress_score,
            error_message: self.error_message,
            records_processed: self.records_processed.max(0) as u64,
            last_update: DateTime::<Utc>::from_timestamp_millis(self.last_update_ms)
                .ok_or_else(|| SearchError::storage(format!("bad timestamp {}", self.last_update_ms)))?,
            owner: parse_uuid(&self.owner)?,
            restarts: self.restarts.max(0) as u32,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> SearchResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| SearchError::storage(format!("bad id '{}': {}", s, e)))
}

fn parse_time(s: &str) -> SearchResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SearchError::storage(format!("bad timestamp '{}': {}", s, e)))
}

/// Unit enums are stored as their bare serde name
fn encode_enum<T: serde::Serialize>(value: &T) -> SearchResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(SearchError::storage(format!("expected a unit variant, got {}", other))),
    }
}

fn decode_enum<T: serde::de::DeserializeOwned>(s: &str) -> SearchResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(s.to_string()))?)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn initialize(&self) -> SearchResult<()> {
        self.init_schema().await?;
        info!("Initialized SQLite job store");
        Ok(())
    }

    async fn insert_job(&self, config: SearchConfig) -> SearchResult<JobId> {
        config.validate()?;
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let config_json = serde_json::to_string(&config)?;
        let state_json = serde_json::to_string(&SwarmEngineState::default())?;
        let status = encode_enum(&JobStatus::Running)?;
        let created_at = Utc::now().to_rfc3339();

        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (id, config, status, engine_state, engine_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                    params![id_str, config_json, status, state_json, created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    async fn get_job(&self, job_id: JobId) -> SearchResult<Job> {
        let id = job_id.to_string();
        let row = self
            .connection
            .call(move |conn| {
                let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
                Ok(conn.query_row(&sql, params![id], JobRow::read).optional()?)
            })
            .await?;
        row.ok_or(SearchError::JobNotFound(job_id))?.decode()
    }

    async fn update_job_results(&self, job_id: JobId, results: &JobResults) -> SearchResult<()> {
        let id = job_id.to_string();
        let results_json = serde_json::to_string(results)?;
        let updated = self
            .connection
            .call(move |conn| Ok(conn.execute("UPDATE jobs SET results = ?1 WHERE id = ?2", params![results_json, id])?))
            .await?;
        if updated == 0 {
            return Err(SearchError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn update_job_engine_state(
        &self,
        job_id: JobId,
        expected_version: u64,
        state: &SwarmEngineState,
    ) -> SearchResult<bool> {
        let id = job_id.to_string();
        let mut next = state.clone();
        next.version = expected_version + 1;
        let state_json = serde_json::to_string(&next)?;
        let expected = expected_version as i64;

        let updated = self
            .connection
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE jobs SET engine_state = ?1, engine_version = engine_version + 1
                     WHERE id = ?2 AND engine_version = ?3",
                    params![state_json, id, expected],
                )?)
            })
            .await?;
        if updated == 0 && !self.job_exists(job_id).await? {
            return Err(SearchError::JobNotFound(job_id));
        }
        Ok(updated == 1)
    }

    async fn mark_job_complete(
        &self,
        job_id: JobId,
        reason: JobCompletionReason,
        message: Option<String>,
    ) -> SearchResult<bool> {
        let id = job_id.to_string();
        let completed = encode_enum(&JobStatus::Completed)?;
        let running = encode_enum(&JobStatus::Running)?;
        let reason = encode_enum(&reason)?;

        let updated = self
            .connection
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE jobs SET status = ?1, completion_reason = ?2, completion_message = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![completed, reason, message, id, running],
                )?)
            })
            .await?;
        if updated == 0 && !self.job_exists(job_id).await? {
            return Err(SearchError::JobNotFound(job_id));
        }
        Ok(updated == 1)
    }

    async fn insert_model(&self, job_id: JobId, params: ModelParams, owner: WorkerId) -> SearchResult<Option<ModelId>> {
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let job_str = job_id.to_string();
        let slot_key = params.slot_key();
        let params_json = serde_json::to_string(&params)?;
        let status = encode_enum(&ModelStatus::Running)?;
        let job_running = encode_enum(&JobStatus::Running)?;
        let owner = owner.to_string();
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let created_at = now.to_rfc3339();

        let outcome = self
            .connection
            .call(move |conn| {
                // take the write lock up front so the status check and insert
                // wait on busy_timeout instead of failing the lock upgrade
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let job_status: Option<String> = tx
                    .query_row("SELECT status FROM jobs WHERE id = ?1", params![job_str], |row| row.get(0))
                    .optional()?;
                match job_status {
                    None => return Ok(None),
                    Some(s) if s != job_running => return Ok(Some(false)),
                    Some(_) => {}
                }
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO models
                     (id, job_id, slot_key, params, status, records_processed, last_update_ms, owner, restarts, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, 0, ?8)",
                    params![id_str, job_str, slot_key, params_json, status, now_ms, owner, created_at],
                )?;
                tx.commit()?;
                Ok(Some(inserted == 1))
            })
            .await?;

        match outcome {
            None => Err(SearchError::JobNotFound(job_id)),
            Some(true) => Ok(Some(id)),
            Some(false) => Ok(None),
        }
    }

    async fn get_model(&self, model_id: ModelId) -> SearchResult<Model> {
        let id = model_id.to_string();
        let row = self
            .connection
            .call(move |conn| {
                let sql = format!("SELECT {} FROM models WHERE id = ?1", MODEL_COLUMNS);
                Ok(conn.query_row(&sql, params![id], ModelRow::read).optional()?)
            })
            .await?;
        row.ok_or(SearchError::ModelNotFound(model_id))?.decode()
    }

    async fn update_model_progress(
        &self,
        model_id: ModelId,
        owner: WorkerId,
        records_processed: u64,
        timestamp: DateTime<Utc>,
        progress_score: Option<f64>,
    ) -> SearchResult<bool> {
        let id = model_id.to_string();
        let owner = owner.to_string();
        let running = encode_enum(&ModelStatus::Running)?;
        let records = records_processed as i64;
        let ts = timestamp.timestamp_millis();

        let updated = self
            .connection
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE models
                     SET records_processed = ?1, last_update_ms = ?2,
                         progress_score = COALESCE(?3, progress_score)
                     WHERE id = ?4 AND owner = ?5 AND status = ?6",
                    params![records, ts, progress_score, id, owner, running],
                )?)
            })
            .await?;
        Ok(updated == 1)
    }

    async fn complete_model(
        &self,
        model_id: ModelId,
        owner: WorkerId,
        reason: CompletionReason,
        result: Option<f64>,
        error_message: Option<String>,
    ) -> SearchResult<bool> {
        let id = model_id.to_string();
        let owner = owner.to_string();
        let running = encode_enum(&ModelStatus::Running)?;
        let completed = encode_enum(&ModelStatus::Completed)?;
        let reason = reason.as_str();
        let now_ms = Utc::now().timestamp_millis();

        let updated = self
            .connection
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE models
                     SET status = ?1, completion_reason = ?2, result = ?3, error_message = ?4, last_update_ms = ?5
                     WHERE id = ?6 AND owner = ?7 AND status = ?8",
                    params![completed, reason, result, error_message, now_ms, id, owner, running],
                )?)
            })
            .await?;
        Ok(updated == 1)
    }

    async fn list_models(&self, job_id: JobId) -> SearchResult<Vec<Model>> {
        let id = job_id.to_string();
        let rows = self
            .connection
            .call(move |conn| {
                let sql = format!("SELECT {} FROM models WHERE job_id = ?1 ORDER BY rowid", MODEL_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![id], ModelRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(ModelRow::decode).collect()
    }

    async fn claim_orphan(&self, model_id: ModelId, new_owner: WorkerId, orphan_interval: Duration) -> SearchResult<bool> {
        let id = model_id.to_string();
        let owner = new_owner.to_string();
        let running = encode_enum(&ModelStatus::Running)?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let cutoff_ms = orphan_cutoff(now, orphan_interval).timestamp_millis();

        let updated = self
            .connection
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE models
                     SET owner = ?1, last_update_ms = ?2, records_processed = 0,
                         progress_score = NULL, restarts = restarts + 1
                     WHERE id = ?3 AND status = ?4 AND owner != ?1 AND last_update_ms < ?5",
                    params![owner, now_ms, id, running, cutoff_ms],
                )?)
            })
            .await?;
        Ok(updated == 1)
    }

    async fn health_check(&self) -> SearchResult<StoreHealth> {
        let counts = self
            .connection
            .call(|conn| {
                let jobs: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
                let models: i64 = conn.query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
                Ok((jobs as usize, models as usize))
            })
            .await;

        Ok(match counts {
            Ok((total_jobs, total_models)) => StoreHealth {
                is_healthy: true,
                error_message: None,
                total_jobs,
                total_models,
            },
            Err(e) => StoreHealth {
                is_healthy: false,
                error_message: Some(e.to_string()),
                total_jobs: 0,
                total_models: 0,
            },
        })
    }
}
