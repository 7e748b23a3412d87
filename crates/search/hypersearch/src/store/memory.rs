//! In-memory job store for tests and single-process runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{orphan_cutoff, JobStore, StoreHealth};
use crate::config::SearchConfig;
use crate::engine_state::SwarmEngineState;
use crate::error::{SearchError, SearchResult};
use crate::types::{
    CompletionReason, Job, JobCompletionReason, JobId, JobResults, JobStatus, Model, ModelId, ModelParams,
    ModelStatus, WorkerId,
};

/// Job store backed by concurrent maps
///
/// Conditional updates hold the entry's shard lock for the whole
/// check-and-write, which gives the same atomicity as the SQLite store.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    models: DashMap<ModelId, Model>,
    slots: Mutex<HashSet<(JobId, String)>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn initialize(&self) -> SearchResult<()> {
        debug!("Initialized in-memory job store");
        Ok(())
    }

    async fn insert_job(&self, config: SearchConfig) -> SearchResult<JobId> {
        config.validate()?;
        let id = Uuid::new_v4();
        self.jobs.insert(
            id,
            Job {
                id,
                config,
                status: JobStatus::Running,
                completion_reason: None,
                completion_message: None,
                engine_state: SwarmEngineState::default(),
                results: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_job(&self, job_id: JobId) -> SearchResult<Job> {
        self.jobs
            .get(&job_id)
            .map(|job| job.clone())
            .ok_or(SearchError::JobNotFound(job_id))
    }

    async fn update_job_results(&self, job_id: JobId, results: &JobResults) -> SearchResult<()> {
        let mut job = self.jobs.get_mut(&job_id).ok_or(SearchError::JobNotFound(job_id))?;
        job.results = Some(results.clone());
        Ok(())
    }

    async fn update_job_engine_state(
        &self,
        job_id: JobId,
        expected_version: u64,
        state: &SwarmEngineState,
    ) -> SearchResult<bool> {
        let mut job = self.jobs.get_mut(&job_id).ok_or(SearchError::JobNotFound(job_id))?;
        if job.engine_state.version != expected_version {
            return Ok(false);
        }
        let mut next = state.clone();
        next.version = expected_version + 1;
        job.engine_state = next;
        Ok(true)
    }

    async fn mark_job_complete(
        &self,
        job_id: JobId,
        reason: JobCompletionReason,
        message: Option<String>,
    ) -> SearchResult<bool> {
        let mut job = self.jobs.get_mut(&job_id).ok_or(SearchError::JobNotFound(job_id))?;
        if job.status == JobStatus::Completed {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completion_reason = Some(reason);
        job.completion_message = message;
        Ok(true)
    }

    async fn insert_model(&self, job_id: JobId, params: ModelParams, owner: WorkerId) -> SearchResult<Option<ModelId>> {
        // the job entry stays read-locked until the model is in, so
        // mark_job_complete cannot slip between the check and the insert
        let job = self.jobs.get(&job_id).ok_or(SearchError::JobNotFound(job_id))?;
        if job.is_completed() {
            return Ok(None);
        }
        let mut slots = self.slots.lock();
        if !slots.insert((job_id, params.slot_key())) {
            return Ok(None);
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.models.insert(
            id,
            Model {
                id,
                job_id,
                params,
                status: ModelStatus::Running,
                completion_reason: None,
                result: None,
                progress_score: None,
                error_message: None,
                records_processed: 0,
                last_update: now,
                owner,
                restarts: 0,
                created_at: now,
            },
        );
        Ok(Some(id))
    }

    async fn get_model(&self, model_id: ModelId) -> SearchResult<Model> {
        self.models
            .get(&model_id)
            .map(|model| model.clone())
            .ok_or(SearchError::ModelNotFound(model_id))
    }

    async fn update_model_progress(
        &self,
        model_id: ModelId,
        owner: WorkerId,
        records_processed: u64,
        timestamp: DateTime<Utc>,
        progress_score: Option<f64>,
    ) -> SearchResult<bool> {
        let Some(mut model) = self.models.get_mut(&model_id) else {
            return Ok(false);
        };
        if !model.is_running() || model.owner != owner {
            return Ok(false);
        }
        model.records_processed = records_processed;
        model.last_update = timestamp;
        if progress_score.is_some() {
            model.progress_score = progress_score;
        }
        Ok(true)
    }

    async fn complete_model(
        &self,
        model_id: ModelId,
        owner: WorkerId,
        reason: CompletionReason,
        result: Option<f64>,
        error_message: Option<String>,
    ) -> SearchResult<bool> {
        let Some(mut model) = self.models.get_mut(&model_id) else {
            return Ok(false);
        };
        if !model.is_running() || model.owner != owner {
            return Ok(false);
        }
        model.status = ModelStatus::Completed;
        model.completion_reason = Some(reason);
        model.result = result;
        model.error_message = error_message;
        model.last_update = Utc::now();
        Ok(true)
    }

    async fn list_models(&self, job_id: JobId) -> SearchResult<Vec<Model>> {
        let mut models: Vec<Model> = self
            .models
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .map(|entry| entry.value().clone())
            .collect();
        models.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(models)
    }

    async fn claim_orphan(&self, model_id: ModelId, new_owner: WorkerId, orphan_interval: Duration) -> SearchResult<bool> {
        let Some(mut model) = self.models.get_mut(&model_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        if !model.is_running() || model.owner == new_owner || model.last_update >= orphan_cutoff(now, orphan_interval) {
            return Ok(false);
        }
        model.owner = new_owner;
        model.last_update = now;
        model.records_processed = 0;
        model.progress_score = None;
        model.restarts += 1;
        Ok(true)
    }

    async fn health_check(&self) -> SearchResult<StoreHealth> {
        Ok(StoreHealth {
            is_healthy: true,
            error_message: None,
            total_jobs: self.jobs.len(),
            total_models: self.models.len(),
        })
    }
}
