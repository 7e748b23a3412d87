//! Job store: the only shared state between workers
//!
//! Every write that can race between workers is conditional and reports
//! whether it landed. Losing such a race is a normal outcome, never an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SearchConfig;
use crate::engine_state::SwarmEngineState;
use crate::error::SearchResult;
use crate::types::{CompletionReason, Job, JobCompletionReason, JobId, JobResults, Model, ModelId, ModelParams, WorkerId};

mod memory;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Current schema version of the SQLite store
pub const SCHEMA_VERSION: i32 = 1;

/// Persistent, concurrently accessed record of jobs and models
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Prepare the backing storage
    async fn initialize(&self) -> SearchResult<()>;

    /// Validate `config` and insert a running job
    async fn insert_job(&self, config: SearchConfig) -> SearchResult<JobId>;

    async fn get_job(&self, job_id: JobId) -> SearchResult<Job>;

    /// Record the final results of a job
    async fn update_job_results(&self, job_id: JobId, results: &JobResults) -> SearchResult<()>;

    /// Replace the engine state if its version is still `expected_version`
    async fn update_job_engine_state(
        &self,
        job_id: JobId,
        expected_version: u64,
        state: &SwarmEngineState,
    ) -> SearchResult<bool>;

    /// Mark a running job completed; false if it already was
    async fn mark_job_complete(
        &self,
        job_id: JobId,
        reason: JobCompletionReason,
        message: Option<String>,
    ) -> SearchResult<bool>;

    /// Insert a running model owned by `owner`; `None` if its slot is already filled or the job is complete
    async fn insert_model(&self, job_id: JobId, params: ModelParams, owner: WorkerId) -> SearchResult<Option<ModelId>>;

    async fn get_model(&self, model_id: ModelId) -> SearchResult<Model>;

    /// Record progress of a running model; false if `owner` no longer owns it
    async fn update_model_progress(
        &self,
        model_id: ModelId,
        owner: WorkerId,
        records_processed: u64,
        timestamp: DateTime<Utc>,
        progress_score: Option<f64>,
    ) -> SearchResult<bool>;

    /// Complete a running model owned by `owner`; false if it lost the race
    async fn complete_model(
        &self,
        model_id: ModelId,
        owner: WorkerId,
        reason: CompletionReason,
        result: Option<f64>,
        error_message: Option<String>,
    ) -> SearchResult<bool>;

    /// All models of a job in creation order
    async fn list_models(&self, job_id: JobId) -> SearchResult<Vec<Model>>;

    /// Take over a running model that has not progressed for `orphan_interval`
    async fn claim_orphan(&self, model_id: ModelId, new_owner: WorkerId, orphan_interval: Duration) -> SearchResult<bool>;

    async fn health_check(&self) -> SearchResult<StoreHealth>;
}

/// Store health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub is_healthy: bool,
    pub error_message: Option<String>,
    pub total_jobs: usize,
    pub total_models: usize,
}

/// Latest `last_update` at which a running model counts as orphaned
pub(crate) fn orphan_cutoff(now: DateTime<Utc>, orphan_interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(orphan_interval)
        .ok()
        .and_then(|interval| now.checked_sub_signed(interval))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    //! Behaviour every backend must share, run against both
    use super::*;
    use crate::config::{SearchDimension, SearchSpace};
    use crate::particle::Particle;
    use crate::types::{JobStatus, ModelStatus, SwarmId};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn config() -> SearchConfig {
        let space = SearchSpace::new()
            .with_field("gym", [("n", SearchDimension::int(1, 10, 1))])
            .with_field("address", [("kind", SearchDimension::choice(["a", "b"], false))]);
        SearchConfig::new(space, "gym")
    }

    fn params(config: &SearchConfig, index: usize) -> ModelParams {
        Particle::new(&config.space, SwarmId::from("gym"), index, config.seed)
            .unwrap()
            .to_model_params(&config.predicted_field)
    }

    async fn stores() -> (TempDir, Vec<Arc<dyn JobStore>>) {
        let dir = TempDir::new().unwrap();
        let sqlite = SqliteJobStore::new(dir.path().join("jobs.db")).await.unwrap();
        sqlite.initialize().await.unwrap();
        let memory = InMemoryJobStore::new();
        memory.initialize().await.unwrap();
        (dir, vec![Arc::new(sqlite), Arc::new(memory)])
    }

    #[tokio::test]
    async fn test_insert_job_rejects_bad_config() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let mut bad = config();
            bad.min_particles_per_swarm = 0;
            let err = store.insert_job(bad).await.unwrap_err();
            assert!(err.is_configuration());
        }
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let job = store.get_job(job_id).await.unwrap();
            assert_eq!(job.status, JobStatus::Running);
            assert_eq!(job.config, config());
            assert_eq!(job.engine_state.version, 0);
            assert!(store.get_job(Uuid::new_v4()).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_engine_state_compare_and_swap() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let (state, _) = SwarmEngineState::default().advance(&config(), &[]);

            assert!(store.update_job_engine_state(job_id, 0, &state).await.unwrap());
            assert!(!store.update_job_engine_state(job_id, 0, &state).await.unwrap());

            let stored = store.get_job(job_id).await.unwrap().engine_state;
            assert_eq!(stored.version, 1);
            assert_eq!(stored.swarms, state.swarms);
            assert!(store.update_job_engine_state(job_id, 1, &stored).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_slot_is_filled_once() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let config = config();
            let first = store.insert_model(job_id, params(&config, 0), Uuid::new_v4()).await.unwrap();
            let second = store.insert_model(job_id, params(&config, 0), Uuid::new_v4()).await.unwrap();
            assert!(first.is_some());
            assert!(second.is_none());
            assert!(store.insert_model(job_id, params(&config, 1), Uuid::new_v4()).await.unwrap().is_some());
            assert_eq!(store.list_models(job_id).await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_complete_model_is_idempotent() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let owner = Uuid::new_v4();
            let model_id = store.insert_model(job_id, params(&config(), 0), owner).await.unwrap().unwrap();

            assert!(!store
                .complete_model(model_id, Uuid::new_v4(), CompletionReason::Eof, Some(0.1), None)
                .await
                .unwrap());
            assert!(store
                .complete_model(model_id, owner, CompletionReason::Eof, Some(0.25), None)
                .await
                .unwrap());
            assert!(!store
                .complete_model(model_id, owner, CompletionReason::Error, None, Some("late".into()))
                .await
                .unwrap());

            let model = store.get_model(model_id).await.unwrap();
            assert_eq!(model.status, ModelStatus::Completed);
            assert_eq!(model.completion_reason, Some(CompletionReason::Eof));
            assert_eq!(model.result, Some(0.25));
            assert_eq!(model.error_message, None);
        }
    }

    #[tokio::test]
    async fn test_progress_requires_ownership() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let owner = Uuid::new_v4();
            let model_id = store.insert_model(job_id, params(&config(), 0), owner).await.unwrap().unwrap();

            assert!(store.update_model_progress(model_id, owner, 5, Utc::now(), Some(0.4)).await.unwrap());
            assert!(!store
                .update_model_progress(model_id, Uuid::new_v4(), 6, Utc::now(), None)
                .await
                .unwrap());
            let model = store.get_model(model_id).await.unwrap();
            assert_eq!(model.records_processed, 5);
            assert_eq!(model.progress_score, Some(0.4));
        }
    }

    #[tokio::test]
    async fn test_claim_orphan_needs_staleness() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let dead = Uuid::new_v4();
            let model_id = store.insert_model(job_id, params(&config(), 0), dead).await.unwrap().unwrap();
            let rescuer = Uuid::new_v4();

            assert!(!store.claim_orphan(model_id, rescuer, Duration::from_secs(3600)).await.unwrap());
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(store.claim_orphan(model_id, rescuer, Duration::from_millis(5)).await.unwrap());

            let model = store.get_model(model_id).await.unwrap();
            assert_eq!(model.owner, rescuer);
            assert_eq!(model.restarts, 1);
            assert_eq!(model.records_processed, 0);

            // the former owner can no longer write
            assert!(!store
                .complete_model(model_id, dead, CompletionReason::Eof, Some(0.1), None)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let model_id = store
                .insert_model(job_id, params(&config(), 0), Uuid::new_v4())
                .await
                .unwrap()
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            let claims = (0..8).map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_orphan(model_id, Uuid::new_v4(), Duration::from_millis(5)).await })
            });
            let results = futures::future::join_all(claims).await;
            let winners = results.into_iter().filter(|r| matches!(r, Ok(Ok(true)))).count();
            assert_eq!(winners, 1);
        }
    }

    #[tokio::test]
    async fn test_mark_job_complete_once() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let results = JobResults {
                total_models: 3,
                ..Default::default()
            };
            store.update_job_results(job_id, &results).await.unwrap();
            assert!(store
                .mark_job_complete(job_id, JobCompletionReason::Error, Some("model x failed: boom".into()))
                .await
                .unwrap());
            assert!(!store.mark_job_complete(job_id, JobCompletionReason::Success, None).await.unwrap());

            let job = store.get_job(job_id).await.unwrap();
            assert!(job.is_completed());
            assert_eq!(job.completion_reason, Some(JobCompletionReason::Error));
            assert_eq!(job.results, Some(results));
        }
    }

    #[tokio::test]
    async fn test_completed_job_accepts_no_models() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            assert!(store.mark_job_complete(job_id, JobCompletionReason::Success, None).await.unwrap());
            let inserted = store.insert_model(job_id, params(&config(), 0), Uuid::new_v4()).await.unwrap();
            assert!(inserted.is_none());
            assert!(store.insert_model(Uuid::new_v4(), params(&config(), 0), Uuid::new_v4()).await.is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inserts_racing_completion_stop_at_completion() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            let inserters = (0..3).map(|worker| {
                let store = store.clone();
                let config = config();
                tokio::spawn(async move {
                    let mut inserted = Vec::new();
                    for index in (worker..).step_by(3).take(500) {
                        match store.insert_model(job_id, params(&config, index), Uuid::new_v4()).await.unwrap() {
                            Some(id) => inserted.push(id),
                            None => break,
                        }
                    }
                    inserted
                })
            });
            let inserters: Vec<_> = inserters.collect();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(store.mark_job_complete(job_id, JobCompletionReason::Success, None).await.unwrap());
            let seen = store.list_models(job_id).await.unwrap().len();

            let mut inserted = 0;
            for inserter in futures::future::join_all(inserters).await {
                inserted += inserter.unwrap().len();
            }
            let models = store.list_models(job_id).await.unwrap();
            assert_eq!(models.len(), inserted);
            assert_eq!(models.len(), seen);
            assert!(store.insert_model(job_id, params(&config(), 9999), Uuid::new_v4()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_health_check_counts_rows() {
        let (_dir, stores) = stores().await;
        for store in stores {
            let job_id = store.insert_job(config()).await.unwrap();
            store.insert_model(job_id, params(&config(), 0), Uuid::new_v4()).await.unwrap();
            let health = store.health_check().await.unwrap();
            assert!(health.is_healthy);
            assert_eq!(health.total_jobs, 1);
            assert_eq!(health.total_models, 1);
        }
    }
}
