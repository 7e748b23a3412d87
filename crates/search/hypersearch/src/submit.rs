//! Client side of a search: submit jobs, run local workers, read reports

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SearchConfig;
use crate::controller::compute_results;
use crate::engine_state::SwarmEngineState;
use crate::error::{SearchError, SearchResult};
use crate::evaluator::EvaluatorFactory;
use crate::store::JobStore;
use crate::types::{JobCompletionReason, JobId, JobResults, JobStatus, ModelParams, SwarmId, SwarmStatus};
use crate::worker::{WorkerHandle, WorkerLoop, WorkerReport};

/// Per-swarm view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSummary {
    pub sprint: usize,
    pub status: SwarmStatus,
    pub speculative: bool,
    pub generations: u32,
    pub best_error: Option<f64>,
    pub contribution: Option<f64>,
}

/// State and results of a job as seen by its submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub completion_reason: Option<JobCompletionReason>,
    pub completion_message: Option<String>,
    /// Final results once complete, otherwise computed from the models so far
    pub results: JobResults,
    /// Parameters of the best model
    pub best_params: Option<ModelParams>,
    pub sprints: usize,
    pub swarms: BTreeMap<SwarmId, SwarmSummary>,
    pub stop_reason: Option<String>,
}

impl JobReport {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Entry point for submitting and following search jobs
#[derive(Clone)]
pub struct HypersearchClient {
    store: Arc<dyn JobStore>,
}

impl HypersearchClient {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and store a new job; workers pick it up by id
    pub async fn submit(&self, config: SearchConfig) -> SearchResult<JobId> {
        let fields = config.space.field_names();
        let job_id = self.store.insert_job(config).await?;
        info!(%job_id, fields = ?fields, "Submitted search job");
        Ok(job_id)
    }

    pub async fn report(&self, job_id: JobId) -> SearchResult<JobReport> {
        let job = self.store.get_job(job_id).await?;
        let models = self.store.list_models(job_id).await?;
        let results = match &job.results {
            Some(results) if job.is_completed() => results.clone(),
            _ => compute_results(&job.config, &job.engine_state, &models),
        };
        let best_params = results
            .best_model_id
            .and_then(|id| models.iter().find(|m| m.id == id))
            .map(|m| m.params.clone());

        Ok(JobReport {
            job_id,
            status: job.status,
            completion_reason: job.completion_reason,
            completion_message: job.completion_message.clone(),
            results,
            best_params,
            sprints: job.engine_state.sprints.len(),
            swarms: swarm_summaries(&job.engine_state),
            stop_reason: job.engine_state.stop_reason.clone(),
        })
    }

    /// Poll until the job completes
    pub async fn wait_for_completion(&self, job_id: JobId, poll: Duration) -> SearchResult<JobReport> {
        loop {
            let report = self.report(job_id).await?;
            if report.is_completed() {
                return Ok(report);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Spawn `workers` worker loops in this process and wait for all of them
    pub async fn run_local_workers(
        &self,
        job_id: JobId,
        workers: usize,
        factory: Arc<dyn EvaluatorFactory>,
    ) -> SearchResult<Vec<WorkerReport>> {
        if workers == 0 {
            return Err(SearchError::config("at least one worker is required"));
        }
        let (tasks, _handles): (Vec<_>, Vec<WorkerHandle>) = (0..workers)
            .map(|_| {
                let (worker, handle) = WorkerLoop::new(self.store.clone(), factory.clone(), job_id);
                (tokio::spawn(worker.run()), handle)
            })
            .unzip();

        let mut reports = Vec::with_capacity(workers);
        let mut first_error = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    warn!(%job_id, error = %e, "Worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "Worker task panicked");
                    first_error.get_or_insert(SearchError::Other(anyhow::anyhow!("worker task failed: {}", e)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

fn swarm_summaries(state: &SwarmEngineState) -> BTreeMap<SwarmId, SwarmSummary> {
    state
        .swarms
        .iter()
        .map(|(id, s)| {
            (
                id.clone(),
                SwarmSummary {
                    sprint: s.sprint,
                    status: s.status,
                    speculative: s.speculative,
                    generations: s.generation,
                    best_error: s.best_error,
                    contribution: s.contribution,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SearchDimension, SearchSpace};
    use crate::store::InMemoryJobStore;

    fn client() -> HypersearchClient {
        HypersearchClient::new(Arc::new(InMemoryJobStore::new()))
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_config() {
        let err = client().submit(SearchConfig::default()).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_report_of_fresh_job() {
        let client = client();
        let space = SearchSpace::new().with_field("a", [("n", SearchDimension::int(1, 5, 1))]);
        let job_id = client.submit(SearchConfig::new(space, "a")).await.unwrap();

        let report = client.report(job_id).await.unwrap();
        assert!(!report.is_completed());
        assert_eq!(report.results.total_models, 0);
        assert!(report.best_params.is_none());
        assert!(report.swarms.is_empty());
    }

    #[tokio::test]
    async fn test_report_unknown_job() {
        let err = client().report(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SearchError::JobNotFound(_)));
    }
}
