//! Worker loop: asks the controller for work and runs it until the job ends

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::controller::{NextModel, SwarmController};
use crate::error::SearchResult;
use crate::evaluator::EvaluatorFactory;
use crate::runner::{ModelEvaluationRunner, RunOutcome};
use crate::store::JobStore;
use crate::telemetry::{MetricsSnapshot, SearchMetrics};
use crate::types::{JobId, WorkerId};

/// Summary of one worker's participation in a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub models_run: usize,
    pub models_adopted: usize,
    pub models_abandoned: usize,
    /// True when the worker exited because the job completed
    pub job_completed: bool,
    pub metrics: MetricsSnapshot,
}

/// Requests a cooperative stop of a running [`WorkerLoop`]
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    /// Ask the worker to stop; a model in flight is left for adoption
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// One worker participating in a job
pub struct WorkerLoop {
    store: Arc<dyn JobStore>,
    factory: Arc<dyn EvaluatorFactory>,
    job_id: JobId,
    worker_id: WorkerId,
    metrics: Arc<SearchMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerLoop {
    pub fn new(store: Arc<dyn JobStore>, factory: Arc<dyn EvaluatorFactory>, job_id: JobId) -> (Self, WorkerHandle) {
        let (tx, rx) = watch::channel(false);
        let worker = Self {
            store,
            factory,
            job_id,
            worker_id: Uuid::new_v4(),
            metrics: Arc::new(SearchMetrics::new()),
            shutdown: rx,
        };
        (worker, WorkerHandle { shutdown: Arc::new(tx) })
    }

    /// Use a fixed worker identity instead of a random one
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Run until the job completes or a stop is requested
    pub async fn run(self) -> SearchResult<WorkerReport> {
        let span = info_span!("worker", worker_id = %self.worker_id, job_id = %self.job_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> SearchResult<WorkerReport> {
        let controller = SwarmController::new(self.store.clone(), self.job_id, self.worker_id, self.metrics.clone());
        let runner = ModelEvaluationRunner::new(self.store.clone(), self.worker_id, self.metrics.clone());
        let config = self.store.get_job(self.job_id).await?.config;
        let mut report = WorkerReport {
            worker_id: self.worker_id,
            ..Default::default()
        };
        info!("Worker started");

        loop {
            if *self.shutdown.borrow() {
                info!("Worker stopping on request");
                break;
            }

            match controller.get_next_model().await? {
                NextModel::Run { model, adopted } => {
                    report.models_run += 1;
                    if adopted {
                        report.models_adopted += 1;
                    }
                    let outcome = runner
                        .run(&model, &config, self.factory.as_ref(), &self.shutdown)
                        .await?;
                    match outcome {
                        RunOutcome::Completed { .. } => {
                            if controller.on_model_completed().await? {
                                report.job_completed = true;
                                break;
                            }
                        }
                        RunOutcome::OwnershipLost => {}
                        RunOutcome::Abandoned => report.models_abandoned += 1,
                    }
                }
                NextModel::Wait => {
                    debug!("No model available, waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval()) => {}
                        Ok(()) = self.shutdown.changed() => {}
                    }
                }
                NextModel::Done => {
                    report.job_completed = true;
                    break;
                }
            }
        }

        report.metrics = self.metrics.snapshot();
        info!(
            models_run = report.models_run,
            adopted = report.models_adopted,
            job_completed = report.job_completed,
            "Worker finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SearchConfig, SearchDimension, SearchSpace};
    use crate::evaluator::{ModelEvaluator, StepOutcome};
    use crate::store::InMemoryJobStore;
    use crate::types::{JobStatus, ModelParams};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Oneshot {
        score: f64,
    }

    #[async_trait]
    impl ModelEvaluator for Oneshot {
        async fn step(&mut self) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::Done)
        }

        fn cancel(&mut self) {}

        fn score(&self) -> f64 {
            self.score
        }
    }

    struct Endless;

    #[async_trait]
    impl ModelEvaluator for Endless {
        async fn step(&mut self) -> anyhow::Result<StepOutcome> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(StepOutcome::Continue)
        }

        fn cancel(&mut self) {}

        fn score(&self) -> f64 {
            1.0
        }
    }

    fn config() -> SearchConfig {
        let space = SearchSpace::new().with_field("a", [("n", SearchDimension::int(1, 20, 1))]);
        let mut config = SearchConfig::new(space, "a");
        config.min_particles_per_swarm = 3;
        config.max_swarm_generations = 4;
        config.worker_poll_interval_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_single_worker_finishes_job() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job_id = store.insert_job(config()).await.unwrap();
        let factory: Arc<dyn EvaluatorFactory> =
            Arc::new(|params: &ModelParams| -> anyhow::Result<Box<dyn ModelEvaluator>> {
                let n = params.values["a:n"].as_f64().unwrap_or(0.0);
                Ok(Box::new(Oneshot { score: (n - 7.0).abs() }))
            });

        let worker_id = Uuid::new_v4();
        let (worker, _handle) = WorkerLoop::new(store.clone(), factory, job_id);
        let worker = worker.with_worker_id(worker_id);
        assert_eq!(worker.worker_id(), worker_id);
        let report = tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .unwrap()
            .unwrap();

        assert!(report.job_completed);
        assert_eq!(report.worker_id, worker_id);
        let models = store.list_models(job_id).await.unwrap();
        assert!(models.iter().all(|m| m.owner == worker_id));
        assert!(report.models_run >= 3);
        assert_eq!(report.metrics.models_completed as usize, report.models_run);
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.results.unwrap().best_value.is_some());
    }

    #[tokio::test]
    async fn test_stop_leaves_model_running() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job_id = store.insert_job(config()).await.unwrap();
        let factory: Arc<dyn EvaluatorFactory> =
            Arc::new(|_: &ModelParams| -> anyhow::Result<Box<dyn ModelEvaluator>> { Ok(Box::new(Endless)) });

        let (worker, handle) = WorkerLoop::new(store.clone(), factory, job_id);
        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
        let report = task.await.unwrap().unwrap();

        assert!(!report.job_completed);
        assert_eq!(report.models_abandoned, 1);
        let models = store.list_models(job_id).await.unwrap();
        assert_eq!(models.len(), 1);
        assert!(models[0].is_running());
    }
}
