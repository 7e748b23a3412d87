//! Runs one model to completion on behalf of a worker

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SearchConfig;
use crate::error::SearchResult;
use crate::evaluator::{EvaluatorFactory, ModelEvaluator, StepOutcome};
use crate::maturity::ModelMaturityTracker;
use crate::store::JobStore;
use crate::telemetry::SearchMetrics;
use crate::types::{to_error, CompletionReason, Job, Model, SwarmId, SwarmStatus, WorkerId};

/// How a model run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The model was completed by this worker
    Completed {
        reason: CompletionReason,
        result: Option<f64>,
    },
    /// Another worker adopted the model; nothing was written
    OwnershipLost,
    /// Shutdown requested; the model stays running until someone adopts it
    Abandoned,
}

/// Drives a [`ModelEvaluator`] and keeps the job store informed
///
/// Progress is written every `progress_update_interval` records. The same
/// write doubles as the ownership check: once it fails the model belongs to
/// someone else and the run stops without touching the model again. After
/// each progress write the runner checks the swarm: models of killed swarms
/// stop as killed, and models of matured swarms stop early unless they are
/// the swarm's best so far.
pub struct ModelEvaluationRunner {
    store: Arc<dyn JobStore>,
    worker_id: WorkerId,
    metrics: Arc<SearchMetrics>,
}

impl ModelEvaluationRunner {
    pub fn new(store: Arc<dyn JobStore>, worker_id: WorkerId, metrics: Arc<SearchMetrics>) -> Self {
        Self {
            store,
            worker_id,
            metrics,
        }
    }

    /// Evaluate `model` until it finishes, is stopped, or shutdown is requested
    pub async fn run(
        &self,
        model: &Model,
        config: &SearchConfig,
        factory: &dyn EvaluatorFactory,
        shutdown: &watch::Receiver<bool>,
    ) -> SearchResult<RunOutcome> {
        let span = info_span!(
            "model",
            model_id = %model.id,
            swarm = %model.params.swarm_id,
            particle = model.params.particle_index,
            generation = model.params.generation,
        );
        self.run_inner(model, config, factory, shutdown).instrument(span).await
    }

    async fn run_inner(
        &self,
        model: &Model,
        config: &SearchConfig,
        factory: &dyn EvaluatorFactory,
        shutdown: &watch::Receiver<bool>,
    ) -> SearchResult<RunOutcome> {
        let mut evaluator = match factory.create(&model.params) {
            Ok(evaluator) => evaluator,
            Err(e) => {
                warn!(error = %e, "Failed to build evaluator");
                return self.finish(model, CompletionReason::Error, None, Some(format!("{:#}", e))).await;
            }
        };

        let maximize = config.optimize.maximize;
        let mut tracker = config
            .model_maturity
            .then(|| ModelMaturityTracker::new(config.model_maturity_window, config.maturity_max_slope));
        let mut records: u64 = 0;
        debug!("Starting evaluation");

        loop {
            if *shutdown.borrow() {
                evaluator.cancel();
                info!(records, "Shutdown requested, leaving model for adoption");
                return Ok(RunOutcome::Abandoned);
            }

            let outcome = match evaluator.step().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    evaluator.cancel();
                    warn!(records, error = %e, "Evaluation failed");
                    return self.finish(model, CompletionReason::Error, None, Some(format!("{:#}", e))).await;
                }
            };
            records += 1;

            if outcome == StepOutcome::Done {
                let result = finite(evaluator.score());
                return self.finish(model, CompletionReason::Eof, result, None).await;
            }

            let mut model_mature = false;
            if let Some(tracker) = tracker.as_mut() {
                if records % config.model_maturity_check_interval == 0 {
                    model_mature = tracker.push(to_error(evaluator.score(), maximize));
                }
            }
            if records % config.progress_update_interval != 0 && !model_mature {
                continue;
            }

            let score = finite(evaluator.score());
            let owned = self
                .store
                .update_model_progress(model.id, self.worker_id, records, Utc::now(), score)
                .await?;
            if !owned {
                evaluator.cancel();
                self.metrics.ownership_lost();
                warn!(records, "Model was taken over by another worker");
                return Ok(RunOutcome::OwnershipLost);
            }

            let job = self.store.get_job(model.job_id).await?;
            let error = score.map(|s| to_error(s, maximize));
            if let Some(reason) = stop_reason(&job, &model.params.swarm_id, error, model_mature) {
                evaluator.cancel();
                debug!(records, reason = %reason, "Stopping model early");
                let result = if reason == CompletionReason::Stopped { score } else { None };
                return self.finish(model, reason, result, None).await;
            }
        }
    }

    async fn finish(
        &self,
        model: &Model,
        reason: CompletionReason,
        result: Option<f64>,
        error_message: Option<String>,
    ) -> SearchResult<RunOutcome> {
        let landed = self
            .store
            .complete_model(model.id, self.worker_id, reason, result, error_message)
            .await?;
        if !landed {
            self.metrics.ownership_lost();
            warn!(reason = %reason, "Model was taken over before it could be completed");
            return Ok(RunOutcome::OwnershipLost);
        }
        self.metrics.model_completed(reason);
        info!(reason = %reason, result = ?result, "Model completed");
        Ok(RunOutcome::Completed { reason, result })
    }
}

fn finite(score: f64) -> Option<f64> {
    score.is_finite().then_some(score)
}

/// Why a running model should stop now, if it should
fn stop_reason(job: &Job, swarm_id: &SwarmId, error: Option<f64>, model_mature: bool) -> Option<CompletionReason> {
    if job.is_completed() {
        return Some(CompletionReason::Killed);
    }
    let state = &job.engine_state;
    let swarm = state.swarm(swarm_id)?;
    if swarm.status == SwarmStatus::Killed {
        return Some(CompletionReason::Killed);
    }
    let is_best = error.map_or(false, |e| state.is_swarm_best(swarm_id, e));
    let swarm_done = swarm.matured || swarm.status == SwarmStatus::Completed;
    if (swarm_done || model_mature) && !is_best {
        return Some(CompletionReason::Stopped);
    }
    None
}
