//! Swarm controller: decides what a worker should evaluate next
//!
//! Every call re-reads the job and its models, advances the shared engine
//! state through the store's version check, then either adopts an orphaned
//! model or proposes the next particle position of the least-served swarm.
//! Concurrent workers may propose the same swarm slot; the store accepts the
//! first insert and the others simply look again.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ParamValue, SearchConfig};
use crate::engine_state::{EngineEvent, SwarmEngineState};
use crate::error::{SearchError, SearchResult};
use crate::particle::Particle;
use crate::store::{orphan_cutoff, JobStore};
use crate::telemetry::SearchMetrics;
use crate::types::{
    from_error, CompletionReason, Job, JobCompletionReason, JobId, JobResults, Model, ModelParams, SwarmId,
    SwarmStatus, WorkerId,
};
use crate::variable::Coordinate;

/// Attempts at writing the engine state before giving up
const MAX_STATE_ATTEMPTS: usize = 32;

/// Attempts at filling a slot before telling the worker to wait
const MAX_INSERT_ATTEMPTS: usize = 16;

/// What a worker should do next
#[derive(Debug, Clone)]
pub enum NextModel {
    /// Evaluate this model; `adopted` when it was taken over from a dead worker
    Run { model: Model, adopted: bool },
    /// Nothing to do right now, poll again later
    Wait,
    /// The job is complete
    Done,
}

/// Consistent view of a job after advancing its engine state
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
    pub models: Vec<Model>,
}

impl JobSnapshot {
    pub fn state(&self) -> &SwarmEngineState {
        &self.job.engine_state
    }
}

enum Adoption {
    Resume(Model),
    Retired,
    None,
}

/// Per-worker view of the swarming engine for one job
pub struct SwarmController {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    worker_id: WorkerId,
    metrics: Arc<SearchMetrics>,
}

impl SwarmController {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, worker_id: WorkerId, metrics: Arc<SearchMetrics>) -> Self {
        Self {
            store,
            job_id,
            worker_id,
            metrics,
        }
    }

    /// Pick the next model for this worker to evaluate
    pub async fn get_next_model(&self) -> SearchResult<NextModel> {
        for _ in 0..MAX_INSERT_ATTEMPTS {
            let snapshot = self.sync().await?;
            if snapshot.job.is_completed() || self.finalize_if_done(&snapshot).await? {
                return Ok(NextModel::Done);
            }

            match self.adopt_orphan(&snapshot).await? {
                Adoption::Resume(model) => return Ok(NextModel::Run { model, adopted: true }),
                Adoption::Retired => continue,
                Adoption::None => {}
            }

            let config = &snapshot.job.config;
            if config.max_models.map_or(false, |max| snapshot.models.len() >= max) {
                debug!(models = snapshot.models.len(), "Model cap reached, waiting for running models");
                return Ok(NextModel::Wait);
            }
            if snapshot.state().search_over {
                return Ok(NextModel::Wait);
            }

            let Some(params) = propose(config, snapshot.state(), &snapshot.models)? else {
                return Ok(NextModel::Wait);
            };
            let slot = params.slot_key();
            match self.store.insert_model(self.job_id, params, self.worker_id).await? {
                Some(model_id) => {
                    self.metrics.model_created();
                    let model = self.store.get_model(model_id).await?;
                    debug!(%model_id, slot = %slot, "Created model");
                    return Ok(NextModel::Run { model, adopted: false });
                }
                None => {
                    debug!(slot = %slot, "Slot filled by another worker, looking again");
                }
            }
        }
        Ok(NextModel::Wait)
    }

    /// Fold a finished model into the engine state; true once the job is complete
    pub async fn on_model_completed(&self) -> SearchResult<bool> {
        let snapshot = self.sync().await?;
        if snapshot.job.is_completed() {
            return Ok(true);
        }
        self.finalize_if_done(&snapshot).await
    }

    /// Read the job and advance its engine state until the write lands or nothing changes
    pub async fn sync(&self) -> SearchResult<JobSnapshot> {
        for _ in 0..MAX_STATE_ATTEMPTS {
            let mut job = self.store.get_job(self.job_id).await?;
            let models = self.store.list_models(self.job_id).await?;
            if job.is_completed() {
                return Ok(JobSnapshot { job, models });
            }

            let (next, events) = job.engine_state.advance(&job.config, &models);
            if next == job.engine_state {
                return Ok(JobSnapshot { job, models });
            }
            let version = job.engine_state.version;
            if self.store.update_job_engine_state(self.job_id, version, &next).await? {
                for event in &events {
                    log_event(self.job_id, event);
                }
                self.metrics.active_swarms(next.active_swarm_count());
                job.engine_state = next;
                job.engine_state.version = version + 1;
                return Ok(JobSnapshot { job, models });
            }

            self.metrics.state_conflict();
            debug!(version, "Engine state changed underneath, retrying");
            tokio::task::yield_now().await;
        }
        Err(SearchError::EngineStateConflict {
            job: self.job_id,
            attempts: MAX_STATE_ATTEMPTS,
        })
    }

    async fn adopt_orphan(&self, snapshot: &JobSnapshot) -> SearchResult<Adoption> {
        let config = &snapshot.job.config;
        let interval = config.orphan_interval();
        let cutoff = orphan_cutoff(Utc::now(), interval);
        let mut candidates: Vec<&Model> = snapshot
            .models
            .iter()
            .filter(|m| m.is_running() && m.owner != self.worker_id && m.last_update < cutoff)
            .collect();
        candidates.sort_by_key(|m| (m.last_update, m.id));

        for candidate in candidates {
            if !self.store.claim_orphan(candidate.id, self.worker_id, interval).await? {
                continue;
            }
            self.metrics.orphan_adopted();
            let model = self.store.get_model(candidate.id).await?;
            let swarm = snapshot.state().swarm(&model.params.swarm_id);

            let retire_as = match swarm {
                Some(s) if s.status == SwarmStatus::Killed => Some(CompletionReason::Killed),
                Some(s) if s.status.is_terminal() || s.matured => Some(CompletionReason::Orphaned),
                _ if snapshot.state().search_over => Some(CompletionReason::Orphaned),
                _ if model.restarts > config.max_orphan_restarts => Some(CompletionReason::Orphaned),
                _ => None,
            };
            match retire_as {
                Some(reason) => {
                    warn!(
                        model_id = %model.id,
                        restarts = model.restarts,
                        reason = %reason,
                        "Retiring orphaned model"
                    );
                    if self
                        .store
                        .complete_model(model.id, self.worker_id, reason, None, None)
                        .await?
                    {
                        self.metrics.model_completed(reason);
                    }
                    return Ok(Adoption::Retired);
                }
                None => {
                    info!(model_id = %model.id, restarts = model.restarts, "Adopted orphaned model");
                    return Ok(Adoption::Resume(model));
                }
            }
        }
        Ok(Adoption::None)
    }

    /// Complete the job when the search is over or the error budget is spent
    async fn finalize_if_done(&self, snapshot: &JobSnapshot) -> SearchResult<bool> {
        let config = &snapshot.job.config;
        let models = &snapshot.models;

        if let Some(budget) = config.error_budget() {
            let errored: Vec<&Model> = models
                .iter()
                .filter(|m| m.completion_reason == Some(CompletionReason::Error))
                .collect();
            if errored.len() > budget {
                let trigger = errored.iter().max_by_key(|m| (m.last_update, m.id));
                let message = trigger.map(|m| {
                    format!(
                        "model {} failed: {}",
                        m.id,
                        m.error_message.as_deref().unwrap_or("unknown error")
                    )
                });
                let results = compute_results(config, snapshot.state(), models);
                self.store.update_job_results(self.job_id, &results).await?;
                if self
                    .store
                    .mark_job_complete(self.job_id, JobCompletionReason::Error, message.clone())
                    .await?
                {
                    warn!(errored = errored.len(), budget, message = ?message, "Job failed: error budget exhausted");
                }
                return Ok(true);
            }
        }

        let capped = config.max_models.map_or(false, |max| models.len() >= max);
        let state = snapshot.state();
        if (state.search_over || capped) && models.iter().all(|m| !m.is_running()) {
            let results = compute_results(config, state, models);
            self.store.update_job_results(self.job_id, &results).await?;
            let message = state
                .stop_reason
                .clone()
                .or_else(|| capped.then(|| "model cap reached".to_string()));
            if self
                .store
                .mark_job_complete(self.job_id, JobCompletionReason::Success, message)
                .await?
            {
                info!(
                    best_model = ?results.best_model_id,
                    best_value = ?results.best_value,
                    total_models = results.total_models,
                    "Job completed"
                );
            }
            return Ok(true);
        }
        Ok(false)
    }
}

fn log_event(job_id: JobId, event: &EngineEvent) {
    match event {
        EngineEvent::SprintStarted { sprint, swarms } => {
            info!(%job_id, sprint, swarms = swarms.len(), "Sprint started");
        }
        EngineEvent::SprintCompleted { sprint, winner, best_error } => {
            info!(%job_id, sprint, winner = %winner, best_error, "Sprint completed");
        }
        EngineEvent::SwarmMatured { swarm, generations, best_error } => {
            info!(%job_id, swarm = %swarm, generations, best_error = ?best_error, "Swarm matured");
        }
        EngineEvent::SwarmCompleted { swarm } => debug!(%job_id, swarm = %swarm, "Swarm completed"),
        EngineEvent::SwarmKilled { swarm } => info!(%job_id, swarm = %swarm, "Swarm killed"),
        EngineEvent::SwarmPromoted { swarm } => debug!(%job_id, swarm = %swarm, "Speculative swarm promoted"),
        EngineEvent::SpeculationStarted { leader, swarms } => {
            info!(%job_id, leader = %leader, swarms = swarms.len(), "Speculating on leader");
        }
        EngineEvent::FieldsBlacklisted { fields } => {
            info!(%job_id, fields = ?fields, "Fields below minimum contribution");
        }
        EngineEvent::SearchFinished { reason } => info!(%job_id, reason = %reason, "Search finished"),
    }
}

/// Parameters for the next model of the least-served schedulable swarm
pub fn propose(
    config: &SearchConfig,
    state: &SwarmEngineState,
    models: &[Model],
) -> SearchResult<Option<ModelParams>> {
    let mut by_swarm: BTreeMap<&SwarmId, Vec<&Model>> = BTreeMap::new();
    for model in models {
        by_swarm.entry(&model.params.swarm_id).or_default().push(model);
    }

    let mut candidates: Vec<(usize, &SwarmId)> = state
        .schedulable_swarms()
        .into_iter()
        .map(|id| (by_swarm.get(id).map_or(0, Vec::len), id))
        .collect();
    candidates.sort();

    for (_, id) in candidates {
        let swarm_models = by_swarm.get(id).map(Vec::as_slice).unwrap_or(&[]);
        if let Some(params) = next_slot(config, id, swarm_models)? {
            return Ok(Some(params));
        }
    }
    Ok(None)
}

/// Next free slot of one swarm: a new particle, or the next generation of a finished one
fn next_slot(config: &SearchConfig, swarm: &SwarmId, models: &[&Model]) -> SearchResult<Option<ModelParams>> {
    let particles = config.min_particles_per_swarm;
    let maximize = config.optimize.maximize;

    let mut latest: BTreeMap<usize, &Model> = BTreeMap::new();
    for &model in models {
        let entry = latest.entry(model.params.particle_index).or_insert(model);
        if model.params.generation > entry.params.generation {
            *entry = model;
        }
    }

    for index in 0..particles {
        if !latest.contains_key(&index) {
            let particle = Particle::new(&config.space, swarm.clone(), index, config.seed)?;
            return Ok(Some(particle.to_model_params(&config.predicted_field)));
        }
    }

    let generation_done = |generation: u32| {
        let mut finished: Vec<usize> = models
            .iter()
            .filter(|m| m.params.generation == generation && !m.is_running())
            .map(|m| m.params.particle_index)
            .collect();
        finished.sort_unstable();
        finished.dedup();
        finished.len() >= particles
    };

    for model in latest.values() {
        if model.is_running() || model.params.generation + 1 >= config.max_swarm_generations {
            continue;
        }
        if !config.speculative_particles && !generation_done(model.params.generation) {
            continue;
        }

        let mut particle = Particle::from_state(&config.space, &model.params.particle)?;
        if let Some(error) = model.error_score(maximize) {
            particle.record_result(error);
        }
        particle.set_results_per_choice(&choice_results(models, maximize));
        particle.evolve(&global_best(models, maximize), config.seed);
        return Ok(Some(particle.to_model_params(&config.predicted_field)));
    }
    Ok(None)
}

/// Position of the swarm's best scored model
fn global_best(models: &[&Model], maximize: bool) -> BTreeMap<String, Coordinate> {
    models
        .iter()
        .filter_map(|m| m.error_score(maximize).map(|e| (e, m)))
        .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)))
        .map(|(_, m)| {
            m.params
                .particle
                .variables
                .iter()
                .map(|(name, var)| (name.clone(), var.position))
                .collect()
        })
        .unwrap_or_default()
}

/// Errors observed for each value of every choice variable
fn choice_results(models: &[&Model], maximize: bool) -> BTreeMap<String, BTreeMap<String, Vec<f64>>> {
    let mut results: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    for model in models {
        let Some(error) = model.error_score(maximize) else {
            continue;
        };
        for (name, value) in &model.params.values {
            if let ParamValue::Choice(choice) = value {
                results
                    .entry(name.clone())
                    .or_default()
                    .entry(choice.clone())
                    .or_default()
                    .push(error);
            }
        }
    }
    results
}

/// Results of a job from its engine state and models
pub fn compute_results(config: &SearchConfig, state: &SwarmEngineState, models: &[Model]) -> JobResults {
    let maximize = config.optimize.maximize;
    // models of killed swarms belong to branches the search rejected
    let eligible = |m: &&Model| {
        state
            .swarm(&m.params.swarm_id)
            .map_or(true, |s| s.status != SwarmStatus::Killed)
    };
    let best_with = |reason: CompletionReason| {
        models
            .iter()
            .filter(eligible)
            .filter(|m| m.scored_reason() == Some(reason))
            .filter_map(|m| m.error_score(maximize).map(|e| (e, m)))
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)))
    };
    let best = best_with(CompletionReason::Eof).or_else(|| best_with(CompletionReason::Stopped));

    JobResults {
        best_model_id: best.map(|(_, m)| m.id),
        best_value: best.map(|(e, _)| from_error(e, maximize)),
        field_contributions: state.field_contributions.clone(),
        swarm_generations: state
            .swarms
            .iter()
            .filter(|(_, s)| s.status.is_terminal())
            .map(|(id, s)| (id.clone(), s.generation))
            .collect(),
        total_models: models.len(),
        errored_models: models
            .iter()
            .filter(|m| m.completion_reason == Some(CompletionReason::Error))
            .count(),
    }
}
