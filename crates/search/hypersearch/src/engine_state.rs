//! Versioned swarm engine state shared by every worker through the job store
//!
//! The state records sprints, swarms and the branching decisions taken so far.
//! [`SwarmEngineState::advance`] is a pure function of the previous state, the
//! job configuration and the list of models: any worker may compute it and
//! the store's version check decides whose write lands.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::branching;
use crate::config::SearchConfig;
use crate::maturity;
use crate::types::{Model, ModelId, SwarmId, SwarmStatus};

/// Lifecycle status of a sprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Active,
    Completed,
}

/// One sprint: a set of swarms of the same combination size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintState {
    pub index: usize,
    pub status: SprintStatus,
    pub winner: Option<SwarmId>,
    pub best_error: Option<f64>,
    pub best_model: Option<ModelId>,
}

impl SprintState {
    fn new(index: usize) -> Self {
        Self {
            index,
            status: SprintStatus::Active,
            winner: None,
            best_error: None,
            best_model: None,
        }
    }
}

/// Bookkeeping for one swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmState {
    pub sprint: usize,
    pub status: SwarmStatus,
    /// Created ahead of its sprint and not yet confirmed by the branching policy
    pub speculative: bool,
    /// No new models are created; the swarm completes once its running models drain
    pub matured: bool,
    /// Fully completed generations
    pub generation: u32,
    /// Best error of every completed generation
    pub generation_bests: Vec<f64>,
    pub best_model: Option<ModelId>,
    pub best_error: Option<f64>,
    /// Improvement over the sprint-0 baseline, in percent
    pub contribution: Option<f64>,
}

impl SwarmState {
    pub(crate) fn new(sprint: usize, speculative: bool) -> Self {
        Self {
            sprint,
            status: SwarmStatus::Active,
            speculative,
            matured: false,
            generation: 0,
            generation_bests: Vec::new(),
            best_model: None,
            best_error: None,
            contribution: None,
        }
    }
}

/// Something that changed while advancing the state, for logging
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SprintStarted { sprint: usize, swarms: Vec<SwarmId> },
    SwarmMatured { swarm: SwarmId, generations: u32, best_error: Option<f64> },
    SwarmCompleted { swarm: SwarmId },
    SwarmKilled { swarm: SwarmId },
    SpeculationStarted { leader: SwarmId, swarms: Vec<SwarmId> },
    SwarmPromoted { swarm: SwarmId },
    SprintCompleted { sprint: usize, winner: SwarmId, best_error: f64 },
    FieldsBlacklisted { fields: Vec<String> },
    SearchFinished { reason: String },
}

/// Versioned state of the swarming engine for one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmEngineState {
    /// Bumped by the store on every successful write
    pub version: u64,
    pub initialized: bool,
    pub sprints: Vec<SprintState>,
    pub swarms: BTreeMap<SwarmId, SwarmState>,
    /// Best error of sprint 0, the reference for contributions
    pub baseline_error: Option<f64>,
    pub field_contributions: BTreeMap<String, f64>,
    pub blacklisted_fields: BTreeSet<String>,
    /// Leader whose extensions are being explored speculatively
    pub speculative_leader: Option<SwarmId>,
    pub search_over: bool,
    pub stop_reason: Option<String>,
}

impl SwarmEngineState {
    /// Index of the sprint currently running
    pub fn current_sprint(&self) -> Option<usize> {
        self.sprints
            .iter()
            .rev()
            .find(|s| s.status == SprintStatus::Active)
            .map(|s| s.index)
    }

    pub fn swarm(&self, id: &SwarmId) -> Option<&SwarmState> {
        self.swarms.get(id)
    }

    /// Swarms that may receive new models right now
    pub fn schedulable_swarms(&self) -> Vec<&SwarmId> {
        self.swarms
            .iter()
            .filter(|(id, s)| {
                s.status == SwarmStatus::Active
                    && !s.matured
                    && (!s.speculative || self.extends_leader(id))
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Swarms still active, speculative ones included
    pub fn active_swarm_count(&self) -> usize {
        self.swarms.values().filter(|s| s.status == SwarmStatus::Active).count()
    }

    fn extends_leader(&self, id: &SwarmId) -> bool {
        self.speculative_leader
            .as_ref()
            .map_or(false, |leader| leader.fields().iter().all(|f| id.contains(f)))
    }

    /// Whether a model scoring `error` would be its swarm's best so far
    pub fn is_swarm_best(&self, id: &SwarmId, error: f64) -> bool {
        self.swarms
            .get(id)
            .and_then(|s| s.best_error)
            .map_or(true, |best| error <= best)
    }

    /// Compute the next state from the current models of the job
    pub fn advance(&self, config: &SearchConfig, models: &[Model]) -> (SwarmEngineState, Vec<EngineEvent>) {
        let mut next = self.clone();
        let mut events = Vec::new();

        if !next.initialized {
            next.initialize(config, &mut events);
        }
        if next.search_over {
            return (next, events);
        }

        let mut by_swarm: BTreeMap<&SwarmId, Vec<&Model>> = BTreeMap::new();
        for model in models {
            by_swarm.entry(&model.params.swarm_id).or_default().push(model);
        }

        next.update_swarms(config, &by_swarm, &mut events);
        while next.conclude_sprint(config, &mut events) {
            next.update_swarms(config, &by_swarm, &mut events);
        }
        next.speculate(config, &by_swarm, &mut events);
        (next, events)
    }

    fn initialize(&mut self, config: &SearchConfig, events: &mut Vec<EngineEvent>) {
        let swarms = branching::initial_swarms(&config.space.field_names());
        for id in &swarms {
            self.swarms.insert(id.clone(), SwarmState::new(0, false));
        }
        self.sprints.push(SprintState::new(0));
        self.initialized = true;
        events.push(EngineEvent::SprintStarted { sprint: 0, swarms });
    }

    fn update_swarms(
        &mut self,
        config: &SearchConfig,
        by_swarm: &BTreeMap<&SwarmId, Vec<&Model>>,
        events: &mut Vec<EngineEvent>,
    ) {
        let particles = config.min_particles_per_swarm;
        let maximize = config.optimize.maximize;

        for (id, swarm) in self.swarms.iter_mut() {
            if swarm.status != SwarmStatus::Active {
                continue;
            }
            let models = by_swarm.get(id).map(Vec::as_slice).unwrap_or(&[]);

            let mut generations: BTreeMap<u32, (BTreeSet<usize>, Option<f64>)> = BTreeMap::new();
            let mut best: Option<(f64, ModelId)> = None;
            let mut terminal = 0usize;
            let mut running = 0usize;
            for model in models {
                let error = model.error_score(maximize);
                if let Some(e) = error {
                    if best.map_or(true, |(b, bid)| e < b || (e == b && model.id < bid)) {
                        best = Some((e, model.id));
                    }
                }
                if model.is_running() {
                    running += 1;
                    continue;
                }
                terminal += 1;
                let entry = generations.entry(model.params.generation).or_default();
                entry.0.insert(model.params.particle_index);
                if let Some(e) = error {
                    entry.1 = Some(entry.1.map_or(e, |b: f64| b.min(e)));
                }
            }

            let mut bests = Vec::new();
            for generation in 0.. {
                match generations.get(&generation) {
                    Some((done, gen_best)) if done.len() >= particles => {
                        bests.push(gen_best.unwrap_or(f64::INFINITY));
                    }
                    _ => break,
                }
            }
            swarm.generation = bests.len() as u32;
            swarm.generation_bests = bests;
            swarm.best_error = best.map(|(e, _)| e);
            swarm.best_model = best.map(|(_, id)| id);
            if let Some(baseline) = self.baseline_error {
                swarm.contribution = swarm.best_error.map(|e| branching::contribution(baseline, e));
            }

            if !swarm.matured
                && terminal >= particles
                && (swarm.generation >= config.max_swarm_generations
                    || maturity::swarm_is_mature(
                        &swarm.generation_bests,
                        config.swarm_maturity_window,
                        config.maturity_max_slope,
                    ))
            {
                swarm.matured = true;
                events.push(EngineEvent::SwarmMatured {
                    swarm: id.clone(),
                    generations: swarm.generation,
                    best_error: swarm.best_error,
                });
            }
            if swarm.matured && running == 0 {
                swarm.status = SwarmStatus::Completed;
                events.push(EngineEvent::SwarmCompleted { swarm: id.clone() });
            }
        }
    }

    /// Close the current sprint once all of its swarms are done; true when something changed
    fn conclude_sprint(&mut self, config: &SearchConfig, events: &mut Vec<EngineEvent>) -> bool {
        let Some(k) = self.current_sprint() else {
            return false;
        };
        let members: Vec<(&SwarmId, &SwarmState)> = self
            .swarms
            .iter()
            .filter(|(_, s)| s.sprint == k && !s.speculative)
            .collect();
        if members.iter().any(|(_, s)| s.status == SwarmStatus::Active) {
            return false;
        }

        let winner = branching::pick_winner(
            members
                .iter()
                .filter(|(_, s)| s.status == SwarmStatus::Completed)
                .filter_map(|(id, s)| s.best_error.map(|e| (*id, e))),
        );
        self.sprints[k].status = SprintStatus::Completed;

        let Some((winner, best_error)) = winner else {
            self.finish(format!("no swarm in sprint {} produced a scored model", k), events);
            return true;
        };
        let best_model = self.swarms.get(&winner).and_then(|s| s.best_model);
        self.sprints[k].winner = Some(winner.clone());
        self.sprints[k].best_error = Some(best_error);
        self.sprints[k].best_model = best_model;
        events.push(EngineEvent::SprintCompleted {
            sprint: k,
            winner: winner.clone(),
            best_error,
        });

        if k == 0 {
            self.baseline_error = Some(best_error);
        }
        if let Some(baseline) = self.baseline_error {
            for swarm in self.swarms.values_mut().filter(|s| s.sprint == k && !s.speculative) {
                swarm.contribution = swarm.best_error.map(|e| branching::contribution(baseline, e));
            }
        }
        if k == 1 {
            self.record_field_contributions(config, events);
        }

        if k >= 1 {
            let previous = self.sprints[k - 1].best_error;
            if previous.map_or(false, |p| best_error >= p) {
                self.finish(format!("sprint {} did not improve on sprint {}", k, k - 1), events);
                return true;
            }
        }

        let next_ids = branching::next_swarms(
            &winner,
            &config.space.field_names(),
            &self.field_contributions,
            &self.blacklisted_fields,
            config.max_field_branching,
        );
        if next_ids.is_empty() {
            self.finish(format!("no fields left to add after sprint {}", k), events);
            return true;
        }

        let next_set: BTreeSet<&SwarmId> = next_ids.iter().collect();
        for (id, swarm) in self.swarms.iter_mut() {
            if swarm.sprint != k + 1 || !swarm.speculative {
                continue;
            }
            if next_set.contains(id) {
                swarm.speculative = false;
                events.push(EngineEvent::SwarmPromoted { swarm: id.clone() });
            } else if swarm.status != SwarmStatus::Killed {
                swarm.status = SwarmStatus::Killed;
                events.push(EngineEvent::SwarmKilled { swarm: id.clone() });
            }
        }
        for id in &next_ids {
            self.swarms
                .entry(id.clone())
                .or_insert_with(|| SwarmState::new(k + 1, false));
        }
        self.sprints.push(SprintState::new(k + 1));
        self.speculative_leader = None;
        events.push(EngineEvent::SprintStarted {
            sprint: k + 1,
            swarms: next_ids,
        });
        true
    }

    /// Attribute each sprint-1 swarm's contribution to the field it added
    fn record_field_contributions(&mut self, config: &SearchConfig, events: &mut Vec<EngineEvent>) {
        let Some(base) = self.sprints.first().and_then(|s| s.winner.clone()) else {
            return;
        };
        for (id, swarm) in self.swarms.iter().filter(|(_, s)| s.sprint == 1 && !s.speculative) {
            let added: Vec<&str> = id.fields().into_iter().filter(|f| !base.contains(f)).collect();
            if let ([field], Some(contribution)) = (added.as_slice(), swarm.contribution) {
                self.field_contributions.insert(field.to_string(), contribution);
            }
        }
        let blacklisted = branching::blacklist(&self.field_contributions, config.min_field_contribution);
        if !blacklisted.is_empty() {
            events.push(EngineEvent::FieldsBlacklisted {
                fields: blacklisted.iter().cloned().collect(),
            });
        }
        self.blacklisted_fields = blacklisted;
    }

    fn finish(&mut self, reason: String, events: &mut Vec<EngineEvent>) {
        for (id, swarm) in self.swarms.iter_mut() {
            if swarm.speculative && swarm.status != SwarmStatus::Killed {
                swarm.status = SwarmStatus::Killed;
                events.push(EngineEvent::SwarmKilled { swarm: id.clone() });
            }
        }
        self.speculative_leader = None;
        self.search_over = true;
        self.stop_reason = Some(reason.clone());
        events.push(EngineEvent::SearchFinished { reason });
    }

    /// Start the current leader's next-sprint swarms once every active swarm
    /// has a full generation of results
    fn speculate(
        &mut self,
        config: &SearchConfig,
        by_swarm: &BTreeMap<&SwarmId, Vec<&Model>>,
        events: &mut Vec<EngineEvent>,
    ) {
        if !config.speculative_swarms || self.search_over {
            return;
        }
        let Some(k) = self.current_sprint() else {
            return;
        };
        let members: Vec<(&SwarmId, &SwarmState)> = self
            .swarms
            .iter()
            .filter(|(_, s)| s.sprint == k && !s.speculative)
            .collect();
        let ready = members.iter().all(|(id, s)| {
            s.status != SwarmStatus::Active
                || by_swarm
                    .get(*id)
                    .map_or(0, |ms| ms.iter().filter(|m| !m.is_running()).count())
                    >= config.min_particles_per_swarm
        });
        if !ready {
            return;
        }
        let leader = branching::pick_winner(
            members
                .iter()
                .filter(|(_, s)| s.status != SwarmStatus::Killed)
                .filter_map(|(id, s)| s.best_error.map(|e| (*id, e))),
        );
        let Some((leader, _)) = leader else {
            return;
        };
        if self.speculative_leader.as_ref() == Some(&leader) {
            return;
        }

        let desired = branching::next_swarms(
            &leader,
            &config.space.field_names(),
            &self.field_contributions,
            &self.blacklisted_fields,
            config.max_field_branching,
        );
        let mut created = Vec::new();
        for id in desired {
            if !self.swarms.contains_key(&id) {
                self.swarms.insert(id.clone(), SwarmState::new(k + 1, true));
                created.push(id);
            }
        }
        self.speculative_leader = Some(leader.clone());
        events.push(EngineEvent::SpeculationStarted { leader, swarms: created });
    }
}
