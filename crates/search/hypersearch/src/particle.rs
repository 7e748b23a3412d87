//! Particles: named points in a swarm's search space
//!
//! A particle holds one [`ParticleVariable`] per non-fixed dimension of its
//! swarm. Its whole state is embedded in every model it produces, so any
//! worker can continue the particle from the job store alone.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{ParamValue, SearchDimension, SearchSpace};
use crate::error::{SearchError, SearchResult};
use crate::types::{ModelParams, SwarmId};
use crate::variable::{Coordinate, ParticleVariable, VariableState};

/// Persisted state of a particle at one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleState {
    pub swarm_id: SwarmId,
    pub index: usize,
    pub generation: u32,
    pub best_result: Option<f64>,
    pub variables: BTreeMap<String, VariableState>,
}

/// One member of a swarm's population
#[derive(Debug, Clone)]
pub struct Particle {
    swarm_id: SwarmId,
    index: usize,
    generation: u32,
    best_result: Option<f64>,
    variables: BTreeMap<String, ParticleVariable>,
    fixed: BTreeMap<String, serde_json::Value>,
}

impl Particle {
    /// Create particle `index` of `swarm_id` at a random generation-0 position
    pub fn new(space: &SearchSpace, swarm_id: SwarmId, index: usize, seed: u64) -> SearchResult<Self> {
        let mut particle = Self::skeleton(space, swarm_id, index)?;
        let mut rng = proposal_rng(seed, &particle.swarm_id, index, 0);
        for variable in particle.variables.values_mut() {
            variable.randomize(&mut rng);
        }
        Ok(particle)
    }

    /// Rebuild a particle from a persisted state
    pub fn from_state(space: &SearchSpace, state: &ParticleState) -> SearchResult<Self> {
        let mut particle = Self::skeleton(space, state.swarm_id.clone(), state.index)?;
        particle.generation = state.generation;
        particle.best_result = state.best_result;
        for (name, variable) in particle.variables.iter_mut() {
            let var_state = state.variables.get(name).ok_or_else(|| {
                SearchError::config(format!("particle state of swarm {} lacks variable '{}'", state.swarm_id, name))
            })?;
            variable.set_state(var_state)?;
        }
        Ok(particle)
    }

    fn skeleton(space: &SearchSpace, swarm_id: SwarmId, index: usize) -> SearchResult<Self> {
        let mut variables = BTreeMap::new();
        let mut fixed = BTreeMap::new();
        for (name, dim) in space.dimensions_for(&swarm_id)? {
            match dim {
                SearchDimension::Fixed { value } => {
                    fixed.insert(name, value.clone());
                }
                other => {
                    if let Some(variable) = other.to_variable()? {
                        variables.insert(name, variable);
                    }
                }
            }
        }
        Ok(Self {
            swarm_id,
            index,
            generation: 0,
            best_result: None,
            variables,
            fixed,
        })
    }

    pub fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn best_result(&self) -> Option<f64> {
        self.best_result
    }

    /// Current coordinate of every variable
    pub fn position(&self) -> BTreeMap<String, Coordinate> {
        self.variables.iter().map(|(k, v)| (k.clone(), v.position())).collect()
    }

    /// Record the error of the model evaluated at the current position
    pub fn record_result(&mut self, error: f64) {
        if !error.is_finite() {
            return;
        }
        if self.best_result.map_or(true, |best| error < best) {
            self.best_result = Some(error);
        }
        for variable in self.variables.values_mut() {
            variable.record_result(error);
        }
    }

    /// Supply per-choice errors observed in the swarm, keyed by variable name
    pub fn set_results_per_choice(&mut self, results: &BTreeMap<String, BTreeMap<String, Vec<f64>>>) {
        for (name, variable) in self.variables.iter_mut() {
            if let Some(per_choice) = results.get(name) {
                variable.set_results_per_choice(per_choice);
            }
        }
    }

    /// Move to the next generation, pulled towards the swarm's global best
    pub fn evolve(&mut self, global_best: &BTreeMap<String, Coordinate>, seed: u64) {
        let next = self.generation + 1;
        let mut rng = proposal_rng(seed, &self.swarm_id, self.index, next);
        for (name, variable) in self.variables.iter_mut() {
            variable.new_position(global_best.get(name).copied(), &mut rng);
        }
        self.generation = next;
    }

    pub fn state(&self) -> ParticleState {
        ParticleState {
            swarm_id: self.swarm_id.clone(),
            index: self.index,
            generation: self.generation,
            best_result: self.best_result,
            variables: self.variables.iter().map(|(k, v)| (k.clone(), v.state())).collect(),
        }
    }

    /// Resolved value of every dimension, fixed ones included
    pub fn values(&self) -> BTreeMap<String, ParamValue> {
        let mut values: BTreeMap<String, ParamValue> =
            self.variables.iter().map(|(k, v)| (k.clone(), v.value())).collect();
        for (name, value) in &self.fixed {
            values.insert(name.clone(), ParamValue::Fixed(value.clone()));
        }
        values
    }

    /// Parameters of the model evaluating this particle's current position
    pub fn to_model_params(&self, predicted_field: &str) -> ModelParams {
        ModelParams {
            swarm_id: self.swarm_id.clone(),
            particle_index: self.index,
            generation: self.generation,
            predicted_field: predicted_field.to_string(),
            particle: self.state(),
            values: self.values(),
        }
    }
}

/// Deterministic RNG for one swarm slot, identical on every worker
pub fn proposal_rng(seed: u64, swarm_id: &SwarmId, index: usize, generation: u32) -> StdRng {
    // FNV-1a over swarm id, particle index and generation
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ seed;
    let bytes = swarm_id
        .as_str()
        .bytes()
        .chain((index as u64).to_le_bytes())
        .chain(generation.to_le_bytes());
    for byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    StdRng::seed_from_u64(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .with_field("gym", [("n", SearchDimension::int(1, 50, 1))])
            .with_field("address", [("kind", SearchDimension::choice(["street", "city", "zip"], true))])
            .with_model_param("alpha", SearchDimension::float(0.0, 1.0, None))
            .with_model_param("clip", SearchDimension::fixed(false))
    }

    #[test]
    fn test_new_particle_covers_swarm_dimensions() {
        let particle = Particle::new(&space(), SwarmId::from("gym"), 0, 42).unwrap();
        let position = particle.position();
        assert_eq!(position.keys().collect::<Vec<_>>(), vec!["gym:n", "model:alpha"]);
        let values = particle.values();
        assert_eq!(values["model:clip"], ParamValue::Fixed(serde_json::json!(false)));
        assert!(matches!(values["gym:n"], ParamValue::Int(n) if (1..=50).contains(&n)));
    }

    #[test]
    fn test_same_slot_gives_same_proposal() {
        let a = Particle::new(&space(), SwarmId::from("address.gym"), 3, 7).unwrap();
        let b = Particle::new(&space(), SwarmId::from("address.gym"), 3, 7).unwrap();
        assert_eq!(a.state(), b.state());
        let c = Particle::new(&space(), SwarmId::from("address.gym"), 4, 7).unwrap();
        assert_ne!(a.state(), c.state());
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let space = space();
        let mut original = Particle::new(&space, SwarmId::from("gym"), 1, 5).unwrap();
        original.record_result(0.4);
        let restored_state = original.state();
        let mut restored = Particle::from_state(&space, &restored_state).unwrap();

        let target = BTreeMap::from([("gym:n".to_string(), Coordinate::Number(25.0))]);
        original.evolve(&target, 5);
        restored.evolve(&target, 5);
        assert_eq!(original.state(), restored.state());
        assert_eq!(restored.generation(), 1);
        assert_eq!(restored.best_result(), Some(0.4));
    }

    #[test]
    fn test_record_result_keeps_lowest_error() {
        let mut particle = Particle::new(&space(), SwarmId::from("gym"), 0, 1).unwrap();
        particle.record_result(0.5);
        particle.record_result(0.9);
        particle.record_result(f64::NAN);
        assert_eq!(particle.best_result(), Some(0.5));
        particle.record_result(0.2);
        assert_eq!(particle.best_result(), Some(0.2));
    }

    #[test]
    fn test_from_state_rejects_missing_variables() {
        let space = space();
        let mut state = Particle::new(&space, SwarmId::from("gym"), 0, 1).unwrap().state();
        state.variables.remove("gym:n");
        assert!(Particle::from_state(&space, &state).is_err());
    }

    #[test]
    fn test_model_params_name_the_slot() {
        let particle = Particle::new(&space(), SwarmId::from("gym"), 2, 1).unwrap();
        let params = particle.to_model_params("consumption");
        assert_eq!(params.slot_key(), "gym#2#0");
        assert_eq!(params.predicted_field, "consumption");
        assert_eq!(params.particle, particle.state());
    }
}
