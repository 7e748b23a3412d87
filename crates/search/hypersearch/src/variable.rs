//! Particle variables: one tunable dimension of a particle
//!
//! Numeric variables (integer and float) follow the classic particle swarm
//! update: the velocity is pulled towards the particle's own best position and
//! the swarm's global best, then the position moves by the velocity, is kept
//! inside `[min, max]` and snapped to the step grid anchored at `min`.
//!
//! Categorical variables ignore the global best. They sample a choice with
//! probability proportional to the inverse of its mean observed error; in
//! fix-early mode the distribution is sharpened as evidence accumulates.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ParamValue;
use crate::error::{SearchError, SearchResult};

/// Inertia at the start of the default schedule
pub const INERTIA_START: f64 = 0.9;

/// Inertia at the end of the default schedule
pub const INERTIA_END: f64 = 0.4;

/// Updates over which the default inertia decays
pub const INERTIA_DECAY_UPDATES: u32 = 25;

/// Default cognitive (personal best) acceleration
pub const DEFAULT_COG_RATE: f64 = 1.0;

/// Default social (global best) acceleration
pub const DEFAULT_SOC_RATE: f64 = 1.0;

/// Default sharpening per result per choice in fix-early mode
pub const DEFAULT_FIX_EARLY_FACTOR: f64 = 1.0;

/// Smallest error used when inverting mean errors into weights
const MIN_ERROR: f64 = 1e-9;

/// Tolerance when comparing snapped positions with the upper bound
const GRID_EPSILON: f64 = 1e-9;

/// A position along one dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coordinate {
    Number(f64),
    Choice(usize),
}

impl Coordinate {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Coordinate::Number(v) => Some(*v),
            Coordinate::Choice(_) => None,
        }
    }

    pub fn as_choice(&self) -> Option<usize> {
        match self {
            Coordinate::Choice(i) => Some(*i),
            Coordinate::Number(_) => None,
        }
    }
}

/// Persistable convergence state of a variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    pub position: Coordinate,
    pub velocity: f64,
    pub best_position: Coordinate,
    pub best_result: Option<f64>,
    /// Number of position updates so far, drives the inertia schedule
    pub updates: u32,
}

/// Integer or float dimension
#[derive(Debug, Clone, PartialEq)]
pub struct NumericVariable {
    min: f64,
    max: f64,
    step: Option<f64>,
    integer: bool,
    inertia: Option<f64>,
    cog_rate: f64,
    soc_rate: f64,
    position: f64,
    velocity: f64,
    best_position: f64,
    best_result: Option<f64>,
    updates: u32,
}

impl NumericVariable {
    fn new(min: f64, max: f64, step: Option<f64>, integer: bool) -> SearchResult<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(SearchError::config(format!("bounds must be finite, got [{}, {}]", min, max)));
        }
        if min > max {
            return Err(SearchError::config(format!("min {} is greater than max {}", min, max)));
        }
        if let Some(step) = step {
            if !(step.is_finite() && step > 0.0) {
                return Err(SearchError::config(format!("step size must be positive, got {}", step)));
            }
        }
        Ok(Self {
            min,
            max,
            step,
            integer,
            inertia: None,
            cog_rate: DEFAULT_COG_RATE,
            soc_rate: DEFAULT_SOC_RATE,
            position: min,
            velocity: 0.0,
            best_position: min,
            best_result: None,
            updates: 0,
        })
    }

    fn snap(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        match self.step {
            None => clamped,
            Some(step) => {
                let mut snapped = self.min + ((clamped - self.min) / step).round() * step;
                if snapped > self.max + GRID_EPSILON {
                    snapped -= step;
                }
                snapped
            }
        }
    }

    fn inertia(&self) -> f64 {
        self.inertia.unwrap_or_else(|| scheduled_inertia(self.updates))
    }

    fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let span = self.max - self.min;
        self.position = self.snap(self.min + rng.gen::<f64>() * span);
        self.velocity = (rng.gen::<f64>() * 2.0 - 1.0) * span / 5.0;
        self.best_position = self.position;
    }

    fn new_position<R: Rng + ?Sized>(&mut self, global_best: Option<f64>, rng: &mut R) -> f64 {
        let global_best = global_best.unwrap_or(self.best_position);
        let r1: f64 = rng.gen();
        let r2: f64 = rng.gen();

        self.velocity = self.inertia() * self.velocity
            + self.cog_rate * r1 * (self.best_position - self.position)
            + self.soc_rate * r2 * (global_best - self.position);

        let mut next = self.position + self.velocity;
        if next < self.min {
            next = self.min;
            self.velocity = -self.velocity;
        } else if next > self.max {
            next = self.max;
            self.velocity = -self.velocity;
        }

        self.position = self.snap(next);
        self.updates = self.updates.saturating_add(1);
        self.position
    }
}

/// Linear inertia decay from [`INERTIA_START`] to [`INERTIA_END`]
pub fn scheduled_inertia(updates: u32) -> f64 {
    let progress = (updates as f64 / INERTIA_DECAY_UPDATES as f64).min(1.0);
    INERTIA_START - (INERTIA_START - INERTIA_END) * progress
}

/// Categorical dimension
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceVariable {
    choices: Vec<String>,
    fix_early: bool,
    fix_early_factor: f64,
    position: usize,
    best_position: usize,
    best_result: Option<f64>,
    updates: u32,
    results_per_choice: Vec<Vec<f64>>,
}

impl ChoiceVariable {
    fn new(choices: Vec<String>, fix_early: bool) -> SearchResult<Self> {
        if choices.is_empty() {
            return Err(SearchError::config("choice dimension needs at least one choice"));
        }
        let n = choices.len();
        Ok(Self {
            choices,
            fix_early,
            fix_early_factor: DEFAULT_FIX_EARLY_FACTOR,
            position: 0,
            best_position: 0,
            best_result: None,
            updates: 0,
            results_per_choice: vec![Vec::new(); n],
        })
    }

    /// Selection weight of every choice, normalized to sum to one
    pub fn distribution(&self) -> Vec<f64> {
        let means: Vec<Option<f64>> = self
            .results_per_choice
            .iter()
            .map(|r| {
                let finite: Vec<f64> = r.iter().copied().filter(|v| v.is_finite()).collect();
                if finite.is_empty() {
                    None
                } else {
                    Some(finite.iter().sum::<f64>() / finite.len() as f64)
                }
            })
            .collect();
        let total_results: usize = self
            .results_per_choice
            .iter()
            .map(|r| r.iter().filter(|v| v.is_finite()).count())
            .sum();

        let lowest = means.iter().flatten().copied().fold(f64::INFINITY, f64::min);
        let shift = if lowest.is_finite() && lowest <= 0.0 { 1.0 - lowest } else { 0.0 };

        let evaluated: Vec<Option<f64>> = means
            .iter()
            .map(|m| m.map(|m| 1.0 / (m + shift).max(MIN_ERROR)))
            .collect();
        let optimistic = evaluated.iter().flatten().copied().fold(0.0_f64, f64::max);
        let optimistic = if optimistic > 0.0 { optimistic } else { 1.0 };

        let mut weights: Vec<f64> = evaluated.iter().map(|w| w.unwrap_or(optimistic)).collect();
        let peak = weights.iter().copied().fold(0.0_f64, f64::max);
        if peak > 0.0 {
            for w in weights.iter_mut() {
                *w /= peak;
            }
        }

        if self.fix_early && total_results > 0 {
            let exponent = 1.0 + self.fix_early_factor * total_results as f64 / self.choices.len() as f64;
            for w in weights.iter_mut() {
                *w = w.powf(exponent);
            }
        }

        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / self.choices.len() as f64; self.choices.len()]
        }
    }

    fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.position = self.sample(rng);
        self.best_position = self.position;
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let distribution = self.distribution();
        let r: f64 = rng.gen();
        let mut cumulative = 0.0;
        for (idx, p) in distribution.iter().enumerate() {
            cumulative += p;
            if r < cumulative {
                return idx;
            }
        }
        distribution.len() - 1
    }

    fn new_position<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        self.position = self.sample(rng);
        self.updates = self.updates.saturating_add(1);
        self.position
    }
}

/// One tunable dimension of a particle
#[derive(Debug, Clone, PartialEq)]
pub enum ParticleVariable {
    Numeric(NumericVariable),
    Choice(ChoiceVariable),
}

impl ParticleVariable {
    /// Integer dimension over `[min, max]` with the given step
    pub fn int(min: i64, max: i64, step: i64) -> SearchResult<Self> {
        if step <= 0 {
            return Err(SearchError::config(format!("step size must be positive, got {}", step)));
        }
        Ok(ParticleVariable::Numeric(NumericVariable::new(
            min as f64,
            max as f64,
            Some(step as f64),
            true,
        )?))
    }

    /// Float dimension over `[min, max]`, quantized when `step` is set
    pub fn float(min: f64, max: f64, step: Option<f64>) -> SearchResult<Self> {
        Ok(ParticleVariable::Numeric(NumericVariable::new(min, max, step, false)?))
    }

    /// Categorical dimension
    pub fn choice(choices: Vec<String>, fix_early: bool) -> SearchResult<Self> {
        Ok(ParticleVariable::Choice(ChoiceVariable::new(choices, fix_early)?))
    }

    /// Override the update coefficients of a numeric variable
    pub fn with_coefficients(
        mut self,
        inertia: Option<f64>,
        cog_rate: Option<f64>,
        soc_rate: Option<f64>,
    ) -> SearchResult<Self> {
        for (name, value) in [("inertia", inertia), ("cog_rate", cog_rate), ("soc_rate", soc_rate)] {
            if let Some(v) = value {
                if !(v.is_finite() && v >= 0.0) {
                    return Err(SearchError::config(format!("{} must be a non-negative number, got {}", name, v)));
                }
            }
        }
        if let ParticleVariable::Numeric(var) = &mut self {
            var.inertia = inertia;
            var.cog_rate = cog_rate.unwrap_or(DEFAULT_COG_RATE);
            var.soc_rate = soc_rate.unwrap_or(DEFAULT_SOC_RATE);
        }
        Ok(self)
    }

    /// Place the variable at a random starting point
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        match self {
            ParticleVariable::Numeric(v) => v.randomize(rng),
            ParticleVariable::Choice(v) => v.randomize(rng),
        }
    }

    /// Current coordinate
    pub fn position(&self) -> Coordinate {
        match self {
            ParticleVariable::Numeric(v) => Coordinate::Number(v.position),
            ParticleVariable::Choice(v) => Coordinate::Choice(v.position),
        }
    }

    /// Current coordinate as a parameter value
    pub fn value(&self) -> ParamValue {
        match self {
            ParticleVariable::Numeric(v) if v.integer => ParamValue::Int(v.position.round() as i64),
            ParticleVariable::Numeric(v) => ParamValue::Float(v.position),
            ParticleVariable::Choice(v) => ParamValue::Choice(v.choices[v.position].clone()),
        }
    }

    /// Advance one update step and return the new coordinate
    pub fn new_position<R: Rng + ?Sized>(&mut self, global_best: Option<Coordinate>, rng: &mut R) -> Coordinate {
        match self {
            ParticleVariable::Numeric(v) => {
                Coordinate::Number(v.new_position(global_best.and_then(|c| c.as_number()), rng))
            }
            ParticleVariable::Choice(v) => Coordinate::Choice(v.new_position(rng)),
        }
    }

    /// Record the error obtained at the current position, updating the personal best
    pub fn record_result(&mut self, error: f64) {
        if !error.is_finite() {
            return;
        }
        match self {
            ParticleVariable::Numeric(v) => {
                if v.best_result.map_or(true, |best| error < best) {
                    v.best_result = Some(error);
                    v.best_position = v.position;
                }
            }
            ParticleVariable::Choice(v) => {
                if v.best_result.map_or(true, |best| error < best) {
                    v.best_result = Some(error);
                    v.best_position = v.position;
                }
            }
        }
    }

    /// Supply observed errors per choice value; ignored by numeric variables
    pub fn set_results_per_choice(&mut self, results: &BTreeMap<String, Vec<f64>>) {
        if let ParticleVariable::Choice(v) = self {
            v.results_per_choice = v
                .choices
                .iter()
                .map(|c| results.get(c).cloned().unwrap_or_default())
                .collect();
        }
    }

    pub fn state(&self) -> VariableState {
        match self {
            ParticleVariable::Numeric(v) => VariableState {
                position: Coordinate::Number(v.position),
                velocity: v.velocity,
                best_position: Coordinate::Number(v.best_position),
                best_result: v.best_result,
                updates: v.updates,
            },
            ParticleVariable::Choice(v) => VariableState {
                position: Coordinate::Choice(v.position),
                velocity: 0.0,
                best_position: Coordinate::Choice(v.best_position),
                best_result: v.best_result,
                updates: v.updates,
            },
        }
    }

    /// Restore a persisted state; coordinates are re-validated against the bounds
    pub fn set_state(&mut self, state: &VariableState) -> SearchResult<()> {
        match self {
            ParticleVariable::Numeric(v) => {
                let (Some(position), Some(best)) = (state.position.as_number(), state.best_position.as_number()) else {
                    return Err(SearchError::config("numeric variable given a choice state"));
                };
                v.position = v.snap(position);
                v.best_position = v.snap(best);
                v.velocity = if state.velocity.is_finite() { state.velocity } else { 0.0 };
            }
            ParticleVariable::Choice(v) => {
                let (Some(position), Some(best)) = (state.position.as_choice(), state.best_position.as_choice()) else {
                    return Err(SearchError::config("choice variable given a numeric state"));
                };
                if position >= v.choices.len() || best >= v.choices.len() {
                    return Err(SearchError::config(format!(
                        "choice index out of range for {} choices",
                        v.choices.len()
                    )));
                }
                v.position = position;
                v.best_position = best;
            }
        }
        match self {
            ParticleVariable::Numeric(v) => {
                v.best_result = state.best_result;
                v.updates = state.updates;
            }
            ParticleVariable::Choice(v) => {
                v.best_result = state.best_result;
                v.updates = state.updates;
            }
        }
        Ok(())
    }
}
