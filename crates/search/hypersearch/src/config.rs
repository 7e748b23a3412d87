//! Search configuration: the parameter space and the swarming options
//!
//! A [`SearchConfig`] is supplied once per job and stored with it. Every
//! tunable has a default; [`SearchConfig::validate`] rejects bad ranges before
//! the job is inserted so configuration mistakes never reach a worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{SearchError, SearchResult};
use crate::types::{SwarmId, SWARM_FIELD_SEPARATOR};
use crate::variable::ParticleVariable;

/// Prefix of dimension keys belonging to model-wide parameters
pub const MODEL_PARAM_PREFIX: &str = "model";

fn default_int_step() -> i64 {
    1
}

/// One node of the parameter tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchDimension {
    /// A value that is passed through unchanged
    Fixed { value: serde_json::Value },
    /// Integer range searched by a particle
    IntRange {
        min: i64,
        max: i64,
        #[serde(default = "default_int_step")]
        step: i64,
        #[serde(default)]
        inertia: Option<f64>,
        #[serde(default)]
        cog_rate: Option<f64>,
        #[serde(default)]
        soc_rate: Option<f64>,
    },
    /// Float range searched by a particle, optionally quantized
    FloatRange {
        min: f64,
        max: f64,
        #[serde(default)]
        step: Option<f64>,
        #[serde(default)]
        inertia: Option<f64>,
        #[serde(default)]
        cog_rate: Option<f64>,
        #[serde(default)]
        soc_rate: Option<f64>,
    },
    /// Categorical choice
    Choice {
        choices: Vec<String>,
        #[serde(default)]
        fix_early: bool,
    },
}

impl SearchDimension {
    pub fn int(min: i64, max: i64, step: i64) -> Self {
        SearchDimension::IntRange {
            min,
            max,
            step,
            inertia: None,
            cog_rate: None,
            soc_rate: None,
        }
    }

    pub fn float(min: f64, max: f64, step: Option<f64>) -> Self {
        SearchDimension::FloatRange {
            min,
            max,
            step,
            inertia: None,
            cog_rate: None,
            soc_rate: None,
        }
    }

    pub fn choice<I, S>(choices: I, fix_early: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SearchDimension::Choice {
            choices: choices.into_iter().map(Into::into).collect(),
            fix_early,
        }
    }

    pub fn fixed(value: impl Into<serde_json::Value>) -> Self {
        SearchDimension::Fixed { value: value.into() }
    }

    /// Build the particle variable for this dimension, `None` for fixed values
    pub fn to_variable(&self) -> SearchResult<Option<ParticleVariable>> {
        let variable = match self {
            SearchDimension::Fixed { .. } => return Ok(None),
            SearchDimension::IntRange {
                min,
                max,
                step,
                inertia,
                cog_rate,
                soc_rate,
            } => ParticleVariable::int(*min, *max, *step)?.with_coefficients(*inertia, *cog_rate, *soc_rate)?,
            SearchDimension::FloatRange {
                min,
                max,
                step,
                inertia,
                cog_rate,
                soc_rate,
            } => ParticleVariable::float(*min, *max, *step)?.with_coefficients(*inertia, *cog_rate, *soc_rate)?,
            SearchDimension::Choice { choices, fix_early } => {
                ParticleVariable::choice(choices.clone(), *fix_early)?
            }
        };
        Ok(Some(variable))
    }
}

/// A resolved parameter value handed to the evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Choice(String),
    Fixed(serde_json::Value),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Fixed(v) => v.as_f64(),
            ParamValue::Choice(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Choice(s) => Some(s),
            ParamValue::Fixed(v) => v.as_str(),
            _ => None,
        }
    }
}

/// Candidate encoders per field plus model-wide parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    /// Encoder parameters of every candidate field
    pub fields: BTreeMap<String, BTreeMap<String, SearchDimension>>,
    /// Parameters shared by every swarm
    #[serde(default)]
    pub model: BTreeMap<String, SearchDimension>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate field with its encoder parameters
    pub fn with_field<I, S>(mut self, field: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (S, SearchDimension)>,
        S: Into<String>,
    {
        self.fields.insert(
            field.to_string(),
            params.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        );
        self
    }

    /// Add a model-wide parameter
    pub fn with_model_param(mut self, name: &str, dimension: SearchDimension) -> Self {
        self.model.insert(name.to_string(), dimension);
        self
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// All dimensions searched by `swarm`, keyed `model:<param>` / `<field>:<param>`
    pub fn dimensions_for(&self, swarm: &SwarmId) -> SearchResult<BTreeMap<String, &SearchDimension>> {
        let mut dims = BTreeMap::new();
        for (name, dim) in &self.model {
            dims.insert(format!("{}:{}", MODEL_PARAM_PREFIX, name), dim);
        }
        for field in swarm.fields() {
            let params = self
                .fields
                .get(field)
                .ok_or_else(|| SearchError::config(format!("swarm {} names unknown field '{}'", swarm, field)))?;
            for (name, dim) in params {
                dims.insert(format!("{}:{}", field, name), dim);
            }
        }
        Ok(dims)
    }

    pub fn validate(&self) -> SearchResult<()> {
        if self.fields.is_empty() {
            return Err(SearchError::config("search space has no candidate fields"));
        }
        for (field, params) in &self.fields {
            if field.is_empty() || field.contains(SWARM_FIELD_SEPARATOR) || field.contains(':') {
                return Err(SearchError::config(format!(
                    "field name '{}' must be non-empty and contain neither '{}' nor ':'",
                    field, SWARM_FIELD_SEPARATOR
                )));
            }
            if field == MODEL_PARAM_PREFIX {
                return Err(SearchError::config(format!("'{}' is reserved", MODEL_PARAM_PREFIX)));
            }
            for (name, dim) in params {
                dim.to_variable()
                    .map_err(|e| SearchError::config(format!("{}:{}: {}", field, name, e)))?;
            }
        }
        for (name, dim) in &self.model {
            dim.to_variable()
                .map_err(|e| SearchError::config(format!("{}:{}: {}", MODEL_PARAM_PREFIX, name, e)))?;
        }
        Ok(())
    }
}

/// Metric to optimize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeMetric {
    pub metric: String,
    #[serde(default)]
    pub maximize: bool,
}

impl Default for OptimizeMetric {
    fn default() -> Self {
        Self {
            metric: "error".to_string(),
            maximize: false,
        }
    }
}

/// Configuration of one search job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub space: SearchSpace,
    /// Field the model predicts
    pub predicted_field: String,
    pub optimize: OptimizeMetric,
    /// Cap on the number of models created, `None` for unlimited
    pub max_models: Option<usize>,
    /// Particles per swarm; also the completed models needed before maturity is assessed
    pub min_particles_per_swarm: usize,
    /// Maximum fields in one combination, 0 for unlimited
    pub max_field_branching: usize,
    /// Fields contributing less than this percentage are excluded after sprint 1
    pub min_field_contribution: f64,
    /// Generations examined by the maturity test
    pub swarm_maturity_window: usize,
    /// Relative slope below which a best-score curve counts as flat
    pub maturity_max_slope: f64,
    /// Hard cap on generations per swarm
    pub max_swarm_generations: u32,
    /// Seconds without progress after which a running model is an orphan
    pub model_orphan_interval_secs: f64,
    /// Adoptions allowed before an orphan is retired as `orphaned`
    pub max_orphan_restarts: u32,
    /// Start the next sprint's likely swarms before the current sprint ends
    pub speculative_swarms: bool,
    /// Evolve a particle as soon as its own model finishes
    pub speculative_particles: bool,
    /// Stop long-tail models whose own score has flattened
    pub model_maturity: bool,
    pub model_maturity_window: usize,
    /// Records between progressive score samples
    pub model_maturity_check_interval: u64,
    /// Evaluator steps between progress writes
    pub progress_update_interval: u64,
    /// Errored models tolerated before the job fails
    pub max_error_models: Option<usize>,
    /// Fraction of `max_models` tolerated as errors when `max_error_models` is unset
    pub max_error_fraction: f64,
    /// Tolerate any number of errored models
    pub ignore_err_models: bool,
    /// Seed for every particle proposal
    pub seed: u64,
    /// Idle time between polls when no model is available
    pub worker_poll_interval_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            space: SearchSpace::default(),
            predicted_field: String::new(),
            optimize: OptimizeMetric::default(),
            max_models: None,
            min_particles_per_swarm: 5,
            max_field_branching: 0,
            min_field_contribution: 0.0,
            swarm_maturity_window: 5,
            maturity_max_slope: 0.005,
            max_swarm_generations: 20,
            model_orphan_interval_secs: 300.0,
            max_orphan_restarts: 3,
            speculative_swarms: true,
            speculative_particles: false,
            model_maturity: false,
            model_maturity_window: 10,
            model_maturity_check_interval: 10,
            progress_update_interval: 1,
            max_error_models: None,
            max_error_fraction: 0.5,
            ignore_err_models: false,
            seed: 42,
            worker_poll_interval_ms: 500,
        }
    }
}

impl SearchConfig {
    /// Configuration over `space` predicting `predicted_field`, defaults elsewhere
    pub fn new(space: SearchSpace, predicted_field: &str) -> Self {
        Self {
            space,
            predicted_field: predicted_field.to_string(),
            ..Default::default()
        }
    }

    /// Load a configuration file (TOML, JSON or YAML by extension)
    pub fn from_file<P: AsRef<Path>>(path: P) -> SearchResult<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| SearchError::config(format!("failed to read {}: {}", path.display(), e)))?;
        let search: SearchConfig = settings
            .try_deserialize()
            .map_err(|e| SearchError::config(format!("failed to parse {}: {}", path.display(), e)))?;
        search.validate()?;
        Ok(search)
    }

    pub fn validate(&self) -> SearchResult<()> {
        self.space.validate()?;
        if self.predicted_field.is_empty() {
            return Err(SearchError::config("predicted_field must be set"));
        }
        if self.optimize.metric.is_empty() {
            return Err(SearchError::config("optimize.metric must be set"));
        }
        if self.min_particles_per_swarm == 0 {
            return Err(SearchError::config("min_particles_per_swarm must be at least 1"));
        }
        if matches!(self.max_models, Some(0)) {
            return Err(SearchError::config("max_models must be positive when set"));
        }
        if self.swarm_maturity_window < 2 {
            return Err(SearchError::config("swarm_maturity_window must be at least 2"));
        }
        if self.model_maturity && self.model_maturity_window < 2 {
            return Err(SearchError::config("model_maturity_window must be at least 2"));
        }
        if !(self.maturity_max_slope.is_finite() && self.maturity_max_slope >= 0.0) {
            return Err(SearchError::config("maturity_max_slope must be a non-negative number"));
        }
        if self.max_swarm_generations == 0 {
            return Err(SearchError::config("max_swarm_generations must be at least 1"));
        }
        if !(self.model_orphan_interval_secs.is_finite() && self.model_orphan_interval_secs > 0.0) {
            return Err(SearchError::config("model_orphan_interval_secs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.max_error_fraction) {
            return Err(SearchError::config("max_error_fraction must lie in [0, 1]"));
        }
        if self.progress_update_interval == 0 || self.model_maturity_check_interval == 0 {
            return Err(SearchError::config("progress and maturity intervals must be positive"));
        }
        Ok(())
    }

    pub fn orphan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.model_orphan_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    /// Number of errored models tolerated, `None` when unlimited
    pub fn error_budget(&self) -> Option<usize> {
        if self.ignore_err_models {
            return None;
        }
        if let Some(max) = self.max_error_models {
            return Some(max);
        }
        self.max_models
            .map(|max| (self.max_error_fraction * max as f64).ceil() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .with_field("gym", [("n", SearchDimension::int(10, 100, 10))])
            .with_field(
                "timestamp",
                [
                    ("radius", SearchDimension::float(0.5, 4.0, None)),
                    ("kind", SearchDimension::choice(["dayOfWeek", "timeOfDay"], false)),
                ],
            )
            .with_model_param("alpha", SearchDimension::float(0.0, 1.0, Some(0.05)))
            .with_model_param("clipInput", SearchDimension::fixed(true))
    }

    #[test]
    fn test_default_config_needs_a_space() {
        let err = SearchConfig::default().validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(SearchConfig::new(space(), "consumption").validate().is_ok());
    }

    #[test]
    fn test_bad_range_fails_fast() {
        let bad = SearchSpace::new().with_field("gym", [("n", SearchDimension::int(100, 10, 1))]);
        let err = SearchConfig::new(bad, "gym").validate().unwrap_err();
        assert!(err.to_string().contains("gym:n"));

        let bad_step = SearchSpace::new().with_field("gym", [("r", SearchDimension::float(0.0, 1.0, Some(0.0)))]);
        assert!(SearchConfig::new(bad_step, "gym").validate().is_err());
    }

    #[test]
    fn test_field_names_cannot_contain_separator() {
        let bad = SearchSpace::new().with_field("a.b", [("n", SearchDimension::int(1, 2, 1))]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_dimensions_for_swarm() {
        let space = space();
        let dims = space.dimensions_for(&SwarmId::from_fields(["timestamp"])).unwrap();
        let keys: Vec<&String> = dims.keys().collect();
        assert_eq!(keys, vec!["model:alpha", "model:clipInput", "timestamp:kind", "timestamp:radius"]);
        assert!(space.dimensions_for(&SwarmId::from("unknown")).is_err());
    }

    #[test]
    fn test_error_budget() {
        let mut config = SearchConfig::new(space(), "gym");
        assert_eq!(config.error_budget(), None);
        config.max_models = Some(9);
        assert_eq!(config.error_budget(), Some(5));
        config.max_error_models = Some(2);
        assert_eq!(config.error_budget(), Some(2));
        config.ignore_err_models = true;
        assert_eq!(config.error_budget(), None);
    }

    #[test]
    fn test_dimension_serde_is_tagged() {
        let json = serde_json::to_value(SearchDimension::int(1, 5, 1)).unwrap();
        assert_eq!(json["type"], "int_range");
        let back: SearchDimension = serde_json::from_value(json).unwrap();
        assert_eq!(back, SearchDimension::int(1, 5, 1));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
predicted_field = "consumption"
max_models = 40
min_particles_per_swarm = 3

[optimize]
metric = "altmape"

[space.fields.consumption.n]
type = "int_range"
min = 10
max = 200
step = 10

[space.fields.gym.kind]
type = "choice"
choices = ["a", "b"]
"#
        )
        .unwrap();

        let config = SearchConfig::from_file(&path).unwrap();
        assert_eq!(config.max_models, Some(40));
        assert_eq!(config.min_particles_per_swarm, 3);
        assert_eq!(config.optimize.metric, "altmape");
        assert_eq!(config.space.field_names(), vec!["consumption", "gym"]);
        assert_eq!(config.space.fields["consumption"]["n"], SearchDimension::int(10, 200, 10));
    }
}
