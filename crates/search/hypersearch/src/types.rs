//! Common types for the search engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::config::{ParamValue, SearchConfig};
use crate::engine_state::SwarmEngineState;
use crate::particle::ParticleState;

/// Unique identifier for a search job
pub type JobId = Uuid;

/// Unique identifier for an evaluated model
pub type ModelId = Uuid;

/// Identity token of a worker process or task
pub type WorkerId = Uuid;

/// Separator between encoder names in a swarm id
pub const SWARM_FIELD_SEPARATOR: char = '.';

/// A combination of fields, named by its sorted, dot-joined encoder names
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwarmId(String);

impl SwarmId {
    /// Build the id of the swarm over `fields`, in any order
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = fields.into_iter().map(|f| f.as_ref().to_string()).collect();
        names.sort();
        names.dedup();
        SwarmId(names.join(&SWARM_FIELD_SEPARATOR.to_string()))
    }

    /// Constituent field names, sorted
    pub fn fields(&self) -> Vec<&str> {
        if self.0.is_empty() {
            return Vec::new();
        }
        self.0.split(SWARM_FIELD_SEPARATOR).collect()
    }

    /// Number of fields in the combination
    pub fn len(&self) -> usize {
        self.fields().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields().iter().any(|f| *f == field)
    }

    /// The swarm obtained by adding one more field to this combination
    pub fn with_field(&self, field: &str) -> SwarmId {
        let mut fields = self.fields();
        fields.push(field);
        SwarmId::from_fields(fields)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SwarmId {
    fn from(value: &str) -> Self {
        SwarmId::from_fields(value.split(SWARM_FIELD_SEPARATOR))
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
}

/// Why a job completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCompletionReason {
    Success,
    Error,
}

/// Lifecycle status of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Running,
    Completed,
}

/// Why a model reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Ran to data exhaustion
    Eof,
    /// Matured or terminated on purpose
    Stopped,
    /// Pruned by speculation or field branching
    Killed,
    /// Evaluator raised
    Error,
    /// Owning worker presumed dead and the model was not resumed
    Orphaned,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Eof => "eof",
            CompletionReason::Stopped => "stopped",
            CompletionReason::Killed => "killed",
            CompletionReason::Error => "error",
            CompletionReason::Orphaned => "orphaned",
        }
    }

    /// Whether a model finishing this way produced a usable score
    pub fn is_scored(&self) -> bool {
        matches!(self, CompletionReason::Eof | CompletionReason::Stopped)
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a swarm
///
/// A swarm exists in the engine state only once the branching policy has
/// decided to explore it, so it starts out active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Active,
    Completed,
    Killed,
}

impl SwarmStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SwarmStatus::Active)
    }
}

/// Parameters of one model: which swarm slot it fills and the resolved
/// value of every search dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub swarm_id: SwarmId,
    pub particle_index: usize,
    pub generation: u32,
    pub predicted_field: String,
    /// Particle snapshot used to continue the particle in the next generation
    pub particle: ParticleState,
    /// Resolved values keyed `model:<param>` or `<field>:<param>`
    pub values: BTreeMap<String, ParamValue>,
}

impl ModelParams {
    /// Key identifying the swarm slot; at most one model may fill it
    pub fn slot_key(&self) -> String {
        format!("{}#{}#{}", self.swarm_id, self.particle_index, self.generation)
    }
}

/// One hyperparameter search run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub config: SearchConfig,
    pub status: JobStatus,
    pub completion_reason: Option<JobCompletionReason>,
    pub completion_message: Option<String>,
    pub engine_state: SwarmEngineState,
    pub results: Option<JobResults>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// One evaluated parameter combination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub job_id: JobId,
    pub params: ModelParams,
    pub status: ModelStatus,
    pub completion_reason: Option<CompletionReason>,
    /// Final metric value, in the caller's orientation
    pub result: Option<f64>,
    /// Latest progressive metric value reported while running
    pub progress_score: Option<f64>,
    pub error_message: Option<String>,
    pub records_processed: u64,
    pub last_update: DateTime<Utc>,
    pub owner: WorkerId,
    /// Number of times the model was adopted after being orphaned
    pub restarts: u32,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn is_running(&self) -> bool {
        self.status == ModelStatus::Running
    }

    /// Completion reason when the model finished with a usable score
    pub fn scored_reason(&self) -> Option<CompletionReason> {
        self.completion_reason.filter(|r| r.is_scored() && self.result.is_some())
    }

    /// Final result converted to a lower-is-better error
    pub fn error_score(&self, maximize: bool) -> Option<f64> {
        self.scored_reason()?;
        self.result.map(|v| to_error(v, maximize))
    }
}

/// Convert a metric in the caller's orientation to a lower-is-better error
pub fn to_error(value: f64, maximize: bool) -> f64 {
    if maximize {
        -value
    } else {
        value
    }
}

/// Convert a lower-is-better error back to the caller's orientation
pub fn from_error(error: f64, maximize: bool) -> f64 {
    to_error(error, maximize)
}

/// Final results of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub best_model_id: Option<ModelId>,
    /// Best metric value in the caller's orientation
    pub best_value: Option<f64>,
    /// Percentage improvement each field contributed over the baseline
    pub field_contributions: BTreeMap<String, f64>,
    /// Generation count at termination for every terminated swarm
    pub swarm_generations: BTreeMap<SwarmId, u32>,
    pub total_models: usize,
    pub errored_models: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swarm_id_is_sorted_and_deduplicated() {
        let id = SwarmId::from_fields(["timestamp_dayOfWeek", "gym", "address", "gym"]);
        assert_eq!(id.as_str(), "address.gym.timestamp_dayOfWeek");
        assert_eq!(id.len(), 3);
        assert!(id.contains("gym"));
        assert!(!id.contains("consumption"));
    }

    #[test]
    fn test_swarm_id_with_field() {
        let id = SwarmId::from("gym");
        assert_eq!(id.with_field("address").as_str(), "address.gym");
        assert_eq!(SwarmId::from("b.a"), SwarmId::from_fields(["a", "b"]));
    }

    #[test]
    fn test_only_finished_models_are_scored() {
        assert!(CompletionReason::Eof.is_scored());
        assert!(CompletionReason::Stopped.is_scored());
        assert!(!CompletionReason::Killed.is_scored());
        assert!(!CompletionReason::Error.is_scored());
        assert!(!CompletionReason::Orphaned.is_scored());
        assert_eq!(CompletionReason::Orphaned.to_string(), "orphaned");
    }

    #[test]
    fn test_error_orientation() {
        assert_eq!(to_error(0.3, false), 0.3);
        assert_eq!(to_error(0.3, true), -0.3);
        assert_eq!(from_error(to_error(0.7, true), true), 0.7);
    }
}
