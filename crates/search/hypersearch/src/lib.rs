//! # Hypersearch
//!
//! Distributed hyperparameter search. Particle swarms explore encoder and
//! model parameters while the engine grows the set of input fields sprint by
//! sprint, keeping only the field combinations that improve the optimized
//! metric.
//!
//! ## Key Features
//!
//! - **Particle Swarm Optimization**: numeric, integer and categorical variables
//! - **Field Swarming**: each sprint extends the previous winner by one field
//! - **Speculation**: next-sprint swarms start before the current sprint ends
//! - **Shared Job Store**: workers coordinate only through SQLite or memory
//! - **Fault Tolerance**: models of dead workers are adopted after a quiet interval
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │     HypersearchClient / Workers     │
//! ├─────────────────────────────────────┤
//! │ SwarmController │ EvaluationRunner  │
//! ├─────────────────────────────────────┤
//! │ Engine state │ Particles │ Maturity │
//! ├─────────────────────────────────────┤
//! │        JobStore (SQLite / mem)      │
//! └─────────────────────────────────────┘
//! ```

pub mod branching;
pub mod config;
pub mod controller;
pub mod engine_state;
pub mod error;
pub mod evaluator;
pub mod maturity;
pub mod particle;
pub mod runner;
pub mod store;
pub mod submit;
pub mod telemetry;
pub mod types;
pub mod variable;
pub mod worker;

pub use config::{OptimizeMetric, ParamValue, SearchConfig, SearchDimension, SearchSpace};
pub use controller::{compute_results, JobSnapshot, NextModel, SwarmController};
pub use engine_state::{EngineEvent, SprintState, SprintStatus, SwarmEngineState, SwarmState};
pub use error::{SearchError, SearchResult};
pub use evaluator::{EvaluatorFactory, ModelEvaluator, StepOutcome};
pub use maturity::ModelMaturityTracker;
pub use particle::{Particle, ParticleState};
pub use runner::{ModelEvaluationRunner, RunOutcome};
pub use store::{InMemoryJobStore, JobStore, SqliteJobStore, StoreHealth};
pub use submit::{HypersearchClient, JobReport, SwarmSummary};
pub use telemetry::{init_tracing, MetricsSnapshot, SearchMetrics};
pub use types::*;
pub use variable::{Coordinate, ParticleVariable, VariableState};
pub use worker::{WorkerHandle, WorkerLoop, WorkerReport};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        EvaluatorFactory, HypersearchClient, InMemoryJobStore, JobReport, JobStore, ModelEvaluator, ModelParams,
        ParamValue, SearchConfig, SearchDimension, SearchError, SearchResult, SearchSpace, SqliteJobStore,
        StepOutcome, WorkerLoop, WorkerReport,
    };
}
