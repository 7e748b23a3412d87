//! Model evaluators: the pluggable training/scoring step
//!
//! The engine never looks inside a model. It builds one evaluator per model
//! through an [`EvaluatorFactory`], steps it record by record, and reads its
//! score in the orientation declared by the job's optimize metric.

use async_trait::async_trait;

use crate::types::ModelParams;

/// Result of advancing an evaluator by one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More records remain
    Continue,
    /// Data exhausted; the current score is final
    Done,
}

/// Trains and scores one model
#[async_trait]
pub trait ModelEvaluator: Send {
    /// Process the next record
    async fn step(&mut self) -> anyhow::Result<StepOutcome>;

    /// Abandon the evaluation; no further steps will be requested
    fn cancel(&mut self);

    /// Current value of the optimized metric
    fn score(&self) -> f64;
}

/// Builds evaluators from model parameters
pub trait EvaluatorFactory: Send + Sync {
    fn create(&self, params: &ModelParams) -> anyhow::Result<Box<dyn ModelEvaluator>>;
}

impl<F> EvaluatorFactory for F
where
    F: Fn(&ModelParams) -> anyhow::Result<Box<dyn ModelEvaluator>> + Send + Sync,
{
    fn create(&self, params: &ModelParams) -> anyhow::Result<Box<dyn ModelEvaluator>> {
        self(params)
    }
}
