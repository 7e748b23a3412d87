//! Synthetic search problem shared by the integration tests
//!
//! Fields `a` and `b` lower the error when present, field `c` does nothing,
//! and the model-wide parameter `x` is best at 5:
//! `error = 1.0 - 0.5[a] - 0.3[b] + 0.01 |x - 5|`

#![allow(dead_code)]

use async_trait::async_trait;
use hypersearch::prelude::*;
use hypersearch::{JobCompletionReason, SwarmId, SwarmStatus};
use std::sync::Arc;
use std::time::Duration;

pub const STEPS: usize = 4;

pub fn space() -> SearchSpace {
    SearchSpace::new()
        .with_field("a", [("resolution", SearchDimension::float(0.1, 1.0, None))])
        .with_field("b", [("buckets", SearchDimension::int(5, 50, 5))])
        .with_field(
            "c",
            [
                ("encoder", SearchDimension::choice(["scalar", "category"], false)),
                ("clip", SearchDimension::fixed(true)),
            ],
        )
        .with_model_param("x", SearchDimension::int(0, 10, 1))
}

pub fn config() -> SearchConfig {
    let mut config = SearchConfig::new(space(), "a");
    config.min_particles_per_swarm = 3;
    config.max_swarm_generations = 3;
    config.min_field_contribution = 10.0;
    config.worker_poll_interval_ms = 10;
    config
}

pub fn target_error(params: &ModelParams) -> f64 {
    let x = params.values.get("model:x").and_then(ParamValue::as_f64).unwrap_or(0.0);
    let mut error = 1.0 + 0.01 * (x - 5.0).abs();
    if params.swarm_id.contains("a") {
        error -= 0.5;
    }
    if params.swarm_id.contains("b") {
        error -= 0.3;
    }
    error
}

/// Converges on the target error over a few records
pub struct SyntheticEvaluator {
    target: f64,
    step: usize,
    cancelled: bool,
}

#[async_trait]
impl ModelEvaluator for SyntheticEvaluator {
    async fn step(&mut self) -> anyhow::Result<StepOutcome> {
        anyhow::ensure!(!self.cancelled, "stepped after cancel");
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.step += 1;
        Ok(if self.step >= STEPS {
            StepOutcome::Done
        } else {
            StepOutcome::Continue
        })
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn score(&self) -> f64 {
        self.target + 0.1 * (STEPS - self.step.min(STEPS)) as f64
    }
}

pub fn factory() -> Arc<dyn EvaluatorFactory> {
    Arc::new(|params: &ModelParams| -> anyhow::Result<Box<dyn ModelEvaluator>> {
        Ok(Box::new(SyntheticEvaluator {
            target: target_error(params),
            step: 0,
            cancelled: false,
        }))
    })
}

/// Same problem, but every model of a swarm containing `field` fails
pub fn failing_factory(field: &'static str) -> Arc<dyn EvaluatorFactory> {
    Arc::new(move |params: &ModelParams| -> anyhow::Result<Box<dyn ModelEvaluator>> {
        if params.swarm_id.contains(field) {
            anyhow::bail!("encoder for field {} rejected its input", field);
        }
        Ok(Box::new(SyntheticEvaluator {
            target: target_error(params),
            step: 0,
            cancelled: false,
        }))
    })
}

pub async fn memory_store() -> Arc<dyn JobStore> {
    let store = InMemoryJobStore::new();
    store.initialize().await.unwrap();
    Arc::new(store)
}

/// The search kept `a` and `b`, measured `c` as useless and stopped after sprint 1
pub fn assert_found_useful_fields(report: &JobReport) {
    assert!(report.is_completed());
    assert_eq!(report.completion_reason, Some(JobCompletionReason::Success));
    assert!(
        report
            .stop_reason
            .as_deref()
            .unwrap_or_default()
            .contains("no fields left"),
        "unexpected stop: {:?}",
        report.stop_reason
    );

    let best = report.best_params.as_ref().expect("a best model");
    assert_eq!(best.swarm_id, SwarmId::from_fields(["a", "b"]));
    assert!(report.results.best_value.unwrap() < 0.3);

    let contributions = &report.results.field_contributions;
    assert!(contributions["b"] > 50.0, "{:?}", contributions);
    assert!(contributions["c"] < 10.0, "{:?}", contributions);

    // every first-sprint swarm ran to completion
    for field in ["a", "b", "c"] {
        let swarm = &report.swarms[&SwarmId::from(field)];
        assert_eq!(swarm.status, SwarmStatus::Completed);
        assert!(swarm.generations >= 1);
    }
    assert_eq!(report.sprints, 2);
}
