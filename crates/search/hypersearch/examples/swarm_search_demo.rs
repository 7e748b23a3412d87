//! Swarming over a synthetic hourly energy-consumption dataset
//!
//! Usage: `cargo run --example swarm_search_demo [path/to/jobs.db]`
//!
//! Without a path the job store lives in memory. Consumption follows a daily
//! cycle, so the `hour` field should survive while `gym` and `weekday` add
//! nothing and end up blacklisted.

use async_trait::async_trait;
use hypersearch::prelude::*;
use hypersearch::init_tracing;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::info;

const RECORDS: usize = 240;

#[derive(Debug, Clone, Copy)]
struct Record {
    hour: f64,
    gym: f64,
    weekday: usize,
    consumption: f64,
}

fn dataset() -> Arc<Vec<Record>> {
    let mut rng = StdRng::seed_from_u64(7);
    let records = (0..RECORDS)
        .map(|i| {
            let hour = (i % 24) as f64;
            Record {
                hour,
                gym: rng.gen_range(0.0..1.0),
                weekday: (i / 24) % 7,
                consumption: 20.0 + 8.0 * (TAU * hour / 24.0).sin() + rng.gen_range(-0.5..0.5),
            }
        })
        .collect();
    Arc::new(records)
}

/// Linear predictor whose terms depend on the fields in the swarm
struct Predictor {
    data: Arc<Vec<Record>>,
    next: usize,
    abs_error: f64,
    base: f64,
    amplitude: Option<f64>,
    gym_weight: Option<f64>,
    weekday_offset: Option<(usize, f64)>,
}

impl Predictor {
    fn new(data: Arc<Vec<Record>>, params: &ModelParams) -> anyhow::Result<Self> {
        let number = |key: &str| params.values.get(key).and_then(ParamValue::as_f64);
        let base = number("model:base").ok_or_else(|| anyhow::anyhow!("missing model:base"))?;
        let weekday_offset = params.values.get("weekday:peak").and_then(ParamValue::as_str).map(|day| {
            let index = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
                .iter()
                .position(|d| *d == day)
                .unwrap_or(0);
            (index, number("weekday:offset").unwrap_or(0.0))
        });
        Ok(Self {
            data,
            next: 0,
            abs_error: 0.0,
            base,
            amplitude: number("hour:amplitude"),
            gym_weight: number("gym:weight"),
            weekday_offset,
        })
    }

    fn predict(&self, record: &Record) -> f64 {
        let mut prediction = self.base;
        if let Some(amplitude) = self.amplitude {
            prediction += amplitude * (TAU * record.hour / 24.0).sin();
        }
        if let Some(weight) = self.gym_weight {
            prediction += weight * record.gym;
        }
        if let Some((day, offset)) = self.weekday_offset {
            if record.weekday == day {
                prediction += offset;
            }
        }
        prediction
    }
}

#[async_trait]
impl ModelEvaluator for Predictor {
    async fn step(&mut self) -> anyhow::Result<StepOutcome> {
        let record = self.data[self.next];
        self.abs_error += (self.predict(&record) - record.consumption).abs();
        self.next += 1;
        if self.next % 24 == 0 {
            tokio::task::yield_now().await;
        }
        Ok(if self.next >= self.data.len() {
            StepOutcome::Done
        } else {
            StepOutcome::Continue
        })
    }

    fn cancel(&mut self) {}

    fn score(&self) -> f64 {
        if self.next == 0 {
            return f64::NAN;
        }
        self.abs_error / self.next as f64
    }
}

fn search_config() -> SearchConfig {
    let space = SearchSpace::new()
        .with_field("consumption", [("clip", SearchDimension::fixed(true))])
        .with_field("hour", [("amplitude", SearchDimension::float(0.0, 12.0, None))])
        .with_field("gym", [("weight", SearchDimension::float(-5.0, 5.0, None))])
        .with_field(
            "weekday",
            [
                (
                    "peak",
                    SearchDimension::choice(["mon", "tue", "wed", "thu", "fri", "sat", "sun"], false),
                ),
                ("offset", SearchDimension::float(-3.0, 3.0, Some(0.5))),
            ],
        )
        .with_model_param("base", SearchDimension::float(10.0, 30.0, None));

    let mut config = SearchConfig::new(space, "consumption");
    config.optimize.metric = "mae".to_string();
    config.min_particles_per_swarm = 5;
    config.max_swarm_generations = 8;
    config.min_field_contribution = 5.0;
    config.model_maturity = true;
    config.progress_update_interval = 24;
    config.model_maturity_check_interval = 24;
    config.worker_poll_interval_ms = 20;
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info,hypersearch=info");
    info!("🚀 Starting swarm search demo");

    let store: Arc<dyn JobStore> = match std::env::args().nth(1) {
        Some(path) => {
            let store = SqliteJobStore::new(&path).await?;
            store.initialize().await?;
            info!("Using SQLite job store at {}", path);
            Arc::new(store)
        }
        None => {
            let store = InMemoryJobStore::new();
            store.initialize().await?;
            Arc::new(store)
        }
    };

    let client = HypersearchClient::new(store);
    let job_id = client.submit(search_config()).await?;

    let data = dataset();
    let factory: Arc<dyn EvaluatorFactory> =
        Arc::new(move |params: &ModelParams| -> anyhow::Result<Box<dyn ModelEvaluator>> {
            Ok(Box::new(Predictor::new(data.clone(), params)?))
        });

    let workers = client.run_local_workers(job_id, 4, factory).await?;
    for worker in &workers {
        info!(
            "Worker {} ran {} models ({} adopted)",
            worker.worker_id, worker.models_run, worker.models_adopted
        );
    }

    let report = client.report(job_id).await?;
    info!("✅ Job {} finished: {:?}", job_id, report.completion_reason);
    if let Some(reason) = &report.stop_reason {
        info!("Stopped because {}", reason);
    }
    for (swarm, summary) in &report.swarms {
        info!(
            "  swarm {:<28} sprint {} {:?} generations {} best {:?}",
            swarm.as_str(),
            summary.sprint,
            summary.status,
            summary.generations,
            summary.best_error
        );
    }
    for (field, contribution) in &report.results.field_contributions {
        info!("  field {:<12} contribution {:>7.2}%", field, contribution);
    }
    if let (Some(value), Some(params)) = (report.results.best_value, &report.best_params) {
        info!("Best MAE {:.3} from swarm {}", value, params.swarm_id);
        for (name, value) in &params.values {
            info!("  {} = {:?}", name, value);
        }
    }
    info!(
        "{} models evaluated, {} errored",
        report.results.total_models, report.results.errored_models
    );
    Ok(())
}
