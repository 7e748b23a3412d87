//! Worker failures: dead workers, failing models and stopped workers

mod common;

use hypersearch::prelude::*;
use hypersearch::{CompletionReason, JobCompletionReason, NextModel, SearchMetrics, SwarmController};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const DEADLINE: Duration = Duration::from_secs(60);

/// Claim a model as a worker that then disappears
async fn abandon_one_model(store: &Arc<dyn JobStore>, job_id: Uuid) -> hypersearch::Model {
    let dead = SwarmController::new(store.clone(), job_id, Uuid::new_v4(), Arc::new(SearchMetrics::new()));
    match dead.get_next_model().await.unwrap() {
        NextModel::Run { model, adopted } => {
            assert!(!adopted);
            model
        }
        other => panic!("expected a model, got {:?}", other),
    }
}

async fn recovers_orphan(store: Arc<dyn JobStore>) {
    let mut config = common::config();
    config.model_orphan_interval_secs = 0.2;
    let client = HypersearchClient::new(store.clone());
    let job_id = client.submit(config).await.unwrap();
    let orphan = abandon_one_model(&store, job_id).await;

    let reports = tokio::time::timeout(DEADLINE, client.run_local_workers(job_id, 2, common::factory()))
        .await
        .expect("search did not finish in time")
        .unwrap();

    // the dead worker's model does not change where the search ends up
    let report = client.report(job_id).await.unwrap();
    common::assert_found_useful_fields(&report);
    assert!(reports.iter().map(|r| r.models_adopted).sum::<usize>() >= 1);
    assert!(reports.iter().map(|r| r.metrics.orphans_adopted).sum::<u64>() >= 1);

    let recovered = store.get_model(orphan.id).await.unwrap();
    assert!(!recovered.is_running());
    assert_eq!(recovered.completion_reason, Some(CompletionReason::Eof));
    assert_eq!(recovered.restarts, 1);
    assert_ne!(recovered.owner, orphan.owner);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_orphaned_model_is_adopted_in_memory() {
    recovers_orphan(common::memory_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_orphaned_model_is_adopted_on_sqlite() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteJobStore::new(temp_dir.path().join("orphans.db")).await.unwrap();
    store.initialize().await.unwrap();
    recovers_orphan(Arc::new(store)).await;
}

#[tokio::test]
async fn test_error_budget_fails_job() {
    let mut config = common::config();
    config.max_error_models = Some(1);
    let store = common::memory_store().await;
    let client = HypersearchClient::new(store.clone());
    let job_id = client.submit(config).await.unwrap();

    let reports = tokio::time::timeout(DEADLINE, client.run_local_workers(job_id, 2, common::failing_factory("c")))
        .await
        .unwrap()
        .unwrap();
    assert!(reports.iter().all(|r| r.job_completed));

    let report = client.report(job_id).await.unwrap();
    assert_eq!(report.completion_reason, Some(JobCompletionReason::Error));
    let message = report.completion_message.unwrap();
    assert!(message.starts_with("model "), "{}", message);
    assert!(message.contains("rejected its input"), "{}", message);
    assert!(report.results.errored_models >= 2);

    let models = store.list_models(job_id).await.unwrap();
    assert!(models.iter().all(|m| !m.is_running()));
    let errored = models
        .iter()
        .filter(|m| m.completion_reason == Some(CompletionReason::Error));
    assert!(errored.clone().all(|m| m.params.swarm_id.contains("c")));
    assert!(errored.clone().all(|m| m.error_message.is_some()));
}

#[tokio::test]
async fn test_ignored_errors_do_not_fail_job() {
    let mut config = common::config();
    config.max_error_models = Some(0);
    config.ignore_err_models = true;
    let client = HypersearchClient::new(common::memory_store().await);
    let job_id = client.submit(config).await.unwrap();

    tokio::time::timeout(DEADLINE, client.run_local_workers(job_id, 2, common::failing_factory("c")))
        .await
        .unwrap()
        .unwrap();

    let report = client.report(job_id).await.unwrap();
    assert_eq!(report.completion_reason, Some(JobCompletionReason::Success));
    assert!(report.results.errored_models >= 3);
    let best = report.best_params.unwrap().swarm_id;
    assert!(!best.contains("c"));
}

#[tokio::test]
async fn test_stopped_worker_hands_over_to_new_worker() {
    let mut config = common::config();
    config.model_orphan_interval_secs = 0.1;
    let store = common::memory_store().await;
    let client = HypersearchClient::new(store.clone());
    let job_id = client.submit(config).await.unwrap();

    let (first, handle) = WorkerLoop::new(store.clone(), common::factory(), job_id);
    let task = tokio::spawn(first.run());
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.stop();
    let stopped = task.await.unwrap().unwrap();
    assert!(!stopped.job_completed);

    let (second, _handle) = WorkerLoop::new(store.clone(), common::factory(), job_id);
    let resumed = tokio::time::timeout(DEADLINE, second.run()).await.unwrap().unwrap();
    assert!(resumed.job_completed);
    assert_eq!(resumed.metrics.orphans_adopted, stopped.models_abandoned as u64);
    assert!(store.list_models(job_id).await.unwrap().iter().all(|m| !m.is_running()));

    let report = client.report(job_id).await.unwrap();
    assert_eq!(report.completion_reason, Some(JobCompletionReason::Success));
}
