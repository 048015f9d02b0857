//! End-to-end scenarios through the scheduler service: broker, workers,
//! plan applier, and blocked tracker against a real store.

use std::collections::BTreeSet;
use std::time::Duration;

use fleetgrid_scheduler::{FleetConfig, Service, StoreConfig};
use fleetgrid_state::{
    AllocClientStatus, AllocDesiredStatus, Allocation, DeploymentStatus, EvalStatus, Job,
    StateStore, UpdateStrategy, mock,
};

const WAIT: Duration = Duration::from_secs(10);

fn config() -> FleetConfig {
    FleetConfig {
        store: StoreConfig {
            in_memory: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start(store: StateStore, nodes: usize) -> Service {
    let service = Service::start(store, config()).await.unwrap();
    for i in 0..nodes {
        service.upsert_node(&mock::node(&format!("node-{i}"))).await.unwrap();
    }
    service
}

async fn fleet(nodes: usize) -> Service {
    start(StateStore::open_in_memory().unwrap(), nodes).await
}

fn live(service: &Service, job: &Job) -> Vec<Allocation> {
    service
        .store()
        .allocs_by_job(&job.namespace, &job.id)
        .unwrap()
        .into_iter()
        .filter(|a| !a.terminal_status())
        .collect()
}

fn sized(id: &str, count: u32) -> Job {
    let mut job = mock::job(id);
    job.task_groups[0].count = count;
    job
}

#[tokio::test]
async fn register_places_one_allocation_per_node() {
    let service = fleet(10).await;
    let (job, eval_id) = service.register_job(&mock::job("api")).await.unwrap();

    let eval = service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    assert_eq!(eval.status, EvalStatus::Complete);

    let allocs = live(&service, &job);
    assert_eq!(allocs.len(), 10);
    let nodes: BTreeSet<_> = allocs.iter().map(|a| a.node_id.as_str()).collect();
    assert_eq!(nodes.len(), 10);
    let indexes: BTreeSet<_> = allocs.iter().map(|a| a.index).collect();
    assert_eq!(indexes, (0..10).collect::<BTreeSet<u32>>());

    service.shutdown().await;
}

#[tokio::test]
async fn blocked_evaluation_resumes_when_node_joins() {
    let service = fleet(1).await;
    let (job, eval_id) = service.register_job(&mock::job("api")).await.unwrap();

    let eval = service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    assert_eq!(eval.status, EvalStatus::Blocked);
    service.wait_idle(WAIT).await.unwrap();
    assert_eq!(live(&service, &job).len(), 7);

    let diagnostics = service.diagnostics(&eval_id).unwrap();
    assert_eq!(diagnostics["web"].dimension_exhausted.get("cpu"), Some(&1));
    assert_eq!(service.stats().await.blocked.total, 1);

    service.upsert_node(&mock::node("node-extra")).await.unwrap();
    service.wait_idle(WAIT).await.unwrap();

    let eval = service.eval(&eval_id).unwrap();
    assert_eq!(eval.status, EvalStatus::Complete);
    assert!(eval.failed_tg_allocs.is_empty());
    assert_eq!(live(&service, &job).len(), 10);
    assert_eq!(service.stats().await.blocked.total, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn drained_node_is_emptied() {
    let service = fleet(3).await;
    let (job, eval_id) = service.register_job(&sized("api", 3)).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    let before = service.store().allocs_by_node("node-0").unwrap();
    assert_eq!(before.len(), 1);

    let evals = service.drain_node("node-0").await.unwrap();
    assert_eq!(evals.len(), 1);
    let eval = service.wait_for_eval(&evals[0], WAIT).await.unwrap();
    assert_eq!(eval.status, EvalStatus::Complete);

    let old = service.store().alloc(&before[0].id).unwrap().unwrap();
    assert_eq!(old.desired_status, AllocDesiredStatus::Stop);
    assert_ne!(old.client_status, AllocClientStatus::Lost);

    let allocs = live(&service, &job);
    assert_eq!(allocs.len(), 3);
    assert!(allocs.iter().all(|a| a.node_id != "node-0"));

    service.shutdown().await;
}

#[tokio::test]
async fn deregistered_job_stops_everything() {
    let service = fleet(2).await;
    let (job, eval_id) = service.register_job(&sized("api", 4)).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    assert_eq!(live(&service, &job).len(), 4);

    let eval_id = service.deregister_job(&job.namespace, &job.id).await.unwrap();
    let eval = service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    assert_eq!(eval.status, EvalStatus::Complete);
    assert!(live(&service, &job).is_empty());
    assert!(service.store().job(&job.namespace, &job.id).unwrap().unwrap().stop);

    service.shutdown().await;
}

#[tokio::test]
async fn failed_allocation_is_replaced() {
    let service = fleet(3).await;
    let (job, eval_id) = service.register_job(&sized("api", 2)).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    let victim = live(&service, &job).remove(0);

    service
        .update_alloc_client_status(&victim.id, AllocClientStatus::Failed, "exit code 1")
        .await
        .unwrap();
    service.wait_idle(WAIT).await.unwrap();

    let allocs = live(&service, &job);
    assert_eq!(allocs.len(), 2);
    let replacement = allocs
        .iter()
        .find(|a| a.previous_allocation.as_deref() == Some(victim.id.as_str()))
        .unwrap();
    assert_eq!(replacement.index, victim.index);
    assert_eq!(replacement.reschedule_events.len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn canary_promotion_completes_rollout() {
    let service = fleet(4).await;
    let mut spec = sized("api", 2);
    spec.task_groups[0].update = Some(UpdateStrategy {
        max_parallel: 2,
        canary: 1,
        ..Default::default()
    });

    let (v0, eval_id) = service.register_job(&spec).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    for alloc in live(&service, &v0) {
        service.set_alloc_health(&alloc.id, true).await.unwrap();
    }
    service.wait_idle(WAIT).await.unwrap();
    let first = service
        .store()
        .latest_deployment_by_job(&v0.namespace, &v0.id)
        .unwrap()
        .unwrap();
    assert_eq!(first.status, DeploymentStatus::Successful);

    spec.task_groups[0].tasks[0].env.insert("RELEASE".into(), "2".into());
    let (v1, eval_id) = service.register_job(&spec).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    let rollout = service
        .store()
        .latest_deployment_by_job(&v1.namespace, &v1.id)
        .unwrap()
        .unwrap();
    assert!(rollout.requires_promotion());
    let canary_id = rollout.task_groups["web"].placed_canaries[0].clone();
    assert_eq!(live(&service, &v1).len(), 3);

    service.set_alloc_health(&canary_id, true).await.unwrap();
    service.wait_idle(WAIT).await.unwrap();
    service.promote_deployment(&rollout.id, &[]).await.unwrap();
    service.wait_idle(WAIT).await.unwrap();

    let allocs = live(&service, &v1);
    assert_eq!(allocs.len(), 2);
    assert!(allocs.iter().all(|a| a.job_version == v1.version));
    assert!(allocs.iter().any(|a| a.id == canary_id));

    service.shutdown().await;
}

#[tokio::test]
async fn unhealthy_rollout_reverts_to_stable_version() {
    let service = fleet(2).await;
    let mut spec = sized("api", 1);
    spec.task_groups[0].update = Some(UpdateStrategy {
        max_parallel: 1,
        auto_revert: true,
        ..Default::default()
    });

    let (v0, eval_id) = service.register_job(&spec).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    let stable = live(&service, &v0).remove(0);
    service.set_alloc_health(&stable.id, true).await.unwrap();
    service.wait_idle(WAIT).await.unwrap();

    spec.task_groups[0].tasks[0].env.insert("RELEASE".into(), "broken".into());
    let (v1, eval_id) = service.register_job(&spec).await.unwrap();
    service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    let broken = live(&service, &v1).remove(0);
    assert_eq!(broken.job_version, v1.version);

    service.set_alloc_health(&broken.id, false).await.unwrap();
    service.wait_idle(WAIT).await.unwrap();

    let latest = service.store().job(&v0.namespace, &v0.id).unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert!(!latest.task_groups[0].tasks[0].env.contains_key("RELEASE"));
    let allocs = live(&service, &latest);
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].job_version, 2);

    service.shutdown().await;
}

#[tokio::test]
async fn blocked_evaluation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.redb");

    let service = start(StateStore::open(&path).unwrap(), 1).await;
    let (job, eval_id) = service.register_job(&mock::job("api")).await.unwrap();
    let eval = service.wait_for_eval(&eval_id, WAIT).await.unwrap();
    assert_eq!(eval.status, EvalStatus::Blocked);
    service.wait_idle(WAIT).await.unwrap();
    service.shutdown().await;

    let service = Service::start(StateStore::open(&path).unwrap(), config()).await.unwrap();
    assert_eq!(service.stats().await.blocked.total, 1);
    service.upsert_node(&mock::node("node-extra")).await.unwrap();
    service.wait_idle(WAIT).await.unwrap();

    assert_eq!(service.eval(&eval_id).unwrap().status, EvalStatus::Complete);
    assert_eq!(live(&service, &job).len(), 10);
    service.shutdown().await;
}
