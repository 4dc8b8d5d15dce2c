//! Many instances in flight at once.

use durable_sequence::runtime::activity::ActivityRegistryBuilder;
use durable_sequence::{samples, ActivityPlan, OrchestrationStatus};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;

mod common;

fn status_rank(s: OrchestrationStatus) -> u8 {
    match s {
        OrchestrationStatus::Pending => 0,
        OrchestrationStatus::Running => 1,
        OrchestrationStatus::Completed | OrchestrationStatus::Failed => 2,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_get_distinct_ids_and_complete() {
    let (rt, store) = common::runtime_with(samples::activities());

    let starts = (0..50).map(|i| {
        let rt = rt.clone();
        async move {
            rt.start_orchestration(ActivityPlan::new().then("SayHello", format!("city-{i}")))
                .await
                .unwrap()
        }
    });
    let ids = join_all(starts).await;
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), 50);

    for (i, id) in ids.iter().enumerate() {
        let status = rt.wait_for_orchestration(id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(status.runtime_status, OrchestrationStatus::Completed);
        assert_eq!(status.output, vec![format!("Hello city-{i}!")]);
    }
    assert_eq!(store.len().await, 50);
    assert_eq!(rt.list_instances().await.unwrap().len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_instance_does_not_delay_others() {
    let gate = common::Gate::new();
    let builder = ActivityRegistryBuilder::from_registry(&samples::activities());
    let (rt, _store) = common::runtime_with(gate.register(builder, "Gated").build());

    let blocked = rt.start_orchestration(ActivityPlan::new().then("Gated", "x")).await.unwrap();
    let free = rt.start_orchestration(samples::hello_cities_plan()).await.unwrap();

    let done = rt.wait_for_orchestration(&free, Duration::from_secs(5)).await.unwrap();
    assert_eq!(done.runtime_status, OrchestrationStatus::Completed);

    let still = rt.get_orchestration_status(&blocked).await.unwrap();
    assert!(still.running);

    gate.open(1);
    let finished = rt.wait_for_orchestration(&blocked, Duration::from_secs(5)).await.unwrap();
    assert_eq!(finished.output, vec!["gated:x"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_regression() {
    let gate = common::Gate::new();
    let builder = ActivityRegistryBuilder::from_registry(&samples::activities());
    let (rt, _store) = common::runtime_with(gate.register(builder, "Gated").build());

    let mut plan = ActivityPlan::new();
    for i in 0..10 {
        plan = plan.then("Gated", i.to_string());
    }
    let id = rt.start_orchestration(plan).await.unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let rt = rt.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut last_rank = 0;
                let mut last_output: Vec<String> = Vec::new();
                loop {
                    let view = rt.get_orchestration_status(&id).await.unwrap();
                    let rank = status_rank(view.runtime_status);
                    assert!(rank >= last_rank, "status went backwards");
                    assert!(view.output.starts_with(&last_output), "output was rewritten");
                    last_rank = rank;
                    last_output = view.output.clone();
                    if view.is_terminal() {
                        return last_output;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for _ in 0..10 {
        gate.open(1);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let expected: Vec<String> = (0..10).map(|i| format!("gated:{i}")).collect();
    for reader in readers {
        assert_eq!(reader.await.unwrap(), expected);
    }
}
