//! End-to-end controller behavior: loading, topological evaluation, reload
//! diffing, cycle rejection, and teardown.

mod common;

use std::sync::atomic::Ordering;

use common::{eventually, last_added, test_controller, Probe};
use flow_core::health::HealthStatus;
use flow_runtime::{Flow, LoadError, Source};
use tokio_util::sync::CancellationToken;

const PIPELINE: &str = r#"
counter "c" {
    period = "10ms"
    max = 10
}

passthrough "p" {
    input = counter.c.out
}

summation "s" {
    input = passthrough.p.out
}
"#;

async fn start(flow: &Flow) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let ctx = CancellationToken::new();
    let handle = tokio::spawn({
        let flow = flow.clone();
        let ctx = ctx.clone();
        async move { flow.run(ctx).await }
    });
    (ctx, handle)
}

#[tokio::test]
async fn test_linear_pipeline_propagates_to_sum() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    let source = Source::parse(PIPELINE).unwrap();
    flow.load_source(&source, None).await.unwrap();

    let (ctx, handle) = start(&flow).await;
    eventually(|| async { last_added(&flow, "summation.s").await == Some(10) }).await;

    ctx.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_full_load_evaluates_in_topological_order() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    // Before anything runs, the initial export of the counter must already
    // have flowed through the whole chain: each node was evaluated after
    // everything it references.
    let source = Source::parse(PIPELINE).unwrap();
    flow.load_source(&source, None).await.unwrap();

    assert_eq!(last_added(&flow, "summation.s").await, Some(0));
    for info in flow.list_components().await {
        assert_ne!(info.health.status, HealthStatus::Unhealthy, "{}", info.id);
    }
}

#[tokio::test]
async fn test_cycle_is_rejected_without_starting_components() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    let source = Source::parse(
        r#"
        passthrough "a" {
            input = passthrough.b.out
        }
        passthrough "b" {
            input = passthrough.a.out
        }
        "#,
    )
    .unwrap();

    let err = flow.load_source(&source, None).await.unwrap_err();
    assert!(matches!(err, LoadError::Cycle(_)), "got {err}");
    assert!(flow.list_components().await.is_empty());
    assert_eq!(probe.run_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cycle_on_reload_keeps_previous_graph() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    flow.load_source(&Source::parse(PIPELINE).unwrap(), None)
        .await
        .unwrap();
    let (ctx, handle) = start(&flow).await;
    eventually(|| async { last_added(&flow, "summation.s").await == Some(10) }).await;

    let bad = Source::parse(
        r#"
        passthrough "a" {
            input = passthrough.b.out
        }
        passthrough "b" {
            input = passthrough.a.out
        }
        "#,
    )
    .unwrap();
    assert!(matches!(
        flow.load_source(&bad, None).await,
        Err(LoadError::Cycle(_))
    ));

    // The old graph is still intact and running.
    assert_eq!(last_added(&flow, "summation.s").await, Some(10));
    assert_eq!(flow.list_components().await.len(), 3);

    ctx.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_reload_reuses_unchanged_nodes() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    flow.load_source(&Source::parse(PIPELINE).unwrap(), None)
        .await
        .unwrap();
    let (ctx, handle) = start(&flow).await;
    eventually(|| async { last_added(&flow, "summation.s").await.unwrap_or(0) > 0 }).await;

    // Reload with an unchanged counter block; only the summation's wiring
    // text changes shape (same semantics).
    let reload = r#"
counter "c" {
    period = "10ms"
    max = 10
}

passthrough "p" {
    input = counter.c.out
}

summation "s" {
    input = passthrough.p.out
}

passthrough "extra" {
    input = counter.c.out
}
"#;
    flow.load_source(&Source::parse(reload).unwrap(), None)
        .await
        .unwrap();

    // Same instance, same task: the counter was neither rebuilt nor
    // restarted, and the new node joined the running graph.
    assert_eq!(probe.counter_builds.load(Ordering::SeqCst), 1);
    eventually(|| async {
        flow.get_export("passthrough.extra").await.is_some()
    })
    .await;
    eventually(|| async { last_added(&flow, "summation.s").await == Some(10) }).await;

    ctx.cancel();
    handle.await.unwrap();
    // One run per distinct component across both loads: c, p, s, extra.
    assert_eq!(probe.run_starts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_removed_component_unregisters_metrics() {
    let probe = Probe::default();
    let (flow, registry) = test_controller(&probe);

    let with_counter = r#"
counter "c" {
    period = "10ms"
    max = 3
}
"#;
    flow.load_source(&Source::parse(with_counter).unwrap(), None)
        .await
        .unwrap();
    assert!(registry
        .gather()
        .iter()
        .any(|mf| mf.get_name() == "counter_ticks_total"));

    // Remove the counter; its collector must leave the shared registry so
    // an identical component can register the same metric again.
    flow.load_source(&Source::parse("passthrough \"p\" { input = 1 }").unwrap(), None)
        .await
        .unwrap();
    assert!(!registry
        .gather()
        .iter()
        .any(|mf| mf.get_name() == "counter_ticks_total"));

    flow.load_source(&Source::parse(with_counter).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(probe.counter_builds.load(Ordering::SeqCst), 2);
    let infos = flow.list_components().await;
    let counter = infos.iter().find(|i| i.id == "counter.c").unwrap();
    assert_ne!(counter.health.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_teardown_joins_every_task() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    flow.load_source(&Source::parse(PIPELINE).unwrap(), None)
        .await
        .unwrap();
    let (ctx, handle) = start(&flow).await;
    eventually(|| async { probe.run_starts.load(Ordering::SeqCst) == 3 }).await;

    ctx.cancel();
    handle.await.unwrap();
    assert_eq!(
        probe.run_exits.load(Ordering::SeqCst),
        probe.run_starts.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_evaluation_failure_is_local() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    // The passthrough references an export that does not exist; the load
    // still succeeds and the healthy counter starts.
    let source = Source::parse(
        r#"
        counter "c" {
            period = "10ms"
            max = 2
        }
        passthrough "broken" {
            input = counter.c.missing_field
        }
        "#,
    )
    .unwrap();
    flow.load_source(&source, None).await.unwrap();

    let infos = flow.list_components().await;
    let broken = infos.iter().find(|i| i.id == "passthrough.broken").unwrap();
    assert_eq!(broken.health.status, HealthStatus::Unhealthy);

    let (ctx, handle) = start(&flow).await;
    eventually(|| async {
        flow.get_export("counter.c").await.and_then(|v| v.get("out").cloned())
            == Some(serde_json::json!(2))
    })
    .await;
    assert_eq!(probe.run_starts.load(Ordering::SeqCst), 1);

    ctx.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_component_validation_failure_keeps_last_arguments() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    flow.load_source(
        &Source::parse("counter \"c\" { period = \"10ms\" max = 5 }").unwrap(),
        None,
    )
    .await
    .unwrap();

    // max = 0 fails the arguments' validation; the node turns unhealthy
    // but keeps its previous arguments.
    flow.load_source(
        &Source::parse("counter \"c\" { period = \"10ms\" max = 0 }").unwrap(),
        None,
    )
    .await
    .unwrap();

    let infos = flow.list_components().await;
    let counter = infos.iter().find(|i| i.id == "counter.c").unwrap();
    assert_eq!(counter.health.status, HealthStatus::Unhealthy);
    assert_eq!(counter.arguments.as_ref().unwrap()["max"], 5);
}

#[tokio::test]
async fn test_unknown_component_rejected() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    let err = flow
        .load_source(&Source::parse("frobnicator \"x\" {}").unwrap(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::UnknownComponent(name) if name == "frobnicator"));
}

#[tokio::test]
async fn test_top_level_attribute_rejected() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    let err = flow
        .load_source(&Source::parse("x = 1").unwrap(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::TopLevelAttribute));
}

#[tokio::test]
async fn test_argument_blocks_rejected_at_root() {
    let probe = Probe::default();
    let (flow, _) = test_controller(&probe);

    let err = flow
        .load_source(&Source::parse("argument \"in\" {}").unwrap(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::NotInModule(_)));
}
