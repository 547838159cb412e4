//! Recovery sweeper, duplicate suppression, and shutdown behavior.

mod common;

use std::time::Duration;

use tracing::Span;

use windlass::domain::models::{Invocation, InvocationSpec};
use windlass::infrastructure::{EvalJobOutcome, RecoverySource};

use common::{eventually, harness, single_task_workflow, test_config};

#[tokio::test]
async fn held_lock_suppresses_concurrent_evaluations() {
    let h = harness().await;
    // No init: evaluate is exercised directly, with no background tasks.

    let workflow = single_task_workflow();
    h.workflows.insert(workflow.clone()).await;
    let id = h.submit_invocation(&workflow).await;

    let state = h
        .controller
        .eval_store()
        .load_or_store(id, Span::none())
        .await;
    let guard = state.try_acquire().expect("fresh state must be lockable");

    for _ in 0..10 {
        h.controller.evaluate(id).await;
    }

    assert_eq!(h.metrics().eval_job_count(EvalJobOutcome::Duplicate), 10);
    assert_eq!(h.metrics().eval_job_count(EvalJobOutcome::Action), 0);
    assert!(state.history().await.is_empty(), "no evaluation ran");

    drop(guard);
    // With the token released the same invocation evaluates normally.
    h.controller.evaluate(id).await;
    assert_eq!(h.metrics().eval_job_count(EvalJobOutcome::Action), 1);
}

#[tokio::test]
async fn short_loop_requeues_stale_eval_states() {
    let h = harness().await;
    h.controller.clone().init().await;

    let workflow = single_task_workflow();
    h.workflows.insert(workflow.clone()).await;

    // The creation event is lost: the state exists but nothing enqueued it.
    let invocation = Invocation::new(InvocationSpec::new(workflow.id));
    let id = h.invocations.submit_silently(invocation).await;
    h.controller
        .eval_store()
        .load_or_store(id, Span::none())
        .await;

    // Let the state age past the 100 ms staleness threshold.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let config = test_config();
    h.controller.tick(config.short_loop_period).await;

    assert!(
        h.metrics().recovered_count(RecoverySource::EvalStore) >= 1,
        "short loop should count an evalStore recovery"
    );
    // The re-enqueued evaluation dispatches the task.
    assert!(
        eventually(Duration::from_secs(5), || async {
            h.task_api.invoked().await.len() == 1
        })
        .await,
        "recovered invocation should be evaluated"
    );

    h.controller.close().await;
}

#[tokio::test]
async fn short_loop_skips_fresh_and_locked_states() {
    let h = harness().await;

    let workflow = single_task_workflow();
    h.workflows.insert(workflow.clone()).await;
    let id = h.submit_invocation(&workflow).await;

    let state = h
        .controller
        .eval_store()
        .load_or_store(id, Span::none())
        .await;

    // Locked: the sweeper must skip it even when stale.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let guard = state.try_acquire().unwrap();
    h.controller.tick(test_config().short_loop_period).await;
    assert_eq!(h.metrics().recovered_count(RecoverySource::EvalStore), 0);
    drop(guard);

    // Fresh: a just-recorded evaluation is not stale.
    state
        .record(windlass::domain::models::EvalRecord::noop("invocation"))
        .await;
    h.controller.tick(test_config().short_loop_period).await;
    assert_eq!(h.metrics().recovered_count(RecoverySource::EvalStore), 0);
}

#[tokio::test]
async fn long_loop_rediscovers_orphaned_invocations() {
    let h = harness().await;
    h.controller.clone().init().await;

    let workflow = single_task_workflow();
    h.workflows.insert(workflow.clone()).await;

    // In the cache, not terminal, and entirely unknown to the controller.
    let invocation = Invocation::new(InvocationSpec::new(workflow.id));
    let id = h.invocations.submit_silently(invocation).await;
    assert!(h.controller.eval_store().load(id).await.is_none());

    h.controller.tick(test_config().long_loop_period).await;

    assert_eq!(h.metrics().recovered_count(RecoverySource::Cache), 1);
    assert!(
        h.controller.eval_store().load(id).await.is_some()
            || h.task_api.invoked().await.len() == 1,
        "long loop should register the orphaned invocation"
    );
    assert!(
        eventually(Duration::from_secs(5), || async {
            h.task_api.invoked().await.len() == 1
        })
        .await,
        "rediscovered invocation should be evaluated"
    );

    h.controller.close().await;
}

#[tokio::test]
async fn long_loop_ignores_terminal_and_known_invocations() {
    let h = harness().await;

    let workflow = single_task_workflow();
    h.workflows.insert(workflow.clone()).await;

    // Terminal invocation in the cache.
    let mut terminal = Invocation::new(InvocationSpec::new(workflow.id));
    terminal.status.lifecycle = windlass::domain::models::InvocationLifecycle::Aborted;
    h.invocations.submit_silently(terminal).await;

    // Live invocation already tracked by the store.
    let live = Invocation::new(InvocationSpec::new(workflow.id));
    let live_id = h.invocations.submit_silently(live).await;
    h.controller
        .eval_store()
        .load_or_store(live_id, Span::none())
        .await;

    h.controller.tick(test_config().long_loop_period).await;

    assert_eq!(h.metrics().recovered_count(RecoverySource::Cache), 0);
}

#[tokio::test]
async fn graceful_shutdown_drains_and_clears_state() {
    let h = harness().await;
    h.controller.clone().init().await;

    let workflow = single_task_workflow();
    h.workflows.insert(workflow.clone()).await;
    for _ in 0..10 {
        h.submit_invocation(&workflow).await;
    }

    // Let some evaluations start before stopping.
    assert!(
        eventually(Duration::from_secs(5), || async {
            !h.task_api.invoked().await.is_empty()
        })
        .await
    );

    h.controller.close().await;

    assert!(!h.controller.is_running());
    assert!(h.controller.eval_store().is_empty().await);

    // New events after close must not resurrect state: the listener has
    // exited and the queue is shut down.
    let id = h.submit_invocation(&workflow).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.controller.eval_store().load(id).await.is_none());
}

#[tokio::test]
async fn close_is_idempotent() {
    let h = harness().await;
    h.controller.clone().init().await;
    h.controller.close().await;
    h.controller.close().await;
    assert!(!h.controller.is_running());
}

#[tokio::test]
async fn evaluate_without_state_is_a_stale_queue_entry() {
    let h = harness().await;
    let id = uuid::Uuid::new_v4();

    h.controller.evaluate(id).await;

    // Counted, but nothing else happens.
    assert_eq!(h.metrics().eval_job_count(EvalJobOutcome::Noop), 1);
}
