mod common;

use std::sync::Arc;

use bizflow::providers::in_memory::InMemoryHistoryStore;
use bizflow::{EventKind, FactoryConfig, OrchestrationError, OrchestrationFactory, WorkflowStatus};

use common::{arithmetic_registry, run_sequence, Numbers, OpCounters};

#[tokio::test]
async fn arithmetic_sequence_completes_with_ordered_operations() {
    let counters = Arc::new(OpCounters::default());
    let factory = OrchestrationFactory::new(
        FactoryConfig::local(),
        Arc::new(InMemoryHistoryStore::default()),
        arithmetic_registry(counters.clone()),
    )
    .unwrap();

    let wf = factory.create_orchestration("SequenceWorkFlow").await.unwrap();
    let result = run_sequence(
        &wf,
        Numbers {
            number1: 15.0,
            number2: 5.0,
        },
    )
    .await
    .unwrap();

    // (((15+5)-5)*5)/5
    assert_eq!(result, 15.0);
    assert_eq!(counters.total(), 4);

    let state = wf.current_state();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.last_result.as_deref(), Some("15.0"));
    assert!(state.last_error.is_none());

    let completions: Vec<(String, f64)> = wf
        .history()
        .await
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskCompleted { correlation, result } => {
                let parsed: common::OperationResult = serde_json::from_str(result).unwrap();
                Some((correlation.clone(), parsed.result))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        completions,
        vec![
            ("Operation2".to_string(), 20.0),
            ("Operation3".to_string(), 15.0),
            ("Operation4".to_string(), 75.0),
            ("Operation5".to_string(), 15.0),
        ]
    );
}

#[tokio::test]
async fn exactly_one_terminal_event() {
    let factory = OrchestrationFactory::new(
        FactoryConfig::local(),
        Arc::new(InMemoryHistoryStore::default()),
        arithmetic_registry(Arc::new(OpCounters::default())),
    )
    .unwrap();
    let wf = factory.create_orchestration("wf").await.unwrap();
    wf.start_workflow("go").await.unwrap();
    wf.complete_workflow(&"done").await.unwrap();

    // Completing or failing again is rejected.
    let err = wf.complete_workflow(&"again").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::InvalidState {
            status: WorkflowStatus::Completed,
            ..
        }
    ));
    let err = wf.fail_workflow("late failure").await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidState { .. }));

    let terminals = wf
        .history()
        .await
        .iter()
        .filter(|e| e.kind.is_terminal())
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn fail_workflow_is_idempotent_on_failed_instance() {
    let factory = OrchestrationFactory::new(
        FactoryConfig::local(),
        Arc::new(InMemoryHistoryStore::default()),
        arithmetic_registry(Arc::new(OpCounters::default())),
    )
    .unwrap();
    let wf = factory.create_orchestration("wf").await.unwrap();
    wf.start_workflow("go").await.unwrap();
    wf.fail_workflow("boom").await.unwrap();
    // A re-entered failure path converges instead of erroring.
    wf.fail_workflow("boom").await.unwrap();

    let state = wf.current_state();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some("boom"));
    assert_eq!(
        wf.history()
            .await
            .iter()
            .filter(|e| e.kind.is_terminal())
            .count(),
        1
    );
}

#[tokio::test]
async fn start_workflow_is_idempotent() {
    let factory = OrchestrationFactory::new(
        FactoryConfig::local(),
        Arc::new(InMemoryHistoryStore::default()),
        arithmetic_registry(Arc::new(OpCounters::default())),
    )
    .unwrap();
    let wf = factory.create_orchestration("wf").await.unwrap();
    assert_eq!(wf.current_state().status, WorkflowStatus::Created);
    wf.start_workflow("first").await.unwrap();
    wf.start_workflow("second").await.unwrap();
    let starts = wf
        .history()
        .await
        .iter()
        .filter(|e| matches!(e.kind, EventKind::WorkflowStarted { .. }))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(wf.current_state().status, WorkflowStatus::Running);
}

#[tokio::test]
async fn failed_task_surfaces_as_activity_failure() {
    let registry = bizflow::ActivityRegistry::builder()
        .register("Broken", |_input: String| async move {
            Err::<String, _>("division by zero".to_string())
        })
        .build();
    let factory = OrchestrationFactory::new_with_policy(
        FactoryConfig::local(),
        Arc::new(InMemoryHistoryStore::default()),
        registry,
        bizflow::RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
    )
    .unwrap();
    let wf = factory.create_orchestration("wf").await.unwrap();
    wf.start_workflow("go").await.unwrap();

    let err = wf.call_task_raw("Broken", "x", "Operation2").await.unwrap_err();
    match &err {
        OrchestrationError::ActivityFailed { correlation, error } => {
            assert_eq!(correlation, "Operation2");
            assert!(error.contains("division by zero"));
        }
        other => panic!("expected ActivityFailed, got {other:?}"),
    }
    wf.fail_workflow(err.to_string()).await.unwrap();
    assert_eq!(wf.current_state().status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn unregistered_task_fails_the_call() {
    let factory = OrchestrationFactory::new(
        FactoryConfig::local(),
        Arc::new(InMemoryHistoryStore::default()),
        bizflow::ActivityRegistry::default(),
    )
    .unwrap();
    let wf = factory.create_orchestration("wf").await.unwrap();
    wf.start_workflow("go").await.unwrap();
    let err = wf.call_task_raw("Ghost", "", "Operation2").await.unwrap_err();
    assert!(matches!(err, OrchestrationError::ActivityFailed { .. }));
}
