use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::actors::event_store;
use crate::engine::{resume_token, AgentEngine, EngineError, RunHandle, StepOutcome};
use shared_types::{
    DomainEvent, EventPayload, NodeName, RunBudgets, RunStatus, StopReason, EVENT_RUN_STARTED,
    EVENT_SCREEN_PERCEIVED,
};

use super::support::{
    fast_context, ports, spawn_store, spawn_store_with_pool, start_engine, start_engine_with_budgets,
    FakeDevice, APP_ID,
};

async fn all_events(
    store: &ractor::ActorRef<event_store::EventStoreMsg>,
    run_id: &str,
) -> Vec<DomainEvent> {
    event_store::get_events_from(store, run_id, 1, 1000)
        .await
        .unwrap()
        .unwrap()
}

async fn step_until(engine: &mut AgentEngine, node: NodeName) {
    for _ in 0..20 {
        if engine.state().node_name == node {
            return;
        }
        engine.step().await.unwrap();
    }
    panic!("never reached {node}");
}

#[tokio::test]
async fn test_step_budget_stops_run_successfully() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;

    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.stop_reason, Some(StopReason::Success));
    assert_eq!(state.iteration_ordinal_number, 5);
    assert_eq!(state.counters.screens_new, 1);
    assert_eq!(state.node_name, NodeName::Stop);

    let events = all_events(&store, &state.run_id).await;
    assert_eq!(events[0].kind, EVENT_RUN_STARTED);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as i64 + 1);
    }
    match &events.last().unwrap().payload {
        EventPayload::RunFinished {
            stop_reason,
            final_run_metrics,
            summary_ref_id,
        } => {
            assert_eq!(*stop_reason, StopReason::Success);
            assert_eq!(final_run_metrics.total_iterations_executed, 5);
            assert_eq!(final_run_metrics.screens_new, 1);
            assert!(summary_ref_id.is_some());
        }
        other => panic!("expected run_finished, got {other:?}"),
    }

    let run = event_store::get_run(&store, state.run_id.clone())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    store.stop(None);
}

#[tokio::test]
async fn test_identical_screenshots_share_a_hash() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 2).await;
    let state = engine.run_to_completion().await.unwrap();

    let hashes: Vec<_> = all_events(&store, &state.run_id)
        .await
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::ScreenPerceived {
                perceptual_hash64, ..
            } => Some(perceptual_hash64),
            _ => None,
        })
        .collect();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes[0], hashes[1]);
    assert_eq!(state.counters.screens_new, 1);
    assert_eq!(state.counters.no_progress_cycles, 1);
    store.stop(None);
}

#[tokio::test]
async fn test_three_failures_backtrack_to_ensure_device() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        installed: false,
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;
    step_until(&mut engine, NodeName::ProvisionApp).await;
    let before = engine.state().step_ordinal;

    for attempt in 1..=2 {
        match engine.step().await.unwrap() {
            StepOutcome::Retrying { node, attempt: n, .. } => {
                assert_eq!(node, NodeName::ProvisionApp);
                assert_eq!(n, attempt);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Backtracked {
            from: NodeName::ProvisionApp,
            to: NodeName::EnsureDevice
        }
    );
    assert_eq!(engine.state().node_name, NodeName::EnsureDevice);
    assert_eq!(engine.attempt(), 0);
    assert_eq!(engine.state().step_ordinal, before + 1);
    assert_eq!(engine.state().last_error_id.as_deref(), Some("app_not_installed"));
    store.stop(None);
}

#[tokio::test]
async fn test_backtrack_after_exhausted_retries() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        perform_failures: AtomicU32::new(3),
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;
    step_until(&mut engine, NodeName::ExecuteAction).await;

    assert!(matches!(
        engine.step().await.unwrap(),
        StepOutcome::Retrying { attempt: 1, .. }
    ));
    assert!(matches!(
        engine.step().await.unwrap(),
        StepOutcome::Retrying { attempt: 2, .. }
    ));
    assert_eq!(engine.attempt(), 2);
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Backtracked {
            from: NodeName::ExecuteAction,
            to: NodeName::LaunchOrAttach
        }
    );
    assert_eq!(engine.state().node_name, NodeName::LaunchOrAttach);
    assert_eq!(engine.state().backtrack_count, 1);
    assert_eq!(engine.attempt(), 0);

    let events = all_events(&store, engine.run_id()).await;
    match &events.last().unwrap().payload {
        EventPayload::NodeBacktracked {
            from_node,
            to_node,
            error_id,
            backtrack_count,
        } => {
            assert_eq!(*from_node, NodeName::ExecuteAction);
            assert_eq!(*to_node, NodeName::LaunchOrAttach);
            assert_eq!(error_id, "input_error");
            assert_eq!(*backtrack_count, 1);
        }
        other => panic!("expected node_backtracked, got {other:?}"),
    }

    // The backtracked run recovers and finishes.
    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    store.stop(None);
}

#[tokio::test]
async fn test_transient_device_errors_are_retried() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        device_offline_failures: AtomicU32::new(2),
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;

    assert!(matches!(engine.step().await.unwrap(), StepOutcome::Retrying { .. }));
    assert!(matches!(engine.step().await.unwrap(), StepOutcome::Retrying { .. }));
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Advanced {
            from: NodeName::EnsureDevice,
            to: NodeName::ProvisionApp
        }
    );
    assert_eq!(device.ensure_device_calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.state().device_runtime_context_id.as_deref(), Some("device-ctx-3"));
    // Retries do not commit snapshots.
    assert_eq!(engine.state().step_ordinal, 1);
    store.stop(None);
}

#[tokio::test]
async fn test_stop_failure_fails_the_run_without_looping() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        summary_storage_fails: true,
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 1).await;
    step_until(&mut engine, NodeName::Stop).await;

    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Failed
        }
    );
    let state = engine.state();
    assert_eq!(state.stop_reason, Some(StopReason::Crash));
    assert_eq!(state.last_error_id.as_deref(), Some("storage_error"));

    let events = all_events(&store, engine.run_id()).await;
    assert!(matches!(
        events.last().unwrap().payload,
        EventPayload::RunFailed {
            node: Some(NodeName::Stop),
            ..
        }
    ));

    // A terminal run does not dispatch again.
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Failed
        }
    );
    assert_eq!(all_events(&store, engine.run_id()).await.len(), events.len());
    store.stop(None);
}

#[tokio::test]
async fn test_failed_restart_is_fatal() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        launch_failures: AtomicU32::new(1),
        restart_succeeds: false,
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;
    step_until(&mut engine, NodeName::LaunchOrAttach).await;

    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Failed
        }
    );
    assert_eq!(engine.state().last_error_id.as_deref(), Some("app_restart_failed"));
    assert_eq!(device.launch_calls.load(Ordering::SeqCst), 1);
    store.stop(None);
}

#[tokio::test]
async fn test_backtrack_ceiling_fails_the_run() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        perform_failures: AtomicU32::new(u32::MAX),
        ..FakeDevice::default()
    });
    let mut context = fast_context();
    context.max_backtracks = 1;
    let mut engine = start_engine(&store, &device, context, 50).await;

    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.stop_reason, Some(StopReason::Crash));
    assert_eq!(state.backtrack_count, 1);
    assert_eq!(state.node_name, NodeName::ExecuteAction);
    store.stop(None);
}

#[tokio::test]
async fn test_missing_app_without_package_ref_is_retried_then_backtracked() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        installed: false,
        ..FakeDevice::default()
    });
    let mut context = fast_context();
    context.max_backtracks = 0;
    let mut engine = start_engine(&store, &device, context, 5).await;

    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.last_error_id.as_deref(), Some("app_not_installed"));
    assert_eq!(state.node_name, NodeName::ProvisionApp);
    store.stop(None);
}

#[tokio::test]
async fn test_missing_app_is_installed_from_package_ref() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        installed: false,
        ..FakeDevice::default()
    });
    let mut context = fast_context();
    context.package_ref = Some("s3://apks/app.apk".to_string());
    let mut engine = start_engine(&store, &device, context, 5).await;
    step_until(&mut engine, NodeName::LaunchOrAttach).await;

    let events = all_events(&store, engine.run_id()).await;
    assert!(events.iter().any(|e| matches!(
        e.payload,
        EventPayload::AppProvisioned {
            installed_now: true,
            ..
        }
    )));
    store.stop(None);
}

#[tokio::test]
async fn test_cancellation_is_observed_before_dispatch() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 50).await;
    engine.step().await.unwrap();

    engine.cancel_token().cancel();
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Canceled
        }
    );
    assert_eq!(engine.state().stop_reason, Some(StopReason::Canceled));
    let events = all_events(&store, engine.run_id()).await;
    assert!(matches!(
        events.last().unwrap().payload,
        EventPayload::RunCanceled {
            node: NodeName::ProvisionApp
        }
    ));
    store.stop(None);
}

#[tokio::test]
async fn test_run_handle_cancel() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let engine = start_engine(&store, &device, fast_context(), 50).await;

    let handle = RunHandle::spawn(engine);
    handle.cancel();
    let state = handle.join().await.unwrap();
    assert_eq!(state.status, RunStatus::Canceled);
    store.stop(None);
}

#[tokio::test]
async fn test_edge_is_observed_between_distinct_screens() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        screens: vec![b"home".to_vec(), b"details".to_vec()],
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 2).await;
    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.counters.screens_new, 2);

    let events = all_events(&store, &state.run_id).await;
    let perceived: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EVENT_SCREEN_PERCEIVED)
        .collect();
    assert_eq!(perceived.len(), 2);

    let edges: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::EdgeObserved {
                from_hash,
                to_hash,
                target_key,
                ..
            } => Some((*from_hash, *to_hash, target_key.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(edges.len(), 1);
    assert_ne!(edges[0].0, edges[0].1);
    assert_eq!(device.performed.lock().unwrap().len(), 1);
    assert_eq!(edges[0].2, device.performed.lock().unwrap()[0]);
    store.stop(None);
}

#[tokio::test]
async fn test_no_candidates_stops_successfully() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        candidates: Vec::new(),
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 10).await;
    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.iteration_ordinal_number, 1);
    assert!(state.available_action_candidate_ids.is_empty());
    store.stop(None);
}

#[tokio::test]
async fn test_resume_continues_from_latest_snapshot() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;
    engine.step().await.unwrap();
    let stale_token = engine.state().resume_token.clone();
    engine.step().await.unwrap();
    let run_id = engine.run_id().to_string();
    let current = engine.state().clone();
    drop(engine);

    assert_eq!(current.resume_token, resume_token(&run_id, current.step_ordinal));

    let resumed = AgentEngine::resume(
        store.clone(),
        ports(&device),
        fast_context(),
        &run_id,
        Some(&current.resume_token),
    )
    .await
    .unwrap();
    assert_eq!(resumed.state(), &current);

    let err = AgentEngine::resume(
        store.clone(),
        ports(&device),
        fast_context(),
        &run_id,
        Some(&stale_token),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, EngineError::StaleResume { .. }));

    let err = AgentEngine::resume(store.clone(), ports(&device), fast_context(), "nope", None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::RunNotFound(_)));
    store.stop(None);
}

#[tokio::test]
async fn test_two_engines_on_one_run_conflict() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut first = start_engine(&store, &device, fast_context(), 5).await;
    let run_id = first.run_id().to_string();
    let mut second = AgentEngine::resume(store.clone(), ports(&device), fast_context(), &run_id, None)
        .await
        .unwrap();

    first.step().await.unwrap();
    let err = second.step().await.unwrap_err();
    assert!(matches!(err, EngineError::SequenceConflict { .. }));
    store.stop(None);
}

#[tokio::test]
async fn test_foreground_app_is_attached_not_launched() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice {
        foreground_app: Some(APP_ID.to_string()),
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;
    step_until(&mut engine, NodeName::WaitIdle).await;

    assert_eq!(device.launch_calls.load(Ordering::SeqCst), 0);
    assert!(engine.state().application_foreground_context_id.is_some());
    let launched = all_events(&store, engine.run_id())
        .await
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::AppLaunched {
                attached, restarted, ..
            } => Some((attached, restarted)),
            _ => None,
        });
    assert_eq!(launched, Some((true, false)));
    store.stop(None);
}

#[tokio::test]
async fn test_signature_mismatch_fails_without_backtrack() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut context = fast_context();
    context.expected_signature_sha256 = Some("cd".repeat(32));
    let mut engine = start_engine(&store, &device, context, 5).await;
    step_until(&mut engine, NodeName::ProvisionApp).await;

    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Failed
        }
    );
    let state = engine.state();
    assert_eq!(state.last_error_id.as_deref(), Some("signature_mismatch"));
    assert_eq!(state.backtrack_count, 0);
    assert_eq!(device.ensure_device_calls.load(Ordering::SeqCst), 1);
    store.stop(None);
}

#[tokio::test]
async fn test_matching_signature_is_recorded() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut context = fast_context();
    context.expected_signature_sha256 = Some("AB".repeat(32));
    let mut engine = start_engine(&store, &device, context, 5).await;
    step_until(&mut engine, NodeName::LaunchOrAttach).await;

    let signature = all_events(&store, engine.run_id())
        .await
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::AppProvisioned { signature_sha256, .. } => signature_sha256,
            _ => None,
        });
    assert_eq!(signature, Some("ab".repeat(32)));
    store.stop(None);
}

#[tokio::test]
async fn test_time_budget_stops_after_first_iteration() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let mut context = fast_context();
    context.perceive_settle_delay_ms = 5;
    let budgets = RunBudgets {
        max_steps: 50,
        max_time_ms: 0,
    };
    let mut engine = start_engine_with_budgets(&store, &device, context, budgets).await;

    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.stop_reason, Some(StopReason::Success));
    assert_eq!(state.iteration_ordinal_number, 1);
    assert!(device.performed.lock().unwrap().is_empty());
    store.stop(None);
}

#[tokio::test]
async fn test_progress_without_perception_fails_immediately() {
    let store = spawn_store().await;
    let device = Arc::new(FakeDevice::default());
    let engine = start_engine(&store, &device, fast_context(), 5).await;
    let run_id = engine.run_id().to_string();

    let mut skipped = engine.state().clone();
    skipped.node_name = NodeName::DetectProgress;
    skipped.step_ordinal = 1;
    skipped.resume_token = resume_token(&run_id, 1);
    assert!(skipped.perception.screen_perceptual_hash64.is_none());
    event_store::commit_step(&store, skipped, Vec::new())
        .await
        .unwrap()
        .unwrap();
    drop(engine);

    let mut engine = AgentEngine::resume(store.clone(), ports(&device), fast_context(), &run_id, None)
        .await
        .unwrap();
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Failed
        }
    );
    assert_eq!(engine.state().last_error_id.as_deref(), Some("missing_perception"));
    assert_eq!(engine.state().node_name, NodeName::DetectProgress);
    assert_eq!(engine.attempt(), 0);
    assert_eq!(device.captures.load(Ordering::SeqCst), 0);
    store.stop(None);
}

#[tokio::test]
async fn test_unknown_stored_node_fails_the_run_on_resume() {
    let (store, pool) = spawn_store_with_pool().await;
    let device = Arc::new(FakeDevice::default());
    let engine = start_engine(&store, &device, fast_context(), 5).await;
    let run_id = engine.run_id().to_string();
    drop(engine);

    sqlx::query("UPDATE agent_state_snapshots SET node_name = 'teleport' WHERE run_id = ?1")
        .bind(&run_id)
        .execute(&pool)
        .await
        .unwrap();

    let err = AgentEngine::resume(store.clone(), ports(&device), fast_context(), &run_id, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::UnknownNode(ref node) if node == "teleport"));

    let run = event_store::get_run(&store, run_id.clone())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    match &all_events(&store, &run_id).await.last().unwrap().payload {
        EventPayload::RunFailed { node, error_id, .. } => {
            assert_eq!(*node, None);
            assert_eq!(error_id, "unknown_node");
        }
        other => panic!("expected run_failed, got {other:?}"),
    }
    store.stop(None);
}

#[tokio::test]
async fn test_rejected_snapshot_write_fails_the_run() {
    let (store, pool) = spawn_store_with_pool().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 5).await;
    let run_id = engine.run_id().to_string();

    sqlx::query(
        "CREATE TRIGGER reject_snapshots BEFORE INSERT ON agent_state_snapshots \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = engine.step().await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(engine.state().status, RunStatus::Failed);
    assert_eq!(engine.state().last_error_id.as_deref(), Some("persistence_failure"));
    assert_eq!(
        engine.step().await.unwrap(),
        StepOutcome::Finished {
            status: RunStatus::Failed
        }
    );

    let run = event_store::get_run(&store, run_id.clone())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    match &all_events(&store, &run_id).await.last().unwrap().payload {
        EventPayload::RunFailed { node, error_id, .. } => {
            assert_eq!(*node, Some(NodeName::EnsureDevice));
            assert_eq!(error_id, "persistence_failure");
        }
        other => panic!("expected run_failed, got {other:?}"),
    }

    let resumed = AgentEngine::resume(store.clone(), ports(&device), fast_context(), &run_id, None)
        .await
        .unwrap();
    assert_eq!(resumed.state().status, RunStatus::Failed);
    assert_eq!(resumed.state().step_ordinal, 0);
    store.stop(None);
}
