use ractor::{Actor, ActorRef};
use std::sync::Arc;

use super::support::*;
use crate::actors::event_store::{self, EventStoreActor, EventStoreArguments, EventStoreMsg};
use crate::actors::graph_projector::GraphProjector;
use crate::db;
use crate::graph_store::GraphStore;
use shared_types::{RunStatus, ScreenHash, UpsertKind, EVENT_EDGE_OBSERVED, EVENT_SCREEN_PERCEIVED};

async fn shared_stores() -> (ActorRef<EventStoreMsg>, GraphStore) {
    let pool = db::connect_in_memory().await.unwrap();
    let (store, _handle) = Actor::spawn(None, EventStoreActor, EventStoreArguments::Pool(pool.clone()))
        .await
        .unwrap();
    (store, GraphStore::new(pool))
}

async fn count_kind(store: &ActorRef<EventStoreMsg>, run_id: &str, kind: &str) -> i64 {
    event_store::get_events_from(store, run_id, 1, 10_000)
        .await
        .unwrap()
        .unwrap()
        .iter()
        .filter(|e| e.kind == kind)
        .count() as i64
}

#[tokio::test]
async fn test_identical_screens_project_to_one_node() {
    let (store, graph) = shared_stores().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 4).await;
    let state = engine.run_to_completion().await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    let run_id = state.run_id.clone();

    let projector = GraphProjector::new(store.clone(), graph.clone(), 10, 1_000);
    let report = projector.tick().await.unwrap();
    assert_eq!(report.runs, 1);
    assert_eq!(report.failed_runs, 0);

    let perceived = count_kind(&store, &run_id, EVENT_SCREEN_PERCEIVED).await;
    assert!(perceived >= 2);

    let screens = graph.list_screens(APP_ID).await.unwrap();
    assert_eq!(screens.len(), 1);
    assert_eq!(screens[0].evidence_counter, perceived);

    let hash = state.visited_screens.iter().next().copied().unwrap();
    let by_hash = graph.get_screen_by_hash(APP_ID, hash).await.unwrap().unwrap();
    assert_eq!(by_hash.screen_id, screens[0].screen_id);

    let stats = projector.stats(&run_id).await.unwrap();
    assert_eq!(stats.screens_discovered, 1);
    let edges = count_kind(&store, &run_id, EVENT_EDGE_OBSERVED).await;
    assert_eq!(stats.outcomes_total, perceived + edges);
    assert!(stats.observations_mapped >= perceived - 1);

    // Nothing left to project.
    let again = projector.tick().await.unwrap();
    assert_eq!(again.runs, 0);
    assert_eq!(again.applied, 0);
}

#[tokio::test]
async fn test_self_loop_edge_accumulates_evidence() {
    let (store, graph) = shared_stores().await;
    let device = Arc::new(FakeDevice {
        candidates: vec![candidate("c-1", "btn_refresh")],
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 4).await;
    let state = engine.run_to_completion().await.unwrap();

    let projector = GraphProjector::new(store.clone(), graph.clone(), 10, 1_000);
    projector.tick().await.unwrap();

    let edges_observed = count_kind(&store, &state.run_id, EVENT_EDGE_OBSERVED).await;
    assert!(edges_observed >= 1);

    let screen = &graph.list_screens(APP_ID).await.unwrap()[0];
    let edges = graph.list_edges_from(&screen.screen_id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].to_screen_id, screen.screen_id);
    assert_eq!(edges[0].evidence_counter, edges_observed);

    let actions = graph.list_actions(&screen.screen_id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].target_key, "btn_refresh");
}

#[tokio::test]
async fn test_small_batches_reach_the_same_graph() {
    let (store, graph) = shared_stores().await;
    let device = Arc::new(FakeDevice {
        screens: vec![b"home".to_vec(), b"settings".to_vec(), b"home".to_vec()],
        ..FakeDevice::default()
    });
    let mut engine = start_engine(&store, &device, fast_context(), 3).await;
    let state = engine.run_to_completion().await.unwrap();
    let last_seq = event_store::get_last_event_sequence(&store, state.run_id.clone())
        .await
        .unwrap()
        .unwrap();

    let projector = GraphProjector::new(store.clone(), graph.clone(), 10, 3);
    let mut ticks = 0;
    loop {
        let report = projector.tick().await.unwrap();
        if report.runs == 0 {
            break;
        }
        assert!(report.events_read <= 3);
        ticks += 1;
    }
    assert_eq!(ticks, (last_seq + 2) / 3);

    let cursor = graph.get_cursor(&state.run_id).await.unwrap().unwrap();
    assert_eq!(cursor.next_seq, last_seq + 1);

    let screens = graph.list_screens(APP_ID).await.unwrap();
    assert_eq!(screens.len(), 2);

    let outcomes = graph.list_outcomes(&state.run_id).await.unwrap();
    let discovered = outcomes
        .iter()
        .filter(|o| o.upsert_kind == UpsertKind::Discovered)
        .count();
    assert!(discovered >= 2);
}

#[tokio::test]
async fn test_project_run_after_cursor_reset_is_a_no_op() {
    let (store, graph) = shared_stores().await;
    let device = Arc::new(FakeDevice::default());
    let mut engine = start_engine(&store, &device, fast_context(), 2).await;
    let state = engine.run_to_completion().await.unwrap();

    let projector = GraphProjector::new(store.clone(), graph.clone(), 10, 1_000);
    let first = projector.project_run(&state.run_id).await.unwrap();
    assert!(first.applied > 0);
    let before = graph.list_screens(APP_ID).await.unwrap();

    // Simulate a crash after applying but before the cursor moved.
    sqlx::query("DELETE FROM projection_cursors WHERE run_id = ?1")
        .bind(&state.run_id)
        .execute(graph.pool())
        .await
        .unwrap();

    let replay = projector.project_run(&state.run_id).await.unwrap();
    assert_eq!(replay.applied, 0);
    assert_eq!(replay.already_applied, first.applied);
    assert_eq!(graph.list_screens(APP_ID).await.unwrap(), before);

    let unknown = graph
        .get_screen_by_hash(APP_ID, ScreenHash(0))
        .await
        .unwrap();
    assert!(unknown.is_none());
}
