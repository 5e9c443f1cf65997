//! GraphProjectorActor - turns the event log into the screen graph.
//!
//! Each tick picks runs whose log extends past their projection cursor,
//! least recently projected first, and consumes at most `events_per_run`
//! events from each. A processed run's cursor timestamp moves to "now", so it
//! goes to the back of the queue: runs with work are served round-robin and
//! idle runs never take a slot.
//!
//! A run whose pass fails keeps its cursor but also moves to the back of the
//! queue, so one unreadable event cannot hold the first slot forever.
//!
//! The cursor only advances after the whole batch applied. A crash between
//! applying and advancing replays the batch next tick; the per-event outcome
//! guard in [`GraphStore::apply_event`] makes that replay a no-op.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::time::Duration;

use crate::actors::event_store::{self, EventStoreError, EventStoreMsg};
use crate::graph_store::{ApplyResult, GraphStore, GraphStoreError, PendingRun, ProjectionStats};

#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    #[error("EventStore RPC error: {0}")]
    Rpc(String),

    #[error("EventStore error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Graph store error: {0}")]
    Graph(#[from] GraphStoreError),
}

/// Work done for one run in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProjection {
    pub events_read: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub next_seq: i64,
}

/// Work done by one tick across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub runs: usize,
    pub events_read: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub failed_runs: usize,
}

/// Projection logic, independent of the actor that schedules it.
#[derive(Clone)]
pub struct GraphProjector {
    event_store: ActorRef<EventStoreMsg>,
    graph: GraphStore,
    max_runs_per_tick: i64,
    events_per_run: i64,
}

impl GraphProjector {
    pub fn new(
        event_store: ActorRef<EventStoreMsg>,
        graph: GraphStore,
        max_runs_per_tick: i64,
        events_per_run: i64,
    ) -> Self {
        Self {
            event_store,
            graph,
            max_runs_per_tick: max_runs_per_tick.max(1),
            events_per_run: events_per_run.max(1),
        }
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub async fn tick(&self) -> Result<TickReport, ProjectorError> {
        let pending = self.graph.runs_pending_projection(self.max_runs_per_tick).await?;
        let mut report = TickReport::default();

        for run in pending {
            match self.project_from(&run).await {
                Ok(done) => {
                    report.runs += 1;
                    report.events_read += done.events_read;
                    report.applied += done.applied;
                    report.already_applied += done.already_applied;
                }
                Err(err) => {
                    // Cursor position stays put; only the run's turn moves back.
                    report.failed_runs += 1;
                    tracing::warn!(run_id = %run.run_id, error = %err, "Projection failed");
                    if let Err(defer_err) = self.graph.defer_run(&run.run_id).await {
                        tracing::warn!(run_id = %run.run_id, error = %defer_err, "Failed to defer run");
                    }
                }
            }
        }

        if report.runs > 0 {
            tracing::debug!(
                runs = report.runs,
                events = report.events_read,
                applied = report.applied,
                already_applied = report.already_applied,
                "Projection tick"
            );
        }
        Ok(report)
    }

    /// Project one run's next batch regardless of scheduling.
    pub async fn project_run(&self, run_id: &str) -> Result<RunProjection, ProjectorError> {
        let next_seq = self
            .graph
            .get_cursor(run_id)
            .await?
            .map(|c| c.next_seq)
            .unwrap_or(1);
        self.project_from(&PendingRun {
            run_id: run_id.to_string(),
            next_seq,
            last_seq: 0,
        })
        .await
    }

    async fn project_from(&self, run: &PendingRun) -> Result<RunProjection, ProjectorError> {
        let events = event_store::get_events_from(
            &self.event_store,
            run.run_id.clone(),
            run.next_seq,
            self.events_per_run,
        )
        .await
        .map_err(|e| ProjectorError::Rpc(e.to_string()))??;

        let mut done = RunProjection {
            next_seq: run.next_seq,
            ..RunProjection::default()
        };
        let Some(last) = events.last().map(|e| e.sequence) else {
            return Ok(done);
        };

        for event in &events {
            match self.graph.apply_event(event).await? {
                ApplyResult::Applied(outcome) => {
                    done.applied += 1;
                    tracing::trace!(
                        run_id = %event.run_id,
                        seq = event.sequence,
                        screen_id = %outcome.screen_id,
                        upsert_kind = outcome.upsert_kind.as_str(),
                        "Graph mutation applied"
                    );
                }
                ApplyResult::AlreadyApplied => done.already_applied += 1,
                ApplyResult::NotGraphRelevant => {}
            }
        }
        done.events_read = events.len();

        let cursor = self.graph.advance_cursor(&run.run_id, last + 1).await?;
        done.next_seq = cursor.next_seq;
        Ok(done)
    }

    pub async fn stats(&self, run_id: &str) -> Result<ProjectionStats, ProjectorError> {
        Ok(self.graph.projection_stats(run_id).await?)
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Default)]
pub struct GraphProjectorActor;

pub struct GraphProjectorArguments {
    pub projector: GraphProjector,
    /// Tick period; 0 disables the background ticker.
    pub poll_interval_ms: u64,
}

pub struct GraphProjectorState {
    projector: GraphProjector,
}

#[derive(Debug)]
pub enum GraphProjectorMsg {
    /// Internal trigger from the ticker.
    ScanNow,
    /// Run a tick and report what it did.
    RunOnce {
        reply: RpcReplyPort<Result<TickReport, ProjectorError>>,
    },
    GetStats {
        run_id: String,
        reply: RpcReplyPort<Result<ProjectionStats, ProjectorError>>,
    },
}

#[async_trait]
impl Actor for GraphProjectorActor {
    type Msg = GraphProjectorMsg;
    type State = GraphProjectorState;
    type Arguments = GraphProjectorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            poll_interval_ms = args.poll_interval_ms,
            "GraphProjectorActor starting"
        );

        if args.poll_interval_ms > 0 {
            let interval = Duration::from_millis(args.poll_interval_ms);
            let tick_ref = myself.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if tick_ref.cast(GraphProjectorMsg::ScanNow).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(GraphProjectorState {
            projector: args.projector,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            GraphProjectorMsg::ScanNow => {
                if let Err(err) = state.projector.tick().await {
                    tracing::warn!(error = %err, "Projector tick failed");
                }
            }
            GraphProjectorMsg::RunOnce { reply } => {
                let _ = reply.send(state.projector.tick().await);
            }
            GraphProjectorMsg::GetStats { run_id, reply } => {
                let _ = reply.send(state.projector.stats(&run_id).await);
            }
        }
        Ok(())
    }
}

pub async fn run_once(
    projector: &ActorRef<GraphProjectorMsg>,
) -> Result<Result<TickReport, ProjectorError>, ractor::RactorErr<GraphProjectorMsg>> {
    ractor::call!(projector, |reply| GraphProjectorMsg::RunOnce { reply })
}

pub async fn get_stats(
    projector: &ActorRef<GraphProjectorMsg>,
    run_id: impl Into<String>,
) -> Result<Result<ProjectionStats, ProjectorError>, ractor::RactorErr<GraphProjectorMsg>> {
    ractor::call!(projector, |reply| GraphProjectorMsg::GetStats {
        run_id: run_id.into(),
        reply,
    })
}
