//! Node execution engine
//!
//! Advances one run a node at a time. Every advance commits the next
//! `AgentState` snapshot together with the node's events in a single
//! event-store transaction, so a crashed run resumes from its latest
//! snapshot without losing or duplicating events.
//!
//! Failures go through the node's [`TransitionPolicy`]: retry with backoff,
//! then backtrack to an earlier node (bounded by `max_backtracks`), then fail
//! the run. Cancellation is cooperative and observed between dispatches.

mod context;
mod policy;
mod registry;

#[cfg(test)]
mod tests;

pub use context::AgentContext;
pub use policy::{on_failure, FailureAction, RetryPolicy, TransitionPolicy};
pub use registry::{handler_for, DynNode, Executed, NodeAdvance, NodeFailure, NodeHandler};

use chrono::Utc;
use ractor::ActorRef;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actors::event_store::{self, EventStoreError, EventStoreMsg};
use crate::ports::AgentPorts;
use shared_types::{
    AgentState, EventPayload, NodeName, Run, RunBudgets, RunStatus, StopReason,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Sequence conflict on run {run_id}: expected step {expected}")]
    SequenceConflict { run_id: String, expected: i64 },

    #[error("Stale resume for run {run_id}: expected token {expected}, latest is {actual}")]
    StaleResume {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Event store error: {0}")]
    Store(EventStoreError),

    #[error("Event store unavailable: {0}")]
    Rpc(String),

    #[error("Run task failed: {0}")]
    Task(String),
}

impl From<EventStoreError> for EngineError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::SequenceConflict { run_id, expected } => {
                EngineError::SequenceConflict { run_id, expected }
            }
            EventStoreError::UnknownNode(node) => EngineError::UnknownNode(node),
            EventStoreError::RunNotFound(run_id) => EngineError::RunNotFound(run_id),
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Error id recorded on the run when this error leaves it unable to
    /// continue. `None` for errors that say nothing about the run itself,
    /// such as a conflict with another worker or an unreachable store.
    pub fn structural_error_id(&self) -> Option<&'static str> {
        match self {
            EngineError::UnknownNode(_) => Some("unknown_node"),
            EngineError::Store(_) => Some("persistence_failure"),
            _ => None,
        }
    }
}

fn rpc_error(e: ractor::RactorErr<EventStoreMsg>) -> EngineError {
    EngineError::Rpc(e.to_string())
}

/// Opaque marker for a (run, step) point.
pub fn resume_token(run_id: &str, step_ordinal: i64) -> String {
    let digest = Sha256::digest(format!("{run_id}:{step_ordinal}").as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Request to create a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: Option<String>,
    pub tenant_id: String,
    pub project_id: String,
    pub random_seed: u64,
    pub budgets: RunBudgets,
}

impl NewRun {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            run_id: None,
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            random_seed: 0,
            budgets: RunBudgets::default(),
        }
    }
}

/// What a single [`AgentEngine::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Advanced { from: NodeName, to: NodeName },
    Retrying { node: NodeName, attempt: u32, delay: Duration },
    Backtracked { from: NodeName, to: NodeName },
    Finished { status: RunStatus },
}

pub struct AgentEngine {
    store: ActorRef<EventStoreMsg>,
    ports: AgentPorts,
    context: AgentContext,
    state: AgentState,
    /// Consecutive failures of the current node occurrence. Not persisted.
    attempt: u32,
    cancel: CancellationToken,
}

impl AgentEngine {
    /// Create the run, its step-0 snapshot and `run_started` in one commit.
    pub async fn start_run(
        store: ActorRef<EventStoreMsg>,
        ports: AgentPorts,
        context: AgentContext,
        new_run: NewRun,
    ) -> Result<Self, EngineError> {
        let now = Utc::now();
        let run_id = new_run
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let run = Run {
            run_id: run_id.clone(),
            tenant_id: new_run.tenant_id,
            project_id: new_run.project_id,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        };
        let initial = AgentState::initial(
            run_id.clone(),
            new_run.random_seed,
            new_run.budgets,
            resume_token(&run_id, 0),
            now,
        );
        let started = EventPayload::RunStarted {
            app_id: context.app_id.clone(),
            max_steps: new_run.budgets.max_steps,
            max_time_ms: new_run.budgets.max_time_ms,
        };

        event_store::start_run(&store, run, initial.clone(), vec![started])
            .await
            .map_err(rpc_error)??;
        tracing::info!(run_id = %run_id, app_id = %context.app_id, "Run started");

        Ok(Self::with_state(store, ports, context, initial))
    }

    /// Continue a run from its latest snapshot.
    ///
    /// With `expected_token`, the latest snapshot must still carry that token;
    /// otherwise another worker already advanced the run.
    pub async fn resume(
        store: ActorRef<EventStoreMsg>,
        ports: AgentPorts,
        context: AgentContext,
        run_id: &str,
        expected_token: Option<&str>,
    ) -> Result<Self, EngineError> {
        let loaded: Result<Option<AgentState>, EngineError> = event_store::get_latest_snapshot(&store, run_id)
            .await
            .map_err(rpc_error)
            .and_then(|r| r.map_err(EngineError::from));
        let mut state = match loaded {
            Ok(Some(state)) => state,
            Ok(None) => return Err(EngineError::RunNotFound(run_id.to_string())),
            Err(err) => {
                if let Some(error_id) = err.structural_error_id() {
                    record_failure(&store, run_id, None, error_id, &err).await;
                }
                return Err(err);
            }
        };

        // The runs row can be terminal ahead of the snapshot when a failure
        // was recorded without a step commit.
        if !state.is_terminal() {
            if let Some(run) = event_store::get_run(&store, run_id).await.map_err(rpc_error)?? {
                if run.status.is_terminal() {
                    state.status = run.status;
                    state.stop_reason.get_or_insert(StopReason::Crash);
                }
            }
        }

        if let Some(expected) = expected_token {
            if expected != state.resume_token {
                return Err(EngineError::StaleResume {
                    run_id: run_id.to_string(),
                    expected: expected.to_string(),
                    actual: state.resume_token,
                });
            }
        }

        tracing::info!(
            run_id = %run_id,
            node = %state.node_name,
            step_ordinal = state.step_ordinal,
            "Run resumed"
        );
        Ok(Self::with_state(store, ports, context, state))
    }

    fn with_state(
        store: ActorRef<EventStoreMsg>,
        ports: AgentPorts,
        context: AgentContext,
        state: AgentState,
    ) -> Self {
        Self {
            store,
            ports,
            context,
            state,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    /// Consecutive failures of the node currently being dispatched.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Dispatch the current node once and commit whatever it led to.
    pub async fn step(&mut self) -> Result<StepOutcome, EngineError> {
        if self.state.is_terminal() {
            return Ok(StepOutcome::Finished {
                status: self.state.status,
            });
        }
        if self.cancel.is_cancelled() {
            return self.finish_canceled().await;
        }

        let node = self.state.node_name;
        let handler = handler_for(node);
        let policy = handler.policy(&self.context);
        match handler.run(&self.state, &self.context, &self.ports).await {
            Ok(advance) => self.handle_success(node, advance).await,
            Err(failure) => self.handle_failure(node, policy, failure).await,
        }
    }

    /// Step until the run reaches a terminal status.
    pub async fn run_to_completion(&mut self) -> Result<AgentState, EngineError> {
        loop {
            if let StepOutcome::Finished { .. } = self.step().await? {
                return Ok(self.state.clone());
            }
        }
    }

    async fn handle_success(&mut self, from: NodeName, advance: NodeAdvance) -> Result<StepOutcome, EngineError> {
        let mut next = advance.state;
        next.counters.steps_total += 1;
        next.last_error_id = None;

        let outcome = match advance.next {
            Some(to) => {
                next.node_name = to;
                StepOutcome::Advanced { from, to }
            }
            None => {
                if !next.status.is_terminal() {
                    next.status = RunStatus::Completed;
                    next.stop_reason.get_or_insert(StopReason::Success);
                }
                StepOutcome::Finished { status: next.status }
            }
        };

        self.commit(next, advance.events).await?;
        self.attempt = 0;
        tracing::debug!(
            run_id = %self.state.run_id,
            step_ordinal = self.state.step_ordinal,
            outcome = ?outcome,
            "Node succeeded"
        );
        Ok(outcome)
    }

    async fn handle_failure(
        &mut self,
        node: NodeName,
        policy: TransitionPolicy,
        failure: NodeFailure,
    ) -> Result<StepOutcome, EngineError> {
        self.attempt += 1;
        let backtracks_left = self.state.backtrack_count < self.context.max_backtracks;
        let action = on_failure(&policy, self.attempt, failure.retryable, backtracks_left);

        tracing::warn!(
            run_id = %self.state.run_id,
            node = %node,
            attempt = self.attempt,
            max_attempts = policy.retry.max_attempts,
            error_id = %failure.error_id,
            retryable = failure.retryable,
            summary = %failure.human_readable_failure_summary,
            "Node failed"
        );

        match action {
            FailureAction::Retry { delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
                Ok(StepOutcome::Retrying {
                    node,
                    attempt: self.attempt,
                    delay,
                })
            }
            FailureAction::Backtrack { to } => {
                let mut next = self.state.clone();
                next.node_name = to;
                next.backtrack_count += 1;
                next.last_error_id = Some(failure.error_id.clone());
                let event = EventPayload::NodeBacktracked {
                    from_node: node,
                    to_node: to,
                    error_id: failure.error_id,
                    backtrack_count: next.backtrack_count,
                };
                self.commit(next, vec![event]).await?;
                self.attempt = 0;
                tracing::info!(
                    run_id = %self.state.run_id,
                    from = %node,
                    to = %to,
                    backtrack_count = self.state.backtrack_count,
                    "Backtracking"
                );
                Ok(StepOutcome::Backtracked { from: node, to })
            }
            FailureAction::Fail => {
                let mut next = self.state.clone();
                next.status = RunStatus::Failed;
                next.stop_reason = Some(StopReason::Crash);
                next.last_error_id = Some(failure.error_id.clone());
                let event = EventPayload::RunFailed {
                    node: Some(node),
                    error_id: failure.error_id,
                    summary: failure.human_readable_failure_summary,
                };
                self.commit(next, vec![event]).await?;
                self.attempt = 0;
                tracing::error!(run_id = %self.state.run_id, node = %node, "Run failed");
                Ok(StepOutcome::Finished {
                    status: RunStatus::Failed,
                })
            }
        }
    }

    async fn finish_canceled(&mut self) -> Result<StepOutcome, EngineError> {
        let node = self.state.node_name;
        let mut next = self.state.clone();
        next.status = RunStatus::Canceled;
        next.stop_reason = Some(StopReason::Canceled);
        self.commit(next, vec![EventPayload::RunCanceled { node }]).await?;
        tracing::info!(run_id = %self.state.run_id, node = %node, "Run canceled");
        Ok(StepOutcome::Finished {
            status: RunStatus::Canceled,
        })
    }

    /// Number the snapshot as the next step and persist it with its events.
    async fn commit(&mut self, mut next: AgentState, events: Vec<EventPayload>) -> Result<(), EngineError> {
        next.step_ordinal = self.state.step_ordinal + 1;
        next.resume_token = resume_token(&next.run_id, next.step_ordinal);
        next.timestamps.updated_at = Utc::now();

        let committed: Result<_, EngineError> = event_store::commit_step(&self.store, next.clone(), events)
            .await
            .map_err(rpc_error)
            .and_then(|r| r.map_err(EngineError::from));
        if let Err(err) = committed {
            if let Some(error_id) = err.structural_error_id() {
                let node = Some(self.state.node_name);
                if record_failure(&self.store, &self.state.run_id, node, error_id, &err).await {
                    self.state.status = RunStatus::Failed;
                    self.state.stop_reason = Some(StopReason::Crash);
                    self.state.last_error_id = Some(error_id.to_string());
                }
            }
            return Err(err);
        }
        self.state = next;
        Ok(())
    }
}

/// Best-effort `run_failed` for a run whose state can no longer be read or
/// committed. Returns whether the failure was recorded.
async fn record_failure(
    store: &ActorRef<EventStoreMsg>,
    run_id: &str,
    node: Option<NodeName>,
    error_id: &str,
    cause: &EngineError,
) -> bool {
    match event_store::fail_run(store, run_id, node, error_id, cause.to_string()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::error!(run_id = %run_id, error_id, error = %e, "Could not record run failure");
            false
        }
        Err(e) => {
            tracing::error!(run_id = %run_id, error_id, error = %e, "Could not record run failure");
            false
        }
    }
}

/// One engine on its own task.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<AgentState, EngineError>>,
}

impl RunHandle {
    pub fn spawn(mut engine: AgentEngine) -> Self {
        let run_id = engine.run_id().to_string();
        let cancel = engine.cancel_token();
        let join = tokio::spawn(async move { engine.run_to_completion().await });
        Self { run_id, cancel, join }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cancellation. Takes effect before the next node dispatch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<AgentState, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }
}
