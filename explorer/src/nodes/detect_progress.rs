//! DetectProgress: close one main-loop iteration.
//!
//! Counts the iteration, decides whether the last perception found a new
//! screen, attributes the edge from the previously executed action and picks
//! between continuing, switching policy and stopping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::AgentPorts;
use shared_types::{
    AgentState, EventPayload, ExecutedAction, NodeName, ProgressVerdict, RunBudgets, ScreenHash,
    StopReason,
};

pub struct DetectProgressNode;

pub struct ProgressInput {
    app_id: String,
    step_ordinal: i64,
    iteration: i64,
    hash: Option<ScreenHash>,
    seen_before: bool,
    screens_new: i64,
    no_progress_cycles: i64,
    last_executed_action: Option<ExecutedAction>,
    budgets: RunBudgets,
    started_at: DateTime<Utc>,
    switch_after: i64,
    stop_after: i64,
}

pub struct Progress {
    iteration: i64,
    hash: ScreenHash,
    screens_new: i64,
    no_progress_cycles: i64,
    verdict: ProgressVerdict,
    progress_evaluation_id: String,
}

/// Verdict for an iteration given the counters after it.
pub(crate) fn verdict(
    iteration: i64,
    elapsed_ms: i64,
    no_progress_cycles: i64,
    budgets: &RunBudgets,
    switch_after: i64,
    stop_after: i64,
) -> ProgressVerdict {
    if iteration >= budgets.max_steps
        || elapsed_ms > budgets.max_time_ms
        || (stop_after > 0 && no_progress_cycles >= stop_after)
    {
        return ProgressVerdict::Stop;
    }
    // Switch once per `switch_after` unproductive iterations, not on every one past it.
    if switch_after > 0 && no_progress_cycles > 0 && no_progress_cycles % switch_after == 0 {
        return ProgressVerdict::SwitchPolicy;
    }
    ProgressVerdict::Continue
}

#[async_trait]
impl NodeHandler for DetectProgressNode {
    type Input = ProgressInput;
    type Output = Progress;

    const NAME: NodeName = NodeName::DetectProgress;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::retry(ctx.retry)
    }

    fn build_input(&self, state: &AgentState, ctx: &AgentContext) -> ProgressInput {
        let hash = state.perception.screen_perceptual_hash64;
        ProgressInput {
            app_id: ctx.app_id.clone(),
            step_ordinal: state.step_ordinal + 1,
            iteration: state.iteration_ordinal_number + 1,
            hash,
            seen_before: hash.map_or(false, |h| state.visited_screens.contains(&h)),
            screens_new: state.counters.screens_new,
            no_progress_cycles: state.counters.no_progress_cycles,
            last_executed_action: state.last_executed_action.clone(),
            budgets: state.budgets,
            started_at: state.timestamps.created_at,
            switch_after: ctx.switch_policy_after_no_progress_cycles,
            stop_after: ctx.stop_after_no_progress_cycles,
        }
    }

    async fn execute(
        &self,
        input: ProgressInput,
        _ports: &AgentPorts,
    ) -> Result<Executed<Progress>, NodeFailure> {
        let Some(hash) = input.hash else {
            return Err(NodeFailure::fatal(
                "missing_perception",
                "progress evaluated before any screen was perceived",
            ));
        };

        let is_new_screen = !input.seen_before;
        let (screens_new, no_progress_cycles) = if is_new_screen {
            (input.screens_new + 1, 0)
        } else {
            (input.screens_new, input.no_progress_cycles + 1)
        };

        let elapsed_ms = (Utc::now() - input.started_at).num_milliseconds();
        let verdict = verdict(
            input.iteration,
            elapsed_ms,
            no_progress_cycles,
            &input.budgets,
            input.switch_after,
            input.stop_after,
        );

        let mut events = Vec::with_capacity(2);
        if let Some(action) = input.last_executed_action {
            events.push(EventPayload::EdgeObserved {
                observation_id: ulid::Ulid::new().to_string(),
                app_id: input.app_id,
                step_ordinal: input.step_ordinal,
                from_hash: action.from_hash,
                verb: action.verb,
                target_key: action.target_key,
                to_hash: hash,
            });
        }

        let progress_evaluation_id = ulid::Ulid::new().to_string();
        events.push(EventPayload::ProgressEvaluated {
            progress_evaluation_id: progress_evaluation_id.clone(),
            iteration: input.iteration,
            is_new_screen,
            screens_new,
            no_progress_cycles,
            verdict,
        });

        tracing::info!(
            iteration = input.iteration,
            is_new_screen,
            screens_new,
            no_progress_cycles,
            verdict = ?verdict,
            "Progress evaluated"
        );

        Ok(Executed::new(
            Progress {
                iteration: input.iteration,
                hash,
                screens_new,
                no_progress_cycles,
                verdict,
                progress_evaluation_id,
            },
            events,
        ))
    }

    fn next_node(&self, output: &Progress) -> Option<NodeName> {
        Some(match output.verdict {
            ProgressVerdict::Continue => NodeName::ChooseAction,
            ProgressVerdict::SwitchPolicy => NodeName::SwitchPolicy,
            ProgressVerdict::Stop => NodeName::Stop,
        })
    }

    fn apply_output(&self, mut state: AgentState, output: Progress) -> AgentState {
        state.iteration_ordinal_number = output.iteration;
        state.counters.screens_new = output.screens_new;
        state.counters.no_progress_cycles = output.no_progress_cycles;
        state.visited_screens.insert(output.hash);
        state.last_executed_action = None;
        state.progress_evaluation_id = Some(output.progress_evaluation_id);
        if output.verdict == ProgressVerdict::Stop {
            state.stop_reason = Some(StopReason::Success);
        }
        state
    }
}
