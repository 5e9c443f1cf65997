use async_trait::async_trait;
use std::collections::HashMap;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::{AgentPorts, ArtifactKind};
use shared_types::{AgentState, EventPayload, FinalRunMetrics, NodeName, RunStatus, StopReason};

/// Final node: persist a run summary and mark the run finished.
pub struct StopNode;

pub struct StopInput {
    run_id: String,
    stop_reason: StopReason,
    metrics: FinalRunMetrics,
}

pub struct Finished {
    stop_reason: StopReason,
}

fn status_for(reason: StopReason) -> RunStatus {
    match reason {
        StopReason::Success => RunStatus::Completed,
        StopReason::Crash => RunStatus::Failed,
        StopReason::Canceled => RunStatus::Canceled,
    }
}

#[async_trait]
impl NodeHandler for StopNode {
    type Input = StopInput;
    type Output = Finished;

    const NAME: NodeName = NodeName::Stop;

    fn policy(&self, _ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::terminal()
    }

    fn build_input(&self, state: &AgentState, _ctx: &AgentContext) -> StopInput {
        StopInput {
            run_id: state.run_id.clone(),
            stop_reason: state.stop_reason.unwrap_or(StopReason::Success),
            metrics: FinalRunMetrics {
                total_iterations_executed: state.iteration_ordinal_number,
                steps_total: state.counters.steps_total + 1,
                screens_new: state.counters.screens_new,
            },
        }
    }

    async fn execute(&self, input: StopInput, ports: &AgentPorts) -> Result<Executed<Finished>, NodeFailure> {
        let summary = serde_json::json!({
            "run_id": input.run_id,
            "stop_reason": input.stop_reason,
            "final_run_metrics": input.metrics,
        });
        let summary_ref_id = ports
            .storage
            .store_artifact(
                &input.run_id,
                ArtifactKind::RunSummary,
                summary.to_string().into_bytes(),
                HashMap::from([("content_type".to_string(), "application/json".to_string())]),
            )
            .await?;

        tracing::info!(
            run_id = %input.run_id,
            stop_reason = input.stop_reason.as_str(),
            total_iterations = input.metrics.total_iterations_executed,
            screens_new = input.metrics.screens_new,
            "Run finished"
        );

        let event = EventPayload::RunFinished {
            stop_reason: input.stop_reason,
            final_run_metrics: input.metrics,
            summary_ref_id: Some(summary_ref_id),
        };
        Ok(Executed::new(
            Finished {
                stop_reason: input.stop_reason,
            },
            vec![event],
        ))
    }

    fn next_node(&self, _output: &Finished) -> Option<NodeName> {
        None
    }

    fn apply_output(&self, mut state: AgentState, output: Finished) -> AgentState {
        state.status = status_for(output.stop_reason);
        state.stop_reason = Some(output.stop_reason);
        state
    }
}
