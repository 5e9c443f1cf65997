use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::AgentPorts;
use shared_types::{ActionCandidate, AgentState, EventPayload, ExecutedAction, NodeName, ScreenHash};

/// Perform the chosen action on the device.
///
/// The executed action is kept in state so the next progress check can
/// attribute the resulting screen to it.
pub struct ExecuteActionNode;

pub struct PendingAction {
    decision_id: Option<String>,
    action: Option<ActionCandidate>,
    from_hash: Option<ScreenHash>,
}

#[async_trait]
impl NodeHandler for ExecuteActionNode {
    type Input = PendingAction;
    type Output = ExecutedAction;

    const NAME: NodeName = NodeName::ExecuteAction;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::with_backtrack(ctx.retry, NodeName::LaunchOrAttach)
    }

    fn build_input(&self, state: &AgentState, _ctx: &AgentContext) -> PendingAction {
        PendingAction {
            decision_id: state.chosen_action_decision_id.clone(),
            action: state.chosen_action.clone(),
            from_hash: state.perception.screen_perceptual_hash64,
        }
    }

    async fn execute(
        &self,
        input: PendingAction,
        ports: &AgentPorts,
    ) -> Result<Executed<ExecutedAction>, NodeFailure> {
        let (Some(decision_id), Some(action), Some(from_hash)) =
            (input.decision_id, input.action, input.from_hash)
        else {
            return Err(NodeFailure::fatal(
                "missing_decision",
                "no chosen action to execute",
            ));
        };

        ports.input.perform(&action).await?;
        tracing::debug!(
            decision_id = %decision_id,
            verb = action.verb.as_str(),
            target_key = %action.target_key,
            "Action executed"
        );

        let executed = ExecutedAction {
            decision_id,
            verb: action.verb,
            target_key: action.target_key,
            from_hash,
        };
        let event = EventPayload::ActionExecuted {
            decision_id: executed.decision_id.clone(),
            verb: executed.verb,
            target_key: executed.target_key.clone(),
            from_hash,
        };
        Ok(Executed::new(executed, vec![event]))
    }

    fn next_node(&self, _output: &ExecutedAction) -> Option<NodeName> {
        Some(NodeName::WaitIdle)
    }

    fn apply_output(&self, mut state: AgentState, output: ExecutedAction) -> AgentState {
        state.last_executed_action = Some(output);
        state.chosen_action = None;
        state
    }
}
