use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::{ActionDecision, AgentPorts, SelectionContext};
use shared_types::{ActionCandidate, AgentState, EventPayload, NodeName, StopReason};

/// Enumerate candidate actions for the current screen and pick one.
///
/// A screen with no candidates ends the run successfully: there is nothing
/// left to explore from here.
pub struct ChooseActionNode;

pub struct ChooseInput {
    ui_ref_id: Option<String>,
    max_actions: usize,
    selection: SelectionContext,
}

pub struct Choice {
    candidate_ids: Vec<String>,
    decision: Option<ActionDecision>,
}

#[async_trait]
impl NodeHandler for ChooseActionNode {
    type Input = ChooseInput;
    type Output = Choice;

    const NAME: NodeName = NodeName::ChooseAction;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::retry(ctx.retry)
    }

    fn build_input(&self, state: &AgentState, ctx: &AgentContext) -> ChooseInput {
        ChooseInput {
            ui_ref_id: state.perception.ui_hierarchy_xml_ref_id.clone(),
            max_actions: ctx.max_actions,
            selection: SelectionContext {
                strategy: state.strategy,
                random_seed: state.random_seed,
                iteration: state.iteration_ordinal_number,
                policy_version: state.policy_version,
            },
        }
    }

    async fn execute(&self, input: ChooseInput, ports: &AgentPorts) -> Result<Executed<Choice>, NodeFailure> {
        let Some(ui_ref_id) = input.ui_ref_id else {
            return Err(NodeFailure::fatal(
                "missing_perception",
                "no UI hierarchy captured to choose an action from",
            ));
        };

        let candidates: Vec<ActionCandidate> = ports
            .action_selection
            .enumerate_actions(&ui_ref_id, input.max_actions)
            .await?;
        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.candidate_id.clone()).collect();

        if candidates.is_empty() {
            tracing::info!(ui_ref_id = %ui_ref_id, "No action candidates, stopping");
            return Ok(Executed::new(
                Choice {
                    candidate_ids,
                    decision: None,
                },
                Vec::new(),
            ));
        }

        let decision = ports
            .action_selection
            .choose_action(&candidates, &input.selection)
            .await?;
        let event = EventPayload::ActionChosen {
            decision_id: decision.decision_id.clone(),
            candidate_count: u32::try_from(candidates.len()).unwrap_or(u32::MAX),
            verb: decision.candidate.verb,
            target_key: decision.candidate.target_key.clone(),
            strategy: input.selection.strategy,
        };
        Ok(Executed::new(
            Choice {
                candidate_ids,
                decision: Some(decision),
            },
            vec![event],
        ))
    }

    fn next_node(&self, output: &Choice) -> Option<NodeName> {
        Some(match output.decision {
            Some(_) => NodeName::ExecuteAction,
            None => NodeName::Stop,
        })
    }

    fn apply_output(&self, mut state: AgentState, output: Choice) -> AgentState {
        state.available_action_candidate_ids = output.candidate_ids;
        match output.decision {
            Some(decision) => {
                state.chosen_action_decision_id = Some(decision.decision_id);
                state.chosen_action = Some(decision.candidate);
            }
            None => {
                state.chosen_action_decision_id = None;
                state.chosen_action = None;
                state.stop_reason = Some(StopReason::Success);
            }
        }
        state
    }
}
