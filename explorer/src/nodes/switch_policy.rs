use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::AgentPorts;
use shared_types::{AgentState, EventPayload, ExplorationStrategy, NodeName};

/// Rotate to the next exploration strategy after a plateau.
pub struct SwitchPolicyNode;

pub struct CurrentPolicy {
    strategy: ExplorationStrategy,
    policy_version: u32,
}

#[async_trait]
impl NodeHandler for SwitchPolicyNode {
    type Input = CurrentPolicy;
    type Output = CurrentPolicy;

    const NAME: NodeName = NodeName::SwitchPolicy;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::retry(ctx.retry)
    }

    fn build_input(&self, state: &AgentState, _ctx: &AgentContext) -> CurrentPolicy {
        CurrentPolicy {
            strategy: state.strategy,
            policy_version: state.policy_version,
        }
    }

    async fn execute(
        &self,
        input: CurrentPolicy,
        _ports: &AgentPorts,
    ) -> Result<Executed<CurrentPolicy>, NodeFailure> {
        let next = CurrentPolicy {
            strategy: input.strategy.next(),
            policy_version: input.policy_version.saturating_add(1),
        };
        tracing::info!(
            from = input.strategy.as_str(),
            to = next.strategy.as_str(),
            policy_version = next.policy_version,
            "Switching exploration policy"
        );
        let event = EventPayload::PolicySwitched {
            from_strategy: input.strategy,
            to_strategy: next.strategy,
            policy_version: next.policy_version,
        };
        Ok(Executed::new(next, vec![event]))
    }

    fn next_node(&self, _output: &CurrentPolicy) -> Option<NodeName> {
        Some(NodeName::ChooseAction)
    }

    fn apply_output(&self, mut state: AgentState, output: CurrentPolicy) -> AgentState {
        state.strategy = output.strategy;
        state.policy_version = output.policy_version;
        state
    }
}
