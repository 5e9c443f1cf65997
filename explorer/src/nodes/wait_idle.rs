use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::AgentPorts;
use shared_types::{AgentState, EventPayload, NodeName};

pub struct WaitIdleNode;

pub struct IdleWindow {
    min_quiet_ms: u64,
    max_wait_ms: u64,
}

#[async_trait]
impl NodeHandler for WaitIdleNode {
    type Input = IdleWindow;
    type Output = u64;

    const NAME: NodeName = NodeName::WaitIdle;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::retry(ctx.retry)
    }

    fn build_input(&self, _state: &AgentState, ctx: &AgentContext) -> IdleWindow {
        IdleWindow {
            min_quiet_ms: ctx.idle_min_quiet_ms,
            max_wait_ms: ctx.idle_max_wait_ms,
        }
    }

    async fn execute(&self, input: IdleWindow, ports: &AgentPorts) -> Result<Executed<u64>, NodeFailure> {
        let observed_quiet_ms = ports
            .idle_detector
            .wait_idle(input.min_quiet_ms, input.max_wait_ms)
            .await?;
        Ok(Executed::new(
            observed_quiet_ms,
            vec![EventPayload::UiIdle { observed_quiet_ms }],
        ))
    }

    fn next_node(&self, _output: &u64) -> Option<NodeName> {
        Some(NodeName::Perceive)
    }

    fn apply_output(&self, state: AgentState, _output: u64) -> AgentState {
        state
    }
}
