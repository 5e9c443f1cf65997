//! Node registry and router.
//!
//! Each [`NodeName`] maps to exactly one handler through [`handler_for`]; the
//! match is exhaustive so adding a node without a handler does not compile.

use async_trait::async_trait;

use super::context::AgentContext;
use super::policy::TransitionPolicy;
use crate::nodes;
use crate::ports::{AgentPorts, PortError};
use shared_types::{AgentState, EventPayload, NodeName};

/// Structured failure returned by a node's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub error_id: String,
    pub retryable: bool,
    pub human_readable_failure_summary: String,
}

impl NodeFailure {
    pub fn fatal(error_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            error_id: error_id.into(),
            retryable: false,
            human_readable_failure_summary: summary.into(),
        }
    }
}

impl From<PortError> for NodeFailure {
    fn from(err: PortError) -> Self {
        Self {
            error_id: err.error_id().to_string(),
            retryable: err.is_retryable(),
            human_readable_failure_summary: err.to_string(),
        }
    }
}

/// A node's successful result together with the events it produced.
#[derive(Debug)]
pub struct Executed<O> {
    pub output: O,
    pub events: Vec<EventPayload>,
}

impl<O> Executed<O> {
    pub fn new(output: O, events: Vec<EventPayload>) -> Self {
        Self { output, events }
    }
}

/// One step of the run.
///
/// `build_input` must stay pure so a step can be replayed from a snapshot;
/// all I/O happens in `execute`.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    type Input: Send;
    type Output: Send;

    const NAME: NodeName;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy;

    fn build_input(&self, state: &AgentState, ctx: &AgentContext) -> Self::Input;

    async fn execute(
        &self,
        input: Self::Input,
        ports: &AgentPorts,
    ) -> Result<Executed<Self::Output>, NodeFailure>;

    /// Successor node, or `None` when the run halts after this node.
    fn next_node(&self, output: &Self::Output) -> Option<NodeName>;

    fn apply_output(&self, state: AgentState, output: Self::Output) -> AgentState;
}

/// Result of running a node end to end.
#[derive(Debug)]
pub struct NodeAdvance {
    pub state: AgentState,
    pub events: Vec<EventPayload>,
    pub next: Option<NodeName>,
}

/// Type-erased handler stored in the node table.
#[async_trait]
pub trait DynNode: Send + Sync {
    fn name(&self) -> NodeName;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy;

    async fn run(
        &self,
        state: &AgentState,
        ctx: &AgentContext,
        ports: &AgentPorts,
    ) -> Result<NodeAdvance, NodeFailure>;
}

#[async_trait]
impl<H> DynNode for H
where
    H: NodeHandler,
{
    fn name(&self) -> NodeName {
        H::NAME
    }

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        NodeHandler::policy(self, ctx)
    }

    async fn run(
        &self,
        state: &AgentState,
        ctx: &AgentContext,
        ports: &AgentPorts,
    ) -> Result<NodeAdvance, NodeFailure> {
        let input = self.build_input(state, ctx);
        let executed = self.execute(input, ports).await?;
        let next = self.next_node(&executed.output);
        let state = self.apply_output(state.clone(), executed.output);
        Ok(NodeAdvance {
            state,
            events: executed.events,
            next,
        })
    }
}

pub fn handler_for(node: NodeName) -> &'static dyn DynNode {
    match node {
        NodeName::EnsureDevice => &nodes::EnsureDeviceNode,
        NodeName::ProvisionApp => &nodes::ProvisionAppNode,
        NodeName::LaunchOrAttach => &nodes::LaunchOrAttachNode,
        NodeName::WaitIdle => &nodes::WaitIdleNode,
        NodeName::Perceive => &nodes::PerceiveNode,
        NodeName::DetectProgress => &nodes::DetectProgressNode,
        NodeName::SwitchPolicy => &nodes::SwitchPolicyNode,
        NodeName::ChooseAction => &nodes::ChooseActionNode,
        NodeName::ExecuteAction => &nodes::ExecuteActionNode,
        NodeName::Stop => &nodes::StopNode,
    }
}
