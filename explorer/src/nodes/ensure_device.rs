use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::{AgentPorts, DeviceConfig, DeviceSession};
use shared_types::{AgentState, EventPayload, NodeName};

/// Acquire a device session for the run.
pub struct EnsureDeviceNode;

#[async_trait]
impl NodeHandler for EnsureDeviceNode {
    type Input = DeviceConfig;
    type Output = DeviceSession;

    const NAME: NodeName = NodeName::EnsureDevice;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::retry(ctx.retry)
    }

    fn build_input(&self, _state: &AgentState, ctx: &AgentContext) -> DeviceConfig {
        ctx.device.clone()
    }

    async fn execute(
        &self,
        input: DeviceConfig,
        ports: &AgentPorts,
    ) -> Result<Executed<DeviceSession>, NodeFailure> {
        let session = ports.session.ensure_device(&input).await?;
        tracing::info!(
            context_id = %session.context_id,
            session_id = %session.session_id,
            "Device ready"
        );
        let event = EventPayload::DeviceReady {
            device_runtime_context_id: session.context_id.clone(),
            session_id: session.session_id.clone(),
            capabilities: session.capabilities.clone(),
        };
        Ok(Executed::new(session, vec![event]))
    }

    fn next_node(&self, _output: &DeviceSession) -> Option<NodeName> {
        Some(NodeName::ProvisionApp)
    }

    fn apply_output(&self, mut state: AgentState, output: DeviceSession) -> AgentState {
        state.device_runtime_context_id = Some(output.context_id);
        state
    }
}
