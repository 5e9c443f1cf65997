use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::{AgentPorts, PortError};
use shared_types::{AgentState, EventPayload, NodeName};

/// Bring the target app to the foreground.
///
/// Attaches when the app is already in front. A failed launch falls back to a
/// restart; a restart the driver reports as unsuccessful is fatal.
pub struct LaunchOrAttachNode;

pub struct LaunchInput {
    app_id: String,
    timeout_ms: u64,
}

pub struct Foreground {
    context_id: String,
}

#[async_trait]
impl NodeHandler for LaunchOrAttachNode {
    type Input = LaunchInput;
    type Output = Foreground;

    const NAME: NodeName = NodeName::LaunchOrAttach;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::with_backtrack(ctx.retry, NodeName::EnsureDevice)
    }

    fn build_input(&self, _state: &AgentState, ctx: &AgentContext) -> LaunchInput {
        LaunchInput {
            app_id: ctx.app_id.clone(),
            timeout_ms: ctx.launch_timeout_ms,
        }
    }

    async fn execute(
        &self,
        input: LaunchInput,
        ports: &AgentPorts,
    ) -> Result<Executed<Foreground>, NodeFailure> {
        let lifecycle = &ports.app_lifecycle;

        let current = lifecycle.get_current_app().await?;
        let (context_id, attached, restarted) = if current.as_deref() == Some(input.app_id.as_str()) {
            (ulid::Ulid::new().to_string(), true, false)
        } else {
            match lifecycle.launch_app(&input.app_id, input.timeout_ms).await {
                Ok(foreground) => (foreground.context_id, false, false),
                Err(launch_err) => {
                    tracing::warn!(
                        app_id = %input.app_id,
                        error = %launch_err,
                        "Launch failed, restarting app"
                    );
                    if !lifecycle.restart_app(&input.app_id, input.timeout_ms).await? {
                        return Err(PortError::AppRestartFailed(input.app_id).into());
                    }
                    (ulid::Ulid::new().to_string(), false, true)
                }
            }
        };

        let event = EventPayload::AppLaunched {
            app_id: input.app_id,
            foreground_context_id: context_id.clone(),
            attached,
            restarted,
        };
        Ok(Executed::new(Foreground { context_id }, vec![event]))
    }

    fn next_node(&self, _output: &Foreground) -> Option<NodeName> {
        Some(NodeName::WaitIdle)
    }

    fn apply_output(&self, mut state: AgentState, output: Foreground) -> AgentState {
        state.application_foreground_context_id = Some(output.context_id);
        state
    }
}
