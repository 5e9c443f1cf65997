use async_trait::async_trait;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::{AgentPorts, PortError};
use shared_types::{AgentState, EventPayload, NodeName};

/// Make sure the target app is installed, installing it from object storage
/// when a package reference is configured.
pub struct ProvisionAppNode;

pub struct ProvisionInput {
    app_id: String,
    package_ref: Option<String>,
    expected_package_sha256: Option<String>,
    expected_signature_sha256: Option<String>,
}

pub struct Provisioned;

#[async_trait]
impl NodeHandler for ProvisionAppNode {
    type Input = ProvisionInput;
    type Output = Provisioned;

    const NAME: NodeName = NodeName::ProvisionApp;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::with_backtrack(ctx.retry, NodeName::EnsureDevice)
    }

    fn build_input(&self, _state: &AgentState, ctx: &AgentContext) -> ProvisionInput {
        ProvisionInput {
            app_id: ctx.app_id.clone(),
            package_ref: ctx.package_ref.clone(),
            expected_package_sha256: ctx.expected_package_sha256.clone(),
            expected_signature_sha256: ctx.expected_signature_sha256.clone(),
        }
    }

    async fn execute(
        &self,
        input: ProvisionInput,
        ports: &AgentPorts,
    ) -> Result<Executed<Provisioned>, NodeFailure> {
        let package = ports.package_manager.is_installed(&input.app_id).await?;

        let installed_now = if package.installed {
            false
        } else {
            let Some(package_ref) = input.package_ref.as_deref() else {
                return Err(PortError::AppNotInstalled(input.app_id).into());
            };
            let installed_app = ports
                .package_manager
                .install_from_object_storage(package_ref, input.expected_package_sha256.as_deref())
                .await?;
            tracing::info!(app_id = %installed_app, package_ref, "App installed");
            true
        };

        let signature_sha256 = match input.expected_signature_sha256 {
            Some(expected) => {
                let actual = ports
                    .package_manager
                    .get_signature_sha256(&input.app_id)
                    .await?;
                if !actual.eq_ignore_ascii_case(&expected) {
                    return Err(PortError::SignatureMismatch {
                        app_id: input.app_id,
                        expected,
                        actual,
                    }
                    .into());
                }
                Some(actual)
            }
            None => None,
        };

        let event = EventPayload::AppProvisioned {
            app_id: input.app_id,
            installed_now,
            signature_sha256,
        };
        Ok(Executed::new(Provisioned, vec![event]))
    }

    fn next_node(&self, _output: &Provisioned) -> Option<NodeName> {
        Some(NodeName::LaunchOrAttach)
    }

    fn apply_output(&self, state: AgentState, _output: Provisioned) -> AgentState {
        state
    }
}
