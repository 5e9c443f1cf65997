//! Node handlers, one per step of a run.
//!
//! ```text
//! EnsureDevice -> ProvisionApp -> LaunchOrAttach -> WaitIdle -> Perceive -> DetectProgress
//! DetectProgress -> ChooseAction | SwitchPolicy | Stop
//! SwitchPolicy -> ChooseAction
//! ChooseAction -> ExecuteAction | Stop
//! ExecuteAction -> WaitIdle
//! ```

mod choose_action;
mod detect_progress;
mod ensure_device;
mod execute_action;
mod launch_or_attach;
mod perceive;
mod provision_app;
mod stop;
mod switch_policy;
mod wait_idle;

pub use choose_action::ChooseActionNode;
pub use detect_progress::DetectProgressNode;
pub use ensure_device::EnsureDeviceNode;
pub use execute_action::ExecuteActionNode;
pub use launch_or_attach::LaunchOrAttachNode;
pub use perceive::{count_ui_elements, perceptual_hash, PerceiveNode};
pub use provision_app::ProvisionAppNode;
pub use stop::StopNode;
pub use switch_policy::SwitchPolicyNode;
pub use wait_idle::WaitIdleNode;
