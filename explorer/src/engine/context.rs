use serde::{Deserialize, Serialize};

use super::policy::RetryPolicy;
use crate::ports::DeviceConfig;

/// Immutable per-run configuration handed to every node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentContext {
    pub app_id: String,
    pub device: DeviceConfig,
    /// Object-storage reference to install from when the app is missing.
    pub package_ref: Option<String>,
    pub expected_package_sha256: Option<String>,
    /// Installed signature must match when set.
    pub expected_signature_sha256: Option<String>,
    pub launch_timeout_ms: u64,
    pub idle_min_quiet_ms: u64,
    pub idle_max_wait_ms: u64,
    pub perceive_settle_delay_ms: u64,
    pub max_actions: usize,
    pub switch_policy_after_no_progress_cycles: i64,
    pub stop_after_no_progress_cycles: i64,
    pub max_backtracks: u32,
    pub retry: RetryPolicy,
}

impl Default for AgentContext {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            device: DeviceConfig::default(),
            package_ref: None,
            expected_package_sha256: None,
            expected_signature_sha256: None,
            launch_timeout_ms: 30_000,
            idle_min_quiet_ms: 750,
            idle_max_wait_ms: 10_000,
            perceive_settle_delay_ms: 0,
            max_actions: 20,
            switch_policy_after_no_progress_cycles: 3,
            stop_after_no_progress_cycles: 10,
            max_backtracks: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentContext {
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }
}
