//! Capability interfaces consumed by node handlers.
//!
//! Concrete device drivers, artifact storage and the action chooser live
//! outside this crate; handlers only see these traits through [`AgentPorts`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use shared_types::{ActionCandidate, ExplorationStrategy};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PortError {
    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("app not installed: {0}")]
    AppNotInstalled(String),

    #[error("app restart failed: {0}")]
    AppRestartFailed(String),

    #[error("signature mismatch for {app_id}: expected {expected}, found {actual}")]
    SignatureMismatch {
        app_id: String,
        expected: String,
        actual: String,
    },

    #[error("invalid capture: {0}")]
    InvalidCapture(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("action selection error: {0}")]
    Selection(String),

    #[error("input error: {0}")]
    Input(String),
}

impl PortError {
    /// Stable identifier recorded in state and failure events.
    pub fn error_id(&self) -> &'static str {
        match self {
            PortError::DeviceOffline(_) => "device_offline",
            PortError::Timeout { .. } => "timeout",
            PortError::AppNotInstalled(_) => "app_not_installed",
            PortError::AppRestartFailed(_) => "app_restart_failed",
            PortError::SignatureMismatch { .. } => "signature_mismatch",
            PortError::InvalidCapture(_) => "invalid_capture",
            PortError::Storage(_) => "storage_error",
            PortError::Selection(_) => "action_selection_error",
            PortError::Input(_) => "input_error",
        }
    }

    /// Whether the transition policy may retry or backtrack on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PortError::AppRestartFailed(_) | PortError::SignatureMismatch { .. }
        )
    }
}

// ============================================================================
// Port payloads
// ============================================================================

/// Device the run should be bound to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub platform_version: Option<String>,
    #[serde(default)]
    pub driver_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    pub context_id: String,
    pub session_id: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForegroundContext {
    pub context_id: String,
    pub app_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPackage {
    pub installed: bool,
    pub version_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
    pub base64_image: String,
    pub format: String,
    pub width_px: u32,
    pub height_px: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UiHierarchy {
    pub xml_content: String,
    pub capture_timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenDimensions {
    pub width_px: u32,
    pub height_px: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Screenshot,
    UiHierarchy,
    RunSummary,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::UiHierarchy => "ui_hierarchy",
            ArtifactKind::RunSummary => "run_summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub content: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Inputs the chooser may use to make a deterministic pick.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionContext {
    pub strategy: ExplorationStrategy,
    pub random_seed: u64,
    pub iteration: i64,
    pub policy_version: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDecision {
    pub decision_id: String,
    pub candidate: ActionCandidate,
}

// ============================================================================
// Ports
// ============================================================================

#[async_trait]
pub trait SessionPort: Send + Sync {
    async fn ensure_device(&self, config: &DeviceConfig) -> Result<DeviceSession, PortError>;
}

#[async_trait]
pub trait AppLifecyclePort: Send + Sync {
    async fn launch_app(&self, app_id: &str, timeout_ms: u64) -> Result<ForegroundContext, PortError>;
    async fn restart_app(&self, app_id: &str, timeout_ms: u64) -> Result<bool, PortError>;
    async fn get_current_app(&self) -> Result<Option<String>, PortError>;
}

#[async_trait]
pub trait IdleDetectorPort: Send + Sync {
    /// Blocks until the UI has been quiet for `min_quiet_ms` or `max_wait_ms` elapses.
    async fn wait_idle(&self, min_quiet_ms: u64, max_wait_ms: u64) -> Result<u64, PortError>;
}

#[async_trait]
pub trait PackageManagerPort: Send + Sync {
    async fn is_installed(&self, app_id: &str) -> Result<InstalledPackage, PortError>;
    async fn install_from_object_storage(
        &self,
        package_ref: &str,
        expected_sha256: Option<&str>,
    ) -> Result<String, PortError>;
    async fn get_signature_sha256(&self, app_id: &str) -> Result<String, PortError>;
}

#[async_trait]
pub trait PerceptionPort: Send + Sync {
    async fn capture_screenshot(&self) -> Result<Screenshot, PortError>;
    async fn dump_ui_hierarchy(&self) -> Result<UiHierarchy, PortError>;
}

#[async_trait]
pub trait DeviceInfoPort: Send + Sync {
    async fn get_screen_dimensions(&self) -> Result<ScreenDimensions, PortError>;
}

#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn store_artifact(
        &self,
        run_id: &str,
        kind: ArtifactKind,
        content: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<String, PortError>;
    async fn retrieve_artifact(&self, ref_id: &str) -> Result<StoredArtifact, PortError>;
}

#[async_trait]
pub trait ActionSelectionPort: Send + Sync {
    async fn enumerate_actions(
        &self,
        ui_ref_id: &str,
        max_actions: usize,
    ) -> Result<Vec<ActionCandidate>, PortError>;
    async fn choose_action(
        &self,
        candidates: &[ActionCandidate],
        context: &SelectionContext,
    ) -> Result<ActionDecision, PortError>;
}

#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn perform(&self, action: &ActionCandidate) -> Result<(), PortError>;
}

/// Every capability a node may call, passed explicitly into each execution.
#[derive(Clone)]
pub struct AgentPorts {
    pub session: Arc<dyn SessionPort>,
    pub app_lifecycle: Arc<dyn AppLifecyclePort>,
    pub idle_detector: Arc<dyn IdleDetectorPort>,
    pub package_manager: Arc<dyn PackageManagerPort>,
    pub perception: Arc<dyn PerceptionPort>,
    pub device_info: Arc<dyn DeviceInfoPort>,
    pub storage: Arc<dyn StoragePort>,
    pub action_selection: Arc<dyn ActionSelectionPort>,
    pub input: Arc<dyn InputDriver>,
}
