//! Shared types for the screen-graph explorer
//!
//! These types are used by:
//! - the node execution engine (agent state, node names, event payloads)
//! - the event log and outbox (domain events, outbox entries)
//! - the graph projector (cursors, screens, actions, edges, outcomes)
//!
//! Serializable with serde; persisted as JSON where a column holds structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Current schema version written for every event payload kind.
pub const EVENT_SCHEMA_VERSION: i32 = 1;

/// Error returned when a persisted enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownLabel {}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl FromStr for RunStatus {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(UnknownLabel {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Why a run stopped. Distinguishes a clean finish from a crash or cancellation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Success,
    Crash,
    Canceled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Success => "success",
            StopReason::Crash => "crash",
            StopReason::Canceled => "canceled",
        }
    }
}

/// One exploration session. Identity fields never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Nodes
// ============================================================================

/// The closed set of steps in a run's execution graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    EnsureDevice,
    ProvisionApp,
    LaunchOrAttach,
    WaitIdle,
    Perceive,
    DetectProgress,
    SwitchPolicy,
    ChooseAction,
    ExecuteAction,
    Stop,
}

impl NodeName {
    pub const ALL: [NodeName; 10] = [
        NodeName::EnsureDevice,
        NodeName::ProvisionApp,
        NodeName::LaunchOrAttach,
        NodeName::WaitIdle,
        NodeName::Perceive,
        NodeName::DetectProgress,
        NodeName::SwitchPolicy,
        NodeName::ChooseAction,
        NodeName::ExecuteAction,
        NodeName::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeName::EnsureDevice => "ensure_device",
            NodeName::ProvisionApp => "provision_app",
            NodeName::LaunchOrAttach => "launch_or_attach",
            NodeName::WaitIdle => "wait_idle",
            NodeName::Perceive => "perceive",
            NodeName::DetectProgress => "detect_progress",
            NodeName::SwitchPolicy => "switch_policy",
            NodeName::ChooseAction => "choose_action",
            NodeName::ExecuteAction => "execute_action",
            NodeName::Stop => "stop",
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeName::ALL
            .iter()
            .copied()
            .find(|node| node.as_str() == s)
            .ok_or_else(|| UnknownLabel {
                kind: "node",
                value: s.to_string(),
            })
    }
}

// ============================================================================
// Screen identity
// ============================================================================

/// 64-bit coarse screen fingerprint. Serialized as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScreenHash(pub u64);

impl ScreenHash {
    pub fn from_digest_prefix(digest: &[u8]) -> Option<Self> {
        let prefix: [u8; 8] = digest.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(prefix)))
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for ScreenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ScreenHash {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(UnknownLabel {
                kind: "screen hash",
                value: s.to_string(),
            });
        }
        u64::from_str_radix(s, 16)
            .map(ScreenHash)
            .map_err(|_| UnknownLabel {
                kind: "screen hash",
                value: s.to_string(),
            })
    }
}

impl Serialize for ScreenHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ScreenHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionVerb {
    Tap,
    LongPress,
    Swipe,
    Type,
    Back,
}

impl ActionVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionVerb::Tap => "tap",
            ActionVerb::LongPress => "long_press",
            ActionVerb::Swipe => "swipe",
            ActionVerb::Type => "type",
            ActionVerb::Back => "back",
        }
    }
}

/// An action the selector offered for the current screen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCandidate {
    pub candidate_id: String,
    pub verb: ActionVerb,
    /// Stable key of the UI element the action targets (resource id, xpath, ...).
    pub target_key: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Text to enter for `Type`.
    #[serde(default)]
    pub input_text: Option<String>,
}

/// Action executed since the last perception, used to attribute the next edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutedAction {
    pub decision_id: String,
    pub verb: ActionVerb,
    pub target_key: String,
    pub from_hash: ScreenHash,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationStrategy {
    #[default]
    BreadthFirst,
    DepthFirst,
    RandomWalk,
}

impl ExplorationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExplorationStrategy::BreadthFirst => "breadth_first",
            ExplorationStrategy::DepthFirst => "depth_first",
            ExplorationStrategy::RandomWalk => "random_walk",
        }
    }

    /// Strategy the switch-policy step rotates to.
    pub fn next(&self) -> Self {
        match self {
            ExplorationStrategy::BreadthFirst => ExplorationStrategy::DepthFirst,
            ExplorationStrategy::DepthFirst => ExplorationStrategy::RandomWalk,
            ExplorationStrategy::RandomWalk => ExplorationStrategy::BreadthFirst,
        }
    }
}

// ============================================================================
// Agent State
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentCounters {
    pub steps_total: i64,
    pub screens_new: i64,
    pub no_progress_cycles: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerceptionRefs {
    pub screenshot_ref_id: Option<String>,
    pub ui_hierarchy_xml_ref_id: Option<String>,
    pub screen_perceptual_hash64: Option<ScreenHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTimestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunBudgets {
    /// Maximum main-loop iterations before the run stops.
    pub max_steps: i64,
    pub max_time_ms: i64,
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_time_ms: 30 * 60 * 1000,
        }
    }
}

/// Complete resumable snapshot of a run.
///
/// One live instance per run; only the executing node's output is applied to
/// it, and every committed version is persisted as an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub run_id: String,
    pub node_name: NodeName,
    /// Count of committed snapshots for this run.
    pub step_ordinal: i64,
    pub iteration_ordinal_number: i64,
    pub policy_version: u32,
    pub resume_token: String,
    pub random_seed: u64,
    pub status: RunStatus,
    pub stop_reason: Option<StopReason>,
    pub counters: AgentCounters,
    pub perception: PerceptionRefs,
    pub device_runtime_context_id: Option<String>,
    pub application_foreground_context_id: Option<String>,
    pub available_action_candidate_ids: Vec<String>,
    pub chosen_action_decision_id: Option<String>,
    pub graph_persistence_outcome_id: Option<String>,
    pub progress_evaluation_id: Option<String>,
    pub timestamps: AgentTimestamps,
    pub budgets: RunBudgets,
    #[serde(default)]
    pub strategy: ExplorationStrategy,
    #[serde(default)]
    pub chosen_action: Option<ActionCandidate>,
    #[serde(default)]
    pub last_executed_action: Option<ExecutedAction>,
    #[serde(default)]
    pub visited_screens: BTreeSet<ScreenHash>,
    #[serde(default)]
    pub backtrack_count: u32,
    #[serde(default)]
    pub last_error_id: Option<String>,
}

impl AgentState {
    /// Fresh state positioned at the first node, before any step was committed.
    pub fn initial(
        run_id: impl Into<String>,
        random_seed: u64,
        budgets: RunBudgets,
        resume_token: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_name: NodeName::EnsureDevice,
            step_ordinal: 0,
            iteration_ordinal_number: 0,
            policy_version: 1,
            resume_token: resume_token.into(),
            random_seed,
            status: RunStatus::Running,
            stop_reason: None,
            counters: AgentCounters::default(),
            perception: PerceptionRefs::default(),
            device_runtime_context_id: None,
            application_foreground_context_id: None,
            available_action_candidate_ids: Vec::new(),
            chosen_action_decision_id: None,
            graph_persistence_outcome_id: None,
            progress_evaluation_id: None,
            timestamps: AgentTimestamps {
                created_at: now,
                updated_at: now,
            },
            budgets,
            strategy: ExplorationStrategy::default(),
            chosen_action: None,
            last_executed_action: None,
            visited_screens: BTreeSet::new(),
            backtrack_count: 0,
            last_error_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// Event System
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressVerdict {
    Continue,
    SwitchPolicy,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FinalRunMetrics {
    pub total_iterations_executed: i64,
    pub steps_total: i64,
    pub screens_new: i64,
}

/// Typed payload per event kind. The `kind` tag is the namespaced event type
/// stored alongside the payload body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "agent.event.run_started")]
    RunStarted {
        app_id: String,
        max_steps: i64,
        max_time_ms: i64,
    },
    #[serde(rename = "agent.event.device_ready")]
    DeviceReady {
        device_runtime_context_id: String,
        session_id: String,
        capabilities: Vec<String>,
    },
    #[serde(rename = "agent.event.app_provisioned")]
    AppProvisioned {
        app_id: String,
        installed_now: bool,
        signature_sha256: Option<String>,
    },
    #[serde(rename = "agent.event.app_launched")]
    AppLaunched {
        app_id: String,
        foreground_context_id: String,
        attached: bool,
        restarted: bool,
    },
    #[serde(rename = "agent.event.ui_idle")]
    UiIdle { observed_quiet_ms: u64 },
    #[serde(rename = "agent.event.screenshot_captured")]
    ScreenshotCaptured {
        screenshot_ref_id: String,
        format: String,
        width_px: u32,
        height_px: u32,
    },
    #[serde(rename = "agent.event.ui_hierarchy_captured")]
    UiHierarchyCaptured {
        ui_hierarchy_xml_ref_id: String,
        element_count: u32,
        capture_timestamp_ms: i64,
    },
    #[serde(rename = "agent.event.screen_perceived")]
    ScreenPerceived {
        observation_id: String,
        app_id: String,
        step_ordinal: i64,
        perceptual_hash64: ScreenHash,
        screenshot_ref_id: String,
        ui_hierarchy_xml_ref_id: String,
    },
    #[serde(rename = "agent.event.progress_evaluated")]
    ProgressEvaluated {
        progress_evaluation_id: String,
        iteration: i64,
        is_new_screen: bool,
        screens_new: i64,
        no_progress_cycles: i64,
        verdict: ProgressVerdict,
    },
    #[serde(rename = "agent.event.edge_observed")]
    EdgeObserved {
        observation_id: String,
        app_id: String,
        step_ordinal: i64,
        from_hash: ScreenHash,
        verb: ActionVerb,
        target_key: String,
        to_hash: ScreenHash,
    },
    #[serde(rename = "agent.event.policy_switched")]
    PolicySwitched {
        from_strategy: ExplorationStrategy,
        to_strategy: ExplorationStrategy,
        policy_version: u32,
    },
    #[serde(rename = "agent.event.action_chosen")]
    ActionChosen {
        decision_id: String,
        candidate_count: u32,
        verb: ActionVerb,
        target_key: String,
        strategy: ExplorationStrategy,
    },
    #[serde(rename = "agent.event.action_executed")]
    ActionExecuted {
        decision_id: String,
        verb: ActionVerb,
        target_key: String,
        from_hash: ScreenHash,
    },
    #[serde(rename = "agent.event.node_backtracked")]
    NodeBacktracked {
        from_node: NodeName,
        to_node: NodeName,
        error_id: String,
        backtrack_count: u32,
    },
    #[serde(rename = "agent.event.run_finished")]
    RunFinished {
        stop_reason: StopReason,
        final_run_metrics: FinalRunMetrics,
        summary_ref_id: Option<String>,
    },
    #[serde(rename = "agent.event.run_failed")]
    RunFailed {
        /// Node that failed; absent when the stored snapshot could not be read.
        #[serde(default)]
        node: Option<NodeName>,
        error_id: String,
        summary: String,
    },
    #[serde(rename = "agent.event.run_canceled")]
    RunCanceled { node: NodeName },
}

pub const EVENT_RUN_STARTED: &str = "agent.event.run_started";
pub const EVENT_DEVICE_READY: &str = "agent.event.device_ready";
pub const EVENT_APP_PROVISIONED: &str = "agent.event.app_provisioned";
pub const EVENT_APP_LAUNCHED: &str = "agent.event.app_launched";
pub const EVENT_UI_IDLE: &str = "agent.event.ui_idle";
pub const EVENT_SCREENSHOT_CAPTURED: &str = "agent.event.screenshot_captured";
pub const EVENT_UI_HIERARCHY_CAPTURED: &str = "agent.event.ui_hierarchy_captured";
pub const EVENT_SCREEN_PERCEIVED: &str = "agent.event.screen_perceived";
pub const EVENT_PROGRESS_EVALUATED: &str = "agent.event.progress_evaluated";
pub const EVENT_EDGE_OBSERVED: &str = "agent.event.edge_observed";
pub const EVENT_POLICY_SWITCHED: &str = "agent.event.policy_switched";
pub const EVENT_ACTION_CHOSEN: &str = "agent.event.action_chosen";
pub const EVENT_ACTION_EXECUTED: &str = "agent.event.action_executed";
pub const EVENT_NODE_BACKTRACKED: &str = "agent.event.node_backtracked";
pub const EVENT_RUN_FINISHED: &str = "agent.event.run_finished";
pub const EVENT_RUN_FAILED: &str = "agent.event.run_failed";
pub const EVENT_RUN_CANCELED: &str = "agent.event.run_canceled";

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::RunStarted { .. } => EVENT_RUN_STARTED,
            EventPayload::DeviceReady { .. } => EVENT_DEVICE_READY,
            EventPayload::AppProvisioned { .. } => EVENT_APP_PROVISIONED,
            EventPayload::AppLaunched { .. } => EVENT_APP_LAUNCHED,
            EventPayload::UiIdle { .. } => EVENT_UI_IDLE,
            EventPayload::ScreenshotCaptured { .. } => EVENT_SCREENSHOT_CAPTURED,
            EventPayload::UiHierarchyCaptured { .. } => EVENT_UI_HIERARCHY_CAPTURED,
            EventPayload::ScreenPerceived { .. } => EVENT_SCREEN_PERCEIVED,
            EventPayload::ProgressEvaluated { .. } => EVENT_PROGRESS_EVALUATED,
            EventPayload::EdgeObserved { .. } => EVENT_EDGE_OBSERVED,
            EventPayload::PolicySwitched { .. } => EVENT_POLICY_SWITCHED,
            EventPayload::ActionChosen { .. } => EVENT_ACTION_CHOSEN,
            EventPayload::ActionExecuted { .. } => EVENT_ACTION_EXECUTED,
            EventPayload::NodeBacktracked { .. } => EVENT_NODE_BACKTRACKED,
            EventPayload::RunFinished { .. } => EVENT_RUN_FINISHED,
            EventPayload::RunFailed { .. } => EVENT_RUN_FAILED,
            EventPayload::RunCanceled { .. } => EVENT_RUN_CANCELED,
        }
    }

    pub fn version(&self) -> i32 {
        EVENT_SCHEMA_VERSION
    }

    /// Whether the graph projector mutates the screen graph for this event.
    pub fn is_graph_relevant(&self) -> bool {
        matches!(
            self,
            EventPayload::ScreenPerceived { .. } | EventPayload::EdgeObserved { .. }
        )
    }

    /// Payload body without the kind tag, as stored in the log.
    pub fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }

    /// Rebuild a typed payload from a stored kind and body.
    pub fn from_parts(kind: &str, body: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "kind": kind, "payload": body }))
    }
}

/// Immutable entry in a run's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    pub event_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub project_id: String,
    /// Strictly increasing per run, starting at 1, no gaps.
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub version: i32,
    pub payload: EventPayload,
    /// Hex SHA-256 over the stored payload body.
    pub checksum: String,
}

/// Delivery intent written in the same transaction as its event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub run_id: String,
    pub sequence: i64,
    pub event_id: String,
    pub published_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Screen Graph
// ============================================================================

/// Next unconsumed sequence for a run's projection. Never decreases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectionCursor {
    pub run_id: String,
    pub next_seq: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Screen {
    pub screen_id: String,
    pub app_id: String,
    pub perceptual_hash64: ScreenHash,
    pub screenshot_ref: String,
    pub xml_ref: String,
    pub evidence_counter: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub action_id: String,
    pub from_screen_id: String,
    pub verb: String,
    pub target_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub edge_id: String,
    pub from_screen_id: String,
    pub action_id: String,
    pub to_screen_id: String,
    pub evidence_counter: i64,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpsertKind {
    /// The mutation created the structure.
    Discovered,
    /// The mutation re-observed an existing structure.
    Mapped,
}

impl UpsertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertKind::Discovered => "discovered",
            UpsertKind::Mapped => "mapped",
        }
    }
}

impl FromStr for UpsertKind {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(UpsertKind::Discovered),
            "mapped" => Ok(UpsertKind::Mapped),
            other => Err(UnknownLabel {
                kind: "upsert kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit row tying a graph write to the event that caused it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphPersistenceOutcome {
    pub outcome_id: String,
    pub run_id: String,
    pub step_ordinal: i64,
    pub screen_id: String,
    pub upsert_kind: UpsertKind,
    pub source_event_seq: i64,
}

// ============================================================================
// Tests
// ============================================================================
