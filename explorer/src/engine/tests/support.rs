use async_trait::async_trait;
use base64::Engine as _;
use ractor::{Actor, ActorRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};

use crate::actors::event_store::{EventStoreActor, EventStoreArguments, EventStoreMsg};
use crate::db;
use crate::engine::{AgentContext, AgentEngine, NewRun, RetryPolicy};
use crate::ports::*;
use shared_types::{ActionCandidate, ActionVerb, RunBudgets};

pub(crate) const APP_ID: &str = "com.example.app";

/// Scripted device that implements every port.
///
/// Failure counters count down; each call that consumes one fails.
pub(crate) struct FakeDevice {
    pub device_offline_failures: AtomicU32,
    pub launch_failures: AtomicU32,
    pub restart_succeeds: bool,
    pub installed: bool,
    pub summary_storage_fails: bool,
    pub perform_failures: AtomicU32,
    /// App reported as already in the foreground.
    pub foreground_app: Option<String>,
    pub signature_sha256: String,
    /// Screenshot bytes per capture; the last entry repeats.
    pub screens: Vec<Vec<u8>>,
    pub candidates: Vec<ActionCandidate>,

    pub ensure_device_calls: AtomicU32,
    pub launch_calls: AtomicU32,
    pub captures: AtomicU32,
    pub performed: Mutex<Vec<String>>,
    pub artifacts: Mutex<HashMap<String, StoredArtifact>>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            device_offline_failures: AtomicU32::new(0),
            launch_failures: AtomicU32::new(0),
            restart_succeeds: true,
            installed: true,
            summary_storage_fails: false,
            perform_failures: AtomicU32::new(0),
            foreground_app: None,
            signature_sha256: "ab".repeat(32),
            screens: vec![b"home-screen".to_vec()],
            candidates: vec![candidate("c-1", "btn_next"), candidate("c-2", "btn_back")],
            ensure_device_calls: AtomicU32::new(0),
            launch_calls: AtomicU32::new(0),
            captures: AtomicU32::new(0),
            performed: Mutex::new(Vec::new()),
            artifacts: Mutex::new(HashMap::new()),
        }
    }
}

pub(crate) fn candidate(id: &str, target: &str) -> ActionCandidate {
    ActionCandidate {
        candidate_id: id.to_string(),
        verb: ActionVerb::Tap,
        target_key: target.to_string(),
        label: None,
        input_text: None,
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SessionPort for FakeDevice {
    async fn ensure_device(&self, _config: &DeviceConfig) -> Result<DeviceSession, PortError> {
        let call = self.ensure_device_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if take_failure(&self.device_offline_failures) {
            return Err(PortError::DeviceOffline("emulator-5554".to_string()));
        }
        Ok(DeviceSession {
            context_id: format!("device-ctx-{call}"),
            session_id: format!("session-{call}"),
            capabilities: vec!["screenshot".to_string(), "ui_dump".to_string()],
        })
    }
}

#[async_trait]
impl AppLifecyclePort for FakeDevice {
    async fn launch_app(&self, app_id: &str, timeout_ms: u64) -> Result<ForegroundContext, PortError> {
        self.launch_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.launch_failures) {
            return Err(PortError::Timeout {
                operation: "launch_app".to_string(),
                timeout_ms,
            });
        }
        Ok(ForegroundContext {
            context_id: "fg-1".to_string(),
            app_id: app_id.to_string(),
        })
    }

    async fn restart_app(&self, _app_id: &str, _timeout_ms: u64) -> Result<bool, PortError> {
        Ok(self.restart_succeeds)
    }

    async fn get_current_app(&self) -> Result<Option<String>, PortError> {
        Ok(self.foreground_app.clone())
    }
}

#[async_trait]
impl IdleDetectorPort for FakeDevice {
    async fn wait_idle(&self, min_quiet_ms: u64, _max_wait_ms: u64) -> Result<u64, PortError> {
        Ok(min_quiet_ms)
    }
}

#[async_trait]
impl PackageManagerPort for FakeDevice {
    async fn is_installed(&self, _app_id: &str) -> Result<InstalledPackage, PortError> {
        Ok(InstalledPackage {
            installed: self.installed,
            version_name: Some("1.0.0".to_string()),
        })
    }

    async fn install_from_object_storage(
        &self,
        _package_ref: &str,
        _expected_sha256: Option<&str>,
    ) -> Result<String, PortError> {
        Ok(APP_ID.to_string())
    }

    async fn get_signature_sha256(&self, _app_id: &str) -> Result<String, PortError> {
        Ok(self.signature_sha256.clone())
    }
}

#[async_trait]
impl PerceptionPort for FakeDevice {
    async fn capture_screenshot(&self) -> Result<Screenshot, PortError> {
        let index = self.captures.fetch_add(1, Ordering::SeqCst) as usize;
        let bytes = self
            .screens
            .get(index)
            .or_else(|| self.screens.last())
            .cloned()
            .unwrap_or_default();
        Ok(Screenshot {
            base64_image: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: "png".to_string(),
            width_px: 0,
            height_px: 0,
        })
    }

    async fn dump_ui_hierarchy(&self) -> Result<UiHierarchy, PortError> {
        Ok(UiHierarchy {
            xml_content: r#"<hierarchy><node id="btn_next"/><node id="btn_back"/></hierarchy>"#
                .to_string(),
            capture_timestamp_ms: 1_700_000_000_000,
        })
    }
}

#[async_trait]
impl DeviceInfoPort for FakeDevice {
    async fn get_screen_dimensions(&self) -> Result<ScreenDimensions, PortError> {
        Ok(ScreenDimensions {
            width_px: 1080,
            height_px: 2400,
        })
    }
}

#[async_trait]
impl StoragePort for FakeDevice {
    async fn store_artifact(
        &self,
        run_id: &str,
        kind: ArtifactKind,
        content: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<String, PortError> {
        if self.summary_storage_fails && kind == ArtifactKind::RunSummary {
            return Err(PortError::Storage("bucket unavailable".to_string()));
        }
        let mut artifacts = self.artifacts.lock().unwrap();
        let ref_id = format!("{run_id}/{}/{}", kind.as_str(), artifacts.len());
        artifacts.insert(ref_id.clone(), StoredArtifact { content, metadata });
        Ok(ref_id)
    }

    async fn retrieve_artifact(&self, ref_id: &str) -> Result<StoredArtifact, PortError> {
        self.artifacts
            .lock()
            .unwrap()
            .get(ref_id)
            .cloned()
            .ok_or_else(|| PortError::Storage(format!("missing artifact {ref_id}")))
    }
}

#[async_trait]
impl ActionSelectionPort for FakeDevice {
    async fn enumerate_actions(
        &self,
        _ui_ref_id: &str,
        max_actions: usize,
    ) -> Result<Vec<ActionCandidate>, PortError> {
        Ok(self.candidates.iter().take(max_actions).cloned().collect())
    }

    async fn choose_action(
        &self,
        candidates: &[ActionCandidate],
        context: &SelectionContext,
    ) -> Result<ActionDecision, PortError> {
        let index = (context.random_seed as usize + context.iteration as usize) % candidates.len();
        Ok(ActionDecision {
            decision_id: format!("decision-{}", context.iteration),
            candidate: candidates[index].clone(),
        })
    }
}

#[async_trait]
impl InputDriver for FakeDevice {
    async fn perform(&self, action: &ActionCandidate) -> Result<(), PortError> {
        if take_failure(&self.perform_failures) {
            return Err(PortError::Input("tap landed off-screen".to_string()));
        }
        self.performed.lock().unwrap().push(action.target_key.clone());
        Ok(())
    }
}

pub(crate) fn ports(device: &Arc<FakeDevice>) -> AgentPorts {
    AgentPorts {
        session: device.clone(),
        app_lifecycle: device.clone(),
        idle_detector: device.clone(),
        package_manager: device.clone(),
        perception: device.clone(),
        device_info: device.clone(),
        storage: device.clone(),
        action_selection: device.clone(),
        input: device.clone(),
    }
}

/// Context with millisecond backoff so retry tests stay fast.
pub(crate) fn fast_context() -> AgentContext {
    AgentContext {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        },
        idle_min_quiet_ms: 5,
        ..AgentContext::for_app(APP_ID)
    }
}

pub(crate) async fn spawn_store() -> ActorRef<EventStoreMsg> {
    let (store_ref, _handle) = Actor::spawn(None, EventStoreActor, EventStoreArguments::InMemory)
        .await
        .unwrap();
    store_ref
}

/// Store over a pool the test can also reach directly.
pub(crate) async fn spawn_store_with_pool() -> (ActorRef<EventStoreMsg>, SqlitePool) {
    let pool = db::connect_in_memory().await.unwrap();
    let (store_ref, _handle) = Actor::spawn(None, EventStoreActor, EventStoreArguments::Pool(pool.clone()))
        .await
        .unwrap();
    (store_ref, pool)
}

pub(crate) async fn start_engine(
    store: &ActorRef<EventStoreMsg>,
    device: &Arc<FakeDevice>,
    context: AgentContext,
    max_steps: i64,
) -> AgentEngine {
    let budgets = RunBudgets {
        max_steps,
        max_time_ms: 60_000,
    };
    start_engine_with_budgets(store, device, context, budgets).await
}

pub(crate) async fn start_engine_with_budgets(
    store: &ActorRef<EventStoreMsg>,
    device: &Arc<FakeDevice>,
    context: AgentContext,
    budgets: RunBudgets,
) -> AgentEngine {
    let mut new_run = NewRun::new("tenant-1", "project-1");
    new_run.budgets = budgets;
    new_run.random_seed = 7;
    AgentEngine::start_run(store.clone(), ports(device), context, new_run)
        .await
        .unwrap()
}
