// ABOUTME: Shared test support: deterministic fake runtime, fake generator, recording observer
// ABOUTME: The fake runtime simulates build exits, port bindings, and live health endpoints

use arena_orchestrator::lifecycle::RunObserver;
use arena_orchestrator::runtime::{
    run_container_name, BuildExecution, ContainerRuntime, ContainerState, RuntimeError,
    PHASE_DELIMITER,
};
use arena_orchestrator::{
    CodeGenerator, ContainerHandle, EngineConfig, GatewayRegistry, GeneratorError,
    LifecycleEngine, ModelProvider, PortAllocator, ProbeConfig, RunPatch, RunStatus, RunStore,
    WorkspaceManager,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Scripted behavior for one run's containers.
#[derive(Clone)]
pub struct RunBehavior {
    pub install_lines: Vec<String>,
    pub build_lines: Vec<String>,
    pub build_exit: i64,
    /// Pause between install output and the rest, so tests can kill mid-install.
    pub install_delay: Duration,
    /// Whether the runtime container answers HTTP on its bound port.
    pub serve_http: bool,
    /// Whether starting the runtime container fails outright.
    pub start_fails: bool,
}

impl Default for RunBehavior {
    fn default() -> Self {
        Self {
            install_lines: vec!["added 120 packages".to_string()],
            build_lines: vec!["compiled successfully".to_string()],
            build_exit: 0,
            install_delay: Duration::ZERO,
            serve_http: true,
            start_fails: false,
        }
    }
}

#[derive(Default)]
struct FakeState {
    started_builds: Vec<String>,
    started_runs: Vec<String>,
    stopped: Vec<String>,
    live: HashSet<String>,
    networks: Vec<String>,
    servers: HashMap<String, JoinHandle<()>>,
}

/// In-memory stand-in for the Docker adapter. Build containers emit their
/// scripted log lines around the phase delimiter; runtime containers bind a
/// real TCP listener so the engine's health probe exercises actual HTTP.
#[derive(Default)]
pub struct FakeRuntime {
    behaviors: Mutex<HashMap<String, RunBehavior>>,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, run_id: &str, behavior: RunBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(run_id.to_string(), behavior);
    }

    fn behavior_for(&self, run_id: &str) -> RunBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn started_builds(&self) -> Vec<String> {
        self.state.lock().unwrap().started_builds.clone()
    }

    pub fn started_runs(&self) -> Vec<String> {
        self.state.lock().unwrap().started_runs.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn is_live(&self, container_name: &str) -> bool {
        self.state.lock().unwrap().live.contains(container_name)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().networks.push(name.to_string());
        Ok(())
    }

    async fn build_exec(
        &self,
        run_id: &str,
        _workspace: &Path,
        _env: HashMap<String, String>,
    ) -> Result<BuildExecution, RuntimeError> {
        let behavior = self.behavior_for(run_id);
        let name = format!("build-{}", run_id);
        {
            let mut state = self.state.lock().unwrap();
            state.started_builds.push(run_id.to_string());
            state.live.insert(name.clone());
        }

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = ContainerHandle {
            id: format!("fake-{}", name),
            name: name.clone(),
            host_port: None,
            internal_ip: None,
        };

        tokio::spawn(async move {
            for line in &behavior.install_lines {
                let _ = log_tx.send(line.clone());
            }
            tokio::time::sleep(behavior.install_delay).await;
            if behavior.build_exit == 0 || !behavior.build_lines.is_empty() {
                let _ = log_tx.send(PHASE_DELIMITER.to_string());
                for line in &behavior.build_lines {
                    let _ = log_tx.send(line.clone());
                }
            }
            drop(log_tx);
            let _ = exit_tx.send(behavior.build_exit);
        });

        Ok(BuildExecution {
            handle,
            logs: log_rx,
            exit: exit_rx,
        })
    }

    async fn run_exec(
        &self,
        run_id: &str,
        _workspace: &Path,
        _env: HashMap<String, String>,
        _internal_port: u16,
        host_port: u16,
    ) -> Result<ContainerHandle, RuntimeError> {
        let behavior = self.behavior_for(run_id);
        if behavior.start_fails {
            return Err(RuntimeError::Engine("runtime container refused".to_string()));
        }

        let name = run_container_name(run_id);
        if behavior.serve_http {
            let listener = TcpListener::bind(("127.0.0.1", host_port))
                .await
                .map_err(|e| RuntimeError::Engine(format!("bind {}: {}", host_port, e)))?;
            let server = tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let _ = socket.read(&mut buf).await;
                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                            )
                            .await;
                    });
                }
            });
            self.state
                .lock()
                .unwrap()
                .servers
                .insert(name.clone(), server);
        }

        let mut state = self.state.lock().unwrap();
        state.started_runs.push(run_id.to_string());
        state.live.insert(name.clone());
        Ok(ContainerHandle {
            id: format!("fake-{}", name),
            name,
            host_port: Some(host_port),
            internal_ip: Some("172.28.0.2".to_string()),
        })
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(ContainerState {
            running: state.live.contains(&handle.name),
            host_port: handle.host_port,
        })
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        Ok(format!("logs for {}\n", handle.name))
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(server) = state.servers.remove(&handle.name) {
            server.abort();
        }
        state.live.remove(&handle.name);
        state.stopped.push(handle.name.clone());
        Ok(())
    }

    async fn reap_stale(&self) -> Result<usize, RuntimeError> {
        Ok(0)
    }
}

/// Fake code generation gateway returning a canned file set or error.
pub struct FakeGenerator {
    response: Mutex<Result<HashMap<String, String>, String>>,
    delay: Duration,
}

impl FakeGenerator {
    pub fn with_files(files: HashMap<String, String>) -> Self {
        Self {
            response: Mutex::new(Ok(files)),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Mutex::new(Err(message.to_string())),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _provider: ModelProvider,
        _model: &str,
    ) -> Result<HashMap<String, String>, GeneratorError> {
        tokio::time::sleep(self.delay).await;
        match &*self.response.lock().unwrap() {
            Ok(files) => Ok(files.clone()),
            Err(message) => Err(GeneratorError::Gateway(message.clone())),
        }
    }
}

/// Observer recording every status flip per run, for sequence assertions.
#[derive(Default)]
pub struct RecordingObserver {
    statuses: Mutex<HashMap<String, Vec<RunStatus>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses_for(&self, run_id: &str) -> Vec<RunStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunObserver for RecordingObserver {
    async fn run_updated(&self, run_id: &str, patch: &RunPatch) {
        if let Some(status) = patch.status {
            self.statuses
                .lock()
                .unwrap()
                .entry(run_id.to_string())
                .or_default()
                .push(status);
        }
    }
}

/// A generated file set that passes validation.
pub fn good_files() -> HashMap<String, String> {
    HashMap::from([
        (
            "package.json".to_string(),
            r#"{"name":"generated-app","scripts":{"build":"next build","start":"next start"}}"#
                .to_string(),
        ),
        (
            "app/page.tsx".to_string(),
            "export default function Page() { return <main>hello</main>; }".to_string(),
        ),
    ])
}

pub struct Harness {
    pub store: Arc<RunStore>,
    pub ports: Arc<PortAllocator>,
    pub runtime: Arc<FakeRuntime>,
    pub gateway: Arc<GatewayRegistry>,
    pub observer: Arc<RecordingObserver>,
    pub engine: Arc<LifecycleEngine>,
    pub workspace_base: TempDir,
    _template: TempDir,
}

/// Wire an engine over fakes with a fast probe (so health timeouts take
/// milliseconds, not the production ~65 s).
pub fn harness(generator: FakeGenerator, port_min: u16, port_max: u16) -> Harness {
    let workspace_base = TempDir::new().unwrap();
    let template = TempDir::new().unwrap();
    std::fs::write(template.path().join("next.config.js"), "module.exports = {};").unwrap();

    let store = Arc::new(RunStore::new());
    let ports = Arc::new(PortAllocator::new(port_min, port_max));
    let workspaces = Arc::new(WorkspaceManager::new(
        workspace_base.path(),
        template.path(),
    ));
    let runtime = Arc::new(FakeRuntime::new());
    let gateway = Arc::new(GatewayRegistry::new());
    let observer = Arc::new(RecordingObserver::new());

    let config = EngineConfig {
        public_host: "127.0.0.1".to_string(),
        internal_port: 3000,
        stop_grace: Duration::from_millis(100),
        probe: ProbeConfig {
            timeout: Duration::from_millis(250),
            interval: Duration::from_millis(50),
            max_attempts: 3,
        },
    };

    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        ports.clone(),
        workspaces,
        runtime.clone(),
        gateway.clone(),
        Arc::new(generator),
        Some(observer.clone() as Arc<dyn RunObserver>),
        config,
    ));

    Harness {
        store,
        ports,
        runtime,
        gateway,
        observer,
        engine,
        workspace_base,
        _template: template,
    }
}

/// Poll the store until the run reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    store: &RunStore,
    run_id: &str,
    status: RunStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(run) = store.get_run(run_id).await {
            if run.status == status {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the run lands in any terminal state.
pub async fn wait_for_terminal(store: &RunStore, run_id: &str, timeout: Duration) -> RunStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(run) = store.get_run(run_id).await {
            if run.status.is_terminal() {
                return run.status;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("run {} did not reach a terminal state", run_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
