// ABOUTME: Run lifecycle engine driving each run through generate, build, start, probe, register
// ABOUTME: One cancellable task per run; every failure path funnels into the same cleanup sequence

use crate::gateway::GatewayRegistry;
use crate::generator::{CodeGenerator, GeneratorError};
use crate::ports::{PortAllocator, PortError};
use crate::runtime::{ContainerRuntime, RuntimeError, PHASE_DELIMITER};
use crate::store::{RunStore, StoreError};
use crate::types::{RunPatch, RunStatus};
use crate::workspace::{WorkspaceError, WorkspaceManager};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error of a single run. The `Display` text is what lands in the run's
/// `error` field and is surfaced verbatim by the UI.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid generated code: {0}")]
    Validation(String),

    #[error("code generation failed: {0}")]
    Generation(#[from] GeneratorError),

    #[error("build failed with exit code {exit_code}: {tail}")]
    Build { exit_code: i64, tail: String },

    #[error("failed to start runtime container: {0}")]
    Start(String),

    #[error("health check failed after {attempts} attempts against {url}")]
    HealthCheck { attempts: u32, url: String },

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("container engine error: {0}")]
    Engine(#[from] RuntimeError),

    #[error("run cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum KillError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

/// Health probe tuning. Defaults match the production contract: 5 s per
/// request, 2 s between requests, 30 attempts.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Host part of internal URLs (`http://<host>:<port>`).
    pub public_host: String,
    /// Port the generated app listens on inside its container.
    pub internal_port: u16,
    /// Graceful stop window before force-kill.
    pub stop_grace: Duration,
    pub probe: ProbeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            internal_port: 3000,
            stop_grace: Duration::from_secs(10),
            probe: ProbeConfig::default(),
        }
    }
}

/// Advisory notification of a run delta. The in-process store stays
/// authoritative; observers must never stall the pipeline.
#[async_trait::async_trait]
pub trait RunObserver: Send + Sync {
    async fn run_updated(&self, run_id: &str, patch: &RunPatch);
}

/// Best-effort PATCH callbacks to the UI process when orchestrator and UI are
/// split across processes. Delivery failures are logged and ignored.
pub struct UiCallback {
    client: reqwest::Client,
    base_url: String,
}

impl UiCallback {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl RunObserver for UiCallback {
    async fn run_updated(&self, run_id: &str, patch: &RunPatch) {
        let url = format!(
            "{}/api/runs/{}",
            self.base_url.trim_end_matches('/'),
            run_id
        );
        match self.client.patch(&url).json(patch).send().await {
            Ok(response) if !response.status().is_success() => {
                debug!("ui callback for run {} returned {}", run_id, response.status());
            }
            Ok(_) => {}
            Err(e) => debug!("ui callback for run {} failed: {}", run_id, e),
        }
    }
}

struct RunTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives the run state machine. The engine is the only writer of run
/// statuses; all other components are invoked from here.
pub struct LifecycleEngine {
    store: Arc<RunStore>,
    ports: Arc<PortAllocator>,
    workspaces: Arc<WorkspaceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    gateway: Arc<GatewayRegistry>,
    generator: Arc<dyn CodeGenerator>,
    observer: Option<Arc<dyn RunObserver>>,
    config: EngineConfig,
    http: reqwest::Client,
    tasks: Mutex<HashMap<String, RunTask>>,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RunStore>,
        ports: Arc<PortAllocator>,
        workspaces: Arc<WorkspaceManager>,
        runtime: Arc<dyn ContainerRuntime>,
        gateway: Arc<GatewayRegistry>,
        generator: Arc<dyn CodeGenerator>,
        observer: Option<Arc<dyn RunObserver>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ports,
            workspaces,
            runtime,
            gateway,
            generator,
            observer,
            config,
            http: reqwest::Client::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start every eligible run in a session.
    pub async fn start_session(self: &Arc<Self>, session_id: &str) -> Result<(), StoreError> {
        let (_, runs) = self.store.get_session(session_id).await?;
        for run in runs {
            if let Err(e) = self.start_run(&run.id).await {
                warn!("failed to start run {}: {}", run.id, e);
            }
        }
        Ok(())
    }

    /// Spawn the lifecycle task for a run. Returns false if the run is not
    /// eligible (mid-flight, or already driven). Terminal runs are reset and
    /// restarted.
    pub async fn start_run(self: &Arc<Self>, run_id: &str) -> Result<bool, StoreError> {
        let run = self.store.get_run(run_id).await?;
        let restart = run.status.is_terminal();
        if !restart && run.status != RunStatus::Queued {
            return Ok(false);
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(run_id) {
            return Ok(false);
        }
        if restart {
            self.store.reset_run(run_id).await?;
        }

        let token = CancellationToken::new();
        let engine = self.clone();
        let id = run_id.to_string();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            engine.drive(id, task_token).await;
        });
        tasks.insert(run_id.to_string(), RunTask { token, handle });
        info!("started lifecycle for run {}", run_id);
        Ok(true)
    }

    /// Explicit kill. Allowed from any state; killing a terminal run is a
    /// no-op that reports success.
    pub async fn kill_run(&self, run_id: &str) -> Result<(), KillError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let task = self.tasks.lock().await.remove(run_id);
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }

        // The task finalizes cancelled runs itself; anything still live here
        // (e.g. a ready run with no task) gets the full sink now.
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        self.cleanup(run_id).await.map_err(KillError::Cleanup)?;
        let _ = self
            .store
            .finish_run(run_id, RunStatus::Terminated, None)
            .await;
        self.notify(
            run_id,
            &RunPatch {
                status: Some(RunStatus::Terminated),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
        info!("run {} terminated", run_id);
        Ok(())
    }

    /// Daemon teardown: cancel every lifecycle task, then stop all live
    /// containers in parallel.
    pub async fn shutdown(&self) {
        let tasks: Vec<RunTask> = {
            let mut map = self.tasks.lock().await;
            map.drain().map(|(_, task)| task).collect()
        };
        for task in &tasks {
            task.token.cancel();
        }
        for task in tasks {
            let _ = task.handle.await;
        }

        let runs = self.store.list_runs().await;
        let stops = runs.iter().filter_map(|run| {
            run.container.as_ref().map(|handle| {
                let runtime = self.runtime.clone();
                let handle = handle.clone();
                let grace = self.config.stop_grace;
                async move {
                    if let Err(e) = runtime.stop(&handle, grace).await {
                        warn!("failed to stop container {} on shutdown: {}", handle.name, e);
                    }
                }
            })
        });
        futures::future::join_all(stops).await;
        info!("lifecycle engine shut down");
    }

    /// Logs of a run's runtime container: live from the engine when a handle
    /// exists, otherwise the buffers captured in the store.
    pub async fn run_logs(&self, run_id: &str) -> Result<String, StoreError> {
        let run = self.store.get_run(run_id).await?;
        if let Some(handle) = &run.container {
            if let Ok(live) = self.runtime.logs(handle).await {
                return Ok(live);
            }
        }
        let mut combined = String::new();
        for buffer in [
            &run.logs_install,
            &run.logs_build,
            &run.logs_start,
            &run.logs_error,
        ] {
            if !buffer.is_empty() {
                combined.push_str(buffer);
                if !buffer.ends_with('\n') {
                    combined.push('\n');
                }
            }
        }
        Ok(combined)
    }

    async fn drive(self: Arc<Self>, run_id: String, token: CancellationToken) {
        let outcome = self.pipeline(&run_id, &token).await;
        match outcome {
            Ok(()) if token.is_cancelled() => self.terminate_now(&run_id).await,
            Ok(()) => debug!("run {} reached ready", run_id),
            Err(RunError::Cancelled) => self.terminate_now(&run_id).await,
            Err(err) => self.fail(&run_id, err).await,
        }
        self.tasks.lock().await.remove(&run_id);
    }

    async fn pipeline(&self, run_id: &str, token: &CancellationToken) -> Result<(), RunError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|_| RunError::Cancelled)?;
        let (session, _) = self
            .store
            .get_session(&run.session_id)
            .await
            .map_err(|_| RunError::Cancelled)?;

        // queued -> generating
        self.transition(
            run_id,
            RunPatch {
                status: Some(RunStatus::Generating),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;

        let files = tokio::select! {
            _ = token.cancelled() => return Err(RunError::Cancelled),
            result = self.generator.generate(&session.prompt, run.provider, &run.model) => result?,
        };
        validate_generated_files(&files)?;

        // generating -> installing
        let workspace = self.workspaces.materialize(run_id, &files)?;
        self.transition(run_id, RunPatch::status(RunStatus::Installing))
            .await?;

        let mut build = self
            .runtime
            .build_exec(run_id, &workspace, build_env())
            .await?;

        // One container, one invocation; the delimiter line in the stream is
        // where install ends and compile begins.
        let mut install_log = String::new();
        let mut build_log = String::new();
        let mut in_build = false;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = self.runtime.stop(&build.handle, self.config.stop_grace).await;
                    return Err(RunError::Cancelled);
                }
                line = build.logs.recv() => match line {
                    Some(line) if line.trim() == PHASE_DELIMITER => {
                        in_build = true;
                        self.transition(
                            run_id,
                            RunPatch {
                                status: Some(RunStatus::Building),
                                logs_install: Some(install_log.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    }
                    Some(line) => {
                        let target = if in_build { &mut build_log } else { &mut install_log };
                        target.push_str(&line);
                        target.push('\n');
                    }
                    None => break,
                }
            }
        }

        let exit_code = tokio::select! {
            _ = token.cancelled() => {
                let _ = self.runtime.stop(&build.handle, self.config.stop_grace).await;
                return Err(RunError::Cancelled);
            }
            code = &mut build.exit => code.unwrap_or(-1),
        };
        // A failure before the delimiter (dependency fetch) still surfaces
        // through the build log, which is where the UI looks for it.
        if exit_code != 0 && build_log.is_empty() {
            build_log = install_log.clone();
        }
        let _ = self
            .store
            .update_run(
                run_id,
                RunPatch {
                    logs_install: Some(install_log.clone()),
                    logs_build: Some(build_log.clone()),
                    ..Default::default()
                },
            )
            .await;
        if exit_code != 0 {
            return Err(RunError::Build {
                exit_code,
                tail: log_tail(&build_log, 20),
            });
        }

        // building -> starting
        let port = self.ports.allocate()?;
        let internal_url = format!("http://{}:{}", self.config.public_host, port);
        let handle = match self
            .runtime
            .run_exec(
                run_id,
                &workspace,
                run_env(self.config.internal_port),
                self.config.internal_port,
                port,
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                // The port must be free again before the failure is visible.
                self.ports.release(port);
                return Err(RunError::Start(e.to_string()));
            }
        };
        if self
            .transition(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Starting),
                    port: Some(port),
                    container: Some(handle.clone()),
                    internal_url: Some(internal_url.clone()),
                    ..Default::default()
                },
            )
            .await
            .is_err()
        {
            // Run record vanished mid-start; the store can no longer own these.
            let _ = self.runtime.stop(&handle, self.config.stop_grace).await;
            self.ports.release(port);
            return Err(RunError::Cancelled);
        }

        // starting -> healthy
        self.probe_health(&internal_url, token).await?;
        let start_logs = self.runtime.logs(&handle).await.unwrap_or_default();
        self.transition(
            run_id,
            RunPatch {
                status: Some(RunStatus::Healthy),
                logs_start: Some(start_logs),
                ..Default::default()
            },
        )
        .await?;

        // healthy -> ready: registry entry first, so a reader that sees ready
        // always resolves.
        self.gateway.register(run_id, &internal_url);
        if self
            .transition(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Ready),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .is_err()
        {
            self.gateway.unregister(run_id);
            return Err(RunError::Cancelled);
        }
        info!("run {} ready at {}", run_id, internal_url);
        Ok(())
    }

    async fn probe_health(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<(), RunError> {
        let probe = &self.config.probe;
        for attempt in 1..=probe.max_attempts {
            let request = self.http.get(url).timeout(probe.timeout).send();
            tokio::select! {
                _ = token.cancelled() => return Err(RunError::Cancelled),
                result = request => match result {
                    Ok(response) if response.status().is_success() => {
                        debug!("health probe passed on attempt {}: {}", attempt, url);
                        return Ok(());
                    }
                    Ok(response) => {
                        debug!("health probe attempt {} got {}: {}", attempt, response.status(), url);
                    }
                    Err(e) => {
                        debug!("health probe attempt {} failed: {}", attempt, e);
                    }
                }
            }
            if attempt < probe.max_attempts {
                tokio::select! {
                    _ = token.cancelled() => return Err(RunError::Cancelled),
                    _ = tokio::time::sleep(probe.interval) => {}
                }
            }
        }
        Err(RunError::HealthCheck {
            attempts: probe.max_attempts,
            url: url.to_string(),
        })
    }

    /// The single failure sink: unregister, stop, release, delete, then
    /// publish `failed` with the error text.
    async fn fail(&self, run_id: &str, err: RunError) {
        let message = err.to_string();
        warn!("run {} failed: {}", run_id, message);
        if let Err(e) = self.cleanup(run_id).await {
            warn!("cleanup after failure of run {} incomplete: {}", run_id, e);
        }
        let _ = self
            .store
            .update_run(
                run_id,
                RunPatch {
                    logs_error: Some(message.clone()),
                    ..Default::default()
                },
            )
            .await;
        let _ = self
            .store
            .finish_run(run_id, RunStatus::Failed, Some(message.clone()))
            .await;
        self.notify(
            run_id,
            &RunPatch {
                status: Some(RunStatus::Failed),
                error: Some(message),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    }

    async fn terminate_now(&self, run_id: &str) {
        if let Err(e) = self.cleanup(run_id).await {
            warn!("cleanup on kill of run {} incomplete: {}", run_id, e);
        }
        let _ = self
            .store
            .finish_run(run_id, RunStatus::Terminated, None)
            .await;
        self.notify(
            run_id,
            &RunPatch {
                status: Some(RunStatus::Terminated),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
        info!("run {} terminated", run_id);
    }

    /// Release everything a run owns. Unregistration precedes the terminal
    /// store transition performed by the caller.
    async fn cleanup(&self, run_id: &str) -> Result<(), String> {
        self.gateway.unregister(run_id);

        let mut first_error = None;
        if let Ok(run) = self.store.get_run(run_id).await {
            if let Some(handle) = &run.container {
                if let Err(e) = self.runtime.stop(handle, self.config.stop_grace).await {
                    first_error.get_or_insert(format!("stop {}: {}", handle.name, e));
                }
            }
            if let Some(port) = run.port {
                self.ports.release(port);
            }
        }
        if let Err(e) = self.workspaces.remove(run_id) {
            first_error.get_or_insert(format!("workspace: {}", e));
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Store update plus best-effort UI callback. A missing run means the
    /// record was purged under us.
    async fn transition(&self, run_id: &str, patch: RunPatch) -> Result<(), RunError> {
        self.store
            .update_run(run_id, patch.clone())
            .await
            .map_err(|_| RunError::Cancelled)?;
        self.notify(run_id, &patch).await;
        Ok(())
    }

    async fn notify(&self, run_id: &str, patch: &RunPatch) {
        if let Some(observer) = &self.observer {
            observer.run_updated(run_id, patch).await;
        }
    }

    pub async fn active_task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

fn build_env() -> HashMap<String, String> {
    HashMap::from([
        ("NODE_ENV".to_string(), "production".to_string()),
        ("NPM_CONFIG_LOGLEVEL".to_string(), "error".to_string()),
    ])
}

fn run_env(internal_port: u16) -> HashMap<String, String> {
    HashMap::from([
        ("NODE_ENV".to_string(), "production".to_string()),
        ("PORT".to_string(), internal_port.to_string()),
        ("HOSTNAME".to_string(), "0.0.0.0".to_string()),
    ])
}

/// Check the generated file set: the manifest must exist with build and start
/// scripts, and there must be at least one page-level source file.
pub fn validate_generated_files(files: &HashMap<String, String>) -> Result<(), RunError> {
    let manifest = files
        .get("package.json")
        .ok_or_else(|| RunError::Validation("missing required file: package.json".to_string()))?;
    let parsed: serde_json::Value = serde_json::from_str(manifest)
        .map_err(|e| RunError::Validation(format!("package.json is not valid JSON: {}", e)))?;

    let has_script = |name: &str| {
        parsed
            .get("scripts")
            .and_then(|scripts| scripts.get(name))
            .and_then(|value| value.as_str())
            .map(|script| !script.trim().is_empty())
            .unwrap_or(false)
    };
    if !has_script("build") {
        return Err(RunError::Validation(
            "package.json does not declare a build script".to_string(),
        ));
    }
    if !has_script("start") {
        return Err(RunError::Validation(
            "package.json does not declare a start script".to_string(),
        ));
    }

    if !files.keys().any(|path| is_page_source(path)) {
        return Err(RunError::Validation(
            "missing required file: no page-level source file in generated output".to_string(),
        ));
    }
    Ok(())
}

fn is_page_source(path: &str) -> bool {
    let p = Path::new(path);
    let ext_ok = matches!(
        p.extension().and_then(|e| e.to_str()),
        Some("js" | "jsx" | "ts" | "tsx" | "html")
    );
    if !ext_ok {
        return false;
    }
    if path.starts_with("app/") || path.starts_with("pages/") || path.starts_with("src/") {
        return true;
    }
    matches!(p.file_stem().and_then(|s| s.to_str()), Some("page" | "index"))
}

fn log_tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(scripts: &str) -> String {
        format!("{{\"name\":\"app\",\"scripts\":{}}}", scripts)
    }

    #[test]
    fn test_validation_requires_manifest() {
        let files = HashMap::new();
        let err = validate_generated_files(&files).unwrap_err();
        assert!(err.to_string().contains("missing required file"));
    }

    #[test]
    fn test_validation_requires_both_scripts() {
        let mut files = HashMap::new();
        files.insert(
            "package.json".to_string(),
            manifest("{\"build\":\"next build\"}"),
        );
        files.insert("app/page.tsx".to_string(), "x".to_string());
        let err = validate_generated_files(&files).unwrap_err();
        assert!(err.to_string().contains("start script"));

        files.insert(
            "package.json".to_string(),
            manifest("{\"start\":\"next start\"}"),
        );
        let err = validate_generated_files(&files).unwrap_err();
        assert!(err.to_string().contains("build script"));
    }

    #[test]
    fn test_validation_requires_page_source() {
        let mut files = HashMap::new();
        files.insert(
            "package.json".to_string(),
            manifest("{\"build\":\"next build\",\"start\":\"next start\"}"),
        );
        files.insert("README.md".to_string(), "docs".to_string());
        let err = validate_generated_files(&files).unwrap_err();
        assert!(err.to_string().contains("missing required file"));

        files.insert("app/page.tsx".to_string(), "export default".to_string());
        assert!(validate_generated_files(&files).is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_json_manifest() {
        let mut files = HashMap::new();
        files.insert("package.json".to_string(), "not json".to_string());
        files.insert("index.html".to_string(), "<html/>".to_string());
        let err = validate_generated_files(&files).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_page_source_detection() {
        assert!(is_page_source("app/page.tsx"));
        assert!(is_page_source("pages/about.jsx"));
        assert!(is_page_source("index.html"));
        assert!(is_page_source("page.js"));
        assert!(!is_page_source("styles/main.css"));
        assert!(!is_page_source("README.md"));
    }

    #[test]
    fn test_log_tail_keeps_last_lines() {
        let log = (1..=30).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let tail = log_tail(&log, 20);
        assert!(tail.starts_with("line 11"));
        assert!(tail.ends_with("line 30"));
        assert_eq!(log_tail("short", 20), "short");
    }
}
