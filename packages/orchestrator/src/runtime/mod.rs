// ABOUTME: Container runtime adapter contract covering build and runtime phase execution
// ABOUTME: The single polymorphism boundary; tests substitute a deterministic in-memory fake

use crate::types::ContainerHandle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container engine error: {0}")]
    Engine(String),

    #[error("container not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Line the build container prints between dependency fetch and compile, so
/// the lifecycle engine can split one log stream into install and build logs.
pub const PHASE_DELIMITER: &str = "=== arena:build ===";

/// Resource caps for the networked, read-write build phase.
pub const BUILD_MEMORY_BYTES: i64 = 4 * 1024 * 1024 * 1024;
pub const BUILD_CPU_CORES: f64 = 2.0;

/// Resource caps for the isolated, read-only runtime phase.
pub const RUN_MEMORY_BYTES: i64 = 2 * 1024 * 1024 * 1024;
pub const RUN_CPU_CORES: f64 = 1.0;

pub const PIDS_LIMIT: i64 = 512;

/// A one-shot build container in flight. The log stream closes when the
/// container exits; the exit code arrives on `exit`.
pub struct BuildExecution {
    pub handle: ContainerHandle,
    pub logs: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i64>,
}

/// Observed state of a container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub running: bool,
    pub host_port: Option<u16>,
}

/// Contract over the local container engine. Implementations own all engine
/// interaction; callers never see engine-native types.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure the isolation network exists with bridge isolation.
    /// Idempotent.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Start the one-shot build container: dependency fetch then compile as a
    /// single invocation, bridge-networked, workspace mounted read-write.
    /// The container is removed once it exits.
    async fn build_exec(
        &self,
        run_id: &str,
        workspace: &Path,
        env: HashMap<String, String>,
    ) -> Result<BuildExecution>;

    /// Start the long-lived runtime container on the isolation network with
    /// the supplied host port bound to `internal_port`. Workspace is mounted
    /// read-only, all capabilities dropped, no-new-privileges set.
    async fn run_exec(
        &self,
        run_id: &str,
        workspace: &Path,
        env: HashMap<String, String>,
        internal_port: u16,
        host_port: u16,
    ) -> Result<ContainerHandle>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState>;

    /// Accumulated log buffer of a container.
    async fn logs(&self, handle: &ContainerHandle) -> Result<String>;

    /// Stop, then kill after the grace period, then remove. Idempotent:
    /// already-stopped and already-removed containers are not errors.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    /// Remove containers left behind by a previous daemon (matched by this
    /// daemon's labels). Returns how many were reaped.
    async fn reap_stale(&self) -> Result<usize>;
}

pub fn build_container_name(run_id: &str) -> String {
    format!("build-{}", run_id)
}

pub fn run_container_name(run_id: &str) -> String {
    format!("run-{}", run_id)
}
