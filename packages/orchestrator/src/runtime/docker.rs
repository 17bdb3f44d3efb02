// ABOUTME: Docker implementation of the container runtime adapter via bollard
// ABOUTME: Owns container naming, labels, resource caps, and the two-phase security profile

use super::{
    build_container_name, run_container_name, BuildExecution, ContainerRuntime, ContainerState,
    Result, RuntimeError, BUILD_CPU_CORES, BUILD_MEMORY_BYTES, PHASE_DELIMITER, PIDS_LIMIT,
    RUN_CPU_CORES, RUN_MEMORY_BYTES,
};
use crate::types::ContainerHandle;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const MANAGED_LABEL: &str = "arena.managed";
const RUN_ID_LABEL: &str = "arena.run_id";
const PHASE_LABEL: &str = "arena.phase";

const CPU_PERIOD: i64 = 100_000;

/// Adapter over the local Docker daemon. Build containers run on the default
/// bridge with a read-write workspace; runtime containers run on the
/// isolation network with a read-only workspace and a hardened profile.
pub struct DockerRuntime {
    docker: Docker,
    network: String,
    image: String,
}

impl DockerRuntime {
    /// Connect using the platform default socket (`/var/run/docker.sock`).
    /// The connection is lazy; use [`ping`](Self::ping) to verify the daemon.
    pub fn new(network: impl Into<String>, image: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;
        Ok(Self {
            docker,
            network: network.into(),
            image: image.into(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Engine(e.to_string()))
    }

    fn labels(run_id: &str, phase: &str) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (RUN_ID_LABEL.to_string(), run_id.to_string()),
            (PHASE_LABEL.to_string(), phase.to_string()),
        ])
    }

    fn build_host_config(workspace: &Path) -> HostConfig {
        HostConfig {
            binds: Some(vec![format!("{}:/workspace", workspace.display())]),
            memory: Some(BUILD_MEMORY_BYTES),
            cpu_quota: Some((BUILD_CPU_CORES * CPU_PERIOD as f64) as i64),
            cpu_period: Some(CPU_PERIOD),
            pids_limit: Some(PIDS_LIMIT),
            network_mode: Some("bridge".to_string()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: Some(0),
            }),
            ..Default::default()
        }
    }

    fn run_host_config(workspace: &Path, network: &str, internal_port: u16, host_port: u16) -> HostConfig {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{}/tcp", internal_port),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        HostConfig {
            binds: Some(vec![format!("{}:/workspace:ro", workspace.display())]),
            memory: Some(RUN_MEMORY_BYTES),
            cpu_quota: Some((RUN_CPU_CORES * CPU_PERIOD as f64) as i64),
            cpu_period: Some(CPU_PERIOD),
            pids_limit: Some(PIDS_LIMIT),
            network_mode: Some(network.to_string()),
            port_bindings: Some(port_bindings),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            privileged: Some(false),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: Some(0),
            }),
            ..Default::default()
        }
    }

    fn env_list(env: &HashMap<String, String>) -> Vec<String> {
        env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Remove a container by name, tolerating absence. Used to clear stale
    /// names before create and to clean up after exit.
    async fn remove_by_name(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => debug!("removed container {}", name),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!("failed to remove container {}: {}", name, e),
        }
    }

    /// Forward a container's combined log stream line-by-line into `tx`.
    fn spawn_log_forwarder(&self, container_id: String, tx: mpsc::UnboundedSender<String>) {
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&container_id, Some(options));
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(output) => {
                        for line in output.to_string().split('\n') {
                            let line = line.trim_end_matches('\r');
                            if line.is_empty() {
                                continue;
                            }
                            if tx.send(line.to_string()).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("log stream for {} ended: {}", container_id, e);
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let existing = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!("created isolation network {}", name);
                Ok(())
            }
            // Raced with another creator; the network exists either way.
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Engine(e.to_string())),
        }
    }

    async fn build_exec(
        &self,
        run_id: &str,
        workspace: &Path,
        env: HashMap<String, String>,
    ) -> Result<BuildExecution> {
        let name = build_container_name(run_id);
        self.remove_by_name(&name).await;

        let command = format!(
            "npm install 2>&1 && echo '{}' && npm run build 2>&1",
            PHASE_DELIMITER
        );
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-lc".to_string(), command]),
            env: Some(Self::env_list(&env)),
            working_dir: Some("/workspace".to_string()),
            labels: Some(Self::labels(run_id, "build")),
            host_config: Some(Self::build_host_config(workspace)),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;
        info!("started build container {} for run {}", name, run_id);

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        self.spawn_log_forwarder(created.id.clone(), log_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let docker = self.docker.clone();
        let container_id = created.id.clone();
        let container_name = name.clone();
        tokio::spawn(async move {
            let mut wait = docker.wait_container(&container_id, None::<WaitContainerOptions<String>>);
            let code = match wait.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    warn!("wait on build container {} failed: {}", container_name, e);
                    -1
                }
                None => -1,
            };
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                debug!("build container {} already gone: {}", container_name, e);
            }
            let _ = exit_tx.send(code);
        });

        Ok(BuildExecution {
            handle: ContainerHandle {
                id: created.id,
                name,
                host_port: None,
                internal_ip: None,
            },
            logs: log_rx,
            exit: exit_rx,
        })
    }

    async fn run_exec(
        &self,
        run_id: &str,
        workspace: &Path,
        env: HashMap<String, String>,
        internal_port: u16,
        host_port: u16,
    ) -> Result<ContainerHandle> {
        let name = run_container_name(run_id);
        self.remove_by_name(&name).await;

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", internal_port), HashMap::new());

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-lc".to_string(),
                "npm run start 2>&1".to_string(),
            ]),
            env: Some(Self::env_list(&env)),
            working_dir: Some("/workspace".to_string()),
            labels: Some(Self::labels(run_id, "run")),
            exposed_ports: Some(exposed_ports),
            host_config: Some(Self::run_host_config(
                workspace,
                &self.network,
                internal_port,
                host_port,
            )),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Don't leave a created-but-dead container behind the name.
            self.remove_by_name(&name).await;
            return Err(RuntimeError::Engine(e.to_string()));
        }

        let inspect = self
            .docker
            .inspect_container(&created.id, None)
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;
        let internal_ip = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|mut networks| networks.remove(&self.network))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty());

        info!(
            "started runtime container {} for run {} on host port {}",
            name, run_id, host_port
        );

        Ok(ContainerHandle {
            id: created.id,
            name,
            host_port: Some(host_port),
            internal_ip,
        })
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(&handle.id, None)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::NotFound(handle.name.clone()),
                other => RuntimeError::Engine(other.to_string()),
            })?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| {
                ports.values().flatten().flatten().find_map(|binding| {
                    binding.host_port.as_ref().and_then(|p| p.parse().ok())
                })
            });

        Ok(ContainerState { running, host_port })
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(&handle.id, Some(options));
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => buffer.push_str(&output.to_string()),
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(RuntimeError::NotFound(handle.name.clone())),
                Err(e) => return Err(RuntimeError::Engine(e.to_string())),
            }
        }
        Ok(buffer)
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => {}
            // Already stopped or already removed.
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => return Err(RuntimeError::Engine(e.to_string())),
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Engine(e.to_string())),
        }
    }

    async fn reap_stale(&self) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;

        let mut reaped = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            let name = container
                .names
                .unwrap_or_default()
                .first()
                .cloned()
                .unwrap_or_else(|| id.clone());
            warn!("reaping stale container {}", name);
            let handle = ContainerHandle {
                id,
                name,
                host_port: None,
                internal_ip: None,
            };
            if self.stop(&handle, Duration::from_secs(5)).await.is_ok() {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("reaped {} stale containers", reaped);
        }
        Ok(reaped)
    }
}
