// ABOUTME: Run orchestrator core: port allocation, workspaces, container runtime, registry, store, lifecycle
// ABOUTME: Domain crate consumed by the HTTP layer and the daemon binary

pub mod config;
pub mod gateway;
pub mod generator;
pub mod lifecycle;
pub mod ports;
pub mod runtime;
pub mod store;
pub mod types;
pub mod workspace;

pub use config::{Config, ConfigError};
pub use gateway::GatewayRegistry;
pub use generator::{CodeGenerator, GeneratorError, HttpCodeGenerator};
pub use lifecycle::{
    EngineConfig, KillError, LifecycleEngine, ProbeConfig, RunError, RunObserver, UiCallback,
};
pub use ports::{PortAllocator, PortError};
pub use runtime::{
    BuildExecution, ContainerRuntime, ContainerState, DockerRuntime, RuntimeError,
};
pub use store::{RunStore, StoreError};
pub use types::{
    ContainerHandle, ModelProvider, ModelSpec, Run, RunPatch, RunStatus, Session,
};
pub use workspace::{WorkspaceError, WorkspaceManager};
