// ABOUTME: Core data model for sessions, runs, statuses, and container handles
// ABOUTME: Wire-facing types shared by the state store, lifecycle engine, and HTTP layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A grouping of runs sharing one prompt, created by one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub prompt: String,
    pub run_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One (prompt, provider, model) triple undergoing the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub provider: ModelProvider,
    pub model: String,
    pub status: RunStatus,
    pub port: Option<u16>,
    pub container: Option<ContainerHandle>,
    pub internal_url: Option<String>,
    pub error: Option<String>,
    pub logs_install: String,
    pub logs_build: String,
    pub logs_start: String,
    pub logs_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a run. Forward transitions only; `Failed` and
/// `Terminated` are terminal sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Generating,
    Installing,
    Building,
    Starting,
    Healthy,
    Ready,
    Failed,
    Terminated,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Terminated)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Generating => "generating",
            RunStatus::Installing => "installing",
            RunStatus::Building => "building",
            RunStatus::Starting => "starting",
            RunStatus::Healthy => "healthy",
            RunStatus::Ready => "ready",
            RunStatus::Failed => "failed",
            RunStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Model providers accepted by the submission endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Openai,
    Anthropic,
    Google,
    Xai,
    Meta,
    Deepseek,
}

impl FromStr for ModelProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ModelProvider::Openai),
            "anthropic" => Ok(ModelProvider::Anthropic),
            "google" => Ok(ModelProvider::Google),
            "xai" => Ok(ModelProvider::Xai),
            "meta" => Ok(ModelProvider::Meta),
            "deepseek" => Ok(ModelProvider::Deepseek),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelProvider::Openai => "openai",
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::Google => "google",
            ModelProvider::Xai => "xai",
            ModelProvider::Meta => "meta",
            ModelProvider::Deepseek => "deepseek",
        };
        f.write_str(s)
    }
}

/// A (provider, model) pair requested for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: ModelProvider,
    pub model: String,
}

/// Handle to a container owned by a run. `host_port` is present for runtime
/// containers; build containers carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub host_port: Option<u16>,
    pub internal_ip: Option<String>,
}

/// Partial update merged into a run record. Fields left `None` are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_install: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_build: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        RunPatch {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Generate an opaque identifier safe for use as a subdomain token.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
