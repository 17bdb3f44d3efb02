// ABOUTME: In-memory state store for sessions and runs, the single source of truth for the UI
// ABOUTME: Mutations are serialized behind one write lock; reads take consistent per-run snapshots

use crate::types::{new_id, ModelSpec, Run, RunPatch, RunStatus, Session};
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    runs: HashMap<String, Run>,
}

/// Keyed by session and run identifiers. Sessions own a list of run ids; runs
/// reference their session by id only, so reads join them back together.
#[derive(Default)]
pub struct RunStore {
    inner: RwLock<Inner>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and one run per requested model, atomically.
    pub async fn create_session(&self, prompt: &str, models: &[ModelSpec]) -> (Session, Vec<Run>) {
        let now = Utc::now();
        let mut runs = Vec::with_capacity(models.len());
        for spec in models {
            runs.push(Run {
                id: new_id(),
                session_id: String::new(),
                provider: spec.provider,
                model: spec.model.clone(),
                status: RunStatus::Queued,
                port: None,
                container: None,
                internal_url: None,
                error: None,
                logs_install: String::new(),
                logs_build: String::new(),
                logs_start: String::new(),
                logs_error: String::new(),
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            });
        }

        let session = Session {
            id: new_id(),
            prompt: prompt.to_string(),
            run_ids: runs.iter().map(|r| r.id.clone()).collect(),
            created_at: now,
            updated_at: now,
        };
        for run in &mut runs {
            run.session_id = session.id.clone();
        }

        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        for run in &runs {
            inner.runs.insert(run.id.clone(), run.clone());
        }
        (session, runs)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<(Session, Vec<Run>)> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let runs = session
            .run_ids
            .iter()
            .filter_map(|id| inner.runs.get(id).cloned())
            .collect();
        Ok((session, runs))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let inner = self.inner.read().await;
        inner
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self) -> Vec<Run> {
        let inner = self.inner.read().await;
        inner.runs.values().cloned().collect()
    }

    /// Merge a partial update into a run, bumping `updated_at` on both the
    /// run and its parent session.
    pub async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<Run> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(port) = patch.port {
            run.port = Some(port);
        }
        if let Some(container) = patch.container {
            run.container = Some(container);
        }
        if let Some(url) = patch.internal_url {
            run.internal_url = Some(url);
        }
        if let Some(error) = patch.error {
            run.error = Some(error);
        }
        if let Some(logs) = patch.logs_install {
            run.logs_install = logs;
        }
        if let Some(logs) = patch.logs_build {
            run.logs_build = logs;
        }
        if let Some(logs) = patch.logs_start {
            run.logs_start = logs;
        }
        if let Some(logs) = patch.logs_error {
            run.logs_error = logs;
        }
        if let Some(at) = patch.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            run.completed_at = Some(at);
        }

        let now = Utc::now();
        run.updated_at = now;
        let session_id = run.session_id.clone();
        let updated = run.clone();
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.updated_at = now;
        }
        Ok(updated)
    }

    /// Drive a run into a terminal state, dropping its resource fields so the
    /// record no longer claims a port or container.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        run.status = status;
        run.port = None;
        run.container = None;
        if let Some(error) = error {
            run.error = Some(error);
        }
        let now = Utc::now();
        run.completed_at = Some(now);
        run.updated_at = now;
        let session_id = run.session_id.clone();
        let updated = run.clone();
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.updated_at = now;
        }
        Ok(updated)
    }

    /// Reset a run back to `queued` for a restart, clearing logs, resources,
    /// and timestamps from the previous attempt.
    pub async fn reset_run(&self, run_id: &str) -> Result<Run> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        run.status = RunStatus::Queued;
        run.port = None;
        run.container = None;
        run.internal_url = None;
        run.error = None;
        run.logs_install.clear();
        run.logs_build.clear();
        run.logs_start.clear();
        run.logs_error.clear();
        run.started_at = None;
        run.completed_at = None;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .remove(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if let Some(session) = inner.sessions.get_mut(&run.session_id) {
            session.run_ids.retain(|id| id != run_id);
        }
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        for run_id in &session.run_ids {
            inner.runs.remove(run_id);
        }
        Ok(())
    }

    /// Count of runs currently holding a container handle.
    pub async fn active_container_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.runs.values().filter(|r| r.container.is_some()).count()
    }
}
