use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PipelineStatus — per-project pipeline progress
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Polled by the external API layer; serialized field names match the wire
/// format the dashboard expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub project: String,
    pub current_step: Option<String>,
    pub step_index: usize,
    pub total_steps: usize,
    /// Step name -> log text; insertion order is execution order.
    pub logs: IndexMap<String, String>,
    pub done: bool,
    pub success: bool,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds, computed when the run finalizes.
    pub duration_secs: Option<i64>,
}

impl PipelineStatus {
    fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            current_step: None,
            step_index: 0,
            total_steps: 0,
            logs: IndexMap::new(),
            done: false,
            success: false,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: None,
        }
    }
}

/// Partial update; absent fields leave the stored entry untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub current_step: Option<String>,
    pub step_index: Option<usize>,
    pub total_steps: Option<usize>,
    pub step_log: Option<(String, String)>,
    pub done: Option<bool>,
    pub success: Option<bool>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn step(name: &str, index: usize, total: usize) -> Self {
        Self {
            current_step: Some(name.to_string()),
            step_index: Some(index),
            total_steps: Some(total),
            ..Default::default()
        }
    }

    pub fn log(step: &str, content: &str) -> Self {
        Self {
            step_log: Some((step.to_string(), content.to_string())),
            ..Default::default()
        }
    }

    pub fn finished(success: bool, error: Option<String>) -> Self {
        Self {
            done: Some(true),
            success: Some(success),
            error,
            ..Default::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StatusStore — process-wide project -> status map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Constructed once at process start and injected wherever progress is
/// reported or polled. The mutex is what makes concurrent pipeline runs
/// safe; nothing here relies on single-threaded execution.
pub struct StatusStore {
    inner: Mutex<HashMap<String, PipelineStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Start a fresh run for a project, replacing whatever a previous run
    /// left behind (stale done/error fields would otherwise leak into the
    /// new run through merge updates).
    pub async fn begin_run(&self, project: &str, total_steps: usize) {
        let mut status = PipelineStatus::new(project);
        status.total_steps = total_steps;
        self.inner
            .lock()
            .await
            .insert(project.to_string(), status);
    }

    /// Merge a partial update into the project's entry, creating the entry
    /// on first update. Setting `done` recomputes end time and duration.
    pub async fn update_status(&self, project: &str, update: StatusUpdate) {
        let mut map = self.inner.lock().await;
        let status = map
            .entry(project.to_string())
            .or_insert_with(|| PipelineStatus::new(project));

        if let Some(step) = update.current_step {
            status.current_step = Some(step);
        }
        if let Some(index) = update.step_index {
            status.step_index = index;
        }
        if let Some(total) = update.total_steps {
            status.total_steps = total;
        }
        if let Some((step, content)) = update.step_log {
            status.logs.insert(step, content);
        }
        if let Some(success) = update.success {
            status.success = success;
        }
        if let Some(error) = update.error {
            status.error = Some(error);
        }
        if let Some(done) = update.done {
            status.done = done;
            if done {
                let end = Utc::now();
                status.end_time = Some(end);
                let millis = (end - status.start_time).num_milliseconds();
                status.duration_secs = Some((millis as f64 / 1000.0).round() as i64);
            }
        }
    }

    /// None is the "not found" marker; unknown projects never fail the
    /// caller.
    pub async fn get_status(&self, project: &str) -> Option<PipelineStatus> {
        self.inner.lock().await.get(project).cloned()
    }

    /// Purge entries whose run started before the retention window.
    /// Driven by an external scheduler, not by the store itself.
    pub async fn cleanup_old_statuses(&self, retention_hours: i64) -> usize {
        let cutoff = Utc::now() - Duration::hours(retention_hours);
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, status| status.start_time >= cutoff);
        let removed = before - map.len();
        if removed > 0 {
            tracing::info!(removed = removed, retention_hours = retention_hours, "purged stale pipeline statuses");
        }
        removed
    }

    #[cfg(test)]
    async fn set_start_time(&self, project: &str, start_time: DateTime<Utc>) {
        if let Some(status) = self.inner.lock().await.get_mut(project) {
            status.start_time = start_time;
        }
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
