//! Per-workflow debug logs.
//!
//! A finished multi-step workflow is written as one pretty-printed JSON file
//! `<debug_dir>/<timestamp>_<id8>.json` holding its todos, notes, history and
//! every recorded step.

use crate::workflow::{
    DebugStep, HistoryEntry, Note, TodoSnapshot, Workflow, WorkflowStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted debug payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLog {
    pub workflow_id: String,
    pub goal: String,
    pub status: WorkflowStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logged_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub todos: Vec<TodoSnapshot>,
    pub notes: Vec<Note>,
    pub history: Vec<HistoryEntry>,
    pub steps: Vec<DebugStep>,
}

impl DebugLog {
    pub fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            goal: workflow.goal.clone(),
            status: workflow.status,
            iteration: workflow.iteration,
            max_iterations: workflow.max_iterations,
            created_at: workflow.created_at,
            completed_at: workflow.completed_at,
            logged_at: Utc::now(),
            error: workflow.error.clone(),
            todos: workflow.todos.iter().map(TodoSnapshot::from).collect(),
            notes: workflow.notes.clone(),
            history: workflow.history.clone(),
            steps: workflow.debug_steps.clone(),
        }
    }
}

/// Single-shot workflows are not logged.
pub fn should_log(workflow: &Workflow) -> bool {
    workflow.todos.len() > 1 || workflow.debug_steps.len() > 1
}

pub struct DebugLogger {
    log_dir: PathBuf,
}

impl DebugLogger {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn write(&self, log: &DebugLog) -> Result<PathBuf> {
        fs::create_dir_all(&self.log_dir).with_context(|| {
            format!("Failed to create debug log dir: {}", self.log_dir.display())
        })?;

        let short_id: String = log.workflow_id.chars().take(8).collect();
        let filename = format!(
            "{}_{}.json",
            log.created_at.format("%Y-%m-%dT%H-%M-%S"),
            short_id
        );
        let path = self.log_dir.join(filename);

        let json = serde_json::to_string_pretty(log).context("Failed to serialize debug log")?;
        fs::write(&path, json).context("Failed to write debug log file")?;
        Ok(path)
    }

    /// Write the workflow's log if it qualifies. `Ok(None)` when skipped.
    pub fn persist(&self, workflow: &Workflow) -> Result<Option<PathBuf>> {
        if !should_log(workflow) {
            return Ok(None);
        }
        self.write(&DebugLog::from_workflow(workflow)).map(Some)
    }

    pub fn list_logs(&self) -> Result<Vec<PathBuf>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }

        let mut logs: Vec<PathBuf> = fs::read_dir(&self.log_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        logs.sort();
        logs.reverse(); // Most recent first
        Ok(logs)
    }

    pub fn load(&self, path: &Path) -> Result<DebugLog> {
        let content = fs::read_to_string(path).context("Failed to read debug log file")?;
        let log: DebugLog =
            serde_json::from_str(&content).context("Failed to parse debug log file")?;
        Ok(log)
    }
}
