//! Workflow and todo data model.
//!
//! A `Workflow` is owned by the registry and mutated in place by the
//! scheduler while it runs. It is shared as `SharedWorkflow`; every holder
//! keeps the lock for short, non-async critical sections only.

use crate::dispatch::DispatchSummary;
use crate::parser::ParsedResponse;
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Reserved context key holding the session descriptor. Never overwritten by a merge.
pub const SESSION_KEY: &str = "session";
/// Context key set while a dispatch runs inside a workflow.
pub const WORKFLOW_ID_KEY: &str = "workflowId";

pub type SharedWorkflow = Arc<Mutex<Workflow>>;

/// Lock a shared workflow, recovering the data if a previous holder panicked.
pub fn lock_workflow(workflow: &SharedWorkflow) -> MutexGuard<'_, Workflow> {
    workflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Defined for completeness; workflows are always created as `Running`.
    Pending,
    Running,
    Completed,
    Failed,
    /// Externally stopped; observed between iterations.
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Paused)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Status of a single todo.
///
/// Transitions: `Pending -> InProgress -> {Completed | Failed | Pending}`.
/// Falling back to `Pending` is the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TodoStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A persisted fact or error summary attached to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub content: String,
    pub source: String,
    pub time: DateTime<Utc>,
}

impl Note {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            time: Utc::now(),
        }
    }
}

/// One planned step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    /// `todo_<index>`, never reused.
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
    /// Last dispatch outcome.
    #[serde(default)]
    pub result: Option<DispatchSummary>,
    #[serde(default)]
    pub error: Option<String>,
    /// Snapshot of the note log at the last refresh.
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Todo {
    pub fn new(index: usize, content: impl Into<String>) -> Self {
        Self {
            id: format!("todo_{}", index),
            content: content.into(),
            status: TodoStatus::Pending,
            result: None,
            error: None,
            notes: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = TodoStatus::InProgress;
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TodoStatus::Failed;
        self.error = Some(error.to_string());
    }
}

/// One entry of the append-only execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub todo_id: String,
    pub iteration: u32,
    pub raw_response: String,
    pub completion: f64,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Full record of one processed step, kept for multi-step workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugStep {
    pub todo_id: String,
    pub iteration: u32,
    pub prompt: String,
    pub raw_response: String,
    pub parsed: ParsedResponse,
    pub notes: Vec<Note>,
    pub dispatch: DispatchSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_excerpt: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One goal's execution instance.
pub struct Workflow {
    pub id: String,
    pub goal: String,
    pub user_key: String,
    pub todos: Vec<Todo>,
    /// In-memory mirror of the persisted note log for this process.
    pub notes: Vec<Note>,
    pub context: Map<String, Value>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub debug_steps: Vec<DebugStep>,
    pub session: Arc<dyn Session>,
}

impl Workflow {
    /// Build a workflow directly into `Running`.
    pub fn new(
        id: &str,
        goal: &str,
        user_key: &str,
        todos: Vec<String>,
        session: Arc<dyn Session>,
        max_iterations: u32,
    ) -> Self {
        let mut context = Map::new();
        context.insert(SESSION_KEY.to_string(), session.descriptor());
        context.insert(WORKFLOW_ID_KEY.to_string(), Value::String(id.to_string()));

        Self {
            id: id.to_string(),
            goal: goal.to_string(),
            user_key: user_key.to_string(),
            todos: todos
                .into_iter()
                .enumerate()
                .map(|(i, content)| Todo::new(i, content))
                .collect(),
            notes: Vec::new(),
            context,
            iteration: 0,
            max_iterations,
            status: WorkflowStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            history: Vec::new(),
            debug_steps: Vec::new(),
            session,
        }
    }

    /// Append a new pending todo and return its id.
    pub fn push_todo(&mut self, content: &str) -> String {
        let todo = Todo::new(self.todos.len(), content);
        let id = todo.id.clone();
        self.todos.push(todo);
        id
    }

    /// `(completed, total)` todo counts.
    pub fn progress(&self) -> (usize, usize) {
        let completed = self
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        (completed, self.todos.len())
    }

    pub fn all_todos_terminal(&self) -> bool {
        self.todos.iter().all(|t| t.status.is_terminal())
    }

    /// Index of the next todo to run: first pending, else first in-progress.
    pub fn next_todo_index(&self) -> Option<usize> {
        self.todos
            .iter()
            .position(|t| t.status == TodoStatus::Pending)
            .or_else(|| {
                self.todos
                    .iter()
                    .position(|t| t.status == TodoStatus::InProgress)
            })
    }

    pub fn is_multi_step(&self) -> bool {
        self.todos.len() > 1
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let (completed, total) = self.progress();
        WorkflowSnapshot {
            id: self.id.clone(),
            goal: self.goal.clone(),
            user_key: self.user_key.clone(),
            status: self.status,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            completed,
            total,
            todos: self.todos.iter().map(TodoSnapshot::from).collect(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Todo without its note snapshot and dispatch payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoSnapshot {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Command kinds that succeeded in the last dispatch.
    #[serde(default)]
    pub succeeded: Vec<String>,
}

impl From<&Todo> for TodoSnapshot {
    fn from(todo: &Todo) -> Self {
        Self {
            id: todo.id.clone(),
            content: todo.content.clone(),
            status: todo.status,
            error: todo.error.clone(),
            succeeded: todo
                .result
                .as_ref()
                .map(|r| r.succeeded.clone())
                .unwrap_or_default(),
        }
    }
}

/// Point-in-time copy of a workflow, safe to hand out of the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub goal: String,
    pub user_key: String,
    pub status: WorkflowStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub completed: usize,
    pub total: usize,
    pub todos: Vec<TodoSnapshot>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("goal", &self.goal)
            .field("user_key", &self.user_key)
            .field("status", &self.status)
            .field("iteration", &self.iteration)
            .field("todos", &self.todos)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullSession;

    fn make_workflow(todos: &[&str]) -> Workflow {
        Workflow::new(
            "wf_test",
            "goal",
            "default",
            todos.iter().map(|s| s.to_string()).collect(),
            Arc::new(NullSession),
            20,
        )
    }

    #[test]
    fn test_new_workflow_starts_running_with_reserved_keys() {
        let wf = make_workflow(&["a", "b"]);
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.todos[0].id, "todo_0");
        assert_eq!(wf.todos[1].id, "todo_1");
        assert!(wf.context.contains_key(SESSION_KEY));
        assert_eq!(wf.context[WORKFLOW_ID_KEY], "wf_test");
    }

    #[test]
    fn test_push_todo_assigns_next_index() {
        let mut wf = make_workflow(&["a"]);
        let id = wf.push_todo("follow-up");
        assert_eq!(id, "todo_1");
        assert_eq!(wf.todos.len(), 2);
        assert_eq!(wf.todos[1].status, TodoStatus::Pending);
    }

    #[test]
    fn test_next_todo_prefers_pending_over_in_progress() {
        let mut wf = make_workflow(&["a", "b", "c"]);
        wf.todos[0].status = TodoStatus::InProgress;
        wf.todos[1].status = TodoStatus::Completed;
        assert_eq!(wf.next_todo_index(), Some(2));

        wf.todos[2].status = TodoStatus::Failed;
        assert_eq!(wf.next_todo_index(), Some(0));

        wf.todos[0].status = TodoStatus::Completed;
        assert_eq!(wf.next_todo_index(), None);
        assert!(wf.all_todos_terminal());
    }

    #[test]
    fn test_progress_counts_only_completed() {
        let mut wf = make_workflow(&["a", "b", "c"]);
        wf.todos[0].status = TodoStatus::Completed;
        wf.todos[1].status = TodoStatus::Failed;
        assert_eq!(wf.progress(), (1, 3));
    }

    #[test]
    fn test_snapshot_strips_todo_notes() {
        let mut wf = make_workflow(&["a", "b"]);
        wf.todos[0].status = TodoStatus::Completed;
        wf.todos[0].notes.push(Note::new("fact", "reasoning"));
        wf.todos[0].result = Some(DispatchSummary {
            executed: true,
            succeeded: vec!["read_file".into()],
            success: true,
            ..DispatchSummary::default()
        });

        let snap = wf.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.total, 2);
        assert_eq!(snap.todos[0].succeeded, vec!["read_file"]);
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json["todos"][0].get("notes").is_none());
    }

    #[test]
    fn test_status_terminal_states() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Paused.is_terminal());
        assert!(TodoStatus::Failed.is_terminal());
        assert!(!TodoStatus::InProgress.is_terminal());
    }
}
