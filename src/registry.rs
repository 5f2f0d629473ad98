//! Workflow registry and the one-active-workflow-per-user gate.
//!
//! The registry owns every live workflow. Creation is deduplicated by a
//! short-lived `(user_key, goal)` creation lock and gated so a user never has
//! two `Running` workflows at once. Execution is launched as a detached task;
//! callers only get the workflow id back and observe progress through status
//! events or the stored status.
//!
//! Lock order is always registry maps first, then an individual workflow.

use crate::config::EngineSettings;
use crate::reporter::{self, EventHeader, StatusEvent};
use crate::scheduler::StepScheduler;
use crate::session::{Session, user_key_for};
use crate::workflow::{
    SharedWorkflow, Workflow, WorkflowSnapshot, WorkflowStatus, lock_workflow,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

type CreationKey = (String, String);

/// Result of a creation request. Every variant carries a workflow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new workflow was registered and launched.
    Created(String),
    /// A racing request for the same user and goal already claimed this id.
    Deduplicated(String),
    /// The user already has a running workflow; nothing was created.
    UserBusy(String),
}

impl CreateOutcome {
    pub fn id(&self) -> &str {
        match self {
            CreateOutcome::Created(id)
            | CreateOutcome::Deduplicated(id)
            | CreateOutcome::UserBusy(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkflowRegistry {
    workflows: Mutex<HashMap<String, SharedWorkflow>>,
    creation_locks: Arc<Mutex<HashMap<CreationKey, String>>>,
    scheduler: Arc<StepScheduler>,
    settings: EngineSettings,
}

impl WorkflowRegistry {
    pub fn new(scheduler: Arc<StepScheduler>) -> Self {
        let settings = scheduler.settings().clone();
        Self {
            workflows: Mutex::new(HashMap::new()),
            creation_locks: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register a workflow for `goal` and launch its execution loop.
    ///
    /// The workflow is registered and the creation lock taken before the
    /// first await, so a racing request for the same user observes one or
    /// the other.
    pub async fn create_workflow(
        &self,
        session: Arc<dyn Session>,
        goal: &str,
        todos: Vec<String>,
    ) -> CreateOutcome {
        self.collect_garbage();
        let user_key = user_key_for(session.as_ref());
        let key: CreationKey = (user_key.clone(), goal.to_string());

        let workflow = {
            let mut workflows = lock(&self.workflows);
            let mut locks = lock(&self.creation_locks);

            if let Some(id) = locks.get(&key) {
                debug!(user_key = %user_key, workflow_id = %id, "creation lock hit");
                return CreateOutcome::Deduplicated(id.clone());
            }

            if let Some(id) = running_for_user(&workflows, &user_key) {
                info!(user_key = %user_key, workflow_id = %id, "user already has a running workflow");
                return CreateOutcome::UserBusy(id);
            }

            let id = Uuid::new_v4().to_string();
            let workflow = Workflow::new(
                &id,
                goal,
                &user_key,
                todos,
                Arc::clone(&session),
                self.settings.max_iterations,
            );
            let shared: SharedWorkflow = Arc::new(Mutex::new(workflow));
            workflows.insert(id.clone(), Arc::clone(&shared));
            locks.insert(key.clone(), id);
            shared
        };

        let (id, meta, header) = {
            let wf = lock_workflow(&workflow);
            let meta = json!({
                "goal": wf.goal,
                "userKey": wf.user_key,
                "todos": wf.todos.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(),
                "status": wf.status,
                "createdAt": wf.created_at.to_rfc3339(),
            });
            (wf.id.clone(), meta, EventHeader::from_workflow(&wf))
        };

        if let Err(e) = self
            .scheduler
            .notes()
            .store_workflow_memory(&id, &meta)
            .await
        {
            warn!(workflow_id = %id, "failed to persist workflow metadata: {:#}", e);
        }

        reporter::report(session.as_ref(), &header, &StatusEvent::Start).await;

        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            scheduler.run(workflow).await;
        });
        info!(workflow_id = %id, user_key = %user_key, goal, "workflow launched");

        self.release_lock_later(key, id.clone());
        CreateOutcome::Created(id)
    }

    /// Drop the creation lock after the configured TTL, unless it was
    /// replaced by a newer id in the meantime.
    fn release_lock_later(&self, key: CreationKey, id: String) {
        let locks = Arc::clone(&self.creation_locks);
        let ttl = self.settings.creation_lock_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut locks = lock(&locks);
            if locks.get(&key) == Some(&id) {
                locks.remove(&key);
            }
        });
    }

    pub fn is_creation_locked(&self, user_key: &str, goal: &str) -> bool {
        lock(&self.creation_locks).contains_key(&(user_key.to_string(), goal.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<SharedWorkflow> {
        lock(&self.workflows).get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<WorkflowSnapshot> {
        self.get(id).map(|wf| lock_workflow(&wf).snapshot())
    }

    pub fn status(&self, id: &str) -> Option<WorkflowStatus> {
        self.get(id).map(|wf| lock_workflow(&wf).status)
    }

    /// Snapshots of every registered workflow, oldest first.
    pub fn list(&self) -> Vec<WorkflowSnapshot> {
        let mut all: Vec<WorkflowSnapshot> = lock(&self.workflows)
            .values()
            .map(|wf| lock_workflow(wf).snapshot())
            .collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Id of a running workflow with exactly this goal.
    pub fn find_running_goal(&self, goal: &str) -> Option<String> {
        lock(&self.workflows).values().find_map(|wf| {
            let wf = lock_workflow(wf);
            (wf.status == WorkflowStatus::Running && wf.goal == goal).then(|| wf.id.clone())
        })
    }

    /// Mark a running workflow paused. Its loop stops before the next
    /// iteration; an in-flight step is not interrupted.
    pub fn pause(&self, id: &str) -> bool {
        let Some(workflow) = self.get(id) else {
            return false;
        };
        let mut wf = lock_workflow(&workflow);
        if wf.status != WorkflowStatus::Running {
            return false;
        }
        wf.status = WorkflowStatus::Paused;
        wf.completed_at = Some(Utc::now());
        info!(workflow_id = %id, "workflow paused");
        true
    }

    /// Remove terminal workflows finished longer ago than the GC age.
    /// Returns how many were removed.
    pub fn collect_garbage(&self) -> usize {
        let max_age = chrono::Duration::from_std(self.settings.gc_after)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut workflows = lock(&self.workflows);
        let before = workflows.len();
        workflows.retain(|_, wf| {
            let wf = lock_workflow(wf);
            if !wf.status.is_terminal() {
                return true;
            }
            let finished = wf.completed_at.unwrap_or(wf.created_at);
            now - finished < max_age
        });
        let removed = before - workflows.len();
        if removed > 0 {
            debug!(removed, "collected finished workflows");
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.workflows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn running_for_user(workflows: &HashMap<String, SharedWorkflow>, user_key: &str) -> Option<String> {
    workflows.values().find_map(|wf| {
        let wf = lock_workflow(wf);
        (wf.status == WorkflowStatus::Running && wf.user_key == user_key).then(|| wf.id.clone())
    })
}
