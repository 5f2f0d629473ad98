//! Step scheduler: drives one workflow from `Running` to a terminal status.
//!
//! Each pass picks the next todo (first pending, else first in-progress),
//! asks the reasoning service what to do, reports progress, dispatches the
//! action and folds the result back into the workflow. The loop stops when
//! every todo is terminal, the iteration budget runs out, or the workflow is
//! no longer `Running` (an external pause).
//!
//! The workflow lock is only ever held between awaits.

use crate::config::EngineSettings;
use crate::debug_log::DebugLogger;
use crate::dispatch::{DispatchSummary, Dispatcher, LAST_ERROR_KEY};
use crate::errors::WorkflowError;
use crate::notes::{NoteStore, command_excerpt, file_excerpt, merge_into_workflow, record_note};
use crate::parser::{ParsedResponse, ResponseParser};
use crate::prompt::StepPrompt;
use crate::reasoning::{CallConfig, ReasoningService, call_with_retry};
use crate::reporter::{self, COMPLETED_THRESHOLD, EventHeader, IN_PROGRESS_THRESHOLD, StatusEvent};
use crate::session::Session;
use crate::workflow::{
    DebugStep, HistoryEntry, SharedWorkflow, TodoStatus, Workflow, WorkflowStatus, lock_workflow,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Note source for reasoning-extracted notes.
pub const REASONING_SOURCE: &str = "reasoning";
/// Note source for dispatch error notes.
pub const ERROR_SOURCE: &str = "error";

/// What the loop does next, decided under the lock.
enum NextStep {
    Run(usize),
    Complete,
    Exhausted(u32),
    Stop(WorkflowStatus),
}

pub struct StepScheduler {
    reasoning: Arc<dyn ReasoningService>,
    dispatcher: Arc<Dispatcher>,
    notes: Arc<dyn NoteStore>,
    debug_logger: Option<Arc<DebugLogger>>,
    settings: EngineSettings,
    call_config: CallConfig,
    parser: ResponseParser,
}

impl StepScheduler {
    pub fn new(
        reasoning: Arc<dyn ReasoningService>,
        dispatcher: Arc<Dispatcher>,
        notes: Arc<dyn NoteStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            reasoning,
            dispatcher,
            notes,
            debug_logger: None,
            settings,
            call_config: CallConfig::default(),
            parser: ResponseParser::new(false),
        }
    }

    pub fn with_debug_logger(mut self, logger: DebugLogger) -> Self {
        self.debug_logger = Some(Arc::new(logger));
        self
    }

    pub fn with_call_config(mut self, config: CallConfig) -> Self {
        self.call_config = config;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.parser = ResponseParser::new(verbose);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn notes(&self) -> &Arc<dyn NoteStore> {
        &self.notes
    }

    /// Run the workflow to a terminal status. Never returns an error: every
    /// failure ends as a `Failed` workflow plus an `error` event.
    pub async fn run(&self, workflow: SharedWorkflow) {
        let workflow_id = lock_workflow(&workflow).id.clone();
        info!(workflow_id = %workflow_id, "workflow loop started");

        if let Err(e) = self.run_loop(&workflow).await {
            warn!(workflow_id = %workflow_id, "workflow failed: {}", e);
            let (session, header) = {
                let mut wf = lock_workflow(&workflow);
                wf.status = WorkflowStatus::Failed;
                wf.error = Some(e.to_string());
                wf.completed_at = Some(Utc::now());
                (Arc::clone(&wf.session), EventHeader::from_workflow(&wf))
            };
            reporter::report(
                session.as_ref(),
                &header,
                &StatusEvent::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }

        self.persist_debug_log(&workflow);
        let status = lock_workflow(&workflow).status;
        info!(workflow_id = %workflow_id, %status, "workflow loop finished");
    }

    async fn run_loop(&self, workflow: &SharedWorkflow) -> Result<(), WorkflowError> {
        loop {
            match self.next_step(workflow) {
                NextStep::Stop(status) => {
                    debug!(%status, "workflow no longer running, stopping");
                    return Ok(());
                }
                NextStep::Exhausted(iterations) => {
                    return Err(WorkflowError::PlanExhausted { iterations });
                }
                NextStep::Complete => {
                    let (session, header) = self.session_and_header(workflow);
                    reporter::report(session.as_ref(), &header, &StatusEvent::Complete).await;
                    return Ok(());
                }
                NextStep::Run(index) => {
                    match self.process_todo(workflow, index).await {
                        Ok(()) => {}
                        Err(e @ WorkflowError::ReasoningUnavailable { .. }) => {
                            self.fail_todo(workflow, index, &e.to_string()).await;
                        }
                        Err(e) => return Err(e),
                    }
                    if !self.settings.step_delay.is_zero() {
                        tokio::time::sleep(self.settings.step_delay).await;
                    }
                }
            }
        }
    }

    fn next_step(&self, workflow: &SharedWorkflow) -> NextStep {
        let mut wf = lock_workflow(workflow);
        if wf.status != WorkflowStatus::Running {
            return NextStep::Stop(wf.status);
        }
        if wf.all_todos_terminal() {
            wf.status = WorkflowStatus::Completed;
            wf.completed_at = Some(Utc::now());
            return NextStep::Complete;
        }
        if wf.iteration >= wf.max_iterations {
            return NextStep::Exhausted(wf.iteration);
        }
        match wf.next_todo_index() {
            Some(index) => {
                wf.iteration += 1;
                NextStep::Run(index)
            }
            None => {
                wf.status = WorkflowStatus::Completed;
                wf.completed_at = Some(Utc::now());
                NextStep::Complete
            }
        }
    }

    /// Run one todo through prompt, reasoning, dispatch and status update.
    pub async fn process_todo(
        &self,
        workflow: &SharedWorkflow,
        index: usize,
    ) -> Result<(), WorkflowError> {
        let (workflow_id, todo_id, todo_content, mirror) = {
            let mut wf = lock_workflow(workflow);
            let mirror = wf.notes.clone();
            let todo = wf
                .todos
                .get_mut(index)
                .ok_or_else(|| anyhow::anyhow!("todo index {} out of range", index))?;
            todo.start();
            let (todo_id, content) = (todo.id.clone(), todo.content.clone());
            (wf.id.clone(), todo_id, content, mirror)
        };

        let notes = match self.notes.get_notes(&workflow_id).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(workflow_id = %workflow_id, "note store unavailable, using in-memory notes: {:#}", e);
                mirror
            }
        };

        let fragments = self.dispatcher.registry().prompt_fragments(true);
        let (messages, prompt_text) = {
            let mut wf = lock_workflow(workflow);
            if let Some(todo) = wf.todos.get_mut(index) {
                todo.notes = notes.clone();
            }
            let prompt =
                StepPrompt::from_workflow(&wf, index, &notes, &fragments, &self.settings.prompt);
            (prompt.messages(), prompt.render())
        };

        let reply = call_with_retry(
            self.reasoning.as_ref(),
            &messages,
            &self.call_config,
            self.settings.reasoning_attempts,
            self.settings.retry_delay,
        )
        .await?;
        let parsed = self.parser.parse(&reply);
        debug!(
            workflow_id = %workflow_id,
            todo_id = %todo_id,
            completion = parsed.completion,
            "step reply parsed"
        );

        let (session, header) = self.session_and_header(workflow);
        reporter::report(
            session.as_ref(),
            &header,
            &StatusEvent::Step {
                todo_id: todo_id.clone(),
                todo: todo_content.clone(),
                completion: parsed.completion,
                action: parsed.action.clone(),
                preamble: parsed.preamble.clone(),
            },
        )
        .await;

        if let Some(ref note) = parsed.note
            && let Err(e) = record_note(self.notes.as_ref(), workflow, note, REASONING_SOURCE).await
        {
            warn!(workflow_id = %workflow_id, "failed to store note: {:#}", e);
        }

        let context = lock_workflow(workflow).context.clone();
        let outcome = self.dispatcher.dispatch(&parsed.action, context).await;
        let summary = outcome.summary;
        let execution_error = execution_error(&summary);

        if let Some(ref error) = execution_error {
            let note = format!("步骤 \"{}\" 执行出错: {}", todo_content, error);
            if let Err(e) = record_note(self.notes.as_ref(), workflow, &note, ERROR_SOURCE).await {
                warn!(workflow_id = %workflow_id, "failed to store error note: {:#}", e);
            }
        }

        {
            let mut wf = lock_workflow(workflow);
            merge_into_workflow(&mut wf, &outcome.context);
            if summary.executed && summary.success {
                wf.context.remove(LAST_ERROR_KEY);
            }

            if let Some(todo) = wf.todos.get_mut(index) {
                todo.result = Some(summary.clone());
                match execution_error {
                    Some(ref error) => {
                        todo.status = TodoStatus::Pending;
                        todo.error = Some(error.to_string());
                    }
                    None => {
                        todo.status = status_for(parsed.completion);
                        if todo.status == TodoStatus::Completed {
                            todo.error = None;
                        }
                    }
                }
            }

            if parsed.completion < COMPLETED_THRESHOLD
                && let Some(ref next) = parsed.next_step
            {
                let id = wf.push_todo(next);
                info!(workflow_id = %workflow_id, todo_id = %id, "appended follow-up step");
            }

            self.record_step(&mut wf, &todo_id, prompt_text, reply, parsed, summary);
        }

        if let Some(error) = execution_error {
            let (session, header) = self.session_and_header(workflow);
            reporter::report(
                session.as_ref(),
                &header,
                &StatusEvent::Retry {
                    todo_id,
                    todo: todo_content,
                    message: error.to_string(),
                },
            )
            .await;
        }

        Ok(())
    }

    fn record_step(
        &self,
        wf: &mut Workflow,
        todo_id: &str,
        prompt: String,
        reply: String,
        parsed: ParsedResponse,
        summary: DispatchSummary,
    ) {
        let now = Utc::now();
        wf.history.push(HistoryEntry {
            todo_id: todo_id.to_string(),
            iteration: wf.iteration,
            raw_response: reply.clone(),
            completion: parsed.completion,
            note: parsed.note.clone(),
            timestamp: now,
        });

        if wf.is_multi_step() {
            let limits = &self.settings.prompt;
            let step = DebugStep {
                todo_id: todo_id.to_string(),
                iteration: wf.iteration,
                prompt,
                raw_response: reply,
                parsed,
                notes: wf.notes.clone(),
                dispatch: summary,
                file_excerpt: file_excerpt(&wf.context, limits.debug_file_excerpt_chars),
                command_excerpt: command_excerpt(&wf.context, limits.debug_command_excerpt_chars),
                timestamp: now,
            };
            wf.debug_steps.push(step);
        }
    }

    async fn fail_todo(&self, workflow: &SharedWorkflow, index: usize, message: &str) {
        let (session, header, todo_id, todo) = {
            let mut wf = lock_workflow(workflow);
            let (todo_id, todo) = match wf.todos.get_mut(index) {
                Some(todo) => {
                    todo.fail(message);
                    (todo.id.clone(), todo.content.clone())
                }
                None => return,
            };
            warn!(workflow_id = %wf.id, todo_id = %todo_id, "todo failed: {}", message);
            (
                Arc::clone(&wf.session),
                EventHeader::from_workflow(&wf),
                todo_id,
                todo,
            )
        };
        reporter::report(
            session.as_ref(),
            &header,
            &StatusEvent::Update {
                todo_id,
                todo,
                message: message.to_string(),
            },
        )
        .await;
    }

    fn session_and_header(&self, workflow: &SharedWorkflow) -> (Arc<dyn Session>, EventHeader) {
        let wf = lock_workflow(workflow);
        (Arc::clone(&wf.session), EventHeader::from_workflow(&wf))
    }

    /// Best-effort; a failed write is logged and never changes the outcome.
    fn persist_debug_log(&self, workflow: &SharedWorkflow) {
        let Some(ref logger) = self.debug_logger else {
            return;
        };
        let wf = lock_workflow(workflow);
        if !matches!(wf.status, WorkflowStatus::Completed | WorkflowStatus::Failed) {
            return;
        }
        match logger.persist(&wf) {
            Ok(Some(path)) => debug!(path = %path.display(), "debug log written"),
            Ok(None) => {}
            Err(e) => warn!(workflow_id = %wf.id, "failed to write debug log: {:#}", e),
        }
    }
}

/// Todo status implied by a completion score.
pub fn status_for(completion: f64) -> TodoStatus {
    if completion >= COMPLETED_THRESHOLD {
        TodoStatus::Completed
    } else if completion >= IN_PROGRESS_THRESHOLD {
        TodoStatus::InProgress
    } else {
        TodoStatus::Pending
    }
}

/// First failed command of a dispatch, as an execution error.
fn execution_error(summary: &DispatchSummary) -> Option<WorkflowError> {
    if summary.success {
        return None;
    }
    let failed = summary.commands.iter().find(|c| !c.success);
    Some(match failed {
        Some(record) => WorkflowError::Execution {
            command: record.kind.clone(),
            message: record.error.clone().unwrap_or_default(),
        },
        None => WorkflowError::Execution {
            command: "dispatch".to_string(),
            message: summary.error.clone().unwrap_or_default(),
        },
    })
}
