//! Workflow commands: `todoflow run` and `todoflow exec`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use todoflow::config::TodoflowConfig;
use todoflow::debug_log::DebugLogger;
use todoflow::dispatch::{DispatchSummary, Dispatcher};
use todoflow::notes::{JsonlNoteStore, NoteStore};
use todoflow::planner::{GoalPlanner, StartOutcome};
use todoflow::providers::{WorkflowRequest, builtin_registry};
use todoflow::reasoning::{CallConfig, HttpReasoningClient, ReasoningService};
use todoflow::registry::{CreateOutcome, WorkflowRegistry};
use todoflow::reporter::{CHECK, CROSS, PARTY, WARN};
use todoflow::scheduler::StepScheduler;
use todoflow::session::Session;
use todoflow::workflow::{SESSION_KEY, TodoStatus, WorkflowStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Replies go to stdout. Only the human-readable half is printed unless
/// `verbose` is set.
pub struct ConsoleSession {
    user: Option<String>,
    verbose: bool,
}

impl ConsoleSession {
    pub fn new(user: Option<&str>, verbose: bool) -> Self {
        Self {
            user: user.map(str::to_string),
            verbose,
        }
    }
}

#[async_trait]
impl Session for ConsoleSession {
    fn user_key(&self) -> Option<String> {
        self.user.clone()
    }

    fn descriptor(&self) -> Value {
        json!({ "kind": "console", "user": self.user })
    }

    async fn reply(&self, text: &str) -> Result<()> {
        let shown = if self.verbose {
            text
        } else {
            text.split_once("\n\n").map_or(text, |(_, human)| human)
        };
        println!("{}", shown);
        Ok(())
    }
}

struct Engine {
    planner: GoalPlanner,
    registry: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    requests: mpsc::Receiver<WorkflowRequest>,
}

fn build_engine(config: &TodoflowConfig, verbose: bool) -> Result<Engine> {
    let reasoning: Arc<dyn ReasoningService> =
        Arc::new(HttpReasoningClient::new(&config.toml.reasoning)?);
    let call_config = CallConfig {
        temperature: config.toml.reasoning.temperature,
        max_tokens: config.toml.reasoning.max_tokens,
    };
    let notes: Arc<dyn NoteStore> =
        Arc::new(JsonlNoteStore::new(&config.notes_dir(), &config.memory_dir())?);

    let (tx, requests) = mpsc::channel(16);
    let dispatcher = Arc::new(Dispatcher::new(builtin_registry(
        config.file_root(),
        Some(tx),
    )));

    let scheduler = StepScheduler::new(
        Arc::clone(&reasoning),
        Arc::clone(&dispatcher),
        notes,
        config.toml.engine_settings(),
    )
    .with_debug_logger(DebugLogger::new(&config.debug_log_dir()))
    .with_call_config(call_config.clone())
    .with_verbose(verbose);

    let registry = Arc::new(WorkflowRegistry::new(Arc::new(scheduler)));
    let planner = GoalPlanner::new(reasoning, Arc::clone(&registry)).with_call_config(call_config);

    Ok(Engine {
        planner,
        registry,
        dispatcher,
        requests,
    })
}

/// `todoflow run <goal>`: plan, start, and wait for the workflow to finish.
pub async fn cmd_run(
    config: &TodoflowConfig,
    goal: &str,
    user: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let engine = build_engine(config, verbose)?;
    let session: Arc<dyn Session> = Arc::new(ConsoleSession::new(user, verbose));

    let id = start_goal(&engine, session, goal).await;
    let status = wait_for(&engine.registry, &id).await;
    print_summary(&engine.registry, &id);

    if status == Some(WorkflowStatus::Failed) {
        anyhow::bail!("workflow {} failed", id);
    }
    Ok(())
}

/// `todoflow exec <text>`: dispatch action text outside any workflow.
///
/// Workflows requested by the text are planned and waited on in order.
pub async fn cmd_exec(
    config: &TodoflowConfig,
    text: &str,
    user: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let mut engine = build_engine(config, verbose)?;
    let session: Arc<dyn Session> = Arc::new(ConsoleSession::new(user, verbose));

    let mut context = Map::new();
    context.insert(SESSION_KEY.to_string(), session.descriptor());
    let outcome = engine.dispatcher.dispatch(text, context).await;
    print_dispatch(&outcome.summary, verbose);

    let mut started = Vec::new();
    while let Ok(request) = engine.requests.try_recv() {
        started.push(start_goal(&engine, Arc::clone(&session), &request.goal).await);
    }
    for id in &started {
        wait_for(&engine.registry, id).await;
        print_summary(&engine.registry, id);
    }

    if let Some(error) = outcome.summary.error {
        anyhow::bail!("dispatch failed: {}", error);
    }
    Ok(())
}

async fn start_goal(engine: &Engine, session: Arc<dyn Session>, goal: &str) -> String {
    let outcome = engine.planner.start(session, goal).await;
    match &outcome {
        StartOutcome::AlreadyRunning(id) => {
            println!("{}Goal is already running as workflow {}", WARN, id);
        }
        StartOutcome::Started(CreateOutcome::Created(id)) => {
            tracing::info!(workflow_id = %id, goal = %goal, "workflow started");
        }
        StartOutcome::Started(CreateOutcome::Deduplicated(id)) => {
            println!("{}Same goal was just started as workflow {}", WARN, id);
        }
        StartOutcome::Started(CreateOutcome::UserBusy(id)) => {
            println!("{}A workflow is already running for this user: {}", WARN, id);
        }
    }
    outcome.id().to_string()
}

/// Poll until the workflow reaches a terminal status. Ctrl-C pauses it.
async fn wait_for(registry: &WorkflowRegistry, id: &str) -> Option<WorkflowStatus> {
    let mut pause_requested = false;
    loop {
        match registry.status(id) {
            Some(status) if status.is_terminal() => return Some(status),
            None => return None,
            Some(_) => {}
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !pause_requested => {
                pause_requested = true;
                if registry.pause(id) {
                    println!("\n{}Pausing workflow {}...", WARN, id);
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn print_summary(registry: &WorkflowRegistry, id: &str) {
    let Some(snapshot) = registry.snapshot(id) else {
        return;
    };

    println!();
    let icon = match snapshot.status {
        WorkflowStatus::Completed => PARTY,
        WorkflowStatus::Failed => CROSS,
        _ => WARN,
    };
    println!(
        "{}{} {} ({}/{} steps, {} iterations)",
        icon,
        console::style(&snapshot.goal).bold(),
        snapshot.status,
        snapshot.completed,
        snapshot.total,
        snapshot.iteration
    );
    for todo in &snapshot.todos {
        let marker = match todo.status {
            TodoStatus::Completed => console::style("✓").green(),
            TodoStatus::Failed => console::style("✗").red(),
            TodoStatus::InProgress => console::style("…").yellow(),
            TodoStatus::Pending => console::style("·").dim(),
        };
        println!("  {} {}", marker, todo.content);
        if let Some(error) = &todo.error {
            println!("      {}", console::style(error).red());
        }
    }
    if let Some(error) = &snapshot.error {
        println!("  {} {}", console::style("Error:").red().bold(), error);
    }
}

fn print_dispatch(summary: &DispatchSummary, verbose: bool) {
    if !summary.executed {
        println!("No commands recognized.");
        return;
    }
    for record in &summary.commands {
        if record.success {
            println!("{}{}", CHECK, record.kind);
            if verbose && let Some(result) = &record.result {
                println!("    {}", result);
            }
        } else {
            println!(
                "{}{}: {}",
                CROSS,
                record.kind,
                record.error.as_deref().unwrap_or("failed")
            );
        }
    }
}
