//! Debug log listing and inspection: `todoflow logs`.

use anyhow::{Result, bail};
use std::path::Path;
use todoflow::config::TodoflowConfig;
use todoflow::debug_log::DebugLogger;

pub fn cmd_logs(config: &TodoflowConfig, show: Option<&Path>) -> Result<()> {
    let logger = DebugLogger::new(&config.debug_log_dir());

    let Some(name) = show else {
        let logs = logger.list_logs()?;
        if logs.is_empty() {
            println!("No debug logs found in {}", logger.log_dir().display());
            return Ok(());
        }
        println!();
        println!("Debug logs (newest first):");
        for path in logs {
            if let Some(file) = path.file_name() {
                println!("  {}", file.to_string_lossy());
            }
        }
        println!();
        return Ok(());
    };

    let path = if name.is_absolute() || name.exists() {
        name.to_path_buf()
    } else {
        logger.log_dir().join(name)
    };
    if !path.exists() {
        bail!("Debug log not found: {}", path.display());
    }

    let log = logger.load(&path)?;
    println!();
    println!("Workflow {}", log.workflow_id);
    println!("{}", "=".repeat("Workflow ".len() + log.workflow_id.len()));
    println!("Goal:       {}", log.goal);
    println!("Status:     {}", log.status);
    println!("Iterations: {}/{}", log.iteration, log.max_iterations);
    println!("Created:    {}", log.created_at.to_rfc3339());
    if let Some(done) = log.completed_at {
        println!("Finished:   {}", done.to_rfc3339());
    }
    if let Some(error) = &log.error {
        println!("Error:      {}", error);
    }

    println!();
    println!("Todos:");
    for (i, todo) in log.todos.iter().enumerate() {
        println!("  {}. [{:?}] {}", i + 1, todo.status, todo.content);
        if let Some(error) = &todo.error {
            println!("       error: {}", error);
        }
    }

    if !log.steps.is_empty() {
        println!();
        println!("Steps:");
        for step in &log.steps {
            println!(
                "  #{} {} completion={:.2} commands={}",
                step.iteration,
                step.todo_id,
                step.parsed.completion,
                step.dispatch.commands.len()
            );
            if let Some(error) = &step.dispatch.error {
                println!("      error: {}", error);
            }
        }
    }

    if !log.notes.is_empty() {
        println!();
        println!("Notes:");
        for note in &log.notes {
            println!("  [{}] {}", note.source, note.content);
        }
    }
    println!();

    Ok(())
}
