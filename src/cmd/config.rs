//! Configuration view and validation commands: `todoflow config`.

use anyhow::Result;
use todoflow::config::{TodoflowConfig, TodoflowToml};

use crate::ConfigCommands;

pub fn cmd_config(config: &TodoflowConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Todoflow Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No todoflow.toml found at {}", config_path.display());
                println!("Using defaults. Run 'todoflow config init' to create one.");
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();

            let toml = &config.toml;
            println!("[engine]");
            println!("  max_iterations = {}", toml.engine.max_iterations);
            println!("  step_delay_ms = {}", toml.engine.step_delay_ms);
            println!("  reasoning_attempts = {}", toml.engine.reasoning_attempts);
            println!("  retry_delay_ms = {}", toml.engine.retry_delay_ms);
            println!("  gc_after_secs = {}", toml.engine.gc_after_secs);
            println!("  creation_lock_secs = {}", toml.engine.creation_lock_secs);
            println!();

            println!("[prompt]");
            println!("  file_excerpt_chars = {}", toml.prompt.file_excerpt_chars);
            println!("  command_excerpt_chars = {}", toml.prompt.command_excerpt_chars);
            println!(
                "  debug_file_excerpt_chars = {}",
                toml.prompt.debug_file_excerpt_chars
            );
            println!(
                "  debug_command_excerpt_chars = {}",
                toml.prompt.debug_command_excerpt_chars
            );
            println!("  recent_completed = {}", toml.prompt.recent_completed);
            println!("  max_error_notes = {}", toml.prompt.max_error_notes);
            println!("  max_recent_notes = {}", toml.prompt.max_recent_notes);
            println!();

            println!("[reasoning]");
            println!("  api_base = \"{}\"", toml.reasoning.api_base);
            println!("  model = \"{}\"", toml.reasoning.model);
            if toml.reasoning.api_key.is_some() {
                println!("  api_key = \"****\"");
            }
            println!("  temperature = {}", toml.reasoning.temperature);
            println!("  max_tokens = {}", toml.reasoning.max_tokens);
            println!("  timeout_secs = {}", toml.reasoning.timeout_secs);
            println!();

            println!("[providers]");
            println!("  file_root = \"{}\"", config.file_root().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No todoflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = TodoflowToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("todoflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.data_dir)?;
            TodoflowToml::default().save(&config_path)?;

            println!("Created todoflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] max_iterations, step_delay_ms, reasoning_attempts");
            println!("  - [reasoning] api_base, model, temperature");
            println!("  - [providers] file_root");
            println!();
        }
    }

    Ok(())
}
