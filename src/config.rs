//! Layered configuration for todoflow.
//!
//! Settings are read from `.todoflow/todoflow.toml` and may be overridden by
//! environment variables and then CLI arguments.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_iterations = 20
//! step_delay_ms = 1000
//! reasoning_attempts = 3
//! retry_delay_ms = 2000
//! gc_after_secs = 30
//! creation_lock_secs = 5
//!
//! [prompt]
//! file_excerpt_chars = 5000
//! command_excerpt_chars = 1000
//!
//! [reasoning]
//! api_base = "http://127.0.0.1:8080/api/v1"
//! model = "default"
//!
//! [providers]
//! file_root = "."
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Execution loop and registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Iteration budget per workflow
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Pacing delay between iterations
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// Attempts at the reasoning service before a todo fails
    #[serde(default = "default_reasoning_attempts")]
    pub reasoning_attempts: u32,
    /// Spacing between reasoning attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Age after which finished workflows are collected
    #[serde(default = "default_gc_after_secs")]
    pub gc_after_secs: u64,
    /// Lifetime of a creation lock after the workflow is launched
    #[serde(default = "default_creation_lock_secs")]
    pub creation_lock_secs: u64,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_step_delay_ms() -> u64 {
    1000
}

fn default_reasoning_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_gc_after_secs() -> u64 {
    30
}

fn default_creation_lock_secs() -> u64 {
    5
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            step_delay_ms: default_step_delay_ms(),
            reasoning_attempts: default_reasoning_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            gc_after_secs: default_gc_after_secs(),
            creation_lock_secs: default_creation_lock_secs(),
        }
    }
}

/// Budgets applied when building step prompts and debug records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSection {
    #[serde(default = "default_file_excerpt_chars")]
    pub file_excerpt_chars: usize,
    #[serde(default = "default_command_excerpt_chars")]
    pub command_excerpt_chars: usize,
    #[serde(default = "default_debug_file_excerpt_chars")]
    pub debug_file_excerpt_chars: usize,
    #[serde(default = "default_debug_command_excerpt_chars")]
    pub debug_command_excerpt_chars: usize,
    /// Completed steps quoted in each prompt
    #[serde(default = "default_recent_completed")]
    pub recent_completed: usize,
    /// Error notes quoted in each prompt
    #[serde(default = "default_max_error_notes")]
    pub max_error_notes: usize,
    /// Other recent notes quoted in each prompt
    #[serde(default = "default_max_recent_notes")]
    pub max_recent_notes: usize,
}

fn default_file_excerpt_chars() -> usize {
    5000
}

fn default_command_excerpt_chars() -> usize {
    1000
}

fn default_debug_file_excerpt_chars() -> usize {
    10000
}

fn default_debug_command_excerpt_chars() -> usize {
    5000
}

fn default_recent_completed() -> usize {
    3
}

fn default_max_error_notes() -> usize {
    3
}

fn default_max_recent_notes() -> usize {
    5
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            file_excerpt_chars: default_file_excerpt_chars(),
            command_excerpt_chars: default_command_excerpt_chars(),
            debug_file_excerpt_chars: default_debug_file_excerpt_chars(),
            debug_command_excerpt_chars: default_debug_command_excerpt_chars(),
            recent_completed: default_recent_completed(),
            max_error_notes: default_max_error_notes(),
            max_recent_notes: default_max_recent_notes(),
        }
    }
}

/// OpenAI-compatible reasoning endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "http://127.0.0.1:8080/api/v1".to_string()
}

fn default_model() -> String {
    "default".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Built-in command provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersSection {
    /// Root directory the file provider is confined to
    #[serde(default = "default_file_root")]
    pub file_root: PathBuf,
}

fn default_file_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            file_root: default_file_root(),
        }
    }
}

/// The complete todoflow.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TodoflowToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub prompt: PromptSection,
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub providers: ProvidersSection,
}

impl TodoflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse todoflow.toml")
    }

    /// Load from `<data_dir>/todoflow.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("todoflow.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize todoflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup("TODOFLOW_API_BASE") {
            self.reasoning.api_base = base;
        }
        if let Some(model) = lookup("TODOFLOW_MODEL") {
            self.reasoning.model = model;
        }
        if let Some(key) = lookup("TODOFLOW_API_KEY") {
            self.reasoning.api_key = Some(key);
        }
        if let Some(max) = lookup("TODOFLOW_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.engine.max_iterations = max;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_iterations == 0 {
            warnings.push("engine.max_iterations is 0: every workflow fails immediately".into());
        }
        if self.engine.reasoning_attempts == 0 {
            warnings.push("engine.reasoning_attempts is 0: the reasoning service is never called".into());
        }
        if self.prompt.file_excerpt_chars == 0 || self.prompt.command_excerpt_chars == 0 {
            warnings.push("prompt excerpt budgets of 0 hide step results from later steps".into());
        }
        if !(0.0..=2.0).contains(&self.reasoning.temperature) {
            warnings.push(format!(
                "reasoning.temperature {} is outside 0.0..=2.0",
                self.reasoning.temperature
            ));
        }
        if !self.reasoning.api_base.starts_with("http://")
            && !self.reasoning.api_base.starts_with("https://")
        {
            warnings.push(format!(
                "reasoning.api_base '{}' is not an http(s) URL",
                self.reasoning.api_base
            ));
        }

        warnings
    }

    /// Resolved engine settings.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_iterations: self.engine.max_iterations,
            step_delay: Duration::from_millis(self.engine.step_delay_ms),
            reasoning_attempts: self.engine.reasoning_attempts,
            retry_delay: Duration::from_millis(self.engine.retry_delay_ms),
            gc_after: Duration::from_secs(self.engine.gc_after_secs),
            creation_lock_ttl: Duration::from_secs(self.engine.creation_lock_secs),
            prompt: self.prompt.clone(),
        }
    }
}

/// Settings consumed by the scheduler and registry.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: u32,
    pub step_delay: Duration,
    pub reasoning_attempts: u32,
    pub retry_delay: Duration,
    pub gc_after: Duration,
    pub creation_lock_ttl: Duration,
    pub prompt: PromptSection,
}

impl Default for EngineSettings {
    fn default() -> Self {
        TodoflowToml::default().engine_settings()
    }
}

impl EngineSettings {
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_gc_after(mut self, age: Duration) -> Self {
        self.gc_after = age;
        self
    }

    pub fn with_creation_lock_ttl(mut self, ttl: Duration) -> Self {
        self.creation_lock_ttl = ttl;
        self
    }
}

/// Runtime configuration: project paths plus the merged TOML/env settings.
#[derive(Debug, Clone)]
pub struct TodoflowConfig {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub toml: TodoflowToml,
}

impl TodoflowConfig {
    /// Load configuration for a project directory (file, then environment).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let data_dir = project_dir.join(".todoflow");
        let mut toml = TodoflowToml::load_or_default(&data_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            data_dir,
            toml,
        })
    }

    /// Apply CLI overrides on top of file and environment settings.
    pub fn with_cli_args(mut self, max_iterations: Option<u32>, model: Option<String>) -> Self {
        if let Some(max) = max_iterations {
            self.toml.engine.max_iterations = max;
        }
        if let Some(model) = model {
            self.toml.reasoning.model = model;
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("todoflow.toml")
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.data_dir.join("notes")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn debug_log_dir(&self) -> PathBuf {
        self.data_dir.join("debug")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// File provider root, resolved against the project directory.
    pub fn file_root(&self) -> PathBuf {
        let root = &self.toml.providers.file_root;
        if root.is_absolute() {
            root.clone()
        } else {
            self.project_dir.join(root)
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.notes_dir(),
            self.memory_dir(),
            self.debug_log_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
