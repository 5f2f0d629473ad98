//! Command providers and the action dispatcher.
//!
//! The dispatcher walks an action text through every enabled provider's
//! `parse`, collecting commands and stripping matched text, then runs the
//! commands strictly in order through the owning provider's `handle`.
//!
//! Providers flagged `only_top_level` (the ones that start a new workflow)
//! are excluded whenever the dispatch already runs inside a workflow: their
//! markers are stripped from the text before parsing and any command they
//! would own is filtered out again before execution.

use crate::errors::ProviderError;
use crate::workflow::WORKFLOW_ID_KEY;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One executable command extracted from action text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command type, e.g. `read_file`.
    pub kind: String,
    pub params: Value,
    /// Explicit ordering; commands without one run after ordered ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl Command {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
            order: None,
        }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }
}

/// Result of a provider's `parse`.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub commands: Vec<Command>,
    /// Input text with the matched commands removed.
    pub remaining_text: String,
}

impl ParseOutcome {
    /// No commands; the text passes through untouched.
    pub fn unchanged(text: &str) -> Self {
        Self {
            commands: Vec::new(),
            remaining_text: text.to_string(),
        }
    }
}

/// A family of side-effecting actions the reasoning service can request.
#[async_trait]
pub trait CommandProvider: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Instruction text folded into each step prompt.
    fn prompt_fragment(&self) -> Option<&str> {
        None
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Only usable outside a running workflow.
    fn only_top_level(&self) -> bool {
        false
    }

    /// Literal markers that introduce this provider's commands in text.
    fn markers(&self) -> &[&str] {
        &[]
    }

    fn parse(&self, text: &str, context: &Map<String, Value>) -> ParseOutcome;

    /// Execute one command. A returned object with `"success": false` is
    /// treated the same as an error.
    async fn handle(
        &self,
        command: &Command,
        context: &mut Map<String, Value>,
    ) -> Result<Value, ProviderError>;
}

/// Ordered list of registered providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn CommandProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CommandProvider>) {
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<dyn CommandProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn providers(&self) -> &[Arc<dyn CommandProvider>] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Prompt fragments of the providers usable in the given scope.
    pub fn prompt_fragments(&self, in_workflow: bool) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.enabled() && !(in_workflow && p.only_top_level()))
            .filter_map(|p| p.prompt_fragment().map(str::to_string))
            .collect()
    }
}

/// Record of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub provider: String,
    pub kind: String,
    pub params: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serializable summary of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// Whether any command ran.
    pub executed: bool,
    /// Kinds of the commands that succeeded, in execution order.
    pub succeeded: Vec<String>,
    pub commands: Vec<CommandRecord>,
    pub success: bool,
    /// First error encountered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary plus the context as mutated by the handlers.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub summary: DispatchSummary,
    pub context: Map<String, Value>,
}

/// Context key holding the last dispatch error text.
pub const LAST_ERROR_KEY: &str = "lastError";

struct PendingCommand {
    provider: Arc<dyn CommandProvider>,
    command: Command,
}

pub struct Dispatcher {
    registry: ProviderRegistry,
}

impl Dispatcher {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Parse `text` into commands and run them against `context`.
    ///
    /// Never fails: handler errors are folded into the summary and the
    /// context's `lastError` key. A fully successful dispatch clears it.
    pub async fn dispatch(&self, text: &str, mut context: Map<String, Value>) -> DispatchOutcome {
        let in_workflow = is_in_workflow(&context);
        let pending = self.collect_commands(text, &context, in_workflow);

        let mut summary = DispatchSummary {
            success: true,
            ..DispatchSummary::default()
        };

        for PendingCommand { provider, command } in pending {
            debug!(provider = provider.name(), kind = %command.kind, "executing command");
            let outcome = provider.handle(&command, &mut context).await;

            let record = match outcome {
                Ok(value) => match failure_message(&value) {
                    Some(message) => CommandRecord {
                        provider: provider.name().to_string(),
                        kind: command.kind.clone(),
                        params: command.params.clone(),
                        success: false,
                        result: Some(value),
                        error: Some(message),
                    },
                    None => CommandRecord {
                        provider: provider.name().to_string(),
                        kind: command.kind.clone(),
                        params: command.params.clone(),
                        success: true,
                        result: Some(value),
                        error: None,
                    },
                },
                Err(e) => CommandRecord {
                    provider: provider.name().to_string(),
                    kind: command.kind.clone(),
                    params: command.params.clone(),
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                },
            };

            if record.success {
                summary.succeeded.push(record.kind.clone());
            } else if let Some(ref message) = record.error {
                warn!(provider = %record.provider, kind = %record.kind, "command failed: {}", message);
                let text = format!("{}: {}", record.kind, message);
                context.insert(LAST_ERROR_KEY.to_string(), Value::String(text.clone()));
                summary.success = false;
                if summary.error.is_none() {
                    summary.error = Some(text);
                }
            }
            summary.commands.push(record);
        }

        summary.executed = !summary.commands.is_empty();
        if summary.executed && summary.success {
            context.remove(LAST_ERROR_KEY);
        }
        if summary.executed {
            info!(
                commands = summary.commands.len(),
                succeeded = summary.succeeded.len(),
                "dispatch finished"
            );
        }

        DispatchOutcome { summary, context }
    }

    fn collect_commands(
        &self,
        text: &str,
        context: &Map<String, Value>,
        in_workflow: bool,
    ) -> Vec<PendingCommand> {
        let mut remaining = if in_workflow {
            strip_top_level_markers(text, &self.registry)
        } else {
            text.to_string()
        };

        let mut pending: Vec<PendingCommand> = Vec::new();
        for provider in self.registry.providers() {
            if !provider.enabled() || (in_workflow && provider.only_top_level()) {
                continue;
            }
            let outcome = provider.parse(&remaining, context);
            for command in outcome.commands {
                pending.push(PendingCommand {
                    provider: Arc::clone(provider),
                    command,
                });
            }
            remaining = outcome.remaining_text;
        }

        if in_workflow {
            pending.retain(|p| !p.provider.only_top_level());
        }

        // Stable: discovery order breaks ties.
        pending.sort_by_key(|p| (p.command.order.is_none(), p.command.order.unwrap_or(0)));
        pending
    }
}

/// Whether the context belongs to a running workflow.
pub fn is_in_workflow(context: &Map<String, Value>) -> bool {
    match context.get(WORKFLOW_ID_KEY) {
        Some(Value::String(id)) => !id.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Cut each top-level marker span out of the text: from the marker to its
/// closing `]`, or to the end of the line when it is never closed. Text
/// around the span, line breaks included, is kept.
fn strip_top_level_markers(text: &str, registry: &ProviderRegistry) -> String {
    let markers: Vec<&str> = registry
        .providers()
        .iter()
        .filter(|p| p.only_top_level())
        .flat_map(|p| p.markers().iter().copied())
        .filter(|m| !m.is_empty())
        .collect();

    let mut text = text.to_string();
    for marker in markers {
        while let Some(start) = text.find(marker) {
            let tail = &text[start..];
            let line_end = tail.find(['\r', '\n']).unwrap_or(tail.len());
            let end = match tail[..line_end].find(']') {
                Some(close) => start + close + 1,
                None => start + line_end,
            };
            text.replace_range(start..end, "");
        }
    }
    text
}

fn failure_message(value: &Value) -> Option<String> {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("command reported failure");
        Some(message.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Matches `[<tag>:<arg>]` and records handled commands.
    struct TagProvider {
        name: &'static str,
        tag: &'static str,
        top_level: bool,
        fail_on: Option<&'static str>,
        handled: Mutex<Vec<String>>,
    }

    impl TagProvider {
        fn new(name: &'static str, tag: &'static str) -> Self {
            Self {
                name,
                tag,
                top_level: false,
                fail_on: None,
                handled: Mutex::new(Vec::new()),
            }
        }

        fn top_level(mut self) -> Self {
            self.top_level = true;
            self
        }

        fn failing_on(mut self, arg: &'static str) -> Self {
            self.fail_on = Some(arg);
            self
        }

        fn handled(&self) -> Vec<String> {
            self.handled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandProvider for TagProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test provider"
        }

        fn prompt_fragment(&self) -> Option<&str> {
            Some(self.tag)
        }

        fn only_top_level(&self) -> bool {
            self.top_level
        }

        fn markers(&self) -> &[&str] {
            std::slice::from_ref(&self.tag)
        }

        fn parse(&self, text: &str, _context: &Map<String, Value>) -> ParseOutcome {
            let mut commands = Vec::new();
            let mut remaining = String::new();
            let mut rest = text;
            while let Some(start) = rest.find(self.tag) {
                let after = &rest[start + self.tag.len()..];
                let Some(end) = after.find(']') else { break };
                remaining.push_str(&rest[..start]);
                let arg = &after[..end];
                let (arg, order) = match arg.split_once('#') {
                    Some((a, o)) => (a, o.parse().ok()),
                    None => (arg, None),
                };
                commands.push(Command {
                    kind: self.name.to_string(),
                    params: json!({ "arg": arg }),
                    order,
                });
                rest = &after[end + 1..];
            }
            remaining.push_str(rest);
            ParseOutcome {
                commands,
                remaining_text: remaining,
            }
        }

        async fn handle(
            &self,
            command: &Command,
            context: &mut Map<String, Value>,
        ) -> Result<Value, ProviderError> {
            let arg = command.params["arg"].as_str().unwrap_or_default().to_string();
            self.handled.lock().unwrap().push(arg.clone());
            if self.fail_on == Some(arg.as_str()) {
                return Err(ProviderError::Failed(format!("cannot handle {}", arg)));
            }
            context.insert(format!("{}_last", self.name), json!(arg));
            Ok(json!({ "success": true }))
        }
    }

    fn ctx(in_workflow: bool) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("session".into(), json!({"id": "s"}));
        if in_workflow {
            map.insert(WORKFLOW_ID_KEY.into(), json!("wf_1"));
        }
        map
    }

    #[tokio::test]
    async fn test_dispatch_runs_commands_in_discovery_order() {
        let reader = Arc::new(TagProvider::new("read", "[read:"));
        let dispatcher = Dispatcher::new(ProviderRegistry::new().with(reader.clone()));

        let outcome = dispatcher
            .dispatch("first [read:a] then [read:b]", ctx(true))
            .await;

        assert!(outcome.summary.executed);
        assert!(outcome.summary.success);
        assert_eq!(outcome.summary.succeeded, vec!["read", "read"]);
        assert_eq!(reader.handled(), vec!["a", "b"]);
        assert_eq!(outcome.context["read_last"], "b");
    }

    #[tokio::test]
    async fn test_explicit_order_runs_first() {
        let reader = Arc::new(TagProvider::new("read", "[read:"));
        let dispatcher = Dispatcher::new(ProviderRegistry::new().with(reader.clone()));

        dispatcher
            .dispatch("[read:x] [read:y#2] [read:z#1]", ctx(true))
            .await;
        assert_eq!(reader.handled(), vec!["z", "y", "x"]);
    }

    #[tokio::test]
    async fn test_later_providers_see_stripped_text() {
        let first = Arc::new(TagProvider::new("first", "[a:"));
        let second = Arc::new(TagProvider::new("second", "[a:"));
        let dispatcher = Dispatcher::new(
            ProviderRegistry::new()
                .with(first.clone())
                .with(second.clone()),
        );

        dispatcher.dispatch("[a:1]", ctx(true)).await;
        assert_eq!(first.handled(), vec!["1"]);
        assert!(second.handled().is_empty());
    }

    #[tokio::test]
    async fn test_top_level_provider_excluded_inside_workflow() {
        let starter = Arc::new(TagProvider::new("start_workflow", "[start:").top_level());
        let reader = Arc::new(TagProvider::new("read", "[read:"));
        let dispatcher = Dispatcher::new(
            ProviderRegistry::new()
                .with(starter.clone())
                .with(reader.clone()),
        );

        let outcome = dispatcher
            .dispatch("[start:new goal]\n[read:a]", ctx(true))
            .await;
        assert!(starter.handled().is_empty());
        assert!(
            outcome
                .summary
                .commands
                .iter()
                .all(|c| c.kind != "start_workflow")
        );
        assert_eq!(reader.handled(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_top_level_provider_runs_outside_workflow() {
        let starter = Arc::new(TagProvider::new("start_workflow", "[start:").top_level());
        let dispatcher = Dispatcher::new(ProviderRegistry::new().with(starter.clone()));

        let outcome = dispatcher.dispatch("[start:new goal]", ctx(false)).await;
        assert_eq!(outcome.summary.succeeded, vec!["start_workflow"]);
        assert_eq!(starter.handled(), vec!["new goal"]);
    }

    #[tokio::test]
    async fn test_top_level_marker_on_shared_line_keeps_other_command() {
        let starter = Arc::new(TagProvider::new("start_workflow", "[start:").top_level());
        let reader = Arc::new(TagProvider::new("read", "[read:"));
        let dispatcher = Dispatcher::new(
            ProviderRegistry::new()
                .with(starter.clone())
                .with(reader.clone()),
        );

        let outcome = dispatcher
            .dispatch("[start:new goal] [read:a]", ctx(true))
            .await;
        assert!(starter.handled().is_empty());
        assert_eq!(outcome.summary.succeeded, vec!["read"]);
        assert_eq!(reader.handled(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_builtin_start_marker_beside_read_inside_workflow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let dispatcher = Dispatcher::new(crate::providers::builtin_registry(
            dir.path().to_path_buf(),
            Some(tx),
        ));

        let outcome = dispatcher
            .dispatch("[启动工作流:x] [读取文件:a.txt]", ctx(true))
            .await;
        assert!(outcome.summary.success);
        assert_eq!(outcome.summary.succeeded, vec!["read_file"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_marker_strip_keeps_surrounding_text_and_line_breaks() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(TagProvider::new("start_workflow", "[start:").top_level()));

        assert_eq!(
            strip_top_level_markers("a [start:x] b\r\nnext [start:open\nlast", &registry),
            "a  b\r\nnext \nlast"
        );
        assert_eq!(strip_top_level_markers("plain\n", &registry), "plain\n");
    }

    #[tokio::test]
    async fn test_successful_dispatch_clears_stale_error() {
        let reader = Arc::new(TagProvider::new("read", "[read:"));
        let dispatcher = Dispatcher::new(ProviderRegistry::new().with(reader.clone()));
        let mut context = ctx(true);
        context.insert(LAST_ERROR_KEY.into(), json!("read: cannot handle bad"));

        let outcome = dispatcher.dispatch("[read:good]", context.clone()).await;
        assert!(outcome.summary.success);
        assert!(!outcome.context.contains_key(LAST_ERROR_KEY));

        let idle = dispatcher.dispatch("no commands here", context).await;
        assert!(!idle.summary.executed);
        assert!(idle.context.contains_key(LAST_ERROR_KEY));
    }

    #[tokio::test]
    async fn test_handler_error_is_folded_and_execution_continues() {
        let reader = Arc::new(TagProvider::new("read", "[read:").failing_on("bad"));
        let dispatcher = Dispatcher::new(ProviderRegistry::new().with(reader.clone()));

        let outcome = dispatcher.dispatch("[read:bad] [read:good]", ctx(true)).await;
        assert!(outcome.summary.executed);
        assert!(!outcome.summary.success);
        assert_eq!(outcome.summary.succeeded, vec!["read"]);
        let error = outcome.summary.error.unwrap();
        assert!(error.contains("cannot handle bad"));
        assert_eq!(outcome.context[LAST_ERROR_KEY], json!(error));
        assert_eq!(reader.handled(), vec!["bad", "good"]);
    }

    #[tokio::test]
    async fn test_success_false_result_counts_as_error() {
        struct Soft;

        #[async_trait]
        impl CommandProvider for Soft {
            fn name(&self) -> &str {
                "soft"
            }
            fn description(&self) -> &str {
                "reports failure in its result"
            }
            fn parse(&self, text: &str, _: &Map<String, Value>) -> ParseOutcome {
                ParseOutcome {
                    commands: vec![Command::new("soft", json!({}))],
                    remaining_text: text.to_string(),
                }
            }
            async fn handle(
                &self,
                _: &Command,
                _: &mut Map<String, Value>,
            ) -> Result<Value, ProviderError> {
                Ok(json!({"success": false, "error": "disk full"}))
            }
        }

        let dispatcher = Dispatcher::new(ProviderRegistry::new().with(Arc::new(Soft)));
        let outcome = dispatcher.dispatch("anything", ctx(true)).await;
        assert!(!outcome.summary.success);
        assert_eq!(outcome.summary.error.as_deref(), Some("soft: disk full"));
        assert!(outcome.summary.succeeded.is_empty());
    }

    #[tokio::test]
    async fn test_no_commands_is_not_executed() {
        let dispatcher = Dispatcher::new(
            ProviderRegistry::new().with(Arc::new(TagProvider::new("read", "[read:"))),
        );
        let outcome = dispatcher.dispatch("just prose", ctx(true)).await;
        assert!(!outcome.summary.executed);
        assert!(outcome.summary.success);
        assert!(outcome.summary.error.is_none());
    }

    #[test]
    fn test_prompt_fragments_skip_top_level_inside_workflow() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(TagProvider::new("start", "[start:").top_level()))
            .with(Arc::new(TagProvider::new("read", "[read:")));
        assert_eq!(registry.prompt_fragments(true), vec!["[read:"]);
        assert_eq!(registry.prompt_fragments(false).len(), 2);
    }

    #[test]
    fn test_is_in_workflow() {
        assert!(is_in_workflow(&ctx(true)));
        assert!(!is_in_workflow(&ctx(false)));
        let mut empty = Map::new();
        empty.insert(WORKFLOW_ID_KEY.into(), json!(""));
        assert!(!is_in_workflow(&empty));
    }
}
