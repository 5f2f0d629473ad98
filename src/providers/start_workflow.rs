//! Top-level provider that asks the host to start a new workflow.
//!
//! `[启动工作流:<goal>]` in a top-level reply becomes a [`WorkflowRequest`]
//! on the host's channel. Inside a running workflow the dispatcher never
//! offers this provider, so workflows cannot spawn nested workflows.

use crate::dispatch::{Command, CommandProvider, ParseOutcome};
use crate::errors::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::info;

pub const START_WORKFLOW: &str = "start_workflow";

/// Context key recording the last requested goal.
pub const REQUESTED_GOAL_KEY: &str = "requestedWorkflow";

static START_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[启动工作流[:：]\s*([^\]]+?)\s*\]").expect("valid start regex")
});

const MARKERS: &[&str] = &["[启动工作流"];

const PROMPT_FRAGMENT: &str =
    "需要多个步骤才能完成的任务，可以启动工作流: [启动工作流:目标描述]";

/// A goal the host should plan and start.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub goal: String,
    pub requested_at: DateTime<Utc>,
}

pub struct StartWorkflowProvider {
    requests: mpsc::Sender<WorkflowRequest>,
}

impl StartWorkflowProvider {
    pub fn new(requests: mpsc::Sender<WorkflowRequest>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl CommandProvider for StartWorkflowProvider {
    fn name(&self) -> &str {
        "workflow"
    }

    fn description(&self) -> &str {
        "Start a new multi-step workflow"
    }

    fn prompt_fragment(&self) -> Option<&str> {
        Some(PROMPT_FRAGMENT)
    }

    fn only_top_level(&self) -> bool {
        true
    }

    fn markers(&self) -> &[&str] {
        MARKERS
    }

    fn parse(&self, text: &str, _context: &Map<String, Value>) -> ParseOutcome {
        let commands: Vec<Command> = START_REGEX
            .captures_iter(text)
            .filter_map(|cap| cap.get(1))
            .map(|goal| Command::new(START_WORKFLOW, json!({ "goal": goal.as_str() })))
            .collect();
        if commands.is_empty() {
            return ParseOutcome::unchanged(text);
        }
        ParseOutcome {
            commands,
            remaining_text: START_REGEX.replace_all(text, "").into_owned(),
        }
    }

    async fn handle(
        &self,
        command: &Command,
        context: &mut Map<String, Value>,
    ) -> Result<Value, ProviderError> {
        let goal = command
            .params
            .get("goal")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| ProviderError::InvalidParams("missing 'goal'".to_string()))?;

        let request = WorkflowRequest {
            goal: goal.to_string(),
            requested_at: Utc::now(),
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| ProviderError::Failed("workflow host is not accepting requests".into()))?;

        info!(goal, "workflow start requested");
        context.insert(REQUESTED_GOAL_KEY.to_string(), json!(goal));
        Ok(json!({ "success": true, "goal": goal }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extracts_goal() {
        let (tx, _rx) = mpsc::channel(1);
        let provider = StartWorkflowProvider::new(tx);
        let outcome = provider.parse("好的 [启动工作流: 整理下载目录 ] 稍等", &Map::new());
        assert_eq!(outcome.commands.len(), 1);
        assert_eq!(outcome.commands[0].params["goal"], "整理下载目录");
        assert_eq!(outcome.remaining_text, "好的  稍等");
    }

    #[tokio::test]
    async fn test_handle_forwards_request() {
        let (tx, mut rx) = mpsc::channel(4);
        let provider = StartWorkflowProvider::new(tx);
        let mut context = Map::new();

        provider
            .handle(
                &Command::new(START_WORKFLOW, json!({ "goal": "生成周报" })),
                &mut context,
            )
            .await
            .unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.goal, "生成周报");
        assert_eq!(context[REQUESTED_GOAL_KEY], "生成周报");
    }

    #[tokio::test]
    async fn test_handle_closed_channel_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let provider = StartWorkflowProvider::new(tx);
        let err = provider
            .handle(
                &Command::new(START_WORKFLOW, json!({ "goal": "x" })),
                &mut Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Failed(_)));
    }

    #[test]
    fn test_is_top_level_only() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(StartWorkflowProvider::new(tx).only_top_level());
    }
}
