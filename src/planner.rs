//! Goal planner: turns a goal into the initial todo list.
//!
//! The reasoning service first decides whether the goal needs decomposing
//! and may list the steps right away. If it says yes without a list, a
//! second call asks for 2-3 steps, and if that also comes back empty a
//! fixed two-step plan is used. A plan is never empty.

use crate::errors::WorkflowError;
use crate::reasoning::{CallConfig, ChatMessage, ReasoningService, call_with_retry};
use crate::registry::{CreateOutcome, WorkflowRegistry};
use crate::session::Session;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

/// Plan used when the service wants a decomposition but never lists steps.
pub const FALLBACK_STEPS: [&str; 2] = ["读取并理解输入内容", "分析结果并回复用户"];

/// Upper bound on steps taken from the follow-up call.
const MAX_FOLLOW_UP_STEPS: usize = 3;

static DECISION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)需要分解\s*[:：]\s*(是|否|yes|no|true|false)").expect("valid decision regex")
});

static STEP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+\s*[.、)）]\s*(.+?)\s*$").expect("valid step regex")
});

const DECOMPOSE_SYSTEM_PROMPT: &str = r#"你负责判断一个任务是否需要拆分成多个步骤。

规则:
- 只需要一个可观察的动作就能完成的任务，不需要分解。
- 包含多个逻辑动作，或者后面的动作依赖前面的结果，需要分解。

按以下格式回答:
需要分解: 是/否
如果需要分解，接着逐行列出步骤:
1. 第一步
2. 第二步
"#;

const STEPS_SYSTEM_PROMPT: &str = r#"把任务拆分成 2 到 3 个按顺序执行的步骤。
只输出步骤列表，每行一个，格式为 "序号. 步骤内容"。"#;

/// Parsed answer to the decomposition question.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub needs_decomposition: bool,
    pub steps: Vec<String>,
}

impl Decomposition {
    /// Without an explicit decision, a list of two or more steps counts as yes.
    pub fn parse(reply: &str) -> Self {
        let steps = parse_steps(reply);
        let needs_decomposition = match DECISION_REGEX.captures(reply).and_then(|c| c.get(1)) {
            Some(answer) => matches!(
                answer.as_str().to_lowercase().as_str(),
                "是" | "yes" | "true"
            ),
            None => steps.len() >= 2,
        };
        Self {
            needs_decomposition,
            steps,
        }
    }
}

/// `N. content` lines, in order.
pub fn parse_steps(reply: &str) -> Vec<String> {
    STEP_REGEX
        .captures_iter(reply)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// A running workflow already has this exact goal.
    AlreadyRunning(String),
    Planned(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning(String),
    Started(CreateOutcome),
}

impl StartOutcome {
    pub fn id(&self) -> &str {
        match self {
            StartOutcome::AlreadyRunning(id) => id,
            StartOutcome::Started(outcome) => outcome.id(),
        }
    }
}

pub struct GoalPlanner {
    reasoning: Arc<dyn ReasoningService>,
    registry: Arc<WorkflowRegistry>,
    call_config: CallConfig,
}

impl GoalPlanner {
    pub fn new(reasoning: Arc<dyn ReasoningService>, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            reasoning,
            registry,
            call_config: CallConfig::default(),
        }
    }

    pub fn with_call_config(mut self, config: CallConfig) -> Self {
        self.call_config = config;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Plan `goal`, short-circuiting when the exact goal is already running.
    pub async fn plan(&self, goal: &str) -> PlanOutcome {
        if let Some(id) = self.registry.find_running_goal(goal) {
            info!(workflow_id = %id, "goal already running");
            return PlanOutcome::AlreadyRunning(id);
        }
        PlanOutcome::Planned(self.decompose(goal).await)
    }

    /// Plan `goal` and hand the plan to the registry.
    pub async fn start(&self, session: Arc<dyn Session>, goal: &str) -> StartOutcome {
        match self.plan(goal).await {
            PlanOutcome::AlreadyRunning(id) => StartOutcome::AlreadyRunning(id),
            PlanOutcome::Planned(todos) => {
                StartOutcome::Started(self.registry.create_workflow(session, goal, todos).await)
            }
        }
    }

    /// Initial todo list for `goal`. Never empty.
    pub async fn decompose(&self, goal: &str) -> Vec<String> {
        let messages = [
            ChatMessage::system(DECOMPOSE_SYSTEM_PROMPT),
            ChatMessage::user(format!("任务: {}", goal)),
        ];
        let decision = match self.ask(&messages).await {
            Ok(reply) => Decomposition::parse(&reply),
            Err(e) => {
                warn!("decomposition call failed, running goal as one step: {}", e);
                return vec![goal.to_string()];
            }
        };

        if !decision.needs_decomposition {
            return vec![goal.to_string()];
        }
        if !decision.steps.is_empty() {
            info!(steps = decision.steps.len(), "goal decomposed");
            return decision.steps;
        }

        let messages = [
            ChatMessage::system(STEPS_SYSTEM_PROMPT),
            ChatMessage::user(format!("任务: {}", goal)),
        ];
        let steps = match self.ask(&messages).await {
            Ok(reply) => parse_steps(&reply),
            Err(e) => {
                warn!("step listing call failed: {}", e);
                Vec::new()
            }
        };
        if steps.is_empty() {
            info!("no steps listed, using fallback plan");
            return FALLBACK_STEPS.iter().map(|s| s.to_string()).collect();
        }
        steps.into_iter().take(MAX_FOLLOW_UP_STEPS).collect()
    }

    async fn ask(&self, messages: &[ChatMessage]) -> Result<String, WorkflowError> {
        let settings = self.registry.settings();
        call_with_retry(
            self.reasoning.as_ref(),
            messages,
            &self.call_config,
            settings.reasoning_attempts,
            settings.retry_delay,
        )
        .await
    }
}
