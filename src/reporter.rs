//! Status events delivered to the requesting session.
//!
//! Every event is one reply: a JSON envelope, a blank line, then a
//! human-readable line. Rich clients parse the first block; plain-text
//! clients just read the message.

use crate::session::Session;
use crate::workflow::Workflow;
use chrono::Utc;
use console::Emoji;
use serde_json::{Map, Value, json};
use tracing::warn;

pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "[START] ");
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static WORKING: Emoji<'_, '_> = Emoji("🔄 ", "[..] ");
pub static WAITING: Emoji<'_, '_> = Emoji("⏳ ", "[--] ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[RETRY] ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️ ", "[WARN] ");
pub static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[DONE] ");

/// Completion thresholds shared with the scheduler.
pub const COMPLETED_THRESHOLD: f64 = 0.8;
pub const IN_PROGRESS_THRESHOLD: f64 = 0.5;

/// One progress event.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Start,
    Step {
        todo_id: String,
        todo: String,
        completion: f64,
        action: String,
        preamble: Option<String>,
    },
    Complete,
    Error {
        message: String,
    },
    /// A todo hit a dispatch error and goes back to pending.
    Retry {
        todo_id: String,
        todo: String,
        message: String,
    },
    /// A todo was marked failed and the workflow moves on.
    Update {
        todo_id: String,
        todo: String,
        message: String,
    },
}

impl StatusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Start => "start",
            StatusEvent::Step { .. } => "step",
            StatusEvent::Complete => "complete",
            StatusEvent::Error { .. } => "error",
            StatusEvent::Retry { .. } => "retry",
            StatusEvent::Update { .. } => "update",
        }
    }
}

/// Status code derived from a completion score.
pub fn completion_status(completion: f64) -> &'static str {
    if completion >= COMPLETED_THRESHOLD {
        "completed"
    } else if completion >= IN_PROGRESS_THRESHOLD {
        "in_progress"
    } else {
        "pending"
    }
}

fn completion_icon(completion: f64) -> &'static Emoji<'static, 'static> {
    if completion >= COMPLETED_THRESHOLD {
        &CHECK
    } else if completion >= IN_PROGRESS_THRESHOLD {
        &WORKING
    } else {
        &WAITING
    }
}

/// Workflow fields quoted in every event, copied out under the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeader {
    pub workflow_id: String,
    pub goal: String,
    pub completed: usize,
    pub total: usize,
    pub iteration: u32,
}

impl EventHeader {
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let (completed, total) = workflow.progress();
        Self {
            workflow_id: workflow.id.clone(),
            goal: workflow.goal.clone(),
            completed,
            total,
            iteration: workflow.iteration,
        }
    }
}

/// Machine-readable envelope.
pub fn envelope(header: &EventHeader, event: &StatusEvent) -> Value {
    let mut body = Map::new();
    body.insert("type".into(), json!("workflow"));
    body.insert("event".into(), json!(event.name()));
    body.insert("workflowId".into(), json!(header.workflow_id));
    body.insert("goal".into(), json!(header.goal));
    body.insert(
        "progress".into(),
        json!({ "completed": header.completed, "total": header.total }),
    );
    body.insert("iteration".into(), json!(header.iteration));
    body.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));

    match event {
        StatusEvent::Start | StatusEvent::Complete => {}
        StatusEvent::Step {
            todo_id,
            todo,
            completion,
            action,
            preamble,
        } => {
            body.insert("todoId".into(), json!(todo_id));
            body.insert("todo".into(), json!(todo));
            body.insert("completion".into(), json!(completion));
            body.insert("status".into(), json!(completion_status(*completion)));
            body.insert("action".into(), json!(action));
            if let Some(message) = preamble {
                body.insert("message".into(), json!(message));
            }
        }
        StatusEvent::Error { message } => {
            body.insert("error".into(), json!(message));
        }
        StatusEvent::Retry {
            todo_id,
            todo,
            message,
        }
        | StatusEvent::Update {
            todo_id,
            todo,
            message,
        } => {
            body.insert("todoId".into(), json!(todo_id));
            body.insert("todo".into(), json!(todo));
            body.insert("message".into(), json!(message));
        }
    }

    Value::Object(body)
}

/// Human-readable line.
pub fn human_text(header: &EventHeader, event: &StatusEvent) -> String {
    match event {
        StatusEvent::Start => format!(
            "{}开始执行: {} (共 {} 个步骤)",
            ROCKET, header.goal, header.total
        ),
        StatusEvent::Step {
            todo,
            completion,
            preamble,
            ..
        } => {
            let mut line = format!(
                "{}[{}/{}] {} ({:.0}%)",
                completion_icon(*completion),
                header.completed,
                header.total,
                todo,
                completion * 100.0
            );
            if let Some(message) = preamble {
                line.push('\n');
                line.push_str(message);
            }
            line
        }
        StatusEvent::Complete => format!(
            "{}已完成: {} ({}/{})",
            PARTY, header.goal, header.completed, header.total
        ),
        StatusEvent::Error { message } => format!("{}执行失败: {}", CROSS, message),
        StatusEvent::Retry { todo, message, .. } => {
            format!("{}步骤出错，将重试: {} ({})", RETRY, todo, message)
        }
        StatusEvent::Update { todo, message, .. } => {
            format!("{}步骤失败: {} ({})", WARN, todo, message)
        }
    }
}

/// `<json>\n\n<human text>`
pub fn render(header: &EventHeader, event: &StatusEvent) -> String {
    let json = serde_json::to_string(&envelope(header, event)).unwrap_or_else(|_| "{}".into());
    format!("{}\n\n{}", json, human_text(header, event))
}

/// Deliver one event. Delivery failures are logged, never raised.
pub async fn report(session: &dyn Session, header: &EventHeader, event: &StatusEvent) {
    let text = render(header, event);
    if let Err(e) = session.reply(&text).await {
        warn!(
            workflow_id = %header.workflow_id,
            event = event.name(),
            "failed to deliver status event: {:#}",
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RecordingSession;

    fn header() -> EventHeader {
        EventHeader {
            workflow_id: "wf_1".into(),
            goal: "生成表格".into(),
            completed: 1,
            total: 2,
            iteration: 3,
        }
    }

    fn split(reply: &str) -> (Value, String) {
        let (json, text) = reply.split_once("\n\n").unwrap();
        (serde_json::from_str(json).unwrap(), text.to_string())
    }

    #[test]
    fn test_envelope_common_fields() {
        let (json, _) = split(&render(&header(), &StatusEvent::Start));
        assert_eq!(json["type"], "workflow");
        assert_eq!(json["event"], "start");
        assert_eq!(json["workflowId"], "wf_1");
        assert_eq!(json["goal"], "生成表格");
        assert_eq!(json["progress"]["completed"], 1);
        assert_eq!(json["progress"]["total"], 2);
        assert_eq!(json["iteration"], 3);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_step_event_carries_status_and_preamble() {
        let event = StatusEvent::Step {
            todo_id: "todo_0".into(),
            todo: "读取文件".into(),
            completion: 0.9,
            action: "[读取文件:a.txt]".into(),
            preamble: Some("文件已经读取".into()),
        };
        let (json, text) = split(&render(&header(), &event));
        assert_eq!(json["event"], "step");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["action"], "[读取文件:a.txt]");
        assert_eq!(json["message"], "文件已经读取");
        assert!(text.contains("读取文件"));
        assert!(text.contains("文件已经读取"));
    }

    #[test]
    fn test_error_event_has_error_field() {
        let event = StatusEvent::Error {
            message: "budget exhausted".into(),
        };
        let (json, text) = split(&render(&header(), &event));
        assert_eq!(json["event"], "error");
        assert_eq!(json["error"], "budget exhausted");
        assert!(text.contains("budget exhausted"));
    }

    #[test]
    fn test_completion_status_thresholds() {
        assert_eq!(completion_status(0.8), "completed");
        assert_eq!(completion_status(0.79), "in_progress");
        assert_eq!(completion_status(0.5), "in_progress");
        assert_eq!(completion_status(0.49), "pending");
    }

    #[tokio::test]
    async fn test_report_delivers_one_reply() {
        let session = RecordingSession::new(Some("alice"));
        report(&session, &header(), &StatusEvent::Complete).await;
        let replies = session.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("\"event\":\"complete\""));
    }
}
