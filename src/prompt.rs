//! Step prompt assembly.
//!
//! Each step prompt is a system message carrying the output contract and a
//! user message describing the goal, the current step, recent progress,
//! notes and context excerpts.

use crate::config::PromptSection;
use crate::notes::{command_excerpt, file_excerpt, select_prompt_notes};
use crate::parser::{ACTION_LABEL, COMPLETION_LABEL, NEXT_STEP_LABEL, NOTE_LABEL};
use crate::reasoning::ChatMessage;
use crate::workflow::{Note, TodoStatus, Workflow};
use std::fmt::Write;

/// Bumped whenever the labeled reply format changes.
pub const OUTPUT_CONTRACT_VERSION: u32 = 1;

const SYSTEM_PREAMBLE: &str = "你是一个自动化助手，正在按步骤执行一个多步骤任务。\
每次只处理当前步骤，通过执行动作中的命令完成实际操作。";

/// Reply format the parser expects.
pub fn output_contract() -> String {
    format!(
        "输出格式 (v{version}):\n\
         先用自然语言简要说明本步骤的情况，然后空一行，按以下字段输出:\n\
         {completion}: <0到1之间的小数，1表示当前步骤已完成>\n\
         {action}: <要执行的命令或动作>\n\
         {next}: <还需要追加的下一步，没有则写\"无\">\n\
         {note}: <需要记住的事实，没有则写\"无\">",
        version = OUTPUT_CONTRACT_VERSION,
        completion = COMPLETION_LABEL,
        action = ACTION_LABEL,
        next = NEXT_STEP_LABEL,
        note = NOTE_LABEL,
    )
}

/// Everything one step prompt quotes, borrowed from the workflow.
#[derive(Debug)]
pub struct StepPrompt<'a> {
    pub goal: &'a str,
    pub step: &'a str,
    pub completed: usize,
    pub total: usize,
    pub recent_completed: Vec<&'a str>,
    pub error_notes: Vec<&'a Note>,
    pub recent_notes: Vec<&'a Note>,
    pub file_excerpt: Option<String>,
    pub command_excerpt: Option<String>,
    pub fragments: &'a [String],
}

impl<'a> StepPrompt<'a> {
    pub fn from_workflow(
        workflow: &'a Workflow,
        todo_index: usize,
        notes: &'a [Note],
        fragments: &'a [String],
        limits: &PromptSection,
    ) -> Self {
        let (completed, total) = workflow.progress();
        let done: Vec<&str> = workflow
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .map(|t| t.content.as_str())
            .collect();
        let skip = done.len().saturating_sub(limits.recent_completed);
        let (error_notes, recent_notes) =
            select_prompt_notes(notes, limits.max_error_notes, limits.max_recent_notes);

        Self {
            goal: &workflow.goal,
            step: workflow
                .todos
                .get(todo_index)
                .map(|t| t.content.as_str())
                .unwrap_or_default(),
            completed,
            total,
            recent_completed: done[skip..].to_vec(),
            error_notes,
            recent_notes,
            file_excerpt: file_excerpt(&workflow.context, limits.file_excerpt_chars),
            command_excerpt: command_excerpt(&workflow.context, limits.command_excerpt_chars),
            fragments,
        }
    }

    /// The user message body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "总目标: {}", self.goal);
        let _ = writeln!(out, "当前步骤: {}", self.step);
        let _ = writeln!(out, "进度: {}/{} 已完成", self.completed, self.total);

        if !self.recent_completed.is_empty() {
            out.push_str("\n最近完成的步骤:\n");
            for step in &self.recent_completed {
                let _ = writeln!(out, "- {}", step);
            }
        }

        if !self.error_notes.is_empty() {
            out.push_str("\n之前遇到的错误 (请避免重复):\n");
            for note in &self.error_notes {
                let _ = writeln!(out, "- {}", note.content);
            }
        }

        if let Some(ref content) = self.file_excerpt {
            let _ = writeln!(out, "\n已读取的文件内容:\n{}", content);
        }

        if let Some(ref output) = self.command_excerpt {
            let _ = writeln!(out, "\n命令输出:\n{}", output);
        }

        if !self.recent_notes.is_empty() {
            out.push_str("\n相关笔记:\n");
            for note in &self.recent_notes {
                let _ = writeln!(out, "- {}", note.content);
            }
        }

        if !self.fragments.is_empty() {
            out.push_str("\n可用命令:\n");
            for fragment in self.fragments {
                let _ = writeln!(out, "{}", fragment);
            }
        }

        out
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(format!("{}\n\n{}", SYSTEM_PREAMBLE, output_contract())),
            ChatMessage::user(self.render()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::FILE_CONTENT_KEY;
    use crate::session::NullSession;
    use serde_json::json;
    use std::sync::Arc;

    fn workflow(todos: &[&str]) -> Workflow {
        Workflow::new(
            "wf_test",
            "读取文件列表然后生成表格",
            "default",
            todos.iter().map(|t| t.to_string()).collect(),
            Arc::new(NullSession),
            20,
        )
    }

    #[test]
    fn test_contract_names_every_label() {
        let contract = output_contract();
        for label in [COMPLETION_LABEL, ACTION_LABEL, NEXT_STEP_LABEL, NOTE_LABEL] {
            assert!(contract.contains(label), "missing {}", label);
        }
        assert!(contract.contains(&format!("v{}", OUTPUT_CONTRACT_VERSION)));
    }

    #[test]
    fn test_prompt_quotes_goal_step_and_progress() {
        let mut wf = workflow(&["读取文件列表", "生成表格"]);
        wf.todos[0].status = TodoStatus::Completed;
        let prompt = StepPrompt::from_workflow(&wf, 1, &[], &[], &PromptSection::default());
        let text = prompt.render();
        assert!(text.contains("总目标: 读取文件列表然后生成表格"));
        assert!(text.contains("当前步骤: 生成表格"));
        assert!(text.contains("进度: 1/2"));
        assert!(text.contains("- 读取文件列表"));
    }

    #[test]
    fn test_only_last_completed_steps_are_quoted() {
        let mut wf = workflow(&["s0", "s1", "s2", "s3", "s4"]);
        for todo in wf.todos.iter_mut().take(4) {
            todo.status = TodoStatus::Completed;
        }
        let prompt = StepPrompt::from_workflow(&wf, 4, &[], &[], &PromptSection::default());
        assert_eq!(prompt.recent_completed, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_notes_split_into_errors_and_recent() {
        let wf = workflow(&["a"]);
        let notes: Vec<Note> = (0..5)
            .map(|i| Note::new(format!("执行失败 {}", i), "error"))
            .chain((0..7).map(|i| Note::new(format!("事实 {}", i), "reasoning")))
            .collect();
        let prompt = StepPrompt::from_workflow(&wf, 0, &notes, &[], &PromptSection::default());
        assert_eq!(prompt.error_notes.len(), 3);
        assert_eq!(prompt.error_notes[0].content, "执行失败 2");
        assert_eq!(prompt.recent_notes.len(), 5);
        assert_eq!(prompt.recent_notes[4].content, "事实 6");
    }

    #[test]
    fn test_file_content_is_truncated() {
        let mut wf = workflow(&["a"]);
        wf.context
            .insert(FILE_CONTENT_KEY.into(), json!("x".repeat(6000)));
        let limits = PromptSection::default();
        let prompt = StepPrompt::from_workflow(&wf, 0, &[], &[], &limits);
        let excerpt = prompt.file_excerpt.unwrap();
        assert!(excerpt.starts_with(&"x".repeat(5000)));
        assert!(excerpt.contains("truncated 1000 chars"));
    }

    #[test]
    fn test_messages_carry_contract_and_fragments() {
        let wf = workflow(&["a"]);
        let fragments = vec!["[读取文件:路径]".to_string()];
        let prompt =
            StepPrompt::from_workflow(&wf, 0, &[], &fragments, &PromptSection::default());
        let messages = prompt.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains(COMPLETION_LABEL));
        assert!(messages[1].content.contains("[读取文件:路径]"));
    }
}
