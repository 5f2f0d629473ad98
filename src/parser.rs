//! Parsing of reasoning service replies.
//!
//! Replies follow a labeled-field format:
//!
//! ```text
//! <free-form natural language>
//!
//! 完成度评估: <float 0..1>
//! 执行动作: <free text describing the action taken>
//! 下一步建议: <free text, or "无">
//! 笔记: <free text, or "无">
//! ```
//!
//! Every field is optional. A missing completion score is inferred from
//! keywords, and a missing action label makes the whole reply the action.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const COMPLETION_LABEL: &str = "完成度评估";
pub const ACTION_LABEL: &str = "执行动作";
pub const NEXT_STEP_LABEL: &str = "下一步建议";
pub const NOTE_LABEL: &str = "笔记";

const LABELS: [&str; 4] = [COMPLETION_LABEL, ACTION_LABEL, NEXT_STEP_LABEL, NOTE_LABEL];

static COMPLETION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"完成度评估\s*[:：]\s*([-+]?\d+(?:\.\d+)?)").expect("valid completion regex")
});

/// Label at the start of a line, followed by `:` or `：`.
static LABEL_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(完成度评估|执行动作|下一步建议|笔记)\s*[:：]")
        .expect("valid label regex")
});

const FAILURE_WORDS: &[&str] = &["失败", "错误", "无法", "出错", "error", "failed", "unable"];
const SUCCESS_WORDS: &[&str] = &["成功", "完成", "已完成", "done", "success", "completed"];

/// Next-step hints containing any of these mean "nothing further".
const NO_NEXT_STEP_WORDS: &[&str] = &["无", "完成", "结束", "已完成", "none"];

/// Preambles shorter than this are not surfaced to the user.
const MIN_PREAMBLE_CHARS: usize = 5;

pub const HEURISTIC_SUCCESS: f64 = 0.9;
pub const HEURISTIC_FAILURE: f64 = 0.2;
pub const HEURISTIC_UNKNOWN: f64 = 0.5;

/// Structured decision extracted from one reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Completion score in `[0, 1]`.
    pub completion: f64,
    /// Whether `completion` came from the label rather than keywords.
    pub completion_labeled: bool,
    /// Action text handed to the dispatcher.
    pub action: String,
    /// Follow-up step to append, if the hint was meaningful.
    pub next_step: Option<String>,
    /// Note to persist, if any.
    pub note: Option<String>,
    /// User-facing text preceding the labeled fields.
    pub preamble: Option<String>,
}

/// Parser for the labeled reply format.
pub struct ResponseParser {
    verbose: bool,
}

impl ResponseParser {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn parse(&self, reply: &str) -> ParsedResponse {
        let (completion, completion_labeled) = match extract_completion(reply) {
            Some(score) => (score, true),
            None => (infer_completion(reply), false),
        };

        let action = field_value(reply, ACTION_LABEL).unwrap_or_else(|| reply.trim().to_string());
        let next_step = field_value(reply, NEXT_STEP_LABEL).and_then(|s| accept_next_step(&s));
        let note = field_value(reply, NOTE_LABEL).and_then(|s| accept_note(&s));
        let preamble = extract_preamble(reply);

        if self.verbose {
            tracing::debug!(
                completion,
                completion_labeled,
                has_next_step = next_step.is_some(),
                has_note = note.is_some(),
                "parsed reasoning reply"
            );
        }

        ParsedResponse {
            completion,
            completion_labeled,
            action,
            next_step,
            note,
            preamble,
        }
    }
}

/// Convenience function to parse without creating a parser.
pub fn parse_response(reply: &str) -> ParsedResponse {
    ResponseParser::new(false).parse(reply)
}

/// Labeled completion score, clamped to `[0, 1]`.
pub fn extract_completion(reply: &str) -> Option<f64> {
    let cap = COMPLETION_REGEX.captures(reply)?;
    let value: f64 = cap.get(1)?.as_str().parse().ok()?;
    if value.is_nan() {
        return None;
    }
    Some(value.clamp(0.0, 1.0))
}

/// Keyword-based completion estimate for replies without a score.
/// Failure words win over success words.
pub fn infer_completion(reply: &str) -> f64 {
    let lower = reply.to_lowercase();
    if FAILURE_WORDS.iter().any(|w| lower.contains(w)) {
        HEURISTIC_FAILURE
    } else if SUCCESS_WORDS.iter().any(|w| lower.contains(w)) {
        HEURISTIC_SUCCESS
    } else {
        HEURISTIC_UNKNOWN
    }
}

/// Text of a labeled field, up to the next labeled line. The note field
/// also ends at a blank line; every other field may span blank lines.
pub fn field_value(reply: &str, label: &str) -> Option<String> {
    let stop_at_blank = label == NOTE_LABEL;
    let label_match = LABEL_LINE_REGEX
        .captures_iter(reply)
        .find(|cap| cap.get(1).is_some_and(|m| m.as_str() == label))?;
    let start = label_match.get(0)?.end();
    let rest = &reply[start..];

    let mut lines = Vec::new();
    for (i, line) in rest.lines().enumerate() {
        if i > 0 && ((stop_at_blank && line.trim().is_empty()) || starts_with_label(line)) {
            break;
        }
        lines.push(line);
    }

    let value = lines.join("\n").trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

fn starts_with_label(line: &str) -> bool {
    let trimmed = line.trim_start();
    LABELS.iter().any(|label| {
        trimmed
            .strip_prefix(label)
            .map(|rest| {
                let rest = rest.trim_start();
                rest.starts_with(':') || rest.starts_with('：')
            })
            .unwrap_or(false)
    })
}

fn accept_next_step(hint: &str) -> Option<String> {
    let hint = hint.trim();
    let lower = hint.to_lowercase();
    if hint.chars().count() <= 2 || NO_NEXT_STEP_WORDS.iter().any(|w| lower.contains(w)) {
        None
    } else {
        Some(hint.to_string())
    }
}

fn accept_note(note: &str) -> Option<String> {
    let note = note.trim();
    if note.is_empty() || note.contains('无') {
        None
    } else {
        Some(note.to_string())
    }
}

/// Natural-language text before the completion label, or before the first
/// labeled field when there is no completion label.
fn extract_preamble(reply: &str) -> Option<String> {
    let end = COMPLETION_REGEX
        .find(reply)
        .or_else(|| LABEL_LINE_REGEX.find(reply))
        .map(|m| m.start())
        .unwrap_or(reply.len());
    let preamble = reply[..end].trim();
    if preamble.chars().count() < MIN_PREAMBLE_CHARS {
        None
    } else {
        Some(preamble.to_string())
    }
}
