//! Workflow context and durable notes.
//!
//! Notes are appended to a durable store and mirrored in memory on the
//! workflow. The context is a shared key/value map that command handlers
//! write into and later steps read from.

use crate::workflow::{Note, SESSION_KEY, WORKFLOW_ID_KEY, Workflow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// Context key holding the most recently read file content.
pub const FILE_CONTENT_KEY: &str = "fileContent";
/// Context key holding the most recent command output.
pub const COMMAND_OUTPUT_KEY: &str = "commandOutput";

/// Durable note log and workflow metadata store.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn store_note(
        &self,
        workflow_id: &str,
        content: &str,
        source: &str,
        persistent: bool,
    ) -> Result<()>;

    /// All notes for a workflow, oldest first.
    async fn get_notes(&self, workflow_id: &str) -> Result<Vec<Note>>;

    async fn store_workflow_memory(&self, workflow_id: &str, meta: &Value) -> Result<()>;
}

/// Process-local note store.
#[derive(Default)]
pub struct InMemoryNoteStore {
    notes: Mutex<HashMap<String, Vec<Note>>>,
    memory: Mutex<HashMap<String, Value>>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_memory(&self, workflow_id: &str) -> Option<Value> {
        self.memory
            .lock()
            .ok()
            .and_then(|m| m.get(workflow_id).cloned())
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn store_note(
        &self,
        workflow_id: &str,
        content: &str,
        source: &str,
        _persistent: bool,
    ) -> Result<()> {
        let mut notes = self
            .notes
            .lock()
            .map_err(|e| anyhow::anyhow!("Note store lock poisoned: {}", e))?;
        notes
            .entry(workflow_id.to_string())
            .or_default()
            .push(Note::new(content, source));
        Ok(())
    }

    async fn get_notes(&self, workflow_id: &str) -> Result<Vec<Note>> {
        let notes = self
            .notes
            .lock()
            .map_err(|e| anyhow::anyhow!("Note store lock poisoned: {}", e))?;
        Ok(notes.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn store_workflow_memory(&self, workflow_id: &str, meta: &Value) -> Result<()> {
        let mut memory = self
            .memory
            .lock()
            .map_err(|e| anyhow::anyhow!("Note store lock poisoned: {}", e))?;
        memory.insert(workflow_id.to_string(), meta.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NoteLine {
    #[serde(flatten)]
    note: Note,
    persistent: bool,
}

/// Append-only JSON-lines note log, one file per workflow.
///
/// Non-persistent notes are kept in memory only and merged into `get_notes`
/// results in insertion order after the persisted ones.
pub struct JsonlNoteStore {
    notes_dir: PathBuf,
    memory_dir: PathBuf,
    transient: InMemoryNoteStore,
}

impl JsonlNoteStore {
    pub fn new(notes_dir: &Path, memory_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(notes_dir).context("Failed to create notes directory")?;
        std::fs::create_dir_all(memory_dir).context("Failed to create memory directory")?;
        Ok(Self {
            notes_dir: notes_dir.to_path_buf(),
            memory_dir: memory_dir.to_path_buf(),
            transient: InMemoryNoteStore::new(),
        })
    }

    fn notes_file(&self, workflow_id: &str) -> PathBuf {
        self.notes_dir.join(format!("{}.jsonl", workflow_id))
    }

    fn memory_file(&self, workflow_id: &str) -> PathBuf {
        self.memory_dir.join(format!("{}.json", workflow_id))
    }
}

#[async_trait]
impl NoteStore for JsonlNoteStore {
    async fn store_note(
        &self,
        workflow_id: &str,
        content: &str,
        source: &str,
        persistent: bool,
    ) -> Result<()> {
        if !persistent {
            return self
                .transient
                .store_note(workflow_id, content, source, false)
                .await;
        }

        let line = NoteLine {
            note: Note::new(content, source),
            persistent,
        };
        let mut json = serde_json::to_string(&line).context("Failed to serialize note")?;
        json.push('\n');

        let path = self.notes_file(workflow_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open note log: {}", path.display()))?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to append note")?;
        file.flush().await.context("Failed to flush note log")?;
        Ok(())
    }

    async fn get_notes(&self, workflow_id: &str) -> Result<Vec<Note>> {
        let path = self.notes_file(workflow_id);
        let mut notes = Vec::new();

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read note log: {}", path.display()))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<NoteLine>(line) {
                    Ok(parsed) => notes.push(parsed.note),
                    Err(e) => tracing::warn!(workflow_id, "skipping malformed note line: {}", e),
                }
            }
        }

        notes.extend(self.transient.get_notes(workflow_id).await?);
        Ok(notes)
    }

    async fn store_workflow_memory(&self, workflow_id: &str, meta: &Value) -> Result<()> {
        let path = self.memory_file(workflow_id);
        let json =
            serde_json::to_string_pretty(meta).context("Failed to serialize workflow memory")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write workflow memory: {}", path.display()))?;
        Ok(())
    }
}

/// Keys a handler's context can never change through a merge.
const PROTECTED_KEYS: &[&str] = &[SESSION_KEY, WORKFLOW_ID_KEY];

/// Shallow-merge `incoming` into `target`, keeping the reserved session and
/// workflow id keys at their pre-merge values.
pub fn merge_context(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    let saved: Vec<(&str, Option<Value>)> = PROTECTED_KEYS
        .iter()
        .map(|key| (*key, target.get(*key).cloned()))
        .collect();
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
    for (key, value) in saved {
        match value {
            Some(value) => {
                target.insert(key.to_string(), value);
            }
            None => {
                target.remove(key);
            }
        }
    }
}

/// Persist a note and mirror it on the workflow.
pub async fn record_note(
    store: &dyn NoteStore,
    workflow: &crate::workflow::SharedWorkflow,
    content: &str,
    source: &str,
) -> Result<()> {
    let workflow_id = crate::workflow::lock_workflow(workflow).id.clone();
    store.store_note(&workflow_id, content, source, true).await?;
    crate::workflow::lock_workflow(workflow)
        .notes
        .push(Note::new(content, source));
    Ok(())
}

/// Truncate `text` to at most `max_chars` characters, marking the cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}\n...[truncated {} chars]", kept, total - max_chars)
}

fn context_text(context: &Map<String, Value>, key: &str) -> Option<String> {
    match context.get(key)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Excerpt of the last file content in context, if any.
pub fn file_excerpt(context: &Map<String, Value>, max_chars: usize) -> Option<String> {
    context_text(context, FILE_CONTENT_KEY).map(|t| excerpt(&t, max_chars))
}

/// Excerpt of the last command output in context, if any.
pub fn command_excerpt(context: &Map<String, Value>, max_chars: usize) -> Option<String> {
    context_text(context, COMMAND_OUTPUT_KEY).map(|t| excerpt(&t, max_chars))
}

const ERROR_KEYWORDS: &[&str] = &["错误", "失败", "异常", "error", "failed", "exception"];

/// Whether a note describes an error.
pub fn is_error_note(note: &Note) -> bool {
    let lower = note.content.to_lowercase();
    note.source == "error" || ERROR_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Split notes into the most recent error notes and the most recent other
/// notes, each oldest first and capped at the given counts.
pub fn select_prompt_notes(
    notes: &[Note],
    max_errors: usize,
    max_recent: usize,
) -> (Vec<&Note>, Vec<&Note>) {
    let (errors, others): (Vec<&Note>, Vec<&Note>) = notes.iter().partition(|n| is_error_note(n));
    (tail(errors, max_errors), tail(others, max_recent))
}

fn tail(mut items: Vec<&Note>, max: usize) -> Vec<&Note> {
    let skip = items.len().saturating_sub(max);
    items.drain(..skip);
    items
}

/// Apply a step's context to the workflow, preserving the protected keys.
pub fn merge_into_workflow(workflow: &mut Workflow, incoming: &Map<String, Value>) {
    merge_context(&mut workflow.context, incoming);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_merge_context_restores_session_key() {
        let mut target = map(json!({"session": {"id": "s1"}, "a": 1}));
        let incoming = map(json!({"session": "hijacked", "a": 2, "b": "new"}));
        merge_context(&mut target, &incoming);
        assert_eq!(target["session"], json!({"id": "s1"}));
        assert_eq!(target["a"], 2);
        assert_eq!(target["b"], "new");
    }

    #[test]
    fn test_merge_context_cannot_introduce_session_key() {
        let mut target = map(json!({"a": 1}));
        merge_context(&mut target, &map(json!({"session": "injected"})));
        assert!(!target.contains_key("session"));
    }

    #[test]
    fn test_merge_context_keeps_workflow_id() {
        let mut target = map(json!({"session": {"id": "s1"}, "workflowId": "wf_1"}));
        merge_context(&mut target, &map(json!({"workflowId": "", "a": 1})));
        assert_eq!(target["workflowId"], "wf_1");
        assert_eq!(target["a"], 1);

        let mut top = map(json!({"session": {"id": "s1"}}));
        merge_context(&mut top, &map(json!({"workflowId": "wf_2"})));
        assert!(!top.contains_key("workflowId"));
    }

    #[test]
    fn test_excerpt_truncates_by_chars() {
        assert_eq!(excerpt("short", 10), "short");
        let long = "文".repeat(12);
        let cut = excerpt(&long, 10);
        assert!(cut.starts_with(&"文".repeat(10)));
        assert!(cut.contains("truncated 2 chars"));
    }

    #[test]
    fn test_file_and_command_excerpts_read_context() {
        let ctx = map(json!({
            "fileContent": "a.txt\nb.txt",
            "commandOutput": "",
        }));
        assert_eq!(file_excerpt(&ctx, 100).as_deref(), Some("a.txt\nb.txt"));
        assert!(command_excerpt(&ctx, 100).is_none());
    }

    #[test]
    fn test_select_prompt_notes_splits_and_caps() {
        let mut notes = Vec::new();
        for i in 0..5 {
            notes.push(Note::new(format!("执行失败 {}", i), "error"));
        }
        for i in 0..7 {
            notes.push(Note::new(format!("fact {}", i), "reasoning"));
        }
        let (errors, others) = select_prompt_notes(&notes, 3, 5);
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].content, "执行失败 2");
        assert_eq!(others.len(), 5);
        assert_eq!(others[4].content, "fact 6");
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryNoteStore::new();
        store.store_note("wf", "first", "test", true).await.unwrap();
        store.store_note("wf", "second", "test", false).await.unwrap();
        store
            .store_workflow_memory("wf", &json!({"goal": "g"}))
            .await
            .unwrap();

        let notes = store.get_notes("wf").await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].content, "second");
        assert!(store.get_notes("other").await.unwrap().is_empty());
        assert_eq!(store.workflow_memory("wf").unwrap()["goal"], "g");
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_and_reads_back() {
        let dir = tempdir().unwrap();
        let store = JsonlNoteStore::new(&dir.path().join("notes"), &dir.path().join("memory"))
            .unwrap();

        store.store_note("wf_1", "用户要求生成表格", "reasoning", true).await.unwrap();
        store.store_note("wf_1", "scratch", "debug", false).await.unwrap();
        store.store_note("wf_1", "second fact", "reasoning", true).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("notes/wf_1.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);

        let notes = store.get_notes("wf_1").await.unwrap();
        let contents: Vec<&str> = notes.iter().map(|n| n.content.as_str()).collect();
        assert_eq!(contents, vec!["用户要求生成表格", "second fact", "scratch"]);

        store
            .store_workflow_memory("wf_1", &json!({"goal": "g", "todos": 2}))
            .await
            .unwrap();
        assert!(dir.path().join("memory/wf_1.json").exists());
    }

    #[tokio::test]
    async fn test_jsonl_store_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let store = JsonlNoteStore::new(&dir.path().join("n"), &dir.path().join("m")).unwrap();
        store.store_note("wf", "good", "s", true).await.unwrap();
        let path = dir.path().join("n/wf.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("not json\n");
        std::fs::write(&path, raw).unwrap();

        let notes = store.get_notes("wf").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, "good");
    }
}
