//! File command provider.
//!
//! Recognizes three markers in action text:
//! - `[读取文件:<path>]` reads a file into `fileContent` / `filePath`
//! - `[列出目录:<path>]` lists a directory into `commandOutput`
//! - `[写入文件:<path>]<content>[/写入文件]` writes a file
//!
//! Every path is resolved under a fixed root; absolute paths and `..`
//! components that climb out of it are rejected.

use crate::dispatch::{Command, CommandProvider, ParseOutcome};
use crate::errors::ProviderError;
use crate::notes::{COMMAND_OUTPUT_KEY, FILE_CONTENT_KEY};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

pub const READ_FILE: &str = "read_file";
pub const LIST_DIR: &str = "list_dir";
pub const WRITE_FILE: &str = "write_file";

/// Context key holding the path of the last file read.
pub const FILE_PATH_KEY: &str = "filePath";
/// Context key holding the path of the last file written.
pub const WRITTEN_FILE_KEY: &str = "writtenFile";

static READ_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[读取文件[:：]\s*([^\]]+?)\s*\]").expect("valid read regex")
});

static LIST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[列出目录[:：]\s*([^\]]*?)\s*\]").expect("valid list regex")
});

static WRITE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[写入文件[:：]\s*([^\]]+?)\s*\](.*?)\[/写入文件\]").expect("valid write regex")
});

const MARKERS: &[&str] = &["[读取文件", "[列出目录", "[写入文件"];

const PROMPT_FRAGMENT: &str = "文件操作（路径相对于工作目录）:\n\
- 读取文件: [读取文件:路径]\n\
- 列出目录: [列出目录:路径]\n\
- 写入文件: [写入文件:路径]文件内容[/写入文件]";

pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` under the root without touching the filesystem.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ProviderError> {
        let requested = Path::new(relative.trim());
        let mut resolved = PathBuf::new();
        for component in requested.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(ProviderError::OutsideRoot(requested.to_path_buf()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ProviderError::OutsideRoot(requested.to_path_buf()));
                }
            }
        }
        Ok(self.root.join(resolved))
    }

    async fn read_file(
        &self,
        path: &str,
        context: &mut Map<String, Value>,
    ) -> Result<Value, ProviderError> {
        let full = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|source| ProviderError::Io {
                path: full.clone(),
                source,
            })?;
        debug!(path = %full.display(), chars = content.chars().count(), "file read");
        let bytes = content.len();
        context.insert(FILE_CONTENT_KEY.to_string(), Value::String(content));
        context.insert(FILE_PATH_KEY.to_string(), json!(path));
        Ok(json!({ "success": true, "path": path, "bytes": bytes }))
    }

    async fn list_dir(
        &self,
        path: &str,
        context: &mut Map<String, Value>,
    ) -> Result<Value, ProviderError> {
        let full = self.resolve(path)?;
        let io_err = |source: std::io::Error| ProviderError::Io {
            path: full.clone(),
            source,
        };
        let mut reader = tokio::fs::read_dir(&full).await.map_err(io_err)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(io_err)? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        let count = entries.len();
        context.insert(
            COMMAND_OUTPUT_KEY.to_string(),
            Value::String(entries.join("\n")),
        );
        Ok(json!({ "success": true, "path": path, "entries": count }))
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        context: &mut Map<String, Value>,
    ) -> Result<Value, ProviderError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ProviderError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|source| ProviderError::Io {
                path: full.clone(),
                source,
            })?;
        context.insert(WRITTEN_FILE_KEY.to_string(), json!(path));
        Ok(json!({ "success": true, "path": path, "bytes": content.len() }))
    }
}

fn overlaps(span: &Range<usize>, taken: &[Range<usize>]) -> bool {
    taken
        .iter()
        .any(|t| span.start < t.end && t.start < span.end)
}

#[async_trait]
impl CommandProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn description(&self) -> &str {
        "Read, list and write files under the working directory"
    }

    fn prompt_fragment(&self) -> Option<&str> {
        Some(PROMPT_FRAGMENT)
    }

    fn markers(&self) -> &[&str] {
        MARKERS
    }

    fn parse(&self, text: &str, _context: &Map<String, Value>) -> ParseOutcome {
        let mut found: Vec<(Range<usize>, Command)> = Vec::new();

        // Writes first so markers inside written content are not executed.
        for cap in WRITE_REGEX.captures_iter(text) {
            let (Some(all), Some(path)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let content = cap
                .get(2)
                .map(|m| m.as_str().trim_matches('\n'))
                .unwrap_or_default();
            found.push((
                all.range(),
                Command::new(WRITE_FILE, json!({ "path": path.as_str(), "content": content })),
            ));
        }

        for (regex, kind) in [(&*READ_REGEX, READ_FILE), (&*LIST_REGEX, LIST_DIR)] {
            for cap in regex.captures_iter(text) {
                let (Some(all), Some(path)) = (cap.get(0), cap.get(1)) else {
                    continue;
                };
                let taken: Vec<Range<usize>> = found.iter().map(|(r, _)| r.clone()).collect();
                if overlaps(&all.range(), &taken) {
                    continue;
                }
                let path = if path.as_str().is_empty() { "." } else { path.as_str() };
                found.push((all.range(), Command::new(kind, json!({ "path": path }))));
            }
        }

        if found.is_empty() {
            return ParseOutcome::unchanged(text);
        }

        found.sort_by_key(|(range, _)| range.start);

        let mut remaining = String::with_capacity(text.len());
        let mut cursor = 0;
        for (range, _) in &found {
            remaining.push_str(&text[cursor..range.start]);
            cursor = range.end;
        }
        remaining.push_str(&text[cursor..]);

        ParseOutcome {
            commands: found.into_iter().map(|(_, c)| c).collect(),
            remaining_text: remaining,
        }
    }

    async fn handle(
        &self,
        command: &Command,
        context: &mut Map<String, Value>,
    ) -> Result<Value, ProviderError> {
        let path = command
            .params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidParams("missing 'path'".to_string()))?;

        match command.kind.as_str() {
            READ_FILE => self.read_file(path, context).await,
            LIST_DIR => self.list_dir(path, context).await,
            WRITE_FILE => {
                let content = command
                    .params
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.write_file(path, content, context).await
            }
            other => Err(ProviderError::InvalidParams(format!(
                "unknown file command '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_collects_commands_in_text_order() {
        let provider = FileProvider::new("/tmp");
        let outcome = provider.parse(
            "先 [列出目录:docs] 然后 [读取文件: docs/a.txt ] 最后",
            &Map::new(),
        );
        let kinds: Vec<&str> = outcome.commands.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(kinds, vec![LIST_DIR, READ_FILE]);
        assert_eq!(outcome.commands[1].params["path"], "docs/a.txt");
        assert_eq!(outcome.remaining_text, "先  然后  最后");
    }

    #[test]
    fn test_parse_write_block_hides_inner_markers() {
        let provider = FileProvider::new("/tmp");
        let text = "[写入文件:out.md]\n引用 [读取文件:secret.txt]\n[/写入文件]";
        let outcome = provider.parse(text, &Map::new());
        assert_eq!(outcome.commands.len(), 1);
        assert_eq!(outcome.commands[0].kind, WRITE_FILE);
        assert_eq!(
            outcome.commands[0].params["content"],
            "引用 [读取文件:secret.txt]"
        );
        assert_eq!(outcome.remaining_text, "");
    }

    #[test]
    fn test_parse_without_markers_is_unchanged() {
        let provider = FileProvider::new("/tmp");
        let outcome = provider.parse("nothing to do", &Map::new());
        assert!(outcome.commands.is_empty());
        assert_eq!(outcome.remaining_text, "nothing to do");
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let provider = FileProvider::new("/srv/data");
        assert_eq!(
            provider.resolve("a/./b/../c.txt").unwrap(),
            PathBuf::from("/srv/data/a/c.txt")
        );
        assert!(matches!(
            provider.resolve("../etc/passwd"),
            Err(ProviderError::OutsideRoot(_))
        ));
        assert!(matches!(
            provider.resolve("/etc/passwd"),
            Err(ProviderError::OutsideRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_read_file_sets_context() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("list.txt"), "a.txt\nb.txt").unwrap();
        let provider = FileProvider::new(dir.path());
        let mut context = Map::new();

        let result = provider
            .handle(
                &Command::new(READ_FILE, json!({ "path": "list.txt" })),
                &mut context,
            )
            .await
            .unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(context[FILE_CONTENT_KEY], "a.txt\nb.txt");
        assert_eq!(context[FILE_PATH_KEY], "list.txt");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path());
        let err = provider
            .handle(
                &Command::new(READ_FILE, json!({ "path": "missing.txt" })),
                &mut Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Io { .. }));
    }

    #[tokio::test]
    async fn test_list_dir_marks_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        let provider = FileProvider::new(dir.path());
        let mut context = Map::new();

        provider
            .handle(&Command::new(LIST_DIR, json!({ "path": "." })), &mut context)
            .await
            .unwrap();
        assert_eq!(context[COMMAND_OUTPUT_KEY], "b.txt\nsub/");
    }

    #[tokio::test]
    async fn test_write_file_creates_parents() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path());
        let mut context = Map::new();

        provider
            .handle(
                &Command::new(
                    WRITE_FILE,
                    json!({ "path": "out/table.csv", "content": "name\na.txt" }),
                ),
                &mut context,
            )
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.path().join("out/table.csv")).unwrap();
        assert_eq!(written, "name\na.txt");
        assert_eq!(context[WRITTEN_FILE_KEY], "out/table.csv");
    }

    #[tokio::test]
    async fn test_missing_path_is_invalid_params() {
        let provider = FileProvider::new("/tmp");
        let err = provider
            .handle(&Command::new(READ_FILE, json!({})), &mut Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidParams(_)));
    }
}
