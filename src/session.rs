//! Session handles: the reply channel back to whoever asked for a goal.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

/// Concurrency slot shared by every session without a user identity.
pub const DEFAULT_USER_KEY: &str = "default";

/// Opaque handle to the requesting chat session.
///
/// The engine only ever delivers reply text through it. `user_key` feeds the
/// one-workflow-per-user gate and `descriptor` is what gets stored under the
/// reserved context key.
#[async_trait]
pub trait Session: Send + Sync {
    /// Identity used for the concurrency gate. `None` for anonymous sessions.
    fn user_key(&self) -> Option<String> {
        None
    }

    /// Serializable description of the session for the workflow context.
    fn descriptor(&self) -> Value {
        Value::Null
    }

    /// Deliver reply text to the session.
    async fn reply(&self, text: &str) -> Result<()>;
}

/// Resolve the concurrency key for a session.
pub fn user_key_for(session: &dyn Session) -> String {
    session
        .user_key()
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| DEFAULT_USER_KEY.to_string())
}

/// Session that drops every reply.
pub struct NullSession;

#[async_trait]
impl Session for NullSession {
    async fn reply(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// Session that keeps every reply in memory.
#[derive(Default)]
pub struct RecordingSession {
    user: Option<String>,
    replies: Mutex<Vec<String>>,
}

impl RecordingSession {
    pub fn new(user: Option<&str>) -> Self {
        Self {
            user: user.map(str::to_string),
            replies: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Session for RecordingSession {
    fn user_key(&self) -> Option<String> {
        self.user.clone()
    }

    fn descriptor(&self) -> Value {
        serde_json::json!({ "kind": "recording", "user": self.user })
    }

    async fn reply(&self, text: &str) -> Result<()> {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(text.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_sessions_share_default_key() {
        assert_eq!(user_key_for(&NullSession), DEFAULT_USER_KEY);
        assert_eq!(user_key_for(&RecordingSession::new(Some(""))), DEFAULT_USER_KEY);
    }

    #[test]
    fn test_identified_session_uses_its_key() {
        let session = RecordingSession::new(Some("alice"));
        assert_eq!(user_key_for(&session), "alice");
    }

    #[tokio::test]
    async fn test_recording_session_keeps_replies_in_order() {
        let session = RecordingSession::new(None);
        session.reply("one").await.unwrap();
        session.reply("two").await.unwrap();
        assert_eq!(session.replies(), vec!["one", "two"]);
    }
}
