//! Reasoning service contract and clients.
//!
//! The engine treats the reasoning service as a black-box text completion
//! call. A `None` (or blank) reply is a transient failure; callers go
//! through [`call_with_retry`] to apply the bounded retry policy.

use crate::config::ReasoningSection;
use crate::errors::WorkflowError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// One chat message sent to the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2000,
        }
    }
}

/// A text-completion backend. Implementations never fail loudly: any
/// transport or protocol problem is reported as `None`.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn call(&self, messages: &[ChatMessage], config: &CallConfig) -> Option<String>;
}

/// Call `service` up to `attempts` times, `delay` apart, until it returns a
/// non-blank reply.
pub async fn call_with_retry(
    service: &dyn ReasoningService,
    messages: &[ChatMessage],
    config: &CallConfig,
    attempts: u32,
    delay: Duration,
) -> Result<String, WorkflowError> {
    for attempt in 1..=attempts {
        match service.call(messages, config).await {
            Some(reply) if !reply.trim().is_empty() => {
                debug!(attempt, chars = reply.len(), "reasoning reply received");
                return Ok(reply);
            }
            _ => {
                warn!(attempt, attempts, "reasoning service returned an empty reply");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(WorkflowError::ReasoningUnavailable { attempts })
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpReasoningClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReasoningClient {
    pub fn new(settings: &ReasoningSection) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.api_base.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, messages: &[ChatMessage], config: &CallConfig) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: false,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach reasoning service")?
            .error_for_status()
            .context("Reasoning service returned an error status")?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse reasoning service response")?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningClient {
    async fn call(&self, messages: &[ChatMessage], config: &CallConfig) -> Option<String> {
        match self.request(messages, config).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!(endpoint = %self.endpoint, "reasoning call failed: {:#}", e);
                None
            }
        }
    }
}

/// Replays a fixed queue of replies; `None` entries simulate empty replies.
/// Once the queue is drained every call returns `fallback`.
pub struct ScriptedReasoning {
    replies: Mutex<VecDeque<Option<String>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedReasoning {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(Into::into)).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Every message list received so far, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn call(&self, messages: &[ChatMessage], _config: &CallConfig) -> Option<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(reply) => reply,
            None => self.fallback.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_returns_first_non_empty_reply() {
        let service = ScriptedReasoning::new([None, Some("  "), Some("ok")]);
        let reply = call_with_retry(
            &service,
            &[ChatMessage::user("hi")],
            &CallConfig::default(),
            3,
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_reasoning_unavailable() {
        let service = ScriptedReasoning::new([None::<String>, None, None, Some("late".into())]);
        let err = call_with_retry(
            &service,
            &[ChatMessage::user("hi")],
            &CallConfig::default(),
            3,
            Duration::ZERO,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::ReasoningUnavailable { attempts: 3 }));
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_reasoning_uses_fallback_when_drained() {
        let service = ScriptedReasoning::new([Some("first")]).with_fallback("again");
        let config = CallConfig::default();
        assert_eq!(service.call(&[], &config).await.as_deref(), Some("first"));
        assert_eq!(service.call(&[], &config).await.as_deref(), Some("again"));
        assert_eq!(service.call(&[], &config).await.as_deref(), Some("again"));
    }

    #[test]
    fn test_http_client_builds_chat_completions_endpoint() {
        let settings = ReasoningSection {
            api_base: "http://localhost:9000/api/v1/".to_string(),
            ..ReasoningSection::default()
        };
        let client = HttpReasoningClient::new(&settings).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9000/api/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_http_client_unreachable_endpoint_yields_none() {
        let settings = ReasoningSection {
            api_base: "http://127.0.0.1:1/api/v1".to_string(),
            timeout_secs: 2,
            ..ReasoningSection::default()
        };
        let client = HttpReasoningClient::new(&settings).unwrap();
        let reply = client
            .call(&[ChatMessage::user("hi")], &CallConfig::default())
            .await;
        assert!(reply.is_none());
    }
}
