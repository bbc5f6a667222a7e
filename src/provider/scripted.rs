//! Deterministic provider that replays scripted replies.
//!
//! Lets the pipeline run offline. Each call consumes the next scripted entry
//! for the first matching route; unmatched calls fall through to the default
//! responder, if one is installed.

use crate::error::ProviderError;
use crate::provider::{
    ChatMessage, CompletionOptions, CompletionResponse, ModelProviderClient, TokenUsage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One scripted outcome
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(ProviderError),
}

impl From<&str> for ScriptedReply {
    fn from(value: &str) -> Self {
        ScriptedReply::Text(value.to_string())
    }
}

impl From<String> for ScriptedReply {
    fn from(value: String) -> Self {
        ScriptedReply::Text(value)
    }
}

impl From<ProviderError> for ScriptedReply {
    fn from(value: ProviderError) -> Self {
        ScriptedReply::Fail(value)
    }
}

type Responder = dyn Fn(&[ChatMessage]) -> ScriptedReply + Send + Sync;

struct Route {
    needle: String,
    replies: VecDeque<ScriptedReply>,
}

/// Recorded invocation
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

impl ScriptedCall {
    /// Concatenated text of every message, for assertions.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct ScriptedProvider {
    model: String,
    routes: Mutex<Vec<Route>>,
    fallback: Option<Arc<Responder>>,
    calls: Mutex<Vec<ScriptedCall>>,
    latency: Option<Duration>,
    ready: Result<(), ProviderError>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            routes: Mutex::new(Vec::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            latency: None,
            ready: Ok(()),
        }
    }

    /// Queue replies for calls whose last user message contains `needle`.
    pub fn route<I, R>(self, needle: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReply>,
    {
        self.routes.lock().push(Route {
            needle: needle.into(),
            replies: replies.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Responder used when no route has a queued reply left.
    pub fn with_fallback<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> ScriptedReply + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(responder));
        self
    }

    /// Simulated network latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make `check_ready` report a configuration failure.
    pub fn not_ready(mut self, reason: impl Into<String>) -> Self {
        self.ready = Err(ProviderError::NotConfigured(reason.into()));
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls whose last user message contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| last_user_message(&call.messages).contains(needle))
            .count()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> ScriptedReply {
        let prompt = last_user_message(messages);
        {
            let mut routes = self.routes.lock();
            for route in routes.iter_mut() {
                if prompt.contains(&route.needle) {
                    if let Some(reply) = route.replies.pop_front() {
                        return reply;
                    }
                }
            }
        }
        match &self.fallback {
            Some(responder) => responder(messages),
            None => ScriptedReply::Fail(ProviderError::ClientError(
                "no scripted reply for request".to_string(),
            )),
        }
    }
}

fn last_user_message(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == crate::provider::MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

#[async_trait]
impl ModelProviderClient for ScriptedProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ProviderError> {
        let reply = self.next_reply(&messages);
        self.calls.lock().push(ScriptedCall { messages, options });
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            ScriptedReply::Text(content) => Ok(CompletionResponse {
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 20,
                    total_tokens: 30,
                },
                content,
                model: self.model.clone(),
                finish_reason: Some("stop".to_string()),
            }),
            ScriptedReply::Fail(err) => Err(err),
        }
    }

    fn check_ready(&self) -> Result<(), ProviderError> {
        self.ready.clone()
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
