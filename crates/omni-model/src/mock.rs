// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{GenerateOptions, Message, ModelProvider, ProviderResponse, Role, ToolInvocation, ToolSchema, Usage};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
pub struct MockProvider {
    provider: String,
    model: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::named("mock", "mock-model")
    }
}

impl MockProvider {
    pub fn named(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.provider
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_text(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
        _options: &GenerateOptions,
    ) -> anyhow::Result<ProviderResponse> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]");
        Ok(ProviderResponse {
            text: format!("MOCK: {reply}"),
            tool_calls: None,
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 10,
                thinking_tokens: 0,
            }),
            request_id: Some("mock-req".into()),
            provider: Some(self.provider.clone()),
            model: Some(self.model.clone()),
        })
    }
}

/// The request most recently seen by a [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

enum ScriptStep {
    Respond(ProviderResponse),
    Fail(String),
}

/// A pre-scripted provider.  Each `generate_text` call pops the next step
/// from the front of the queue, so tests can specify exact response
/// sequences — including tool calls and failures — without network access.
pub struct ScriptedProvider {
    provider: String,
    model: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CapturedRequest>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            provider: "scripted".into(),
            model: "scripted-model".into(),
            steps: Mutex::new(responses.into_iter().map(ScriptStep::Respond).collect()),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns the same single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_response(reply)])
    }

    /// Convenience: a tool call round followed by a text reply round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_response(tool_id, tool_name, args),
            Self::text_response(final_text),
        ])
    }

    /// Convenience: provider whose first call fails with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            provider: "scripted".into(),
            model: "scripted-model".into(),
            steps: Mutex::new(VecDeque::from([ScriptStep::Fail(error.into())])),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Append a failing step after the scripted responses.
    pub fn then_fail(self, error: impl Into<String>) -> Self {
        self.steps
            .lock()
            .expect("script queue poisoned")
            .push_back(ScriptStep::Fail(error.into()));
        self
    }

    pub fn text_response(text: impl Into<String>) -> ProviderResponse {
        ProviderResponse {
            text: text.into(),
            tool_calls: None,
            usage: Some(Usage {
                input_tokens: 5,
                output_tokens: 5,
                thinking_tokens: 0,
            }),
            request_id: Some("scripted-req".into()),
            provider: Some("scripted".into()),
            model: Some("scripted-model".into()),
        }
    }

    pub fn tool_call_response(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> ProviderResponse {
        ProviderResponse {
            tool_calls: Some(vec![ToolInvocation {
                id: tool_id.into(),
                name: tool_name.into(),
                args,
            }]),
            ..Self::text_response("")
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.provider
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_text(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        _options: &GenerateOptions,
    ) -> anyhow::Result<ProviderResponse> {
        *self.last_request.lock().expect("capture poisoned") = Some(CapturedRequest {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        let step = self.steps.lock().expect("script queue poisoned").pop_front();
        match step {
            Some(ScriptStep::Respond(r)) => Ok(r),
            Some(ScriptStep::Fail(e)) => anyhow::bail!(e),
            // Default fallback when all scripts are consumed.
            None => Ok(Self::text_response("[no more scripts]")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
