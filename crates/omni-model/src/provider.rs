// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{catalog, catalog::ModelLimits, Message, ToolInvocation, ToolSchema, Usage};

/// Per-request generation options forwarded to the provider driver.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Model override for this request; `None` uses the driver's configured model.
    pub model: Option<String>,
}

/// What the driver returned for one completion request.
///
/// `tool_calls` is `None` when the driver's wire format omits the field;
/// callers must treat that exactly like an empty list.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub tool_calls: Option<Vec<ToolInvocation>>,
    pub usage: Option<Usage>,
    pub request_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl ProviderResponse {
    /// The tool calls, with missing and empty treated identically.
    pub fn tool_calls_or_empty(&self) -> &[ToolInvocation] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    ToolCalling,
    Streaming,
    Embeddings,
    MultimodalInput,
    Batch,
}

/// Driver interface for one model endpoint.
///
/// Concrete wire protocols live outside this crate; the runtime only depends
/// on this trait plus the mock drivers used in tests.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id used in routing tables and rate cards (e.g. `"anthropic"`).
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Chat, Capability::ToolCalling]
    }

    /// Send one completion request and return text, tool calls, and usage.
    async fn generate_text(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> anyhow::Result<ProviderResponse>;

    /// Whether the driver implements its own tool-execution loop.
    fn supports_native_tool_runs(&self) -> bool {
        false
    }

    /// Run the provider's native tool loop.  The default falls back to plain
    /// text generation, which is the accepted behavior when a caller selects
    /// the native runner against a driver without one.
    async fn run_tools_native(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> anyhow::Result<ProviderResponse> {
        self.generate_text(messages, tools, options).await
    }

    /// Embed a single text.  Requires [`Capability::Embeddings`].
    async fn embed_text(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("provider '{}' does not support embeddings", self.name())
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed_text(t).await?);
        }
        Ok(out)
    }

    /// Context/output limits for `model` (or the configured model).
    ///
    /// Reads from the static catalog; returns conservative defaults when the
    /// model is unknown.
    fn model_limits(&self, model: Option<&str>) -> ModelLimits {
        let model = model.unwrap_or_else(|| self.model_name());
        catalog::lookup(self.name(), model)
            .map(|e| e.limits())
            .unwrap_or_default()
    }

    /// Query the live API for available models.
    ///
    /// The default reports "unsupported" so the router can distinguish a
    /// provider-api listing from its catalog fallback.
    async fn list_available_models(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("provider '{}' does not list models", self.name())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
