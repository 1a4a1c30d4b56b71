// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::context::ToolContext;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as the model produced them.  Tools validate at
    /// their own boundary and return a recoverable error on schema mismatch
    /// rather than panicking.
    pub args: Value,
}

/// The result of executing a tool: text, or a text error message.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool failed non-fatally; the loop records the error and
    /// continues so the model can react.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Side-effect classification used by the permission layer.
///
/// `plan` mode denies anything that is not read-only, and `acceptEdits`
/// auto-approves edits but not arbitrary execution; each tool declares what
/// it is so the permission manager never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolKind {
    /// Pure reads: file reads, searches, listings.
    ReadOnly,
    /// File creation and modification.
    Edit,
    /// Process execution and anything else with arbitrary side effects.
    #[default]
    Execute,
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Side-effect classification; defaults to the most restrictive kind.
    fn kind(&self) -> ToolKind {
        ToolKind::default()
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
