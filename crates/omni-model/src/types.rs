// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Most messages carry plain text; the remaining variants exist so that
/// assistant turns, tool interactions, and rich provider payloads survive a
/// round-trip through the conversation log without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
    ImageUrl {
        url: String,
    },
    Document {
        source: serde_json::Value,
    },
    Citation {
        citation: serde_json::Value,
    },
    CodeExecution {
        execution: serde_json::Value,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Approximate token weight of this part.
    ///
    /// Text uses the 4-bytes-per-token heuristic.  Structured parts add a
    /// fixed overhead on top of their serialized size so that estimation
    /// stays conservative for provider wire formats.
    pub fn approx_tokens(&self) -> usize {
        match self {
            Self::Text { text } => text.len() / 4,
            Self::ToolCall { args, .. } => json_bytes(args) / 4 + 10,
            Self::ToolResult { content, .. } => content.len() / 4 + 10,
            Self::ImageUrl { .. } => 170,
            Self::Document { source } => json_bytes(source) / 4 + 20,
            Self::Citation { citation } => json_bytes(citation) / 4 + 8,
            Self::CodeExecution { execution } => json_bytes(execution) / 4 + 16,
        }
    }
}

fn json_bytes(v: &serde_json::Value) -> usize {
    serde_json::to_string(v).map(|s| s.len()).unwrap_or(0)
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// The content of a message: a plain string or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A tool invocation requested by the model in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// A single message in the conversation history.
///
/// Messages are append-only: the session never mutates one in place, and a
/// `ToolResult` message must follow the assistant message that carries the
/// matching tool call id.  History compaction is the only removal path and
/// preserves that pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Tool calls requested by an assistant message.  Absent and empty are
    /// equivalent everywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolInvocation>>,
    /// On `ToolResult` messages: the id of the tool call this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub uuid: String,
    pub ts: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            uuid: Uuid::new_v4().to_string(),
            ts: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Assistant message carrying the model's text plus requested tool calls.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolInvocation>,
    ) -> Self {
        let mut m = Self::base(Role::Assistant, MessageContent::Text(text.into()));
        if !tool_calls.is_empty() {
            m.tool_calls = Some(tool_calls);
        }
        m
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::base(Role::ToolResult, MessageContent::Text(content.into()));
        m.tool_call_id = Some(tool_call_id.into());
        m.tool_name = Some(tool_name.into());
        m
    }

    pub fn tool_error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::tool_result(tool_call_id, tool_name, content);
        m.is_error = true;
        m
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::base(Role::User, MessageContent::Parts(parts))
    }

    /// Return the plain text of this message when it is a single text body.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Ids of every tool call carried by this message, whether declared in
    /// `tool_calls` or embedded as content parts.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .tool_calls
            .iter()
            .flatten()
            .map(|tc| tc.id.as_str())
            .collect();
        if let MessageContent::Parts(parts) = &self.content {
            for p in parts {
                if let ContentPart::ToolCall { id, .. } = p {
                    ids.push(id.as_str());
                }
            }
        }
        ids
    }

    /// Approximate token count used for context management.
    ///
    /// 4 bytes per token for text plus a 4-token role header per message;
    /// tool calls and results carry a fixed overhead on top of their
    /// serialized size (see [`ContentPart::approx_tokens`]).
    pub fn approx_tokens(&self) -> usize {
        let content = match (&self.role, &self.content) {
            (Role::ToolResult, MessageContent::Text(t)) => t.len() / 4 + 10,
            (_, MessageContent::Text(t)) => t.len() / 4,
            (_, MessageContent::Parts(parts)) => parts.iter().map(|p| p.approx_tokens()).sum(),
        };
        let calls: usize = self
            .tool_calls
            .iter()
            .flatten()
            .map(|tc| json_bytes(&tc.args) / 4 + 10)
            .sum();
        4 + content + calls
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Token usage from one turn.  Totals accumulate in the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub thinking_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.thinking_tokens += other.thinking_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
