// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The consumer-facing event stream.
//!
//! A query yields an ordered sequence of these events and ends with exactly
//! one `Result`.  Expected rejections (permission deny, budget, interrupt)
//! travel inside events — the stream itself never fails.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use omni_model::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Interrupted,
    BudgetExceeded,
    PolicyDeniedTurn,
    ToolPermissionDenied,
    ToolNotFound,
    ToolBlockedByHook,
    ToolExecutionFailed,
    ProviderGenerateTextFailed,
    StructuredOutputInvalid,
    AgentLoopFailed,
    UnknownCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Core,
    Permission,
    Tool,
    Provider,
    Hook,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub source: ErrorSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, source: ErrorSource, message: impl Into<String>) -> Self {
        Self {
            code,
            source,
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Progress,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Started,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycle {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputOption {
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputQuestion {
    pub id: String,
    pub header: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_other: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_secret: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<UserInputOption>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputRequest {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub questions: Vec<UserInputQuestion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: String,
    pub status: PlanStepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub plan: Vec<PlanStep>,
}

/// One event in a query's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkEvent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        uuid: String,
    },
    ToolUse {
        tool: String,
        input: serde_json::Value,
        tool_use_id: String,
        uuid: String,
    },
    ToolResult {
        tool: String,
        result: String,
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suggestions: Option<Vec<String>>,
        uuid: String,
    },
    Status {
        subtype: StatusLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
        uuid: String,
    },
    Hook {
        subtype: HookPhase,
        hook_name: String,
        event: String,
        uuid: String,
    },
    Result {
        subtype: ResultKind,
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        uuid: String,
    },
    TaskNotification {
        subtype: TaskLifecycle,
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        uuid: String,
    },
    RequestUserInput {
        payload: UserInputRequest,
        uuid: String,
    },
    PlanUpdate {
        payload: PlanUpdatePayload,
        uuid: String,
    },
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

impl SdkEvent {
    pub fn text(
        text: impl Into<String>,
        request_id: Option<String>,
        provider: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self::Text {
            text: text.into(),
            request_id,
            provider,
            model,
            uuid: new_uuid(),
        }
    }

    pub fn tool_use(tool: impl Into<String>, input: serde_json::Value, tool_use_id: impl Into<String>) -> Self {
        Self::ToolUse {
            tool: tool.into(),
            input,
            tool_use_id: tool_use_id.into(),
            uuid: new_uuid(),
        }
    }

    pub fn tool_result_ok(
        tool: impl Into<String>,
        result: impl Into<String>,
        tool_use_id: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            tool: tool.into(),
            result: result.into(),
            tool_use_id: tool_use_id.into(),
            is_error: None,
            error: None,
            suggestions: None,
            uuid: new_uuid(),
        }
    }

    pub fn tool_result_err(
        tool: impl Into<String>,
        result: impl Into<String>,
        tool_use_id: impl Into<String>,
        error: ErrorInfo,
        suggestions: Option<Vec<String>>,
    ) -> Self {
        Self::ToolResult {
            tool: tool.into(),
            result: result.into(),
            tool_use_id: tool_use_id.into(),
            is_error: Some(true),
            error: Some(error),
            suggestions,
            uuid: new_uuid(),
        }
    }

    pub fn status(subtype: StatusLevel, message: impl Into<String>) -> Self {
        Self::Status {
            subtype,
            message: message.into(),
            error: None,
            uuid: new_uuid(),
        }
    }

    pub fn status_error(message: impl Into<String>, error: ErrorInfo) -> Self {
        Self::Status {
            subtype: StatusLevel::Error,
            message: message.into(),
            error: Some(error),
            uuid: new_uuid(),
        }
    }

    pub fn hook(subtype: HookPhase, hook_name: impl Into<String>, event: impl Into<String>) -> Self {
        Self::Hook {
            subtype,
            hook_name: hook_name.into(),
            event: event.into(),
            uuid: new_uuid(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn result_success(
        result: impl Into<String>,
        structured: Option<serde_json::Value>,
        usage: Option<Usage>,
        request_id: Option<String>,
        provider: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self::Result {
            subtype: ResultKind::Success,
            result: result.into(),
            structured,
            usage,
            error: None,
            request_id,
            provider,
            model,
            uuid: new_uuid(),
        }
    }

    pub fn result_error(result: impl Into<String>, error: ErrorInfo) -> Self {
        Self::Result {
            subtype: ResultKind::Error,
            result: result.into(),
            structured: None,
            usage: None,
            error: Some(error),
            request_id: None,
            provider: None,
            model: None,
            uuid: new_uuid(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Result { error, .. } | Self::Status { error, .. } => error.as_ref().map(|e| e.code),
            Self::ToolResult { error, .. } => error.as_ref().map(|e| e.code),
            _ => None,
        }
    }

    /// Whether this event may be bubbled into a parent query's stream.
    pub fn is_bubbleable(&self) -> bool {
        matches!(
            self,
            Self::Status { .. }
                | Self::TaskNotification { .. }
                | Self::RequestUserInput { .. }
                | Self::PlanUpdate { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialise_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::BudgetExceeded).unwrap(),
            "\"BUDGET_EXCEEDED\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::ToolPermissionDenied).unwrap(),
            "\"TOOL_PERMISSION_DENIED\""
        );
    }

    #[test]
    fn events_carry_type_tags() {
        let ev = SdkEvent::text("hi", None, Some("mock".into()), None);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["provider"], "mock");
        assert!(json["uuid"].as_str().is_some());
        assert!(json.get("request_id").is_none(), "absent options are omitted");
    }

    #[test]
    fn tool_result_error_shape() {
        let ev = SdkEvent::tool_result_err(
            "bash",
            "denied",
            "t1",
            ErrorInfo::new(ErrorCode::ToolPermissionDenied, ErrorSource::Permission, "no"),
            Some(vec!["try later".into()]),
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["is_error"], true);
        assert_eq!(json["error"]["code"], "TOOL_PERMISSION_DENIED");
        assert_eq!(json["error"]["source"], "permission");
    }

    #[test]
    fn result_is_terminal() {
        assert!(SdkEvent::result_success("ok", None, None, None, None, None).is_terminal());
        assert!(!SdkEvent::status(StatusLevel::Info, "x").is_terminal());
    }

    #[test]
    fn bubbleable_covers_subagent_event_kinds() {
        assert!(SdkEvent::status(StatusLevel::Info, "x").is_bubbleable());
        assert!(!SdkEvent::text("t", None, None, None).is_bubbleable());
        assert!(!SdkEvent::result_success("r", None, None, None, None, None).is_bubbleable());
    }

    #[test]
    fn event_round_trips_through_json() {
        let ev = SdkEvent::tool_use("grep", serde_json::json!({"pattern": "x"}), "tu-1");
        let json = serde_json::to_string(&ev).unwrap();
        let back: SdkEvent = serde_json::from_str(&json).unwrap();
        match back {
            SdkEvent::ToolUse { tool, tool_use_id, .. } => {
                assert_eq!(tool, "grep");
                assert_eq!(tool_use_id, "tu-1");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
