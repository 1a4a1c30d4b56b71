// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scenario tests for the agent loop.
//!
//! Uses `ScriptedProvider` so every scenario is deterministic and requires
//! no network access.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use omni_config::PermissionMode;
use omni_hooks::{Condition, ConditionOperator, HookManager, HookRule, HooksFile, RuleAction};
use omni_model::ScriptedProvider;
use omni_policy::{PermissionManager, PolicyEngine};
use omni_tools::{Tool, ToolCall, ToolContext, ToolKind, ToolOutput, ToolRegistry};

use crate::{
    AgentLoop, AgentLoopConfig, ErrorCode, ResultKind, SdkEvent, Session, StatusLevel,
    StructuredOutputConfig,
};

// ── Test tools ────────────────────────────────────────────────────────────────

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its arguments"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }
    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::ok(&call.id, format!("echo:{}", call.args))
    }
}

struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "broken"
    }
    fn description(&self) -> &str {
        "always fails"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }
    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::err(&call.id, "disk on fire")
    }
}

/// Runs until the query is interrupted, then returns.
struct WaitForCancelTool;

#[async_trait]
impl Tool for WaitForCancelTool {
    fn name(&self) -> &str {
        "wait"
    }
    fn description(&self) -> &str {
        "waits for cancellation"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        while !ctx.cancel.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        ToolOutput::ok(&call.id, "stopped")
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn loop_with(
    provider: ScriptedProvider,
    tools: ToolRegistry,
    config: AgentLoopConfig,
    mode: PermissionMode,
) -> Arc<AgentLoop> {
    loop_with_session(Session::new(), provider, tools, config, mode)
}

fn loop_with_session(
    session: Session,
    provider: ScriptedProvider,
    tools: ToolRegistry,
    config: AgentLoopConfig,
    mode: PermissionMode,
) -> Arc<AgentLoop> {
    let permissions = Arc::new(PermissionManager::new(Arc::new(PolicyEngine::empty()), mode));
    Arc::new(AgentLoop::new(
        session,
        Arc::new(provider),
        Arc::new(tools),
        permissions,
        Arc::new(HookManager::disabled()),
        config,
    ))
}

fn results(events: &[SdkEvent]) -> Vec<&SdkEvent> {
    events.iter().filter(|e| e.is_terminal()).collect()
}

fn assert_single_result(events: &[SdkEvent]) {
    assert_eq!(results(events).len(), 1, "exactly one terminal result expected");
    assert!(
        events.last().map(|e| e.is_terminal()).unwrap_or(false),
        "terminal result must be the last event"
    );
}

// ── Basic text turn ───────────────────────────────────────────────────────────

#[tokio::test]
async fn single_text_turn_emits_text_and_success_result() {
    let agent = loop_with(
        ScriptedProvider::always_text("hello from agent"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("hi").collect_events().await;

    assert!(matches!(events[0], SdkEvent::Status { subtype: StatusLevel::Info, ref message, .. } if message == "Agent loop started"));
    assert!(events
        .iter()
        .any(|e| matches!(e, SdkEvent::Text { text, .. } if text == "hello from agent")));
    assert_single_result(&events);
    match events.last().unwrap() {
        SdkEvent::Result {
            subtype,
            result,
            usage,
            provider,
            ..
        } => {
            assert_eq!(*subtype, ResultKind::Success);
            assert_eq!(result, "hello from agent");
            assert!(usage.is_some());
            assert_eq!(provider.as_deref(), Some("scripted"));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn conversation_is_recorded_in_session() {
    let agent = loop_with(
        ScriptedProvider::always_text("reply"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let _ = agent.run("my question").collect_events().await;
    let session = agent.session();
    let session = session.lock().unwrap();
    let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![omni_model::Role::User, omni_model::Role::Assistant]);
    assert_eq!(session.messages()[0].as_text(), Some("my question"));
}

// ── S1: budget exceeded ───────────────────────────────────────────────────────

#[tokio::test]
async fn budget_exceeded_stops_before_any_model_call() {
    let mut session = Session::new();
    session.add_cost(0.01);
    let config = AgentLoopConfig {
        max_cost_usd: Some(0.001),
        ..AgentLoopConfig::default()
    };
    let agent = loop_with_session(
        session,
        ScriptedProvider::always_text("should never be reached"),
        ToolRegistry::new(),
        config,
        PermissionMode::Default,
    );
    let events = agent.run("go").collect_events().await;

    assert!(matches!(
        &events[0],
        SdkEvent::Status { subtype: StatusLevel::Info, message, .. } if message == "Agent loop started"
    ));
    match &events[1] {
        SdkEvent::Status {
            subtype: StatusLevel::Error,
            message,
            error,
            ..
        } => {
            assert_eq!(message, "Execution budget exceeded: $0.0100 > $0.0010");
            assert_eq!(error.as_ref().unwrap().code, ErrorCode::BudgetExceeded);
        }
        other => panic!("expected budget status error, got {other:?}"),
    }
    assert_single_result(&events);
    assert_eq!(events.last().unwrap().error_code(), Some(ErrorCode::BudgetExceeded));
    assert!(!events.iter().any(|e| matches!(e, SdkEvent::Text { .. })));
}

// ── Tool round-trip & ordering ────────────────────────────────────────────────

#[tokio::test]
async fn tool_round_trip_preserves_ordering() {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    let agent = loop_with(
        ScriptedProvider::tool_then_text("tc-1", "echo", json!({"x": 1}), "done"),
        tools,
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("run the echo tool").collect_events().await;

    let use_pos = events
        .iter()
        .position(|e| matches!(e, SdkEvent::ToolUse { tool_use_id, .. } if tool_use_id == "tc-1"))
        .expect("tool_use event");
    let result_pos = events
        .iter()
        .position(|e| matches!(e, SdkEvent::ToolResult { tool_use_id, .. } if tool_use_id == "tc-1"))
        .expect("tool_result event");
    assert!(use_pos < result_pos, "tool_use precedes its tool_result");
    match &events[result_pos] {
        SdkEvent::ToolResult { result, is_error, .. } => {
            assert!(result.starts_with("echo:"));
            assert!(is_error.is_none());
        }
        _ => unreachable!(),
    }
    assert_single_result(&events);

    // The session pairs the tool result with its call.
    let session = agent.session();
    let session = session.lock().unwrap();
    let tool_msg = session
        .messages()
        .iter()
        .find(|m| m.role == omni_model::Role::ToolResult)
        .unwrap();
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("tc-1"));
}

#[tokio::test]
async fn interleaved_tool_results_never_cross_tool_uses() {
    // Two sequential tool-call turns; each result must land before the next
    // tool_use appears.
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    let agent = loop_with(
        ScriptedProvider::new(vec![
            ScriptedProvider::tool_call_response("a", "echo", json!({})),
            ScriptedProvider::tool_call_response("b", "echo", json!({})),
            ScriptedProvider::text_response("done"),
        ]),
        tools,
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("twice").collect_events().await;
    let result_a = events
        .iter()
        .position(|e| matches!(e, SdkEvent::ToolResult { tool_use_id, .. } if tool_use_id == "a"))
        .unwrap();
    let use_b = events
        .iter()
        .position(|e| matches!(e, SdkEvent::ToolUse { tool_use_id, .. } if tool_use_id == "b"))
        .unwrap();
    assert!(result_a < use_b, "result for a must precede tool_use b");
    assert_single_result(&events);
}

#[tokio::test]
async fn failing_tool_is_recoverable() {
    let mut tools = ToolRegistry::new();
    tools.register(FailingTool);
    let agent = loop_with(
        ScriptedProvider::tool_then_text("tc-1", "broken", json!({}), "recovered"),
        tools,
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("try it").collect_events().await;
    let failure = events
        .iter()
        .find(|e| matches!(e, SdkEvent::ToolResult { .. }))
        .unwrap();
    assert_eq!(failure.error_code(), Some(ErrorCode::ToolExecutionFailed));
    // The loop continued and the model produced a final answer.
    assert!(matches!(
        events.last().unwrap(),
        SdkEvent::Result { subtype: ResultKind::Success, result, .. } if result == "recovered"
    ));
}

#[tokio::test]
async fn unknown_tool_yields_tool_not_found() {
    let agent = loop_with(
        ScriptedProvider::tool_then_text("tc-1", "ghost", json!({}), "moving on"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("call a ghost").collect_events().await;
    let failure = events
        .iter()
        .find(|e| matches!(e, SdkEvent::ToolResult { .. }))
        .unwrap();
    assert_eq!(failure.error_code(), Some(ErrorCode::ToolNotFound));
    assert_single_result(&events);
}

// ── S2: permission deny in plan mode ──────────────────────────────────────────

#[tokio::test]
async fn plan_mode_denies_side_effect_tool() {
    let mut tools = ToolRegistry::new();
    struct BashTool;
    #[async_trait]
    impl Tool for BashTool {
        fn name(&self) -> &str {
            "bash"
        }
        fn description(&self) -> &str {
            "runs a shell command"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "should not run")
        }
    }
    tools.register(BashTool);
    let agent = loop_with(
        ScriptedProvider::tool_then_text("t1", "bash", json!({"command": "rm -rf /tmp"}), "done"),
        tools,
        AgentLoopConfig::default(),
        PermissionMode::Plan,
    );
    let events = agent.run("clean up").collect_events().await;

    // PermissionRequest hook bracket is always present.
    assert!(events.iter().any(|e| matches!(
        e,
        SdkEvent::Hook { event, subtype: crate::HookPhase::Started, .. } if event == "PermissionRequest"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SdkEvent::Hook { event, subtype: crate::HookPhase::Response, .. } if event == "PermissionRequest"
    )));

    let denial = events
        .iter()
        .find(|e| matches!(e, SdkEvent::ToolResult { .. }))
        .unwrap();
    match denial {
        SdkEvent::ToolResult {
            result,
            is_error,
            error,
            suggestions,
            ..
        } => {
            assert_eq!(*is_error, Some(true));
            assert!(result.starts_with("Tool execution denied:"));
            assert_eq!(error.as_ref().unwrap().code, ErrorCode::ToolPermissionDenied);
            assert!(suggestions.as_ref().map(|s| !s.is_empty()).unwrap_or(false));
        }
        _ => unreachable!(),
    }
    // A later turn still produced the terminal result.
    assert_single_result(&events);
    assert!(matches!(
        events.last().unwrap(),
        SdkEvent::Result { subtype: ResultKind::Success, .. }
    ));
}

// ── S3: auto-compaction ───────────────────────────────────────────────────────

#[tokio::test]
async fn auto_compaction_fires_and_summary_reaches_provider() {
    let mut session = Session::with_system_prompt("you are terse");
    for i in 0..48 {
        session.add_message(omni_model::Message::user(format!("{i} {}", "x".repeat(900))));
    }
    let provider = ScriptedProvider::always_text("done");
    let last_request = Arc::clone(&provider.last_request);
    let config = AgentLoopConfig {
        compaction: omni_config::CompactionControl {
            enabled: true,
            context_token_threshold: 400,
            target_ratio: 0.6,
            ..omni_config::CompactionControl::default()
        },
        ..AgentLoopConfig::default()
    };
    let agent = loop_with_session(session, provider, ToolRegistry::new(), config, PermissionMode::Default);
    let events = agent.run("finish up").collect_events().await;

    assert!(events.iter().any(|e| matches!(
        e,
        SdkEvent::Status { subtype: StatusLevel::Info, message, .. }
            if message.contains("Auto-compaction applied.")
    )));
    let captured = last_request.lock().unwrap();
    let messages = &captured.as_ref().unwrap().messages;
    assert_eq!(messages[0].role, omni_model::Role::System);
    assert!(messages[1]
        .as_text()
        .unwrap()
        .starts_with("Compaction summary"));
    assert!(matches!(
        events.last().unwrap(),
        SdkEvent::Result { subtype: ResultKind::Success, result, .. } if result == "done"
    ));
}

// ── S5: structured output ─────────────────────────────────────────────────────

fn score_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"title": {"type": "string"}, "score": {"type": "number"}},
        "required": ["title", "score"],
    })
}

#[tokio::test]
async fn structured_output_strict_failure() {
    let config = AgentLoopConfig {
        structured_output: Some(StructuredOutputConfig::new(score_schema())),
        ..AgentLoopConfig::default()
    };
    let agent = loop_with(
        ScriptedProvider::always_text(r#"{"title":"ok","score":"not-a-number"}"#),
        ToolRegistry::new(),
        config,
        PermissionMode::Default,
    );
    let events = agent.run("rate it").collect_events().await;
    assert_single_result(&events);
    match events.last().unwrap() {
        SdkEvent::Result { subtype, result, error, .. } => {
            assert_eq!(*subtype, ResultKind::Error);
            assert!(result.to_lowercase().contains("structured output validation failed"));
            assert_eq!(error.as_ref().unwrap().code, ErrorCode::StructuredOutputInvalid);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn structured_output_success_attaches_value() {
    let config = AgentLoopConfig {
        structured_output: Some(StructuredOutputConfig::new(score_schema())),
        ..AgentLoopConfig::default()
    };
    let agent = loop_with(
        ScriptedProvider::always_text(r#"{"title":"ok","score":0.9}"#),
        ToolRegistry::new(),
        config,
        PermissionMode::Default,
    );
    let events = agent.run("rate it").collect_events().await;
    match events.last().unwrap() {
        SdkEvent::Result { structured, .. } => {
            assert_eq!(structured.as_ref().unwrap()["score"], 0.9);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn structured_output_lenient_degrades_to_warning() {
    let mut cfg = StructuredOutputConfig::new(score_schema());
    cfg.fail_on_validation_error = false;
    let config = AgentLoopConfig {
        structured_output: Some(cfg),
        ..AgentLoopConfig::default()
    };
    let agent = loop_with(
        ScriptedProvider::always_text("no json at all"),
        ToolRegistry::new(),
        config,
        PermissionMode::Default,
    );
    let events = agent.run("rate it").collect_events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SdkEvent::Status { subtype: StatusLevel::Warning, .. })));
    assert!(matches!(
        events.last().unwrap(),
        SdkEvent::Result { subtype: ResultKind::Success, .. }
    ));
}

// ── Provider failure ──────────────────────────────────────────────────────────

#[tokio::test]
async fn provider_failure_is_terminal_and_retryable() {
    let agent = loop_with(
        ScriptedProvider::failing("rate limited"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("hello").collect_events().await;
    assert_single_result(&events);
    match events.last().unwrap() {
        SdkEvent::Result { error, .. } => {
            let error = error.as_ref().unwrap();
            assert_eq!(error.code, ErrorCode::ProviderGenerateTextFailed);
            assert!(error.retryable);
            assert!(error.message.contains("rate limited"));
        }
        _ => unreachable!(),
    }
}

// ── Max turns ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exceeding_max_turns_fails_the_loop() {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    let responses: Vec<_> = (0..6)
        .map(|i| ScriptedProvider::tool_call_response(format!("t{i}"), "echo", json!({})))
        .collect();
    let config = AgentLoopConfig {
        max_turns: 3,
        ..AgentLoopConfig::default()
    };
    let agent = loop_with(
        ScriptedProvider::new(responses),
        tools,
        config,
        PermissionMode::Default,
    );
    let events = agent.run("loop forever").collect_events().await;
    assert_single_result(&events);
    let error_code = events.last().unwrap().error_code();
    assert_eq!(error_code, Some(ErrorCode::AgentLoopFailed));
}

// ── Interruption ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn interrupt_mid_query_yields_single_interrupted_result() {
    let mut tools = ToolRegistry::new();
    tools.register(WaitForCancelTool);
    let agent = loop_with(
        ScriptedProvider::tool_then_text("t1", "wait", json!({}), "never reached"),
        tools,
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let mut handle = agent.run("wait for me");
    let mut events = Vec::new();
    while let Some(ev) = handle.next_event().await {
        let is_tool_use = matches!(ev, SdkEvent::ToolUse { .. });
        events.push(ev);
        if is_tool_use {
            handle.interrupt();
        }
    }
    assert_single_result(&events);
    assert_eq!(events.last().unwrap().error_code(), Some(ErrorCode::Interrupted));
}

// ── Steering & follow-up queues ───────────────────────────────────────────────

#[tokio::test]
async fn steering_is_injected_before_the_model_call() {
    let provider = ScriptedProvider::always_text("noted");
    let last_request = Arc::clone(&provider.last_request);
    let mut session = Session::new();
    session.queue_steering("also check the logs");
    let agent = loop_with_session(
        session,
        provider,
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let _ = agent.run("main task").collect_events().await;
    let captured = last_request.lock().unwrap();
    let texts: Vec<String> = captured
        .as_ref()
        .unwrap()
        .messages
        .iter()
        .filter_map(|m| m.as_text().map(str::to_string))
        .collect();
    assert!(texts.contains(&"main task".to_string()));
    assert!(texts.contains(&"also check the logs".to_string()));
}

#[tokio::test]
async fn follow_up_extends_the_query_after_terminal_reply() {
    let mut session = Session::new();
    session.queue_follow_up("and the second part?");
    let agent = loop_with_session(
        session,
        ScriptedProvider::new(vec![
            ScriptedProvider::text_response("first answer"),
            ScriptedProvider::text_response("second answer"),
        ]),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("first part").collect_events().await;
    let texts: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            SdkEvent::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["first answer", "second answer"]);
    assert!(matches!(
        events.last().unwrap(),
        SdkEvent::Result { result, .. } if result == "second answer"
    ));
}

// ── Hooks in the tool path ────────────────────────────────────────────────────

fn block_rule(tool: &str, pattern: &str) -> HookRule {
    HookRule {
        name: "blocker".into(),
        enabled: true,
        event: "PreToolUse".into(),
        action: RuleAction::Block,
        tool_matcher: Some(tool.into()),
        conditions: vec![Condition {
            field: "tool_input.command".into(),
            operator: ConditionOperator::Contains,
            pattern: pattern.into(),
        }],
        reason: Some("dangerous command".into()),
    }
}

#[tokio::test]
async fn pre_tool_use_hook_blocks_execution() {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    let hooks = HookManager::new(vec![block_rule("echo", "rm -rf")], HooksFile::default(), 5);
    let permissions = Arc::new(PermissionManager::new(
        Arc::new(PolicyEngine::empty()),
        PermissionMode::DontAsk,
    ));
    let agent = Arc::new(AgentLoop::new(
        Session::new(),
        Arc::new(ScriptedProvider::tool_then_text(
            "t1",
            "echo",
            json!({"command": "rm -rf /"}),
            "done",
        )),
        Arc::new(tools),
        permissions,
        Arc::new(hooks),
        AgentLoopConfig::default(),
    ));
    let events = agent.run("dangerous").collect_events().await;
    let blocked = events
        .iter()
        .find(|e| matches!(e, SdkEvent::ToolResult { .. }))
        .unwrap();
    assert_eq!(blocked.error_code(), Some(ErrorCode::ToolBlockedByHook));
    assert_single_result(&events);
}

// ── Slash commands ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cost_command_is_intercepted_before_the_model() {
    let agent = loop_with(
        ScriptedProvider::failing("the model must not be called"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("/cost").collect_events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        SdkEvent::Status { subtype: StatusLevel::Info, message, .. } if message.contains("Session cost")
    )));
    assert!(matches!(
        events.last().unwrap(),
        SdkEvent::Result { subtype: ResultKind::Success, .. }
    ));
}

#[tokio::test]
async fn unknown_command_is_a_terminal_error() {
    let agent = loop_with(
        ScriptedProvider::always_text("unused"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    let events = agent.run("/frobnicate").collect_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].error_code(), Some(ErrorCode::UnknownCommand));
    assert_eq!(events[1].error_code(), Some(ErrorCode::UnknownCommand));
    assert_single_result(&events);
}

// ── Bubbled events ────────────────────────────────────────────────────────────

#[tokio::test]
async fn bus_events_bubble_at_turn_boundaries() {
    let session = Session::new();
    let bus = session.bus();
    let agent = loop_with_session(
        session,
        ScriptedProvider::always_text("done"),
        ToolRegistry::new(),
        AgentLoopConfig::default(),
        PermissionMode::Default,
    );
    bus.publish("bubble", &SdkEvent::status(StatusLevel::Info, "from the sub-agent"));
    let events = agent.run("go").collect_events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        SdkEvent::Status { message, .. } if message == "from the sub-agent"
    )));
    assert_single_result(&events);
}
