// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: drives one query as a cancellable event stream.
//!
//! Each iteration is one turn: drain bubbled events, gate on interrupt,
//! budget and turn policy, inject steering, compact if needed, call the
//! provider, then either finish (no tool calls) or run each tool call
//! through the permission check and hook brackets sequentially.  Every
//! query ends with exactly one `Result` event, whatever goes wrong.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use omni_config::{AgentConfig, CompactionControl, ToolRunnerMode};
use omni_hooks::{HookEvent, HookManager, HookOutcome};
use omni_log::{estimate_turn_cost, EventLogEntry, EventLogStore};
use omni_model::{GenerateOptions, Message, ModelProvider, ModelRouter, Usage};
use omni_policy::{PermissionManager, PolicyBehavior};
use omni_tools::{CancelToken, ToolCall, ToolContext, ToolKind, ToolRegistry};

use crate::{
    commands::{CommandContext, CommandRegistry},
    compact::CompactionOptions,
    events::{ErrorCode, ErrorInfo, ErrorSource, HookPhase, SdkEvent, StatusLevel},
    query::QueryHandle,
    structured::{parse_structured, StructuredOutputConfig},
    truncate::truncate_tool_result,
    watch::ConfigWatcher,
    Session, SessionBus,
};

#[derive(Clone)]
pub struct AgentLoopConfig {
    pub max_turns: u32,
    pub max_cost_usd: Option<f64>,
    pub tool_runner_mode: ToolRunnerMode,
    pub compaction: CompactionControl,
    pub tool_result_token_cap: usize,
    pub structured_output: Option<StructuredOutputConfig>,
    pub working_directory: PathBuf,
    pub agent_name: Option<String>,
    /// Names surfaced by `/agents` and `/skills`.
    pub agents: Vec<String>,
    pub skills: Vec<String>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self::from_agent_config(&AgentConfig::default(), PathBuf::from("."))
    }
}

impl AgentLoopConfig {
    pub fn from_agent_config(cfg: &AgentConfig, working_directory: PathBuf) -> Self {
        Self {
            max_turns: cfg.max_turns,
            max_cost_usd: cfg.max_cost_usd,
            tool_runner_mode: cfg.tool_runner_mode,
            compaction: cfg.compaction.clone(),
            tool_result_token_cap: cfg.tool_result_token_cap,
            structured_output: None,
            working_directory,
            agent_name: cfg.agent_name.clone(),
            agents: Vec::new(),
            skills: Vec::new(),
        }
    }
}

pub struct AgentLoop {
    session: Arc<Mutex<Session>>,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    permissions: Arc<PermissionManager>,
    hooks: Arc<HookManager>,
    commands: Arc<CommandRegistry>,
    router: Option<Arc<ModelRouter>>,
    event_log: Option<Arc<EventLogStore>>,
    config: AgentLoopConfig,
    watcher: Mutex<ConfigWatcher>,
    /// Sub-agent events captured off the session bus, emitted at the next
    /// turn boundary.
    bubbled: Arc<Mutex<VecDeque<SdkEvent>>>,
    /// When set, this loop is a sub-agent: its bubbleable events are also
    /// published onto the parent session's bus.
    bubble_bus: Option<Arc<SessionBus>>,
}

impl AgentLoop {
    pub fn new(
        session: Session,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        permissions: Arc<PermissionManager>,
        hooks: Arc<HookManager>,
        config: AgentLoopConfig,
    ) -> Self {
        let bus = session.bus();
        let session = Arc::new(Mutex::new(session));
        let bubbled: Arc<Mutex<VecDeque<SdkEvent>>> = Arc::new(Mutex::new(VecDeque::new()));
        let queue = Arc::clone(&bubbled);
        bus.subscribe("bubble", move |ev| {
            queue.lock().expect("bubble queue poisoned").push_back(ev.clone());
        });
        let watcher = Mutex::new(ConfigWatcher::new(config.working_directory.clone()));
        Self {
            session,
            provider,
            tools,
            permissions,
            hooks,
            commands: Arc::new(CommandRegistry::with_builtins()),
            router: None,
            event_log: None,
            config,
            watcher,
            bubbled,
            bubble_bus: None,
        }
    }

    pub fn with_router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_event_log(mut self, log: Arc<EventLogStore>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = Arc::new(commands);
        self
    }

    /// Make this loop a sub-agent of the session owning `parent_bus`.
    pub fn bubble_to(mut self, parent_bus: Arc<SessionBus>) -> Self {
        self.bubble_bus = Some(parent_bus);
        self
    }

    pub fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    pub fn permissions(&self) -> Arc<PermissionManager> {
        Arc::clone(&self.permissions)
    }

    /// Start one query.  The returned handle is the only way to observe it.
    pub fn run(self: &Arc<Self>, input: impl Into<String>) -> QueryHandle {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancelToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let input = input.into();
        tokio::spawn(async move {
            this.run_query(tx, token, input).await;
        });
        QueryHandle::new(rx, cancel, Arc::clone(&self.permissions), Arc::clone(&self.session))
    }

    async fn run_query(&self, tx: mpsc::Sender<SdkEvent>, cancel: CancelToken, input: String) {
        let mut emitted_terminal = false;
        match self.drive(&tx, &cancel, &input, &mut emitted_terminal).await {
            Ok(()) if emitted_terminal => {}
            Ok(()) => {
                let err = ErrorInfo::new(
                    ErrorCode::AgentLoopFailed,
                    ErrorSource::Core,
                    "agent loop ended without a terminal result",
                );
                self.emit(&tx, SdkEvent::result_error(err.message.clone(), err)).await;
            }
            Err(e) => {
                warn!(error = %e, "agent loop failed");
                if !emitted_terminal {
                    let err =
                        ErrorInfo::new(ErrorCode::AgentLoopFailed, ErrorSource::Core, e.to_string());
                    self.emit(&tx, SdkEvent::result_error(format!("Agent loop failed: {e}"), err))
                        .await;
                }
            }
        }
    }

    // ── Emission & logging ────────────────────────────────────────────────────

    async fn emit(&self, tx: &mpsc::Sender<SdkEvent>, event: SdkEvent) {
        self.log_event(&event);
        if let Some(bus) = &self.bubble_bus {
            if event.is_bubbleable() {
                bus.publish("bubble", &event);
            }
        }
        let _ = tx.send(event).await;
    }

    async fn finish(&self, tx: &mpsc::Sender<SdkEvent>, emitted: &mut bool, event: SdkEvent) {
        *emitted = true;
        self.emit(tx, event).await;
    }

    fn log(&self, kind: &str, payload: serde_json::Value) {
        if let Some(log) = &self.event_log {
            let session_id = self.session.lock().expect("session lock poisoned").id.clone();
            let mut entry = EventLogEntry::now(kind, payload);
            entry.thread_id = Some(session_id);
            log.append(entry);
        }
    }

    fn log_event(&self, event: &SdkEvent) {
        if self.event_log.is_none() {
            return;
        }
        match event {
            SdkEvent::ToolUse {
                tool,
                input,
                tool_use_id,
                ..
            } => self.log(
                "tool_use",
                json!({"tool": tool, "tool_use_id": tool_use_id, "input": input}),
            ),
            SdkEvent::ToolResult {
                tool,
                tool_use_id,
                is_error,
                ..
            } => self.log(
                "tool_result",
                json!({"tool": tool, "tool_use_id": tool_use_id, "is_error": is_error.unwrap_or(false)}),
            ),
            SdkEvent::Result { subtype, error, .. } => self.log(
                "result",
                json!({"subtype": subtype, "code": error.as_ref().map(|e| e.code)}),
            ),
            _ => {}
        }
    }

    async fn run_hook(
        &self,
        tx: &mpsc::Sender<SdkEvent>,
        event: HookEvent,
        payload: serde_json::Value,
        force_bracket: bool,
    ) -> HookOutcome {
        if !force_bracket && !self.hooks.is_active(event) {
            return HookOutcome {
                payload,
                ..HookOutcome::default()
            };
        }
        self.emit(tx, SdkEvent::hook(HookPhase::Started, event.as_str(), event.as_str()))
            .await;
        let outcome = self.hooks.dispatch(event, payload).await;
        self.emit(tx, SdkEvent::hook(HookPhase::Response, event.as_str(), event.as_str()))
            .await;
        outcome
    }

    fn record_tool_result(&self, tool_use_id: &str, tool: &str, content: &str, is_error: bool) {
        let msg = if is_error {
            Message::tool_error(tool_use_id, tool, content)
        } else {
            Message::tool_result(tool_use_id, tool, content)
        };
        self.session.lock().expect("session lock poisoned").add_message(msg);
    }

    fn interrupted() -> SdkEvent {
        SdkEvent::result_error(
            "Interrupted",
            ErrorInfo::new(ErrorCode::Interrupted, ErrorSource::Core, "query interrupted"),
        )
    }

    // ── The state machine ─────────────────────────────────────────────────────

    async fn drive(
        &self,
        tx: &mpsc::Sender<SdkEvent>,
        cancel: &CancelToken,
        input: &str,
        emitted: &mut bool,
    ) -> anyhow::Result<()> {
        if CommandRegistry::is_command(input) {
            return self.drive_command(tx, input, emitted).await;
        }

        self.emit(tx, SdkEvent::status(StatusLevel::Info, "Agent loop started"))
            .await;
        self.log("message", json!({"role": "user", "text": input}));
        self.session
            .lock()
            .expect("session lock poisoned")
            .add_message(Message::user(input));
        self.run_hook(tx, HookEvent::SessionStart, json!({"event_name": "SessionStart"}), false)
            .await;

        let mut turn_count: u32 = 0;
        let mut pending_follow_ups: VecDeque<String> = VecDeque::new();
        let mut provider_meta: (Option<String>, Option<String>, Option<String>) = (None, None, None);

        loop {
            // Bubbled sub-agent events surface only at turn boundaries so
            // they never interleave with a tool iteration.
            loop {
                let bubbled = self.bubbled.lock().expect("bubble queue poisoned").pop_front();
                match bubbled {
                    Some(ev) => self.emit(tx, ev).await,
                    None => break,
                }
            }

            if cancel.is_cancelled() {
                self.finish(tx, emitted, Self::interrupted()).await;
                return Ok(());
            }

            turn_count += 1;
            if turn_count > self.config.max_turns {
                anyhow::bail!("Max turns reached");
            }

            let current_cost = self
                .session
                .lock()
                .expect("session lock poisoned")
                .calculate_approximate_cost();
            if let Some(max) = self.config.max_cost_usd {
                if current_cost > max {
                    let msg =
                        format!("Execution budget exceeded: ${current_cost:.4} > ${max:.4}");
                    let err = ErrorInfo::new(ErrorCode::BudgetExceeded, ErrorSource::Core, msg.clone());
                    self.emit(tx, SdkEvent::status_error(msg.clone(), err.clone())).await;
                    self.finish(tx, emitted, SdkEvent::result_error(msg, err)).await;
                    return Ok(());
                }
            }

            let turn_decision = self.permissions.evaluate_turn(
                self.config.agent_name.as_deref(),
                turn_count,
                current_cost,
            );
            if turn_decision.behavior == PolicyBehavior::Deny {
                let msg = turn_decision
                    .reason
                    .unwrap_or_else(|| "turn denied by policy".to_string());
                let err = ErrorInfo::new(ErrorCode::PolicyDeniedTurn, ErrorSource::Permission, msg.clone());
                self.finish(tx, emitted, SdkEvent::result_error(msg, err)).await;
                return Ok(());
            }

            {
                let mut session = self.session.lock().expect("session lock poisoned");
                let (steering, follow_ups) = session.consume_queues();
                for text in steering {
                    session.add_message(Message::user(text));
                }
                pending_follow_ups.extend(follow_ups);
            }

            if self.config.compaction.enabled {
                let outcome = {
                    let mut session = self.session.lock().expect("session lock poisoned");
                    if session.estimate_context_tokens()
                        > self.config.compaction.context_token_threshold
                    {
                        Some(session.compact_history(&CompactionOptions {
                            max_tokens: self.config.compaction.context_token_threshold,
                            target_ratio: self.config.compaction.target_ratio,
                            inject_summary: self.config.compaction.inject_summary,
                            summary_prefix: self.config.compaction.summary_prefix.clone(),
                            preserve_system_prompt: self.config.compaction.preserve_system_prompt,
                        }))
                    } else {
                        None
                    }
                };
                if let Some(o) = outcome {
                    self.emit(
                        tx,
                        SdkEvent::status(
                            StatusLevel::Info,
                            format!(
                                "Auto-compaction applied. Context reduced from {} to {} tokens.",
                                o.tokens_before, o.tokens_after
                            ),
                        ),
                    )
                    .await;
                }
            }

            let changes = self.watcher.lock().expect("watcher lock poisoned").scan();
            if !changes.is_empty() {
                debug!(count = changes.len(), "config files changed");
                self.run_hook(
                    tx,
                    HookEvent::ConfigChange,
                    json!({"event_name": "ConfigChange", "changes": changes}),
                    true,
                )
                .await;
            }

            // Model call.
            let messages: Vec<Message> = self
                .session
                .lock()
                .expect("session lock poisoned")
                .messages()
                .to_vec();
            let tool_schemas: Vec<omni_model::ToolSchema> = self
                .tools
                .schemas()
                .into_iter()
                .map(|s| omni_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect();
            let preferred = self.provider.model_name().to_string();
            let chosen = self
                .router
                .as_ref()
                .and_then(|r| r.choose_model(self.provider.name(), Some(&preferred)));
            let options = GenerateOptions {
                model: chosen.clone(),
                ..GenerateOptions::default()
            };
            let call = match self.config.tool_runner_mode {
                ToolRunnerMode::ProviderNative => {
                    self.provider
                        .run_tools_native(&messages, &tool_schemas, &options)
                        .await
                }
                ToolRunnerMode::Loop => {
                    self.provider
                        .generate_text(&messages, &tool_schemas, &options)
                        .await
                }
            };
            let response = match call {
                Ok(r) => r,
                Err(e) => {
                    if let Some(router) = &self.router {
                        router.mark_failure(
                            self.provider.name(),
                            chosen.as_deref().unwrap_or(&preferred),
                            &e.to_string(),
                            None,
                        );
                    }
                    self.log(
                        "turn_completed",
                        json!({
                            "status": "error",
                            "provider": self.provider.name(),
                            "model": preferred,
                            "usage": Usage::default(),
                        }),
                    );
                    let msg = format!("Provider call failed: {e}");
                    let err = ErrorInfo::new(
                        ErrorCode::ProviderGenerateTextFailed,
                        ErrorSource::Provider,
                        msg.clone(),
                    )
                    .retryable();
                    self.emit(tx, SdkEvent::status_error(msg.clone(), err.clone())).await;
                    self.finish(tx, emitted, SdkEvent::result_error(msg, err)).await;
                    return Ok(());
                }
            };

            let usage = response.usage.unwrap_or_default();
            let provider_name = response
                .provider
                .clone()
                .unwrap_or_else(|| self.provider.name().to_string());
            let model_name = response.model.clone().unwrap_or_else(|| preferred.clone());
            let turn_cost = estimate_turn_cost(&provider_name, &model_name, &usage);
            {
                let mut session = self.session.lock().expect("session lock poisoned");
                session.add_usage(&usage);
                session.add_cost(turn_cost);
                session.add_message(Message::assistant_with_tool_calls(
                    response.text.clone(),
                    response.tool_calls.clone().unwrap_or_default(),
                ));
            }
            self.log(
                "turn_completed",
                json!({
                    "status": "success",
                    "provider": provider_name,
                    "model": model_name,
                    "usage": usage,
                }),
            );
            provider_meta = (
                response.request_id.clone(),
                Some(provider_name.clone()),
                Some(model_name.clone()),
            );

            if !response.text.is_empty() {
                self.log("message", json!({"role": "assistant", "text": response.text}));
                self.emit(
                    tx,
                    SdkEvent::text(
                        response.text.clone(),
                        response.request_id.clone(),
                        Some(provider_name.clone()),
                        Some(model_name.clone()),
                    ),
                )
                .await;
            }

            // Missing and empty tool call lists are the same terminal branch.
            let tool_calls = response.tool_calls_or_empty().to_vec();
            if tool_calls.is_empty() {
                if let Some(follow_up) = pending_follow_ups.pop_front() {
                    self.session
                        .lock()
                        .expect("session lock poisoned")
                        .add_message(Message::user(follow_up));
                    continue;
                }

                let mut structured = None;
                if let Some(cfg) = &self.config.structured_output {
                    match parse_structured(&response.text, cfg) {
                        Ok(v) => structured = Some(v),
                        Err(msg) => {
                            if cfg.fail_on_validation_error {
                                let err = ErrorInfo::new(
                                    ErrorCode::StructuredOutputInvalid,
                                    ErrorSource::Core,
                                    msg.clone(),
                                );
                                self.finish(tx, emitted, SdkEvent::result_error(msg, err)).await;
                                return Ok(());
                            }
                            self.emit(tx, SdkEvent::status(StatusLevel::Warning, msg)).await;
                        }
                    }
                }

                self.run_hook(tx, HookEvent::SessionEnd, json!({"event_name": "SessionEnd"}), false)
                    .await;

                if cancel.is_cancelled() {
                    self.finish(tx, emitted, Self::interrupted()).await;
                    return Ok(());
                }
                let usage_total = self.session.lock().expect("session lock poisoned").usage();
                self.finish(
                    tx,
                    emitted,
                    SdkEvent::result_success(
                        response.text.clone(),
                        structured,
                        Some(usage_total),
                        provider_meta.0.clone(),
                        provider_meta.1.clone(),
                        provider_meta.2.clone(),
                    ),
                )
                .await;
                return Ok(());
            }

            for tc in &tool_calls {
                if cancel.is_cancelled() {
                    self.finish(tx, emitted, Self::interrupted()).await;
                    return Ok(());
                }
                self.emit(tx, SdkEvent::tool_use(tc.name.clone(), tc.args.clone(), tc.id.clone()))
                    .await;

                self.run_hook(
                    tx,
                    HookEvent::PermissionRequest,
                    json!({
                        "event_name": "PermissionRequest",
                        "tool_name": tc.name,
                        "tool_input": tc.args,
                    }),
                    true,
                )
                .await;

                let kind = self
                    .tools
                    .get(&tc.name)
                    .map(|t| t.kind())
                    .unwrap_or(ToolKind::Execute);
                let cost_now = self
                    .session
                    .lock()
                    .expect("session lock poisoned")
                    .calculate_approximate_cost();
                let decision = self.permissions.check_permission(
                    &tc.name,
                    kind,
                    &tc.args,
                    self.config.agent_name.as_deref(),
                    turn_count,
                    cost_now,
                );
                if !decision.allow {
                    let reason = decision
                        .reason
                        .unwrap_or_else(|| "permission denied".to_string());
                    let text = format!("Tool execution denied: {reason}");
                    self.record_tool_result(&tc.id, &tc.name, &text, true);
                    let err = ErrorInfo::new(
                        ErrorCode::ToolPermissionDenied,
                        ErrorSource::Permission,
                        reason,
                    );
                    let suggestions =
                        (!decision.suggestions.is_empty()).then(|| decision.suggestions.clone());
                    self.emit(
                        tx,
                        SdkEvent::tool_result_err(tc.name.clone(), text, tc.id.clone(), err, suggestions),
                    )
                    .await;
                    continue;
                }

                let Some(tool) = self.tools.get(&tc.name) else {
                    let text = format!("Tool not found: {}", tc.name);
                    self.record_tool_result(&tc.id, &tc.name, &text, true);
                    let err =
                        ErrorInfo::new(ErrorCode::ToolNotFound, ErrorSource::Tool, text.clone());
                    self.emit(
                        tx,
                        SdkEvent::tool_result_err(tc.name.clone(), text, tc.id.clone(), err, None),
                    )
                    .await;
                    continue;
                };

                let pre = self
                    .run_hook(
                        tx,
                        HookEvent::PreToolUse,
                        json!({
                            "event_name": "PreToolUse",
                            "tool_name": tc.name,
                            "tool_input": tc.args,
                        }),
                        false,
                    )
                    .await;
                if pre.block {
                    let reason = pre.reason.unwrap_or_else(|| "blocked by hook".to_string());
                    let text = format!("Tool blocked by hook: {reason}");
                    self.record_tool_result(&tc.id, &tc.name, &text, true);
                    let err =
                        ErrorInfo::new(ErrorCode::ToolBlockedByHook, ErrorSource::Hook, reason);
                    self.emit(
                        tx,
                        SdkEvent::tool_result_err(tc.name.clone(), text, tc.id.clone(), err, None),
                    )
                    .await;
                    continue;
                }
                // A PreToolUse hook may rewrite the arguments.
                let args = pre
                    .payload
                    .get("tool_input")
                    .cloned()
                    .unwrap_or_else(|| tc.args.clone());

                self.emit(
                    tx,
                    SdkEvent::status(StatusLevel::Progress, format!("Executing tool {}", tc.name)),
                )
                .await;

                let ctx = ToolContext {
                    working_directory: Some(self.config.working_directory.clone()),
                    tool_use_id: tc.id.clone(),
                    cancel: cancel.clone(),
                    ..ToolContext::default()
                };
                let call = ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    args,
                };
                let output = tool.execute(&call, &ctx).await;

                let post = self
                    .run_hook(
                        tx,
                        HookEvent::PostToolUse,
                        json!({
                            "event_name": "PostToolUse",
                            "tool_name": tc.name,
                            "result": output.content,
                            "is_error": output.is_error,
                        }),
                        false,
                    )
                    .await;
                // A PostToolUse hook may rewrite the result.
                let content = post
                    .payload
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| output.content.clone());
                let content = truncate_tool_result(&content, self.config.tool_result_token_cap);

                self.record_tool_result(&tc.id, &tc.name, &content, output.is_error);
                if output.is_error {
                    let err = ErrorInfo::new(
                        ErrorCode::ToolExecutionFailed,
                        ErrorSource::Tool,
                        content.clone(),
                    );
                    self.emit(
                        tx,
                        SdkEvent::tool_result_err(tc.name.clone(), content, tc.id.clone(), err, None),
                    )
                    .await;
                } else {
                    self.emit(tx, SdkEvent::tool_result_ok(tc.name.clone(), content, tc.id.clone()))
                        .await;
                }
            }
        }
    }

    async fn drive_command(
        &self,
        tx: &mpsc::Sender<SdkEvent>,
        input: &str,
        emitted: &mut bool,
    ) -> anyhow::Result<()> {
        let output = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let mut ctx = CommandContext {
                session: &mut *session,
                compaction: &self.config.compaction,
                agents: &self.config.agents,
                skills: &self.config.skills,
            };
            self.commands.dispatch(input, &mut ctx)
        };
        match output {
            Some(out) => {
                for ev in out.events {
                    self.emit(tx, ev).await;
                }
                self.finish(
                    tx,
                    emitted,
                    SdkEvent::result_success(out.result, None, None, None, None, None),
                )
                .await;
            }
            None => {
                let msg = format!("Unknown command: {}", input.trim());
                let err = ErrorInfo::new(ErrorCode::UnknownCommand, ErrorSource::Command, msg.clone());
                self.emit(tx, SdkEvent::status_error(msg.clone(), err.clone())).await;
                self.finish(tx, emitted, SdkEvent::result_error(msg, err)).await;
            }
        }
        Ok(())
    }
}
