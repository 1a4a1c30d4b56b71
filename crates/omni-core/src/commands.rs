// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Slash commands: intercepted before any model turn runs.
//!
//! A command produces its own short event stream and a terminal result
//! text; it never reaches the provider or the tool pipeline.

use std::sync::Arc;

use omni_config::CompactionControl;

use crate::{CompactionOptions, SdkEvent, Session, StatusLevel};

pub struct CommandContext<'a> {
    pub session: &'a mut Session,
    pub compaction: &'a CompactionControl,
    /// Registered agent definition names, for `/agents`.
    pub agents: &'a [String],
    /// Discovered skill names, for `/skills`.
    pub skills: &'a [String],
}

pub struct CommandOutput {
    pub events: Vec<SdkEvent>,
    /// Text of the terminal `result` event the loop emits afterwards.
    pub result: String,
}

impl CommandOutput {
    fn info(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            events: vec![SdkEvent::status(StatusLevel::Info, message.clone())],
            result: message,
        }
    }
}

pub trait SlashCommand: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput;
}

pub struct CommandRegistry {
    commands: Vec<Arc<dyn SlashCommand>>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self { commands: Vec::new() }
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register(HelpCommand);
        r.register(CostCommand);
        r.register(CompactCommand);
        r.register(ClearCommand);
        r.register(AgentsCommand);
        r.register(SkillsCommand);
        r.register(IndexCommand);
        r.register(SecurityReviewCommand);
        r
    }

    pub fn register(&mut self, command: impl SlashCommand + 'static) {
        self.commands.push(Arc::new(command));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|c| c.name()).collect()
    }

    fn get(&self, name: &str) -> Option<Arc<dyn SlashCommand>> {
        self.commands.iter().find(|c| c.name() == name).cloned()
    }

    /// Whether `input` should be treated as a command line at all.
    pub fn is_command(input: &str) -> bool {
        input.trim_start().starts_with('/')
    }

    /// Run the command named by `input`.  Returns `None` for unknown names;
    /// the loop turns that into an `UNKNOWN_COMMAND` result.
    pub fn dispatch(&self, input: &str, ctx: &mut CommandContext<'_>) -> Option<CommandOutput> {
        let name = input
            .trim_start()
            .trim_start_matches('/')
            .split_whitespace()
            .next()?;
        let command = self.get(name)?;
        Some(command.run(ctx))
    }

    fn help_text(&self) -> String {
        let mut lines = vec!["Available commands:".to_string()];
        for c in &self.commands {
            lines.push(format!("  /{} - {}", c.name(), c.description()));
        }
        lines.join("\n")
    }
}

// ─── Built-in commands ────────────────────────────────────────────────────────

struct HelpCommand;

impl SlashCommand for HelpCommand {
    fn name(&self) -> &'static str {
        "help"
    }
    fn description(&self) -> &'static str {
        "list available commands"
    }
    fn run(&self, _ctx: &mut CommandContext<'_>) -> CommandOutput {
        // Lists the built-in command set; host-registered commands document
        // themselves.
        CommandOutput::info(CommandRegistry::with_builtins().help_text())
    }
}

struct CostCommand;

impl SlashCommand for CostCommand {
    fn name(&self) -> &'static str {
        "cost"
    }
    fn description(&self) -> &'static str {
        "show token usage and estimated cost for this session"
    }
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput {
        let usage = ctx.session.usage();
        CommandOutput::info(format!(
            "Session cost: ${:.4} (input {} tokens, output {} tokens, thinking {} tokens)",
            ctx.session.calculate_approximate_cost(),
            usage.input_tokens,
            usage.output_tokens,
            usage.thinking_tokens,
        ))
    }
}

struct CompactCommand;

impl SlashCommand for CompactCommand {
    fn name(&self) -> &'static str {
        "compact"
    }
    fn description(&self) -> &'static str {
        "compact the conversation history now"
    }
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput {
        let opts = CompactionOptions {
            max_tokens: ctx.session.estimate_context_tokens().max(1),
            target_ratio: ctx.compaction.target_ratio,
            inject_summary: ctx.compaction.inject_summary,
            summary_prefix: ctx.compaction.summary_prefix.clone(),
            preserve_system_prompt: ctx.compaction.preserve_system_prompt,
        };
        let outcome = ctx.session.compact_history(&opts);
        CommandOutput::info(format!(
            "Compacted history: {} -> {} tokens ({} messages dropped).",
            outcome.tokens_before, outcome.tokens_after, outcome.dropped
        ))
    }
}

struct ClearCommand;

impl SlashCommand for ClearCommand {
    fn name(&self) -> &'static str {
        "clear"
    }
    fn description(&self) -> &'static str {
        "clear the conversation, keeping the system prompt"
    }
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput {
        ctx.session.clear_history();
        CommandOutput::info("Conversation cleared.")
    }
}

struct AgentsCommand;

impl SlashCommand for AgentsCommand {
    fn name(&self) -> &'static str {
        "agents"
    }
    fn description(&self) -> &'static str {
        "list registered agent definitions"
    }
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput {
        if ctx.agents.is_empty() {
            CommandOutput::info("No agent definitions registered.")
        } else {
            CommandOutput::info(format!("Agents: {}", ctx.agents.join(", ")))
        }
    }
}

struct SkillsCommand;

impl SlashCommand for SkillsCommand {
    fn name(&self) -> &'static str {
        "skills"
    }
    fn description(&self) -> &'static str {
        "list discovered skills"
    }
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput {
        if ctx.skills.is_empty() {
            CommandOutput::info("No skills discovered.")
        } else {
            CommandOutput::info(format!("Skills: {}", ctx.skills.join(", ")))
        }
    }
}

struct IndexCommand;

impl SlashCommand for IndexCommand {
    fn name(&self) -> &'static str {
        "index"
    }
    fn description(&self) -> &'static str {
        "report semantic index status"
    }
    fn run(&self, _ctx: &mut CommandContext<'_>) -> CommandOutput {
        CommandOutput::info(
            "No semantic index provider is configured for this session; \
             semantic search falls back to plain text search.",
        )
    }
}

struct SecurityReviewCommand;

impl SlashCommand for SecurityReviewCommand {
    fn name(&self) -> &'static str {
        "security-review"
    }
    fn description(&self) -> &'static str {
        "queue a security review of recent changes for the next turn"
    }
    fn run(&self, ctx: &mut CommandContext<'_>) -> CommandOutput {
        ctx.session.queue_steering(
            "Perform a security review of the changes discussed in this conversation: \
             look for injection risks, permission escalations, secret handling, and \
             unsafe shell usage. Report findings ordered by severity.",
        );
        CommandOutput::info("Security review queued for the next turn.")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use omni_model::Usage;

    fn ctx<'a>(
        session: &'a mut Session,
        compaction: &'a CompactionControl,
    ) -> CommandContext<'a> {
        CommandContext {
            session,
            compaction,
            agents: &[],
            skills: &[],
        }
    }

    #[test]
    fn registry_knows_all_builtins() {
        let r = CommandRegistry::with_builtins();
        for name in [
            "help",
            "cost",
            "compact",
            "clear",
            "agents",
            "skills",
            "index",
            "security-review",
        ] {
            assert!(r.names().contains(&name), "missing command {name}");
        }
    }

    #[test]
    fn is_command_detects_leading_slash() {
        assert!(CommandRegistry::is_command("/help"));
        assert!(CommandRegistry::is_command("  /cost"));
        assert!(!CommandRegistry::is_command("hello /world"));
    }

    #[test]
    fn unknown_command_dispatches_to_none() {
        let r = CommandRegistry::with_builtins();
        let mut session = Session::new();
        let compaction = CompactionControl::default();
        assert!(r.dispatch("/definitely-not-a-command", &mut ctx(&mut session, &compaction)).is_none());
    }

    #[test]
    fn cost_command_reports_session_totals() {
        let r = CommandRegistry::with_builtins();
        let mut session = Session::new();
        session.add_usage(&Usage {
            input_tokens: 42,
            output_tokens: 7,
            thinking_tokens: 0,
        });
        session.add_cost(1.5);
        let compaction = CompactionControl::default();
        let out = r.dispatch("/cost", &mut ctx(&mut session, &compaction)).unwrap();
        assert!(out.result.contains("$1.5000"));
        assert!(out.result.contains("42"));
    }

    #[test]
    fn clear_command_empties_history() {
        let r = CommandRegistry::with_builtins();
        let mut session = Session::with_system_prompt("sys");
        session.add_message(omni_model::Message::user("hi"));
        let compaction = CompactionControl::default();
        let out = r.dispatch("/clear", &mut ctx(&mut session, &compaction)).unwrap();
        assert_eq!(out.result, "Conversation cleared.");
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn compact_command_reports_token_counts() {
        let r = CommandRegistry::with_builtins();
        let mut session = Session::with_system_prompt("sys");
        for _ in 0..30 {
            session.add_message(omni_model::Message::user("x".repeat(200)));
        }
        let compaction = CompactionControl::default();
        let out = r.dispatch("/compact", &mut ctx(&mut session, &compaction)).unwrap();
        assert!(out.result.starts_with("Compacted history:"));
    }

    #[test]
    fn security_review_queues_steering() {
        let r = CommandRegistry::with_builtins();
        let mut session = Session::new();
        let compaction = CompactionControl::default();
        r.dispatch("/security-review", &mut ctx(&mut session, &compaction)).unwrap();
        let (steering, _) = session.consume_queues();
        assert_eq!(steering.len(), 1);
        assert!(steering[0].contains("security review"));
    }

    #[test]
    fn help_lists_every_command() {
        let r = CommandRegistry::with_builtins();
        let mut session = Session::new();
        let compaction = CompactionControl::default();
        let out = r.dispatch("/help", &mut ctx(&mut session, &compaction)).unwrap();
        assert!(out.result.contains("/cost"));
        assert!(out.result.contains("/security-review"));
    }
}
