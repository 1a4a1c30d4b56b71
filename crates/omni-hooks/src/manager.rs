// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{parse_rule_file, CommandHook, HookEvent, HookRule, HooksFile, RuleAction};

/// The merged result of dispatching one lifecycle event.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    /// Set by any declarative `block` rule; short-circuits the event.
    pub block: bool,
    pub reason: Option<String>,
    /// Aggregated `warn` rule texts, for appending to the system message.
    pub system_message: Option<String>,
    /// The payload after sequential command-hook mutations.
    pub payload: Value,
}

/// Dispatches lifecycle events to declarative rules and command hooks.
///
/// Declarative rules run first and can block the event without spawning any
/// process.  Command hooks then run sequentially so order-sensitive payload
/// mutations compose deterministically.  Nothing in here is fatal to the
/// caller: rule files that fail to parse are skipped, commands that fail or
/// time out are logged and ignored.
pub struct HookManager {
    rules: Vec<HookRule>,
    commands: HooksFile,
    default_timeout_secs: u64,
}

impl HookManager {
    pub fn new(rules: Vec<HookRule>, commands: HooksFile, default_timeout_secs: u64) -> Self {
        Self {
            rules,
            commands,
            default_timeout_secs,
        }
    }

    /// A manager with nothing registered; every dispatch is a no-op.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), HooksFile::default(), 10)
    }

    /// Load rules from a directory of markdown files and commands from a
    /// `hooks.json` file.  Missing paths yield an empty manager.
    pub fn load(rules_dir: &Path, hooks_file: &Path, default_timeout_secs: u64) -> Self {
        let mut rules = Vec::new();
        if let Ok(entries) = std::fs::read_dir(rules_dir) {
            let mut paths: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
                .collect();
            paths.sort();
            for path in paths {
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        if let Some(rule) = parse_rule_file(&text) {
                            debug!(rule = %rule.name, path = %path.display(), "loaded hook rule");
                            rules.push(rule);
                        }
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "unreadable rule file"),
                }
            }
        }
        let commands = HooksFile::load(hooks_file).unwrap_or_default();
        Self::new(rules, commands, default_timeout_secs)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Whether anything at all is registered for `event`.  Callers use this
    /// to skip the hook bracket entirely for quiet events.
    pub fn is_active(&self, event: HookEvent) -> bool {
        let name = event.as_str();
        self.rules.iter().any(|r| r.enabled && r.event == name)
            || self
                .commands
                .hooks
                .get(name)
                .map(|v| !v.is_empty())
                .unwrap_or(false)
    }

    /// Dispatch one event with its payload.
    ///
    /// The payload must contain at least `event_name`; tool events add
    /// `tool_name` and `tool_input`.
    pub async fn dispatch(&self, event: HookEvent, payload: Value) -> HookOutcome {
        let mut outcome = HookOutcome {
            payload,
            ..HookOutcome::default()
        };
        let event_name = event.as_str();

        // Phase 1: declarative rules.  The first block wins; warns aggregate.
        let mut warns: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !rule.applies(event_name, &outcome.payload) {
                continue;
            }
            match rule.action {
                RuleAction::Block => {
                    outcome.block = true;
                    outcome.reason = Some(
                        rule.reason
                            .clone()
                            .unwrap_or_else(|| format!("blocked by hook rule '{}'", rule.name)),
                    );
                    debug!(rule = %rule.name, event = event_name, "hook rule blocked event");
                    return outcome;
                }
                RuleAction::Warn => {
                    warns.push(
                        rule.reason
                            .clone()
                            .unwrap_or_else(|| format!("warning from hook rule '{}'", rule.name)),
                    );
                }
                RuleAction::Allow => {}
            }
        }
        if !warns.is_empty() {
            outcome.system_message = Some(warns.join("\n"));
        }

        // Phase 2: command hooks, sequentially, merging stdout JSON.
        if let Some(hooks) = self.commands.hooks.get(event_name) {
            for hook in hooks {
                if let Some(mutation) = hook.run(&outcome.payload, self.default_timeout_secs).await
                {
                    merge_payload(&mut outcome.payload, mutation);
                    // A command hook may also block by returning {"block": true}.
                    if outcome
                        .payload
                        .get("block")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        outcome.block = true;
                        outcome.reason = outcome
                            .payload
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                        return outcome;
                    }
                }
            }
        }

        outcome
    }
}

/// Shallow merge: top-level keys from `src` replace those in `dst`.
fn merge_payload(dst: &mut Value, src: Value) {
    if let (Value::Object(d), Value::Object(s)) = (dst, src) {
        for (k, v) in s {
            d.insert(k, v);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
