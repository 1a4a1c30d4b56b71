// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, RwLock};

use omni_config::PermissionMode;
use omni_tools::ToolKind;

use crate::{PolicyBehavior, PolicyEngine, ToolCallContext, TurnContext, PolicyDecision};

/// The outcome of a permission check, ready to surface to the event stream.
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    pub allow: bool,
    pub reason: Option<String>,
    pub rule_id: Option<String>,
    /// Actionable alternatives shown to the model/user on deny.
    pub suggestions: Vec<String>,
}

impl PermissionDecision {
    fn allowed() -> Self {
        Self {
            allow: true,
            reason: None,
            rule_id: None,
            suggestions: Vec::new(),
        }
    }

    fn denied(reason: String, rule_id: Option<String>, suggestions: Vec<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
            rule_id,
            suggestions,
        }
    }
}

/// Per-tool gate layered over the policy engine.
///
/// The engine answers allow/deny/ask from declarative rules; the manager
/// resolves `ask` (and side-effect classes) according to the live permission
/// mode.  The mode is behind a lock so a running query can be switched
/// between modes from the outside.
pub struct PermissionManager {
    engine: Arc<PolicyEngine>,
    mode: RwLock<PermissionMode>,
}

impl PermissionManager {
    pub fn new(engine: Arc<PolicyEngine>, mode: PermissionMode) -> Self {
        Self {
            engine,
            mode: RwLock::new(mode),
        }
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.read().expect("mode lock poisoned")
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.write().expect("mode lock poisoned") = mode;
    }

    /// Decide whether one tool call may run.
    pub fn check_permission(
        &self,
        tool_name: &str,
        tool_kind: ToolKind,
        input: &serde_json::Value,
        agent_name: Option<&str>,
        turn_count: u32,
        cost_usd: f64,
    ) -> PermissionDecision {
        let mode = self.mode();
        if mode == PermissionMode::BypassPermissions {
            return PermissionDecision::allowed();
        }

        let decision = self.engine.evaluate_tool(&ToolCallContext {
            tool_name,
            input,
            permission_mode: mode,
            agent_name,
            turn_count,
            cost_usd,
        });

        if decision.behavior == PolicyBehavior::Deny {
            return PermissionDecision::denied(
                decision
                    .reason
                    .unwrap_or_else(|| format!("tool '{tool_name}' is denied by policy")),
                decision.rule_id,
                vec![],
            );
        }

        // Plan mode forbids side effects outright, even for policy-allowed
        // tools; the suggestions tell the model how to make progress.
        if mode == PermissionMode::Plan && tool_kind != ToolKind::ReadOnly {
            return PermissionDecision::denied(
                format!("tool '{tool_name}' has side effects and is unavailable in plan mode"),
                decision.rule_id,
                plan_mode_suggestions(),
            );
        }

        match decision.behavior {
            PolicyBehavior::Allow => PermissionDecision::allowed(),
            PolicyBehavior::Ask => self.resolve_ask(tool_name, tool_kind, mode, decision),
            PolicyBehavior::Deny => unreachable!("deny handled above"),
        }
    }

    /// Collapse an `ask` result according to the mode.
    fn resolve_ask(
        &self,
        tool_name: &str,
        tool_kind: ToolKind,
        mode: PermissionMode,
        decision: PolicyDecision,
    ) -> PermissionDecision {
        match mode {
            PermissionMode::DontAsk => PermissionDecision::allowed(),
            PermissionMode::AcceptEdits if tool_kind == ToolKind::Edit => {
                PermissionDecision::allowed()
            }
            // default / plan / acceptEdits-for-non-edits: read-only tools run,
            // everything else is refused with guidance.
            _ if tool_kind == ToolKind::ReadOnly => PermissionDecision::allowed(),
            _ => PermissionDecision::denied(
                decision
                    .reason
                    .unwrap_or_else(|| format!("tool '{tool_name}' requires approval")),
                decision.rule_id,
                ask_suggestions(),
            ),
        }
    }

    /// Turn-level gate; pure pass-through to the engine with the live mode.
    pub fn evaluate_turn(
        &self,
        agent_name: Option<&str>,
        turn_count: u32,
        cost_usd: f64,
    ) -> PolicyDecision {
        self.engine.evaluate_turn(&TurnContext {
            agent_name,
            turn_count,
            cost_usd,
            permission_mode: self.mode(),
        })
    }
}

fn plan_mode_suggestions() -> Vec<String> {
    vec![
        "Describe the intended change instead of executing it.".to_string(),
        "Switch the permission mode to acceptEdits to apply file edits.".to_string(),
        "Switch the permission mode to default to run tools with approval.".to_string(),
    ]
}

fn ask_suggestions() -> Vec<String> {
    vec![
        "Add an allow rule for this tool to the workspace policy file.".to_string(),
        "Switch the permission mode to dontAsk to auto-approve prompts.".to_string(),
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{PolicyRule, PolicySet, PolicyTier};

    fn manager_with(rules: Vec<PolicyRule>, mode: PermissionMode) -> PermissionManager {
        PermissionManager::new(
            Arc::new(PolicyEngine::new(PolicySet {
                rules,
                turn_rules: vec![],
            })),
            mode,
        )
    }

    fn ask_rule(tool: &str) -> PolicyRule {
        PolicyRule {
            id: format!("ask-{tool}"),
            effect: PolicyBehavior::Ask,
            tools: Some(vec![tool.into()]),
            command_patterns: None,
            arg_matchers: None,
            mode: None,
            priority: 0,
            reason: None,
            tier: PolicyTier::Workspace,
        }
    }

    #[test]
    fn bypass_mode_allows_everything() {
        let m = manager_with(vec![], PermissionMode::BypassPermissions);
        let d = m.check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0);
        assert!(d.allow);
    }

    #[test]
    fn plan_mode_denies_side_effects_with_suggestions() {
        let m = manager_with(vec![], PermissionMode::Plan);
        let d = m.check_permission(
            "bash",
            ToolKind::Execute,
            &json!({"command": "rm -rf /tmp"}),
            None,
            1,
            0.0,
        );
        assert!(!d.allow);
        assert!(d.reason.as_deref().unwrap().contains("plan mode"));
        assert!(!d.suggestions.is_empty());
    }

    #[test]
    fn plan_mode_allows_read_only() {
        let m = manager_with(vec![], PermissionMode::Plan);
        let d = m.check_permission("read_file", ToolKind::ReadOnly, &json!({}), None, 1, 0.0);
        assert!(d.allow);
    }

    #[test]
    fn accept_edits_allows_edit_tools_on_ask() {
        let m = manager_with(vec![ask_rule("edit_file")], PermissionMode::AcceptEdits);
        let d = m.check_permission("edit_file", ToolKind::Edit, &json!({}), None, 1, 0.0);
        assert!(d.allow);
    }

    #[test]
    fn accept_edits_still_refuses_execute_on_ask() {
        let m = manager_with(vec![ask_rule("bash")], PermissionMode::AcceptEdits);
        let d = m.check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0);
        assert!(!d.allow);
    }

    #[test]
    fn dont_ask_collapses_ask_to_allow() {
        let m = manager_with(vec![ask_rule("bash")], PermissionMode::DontAsk);
        let d = m.check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0);
        assert!(d.allow);
    }

    #[test]
    fn default_mode_allows_read_only_ask_and_denies_execute_ask() {
        let m = manager_with(
            vec![ask_rule("grep"), ask_rule("bash")],
            PermissionMode::Default,
        );
        assert!(m
            .check_permission("grep", ToolKind::ReadOnly, &json!({}), None, 1, 0.0)
            .allow);
        let d = m.check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0);
        assert!(!d.allow);
        assert!(!d.suggestions.is_empty());
    }

    #[test]
    fn explicit_deny_is_final_even_in_dont_ask() {
        let deny = PolicyRule {
            id: "deny-bash".into(),
            effect: PolicyBehavior::Deny,
            tools: Some(vec!["bash".into()]),
            command_patterns: None,
            arg_matchers: None,
            mode: None,
            priority: 0,
            reason: Some("bash is disabled here".into()),
            tier: PolicyTier::Admin,
        };
        let m = manager_with(vec![deny], PermissionMode::DontAsk);
        let d = m.check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0);
        assert!(!d.allow);
        assert_eq!(d.rule_id.as_deref(), Some("deny-bash"));
    }

    #[test]
    fn set_mode_takes_effect_immediately() {
        let m = manager_with(vec![], PermissionMode::Plan);
        assert!(!m
            .check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0)
            .allow);
        m.set_mode(PermissionMode::BypassPermissions);
        assert!(m
            .check_permission("bash", ToolKind::Execute, &json!({}), None, 1, 0.0)
            .allow);
    }
}
