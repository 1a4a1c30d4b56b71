// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Declarative policy evaluation for tool calls and turn-level checks.
//!
//! Rules are data, decisions are deterministic: the same rule set and the
//! same call context always produce the same decision, so every gate the
//! runtime applies is auditable from its `rule_id`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use omni_config::PermissionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyBehavior {
    Allow,
    Deny,
    Ask,
}

/// Override tier a rule belongs to.  Higher tiers beat lower ones when
/// priority ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyTier {
    Enterprise,
    Admin,
    User,
    #[default]
    Workspace,
    Agent,
}

impl PolicyTier {
    /// Rank for ordering; lower sorts first.
    fn rank(self) -> u8 {
        match self {
            Self::Enterprise => 0,
            Self::Admin => 1,
            Self::User => 2,
            Self::Workspace => 3,
            Self::Agent => 4,
        }
    }
}

/// One declarative rule.  Every specified predicate must match for the rule
/// to apply; unspecified predicates match everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub effect: PolicyBehavior,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Regexes matched against `input.command`; one match suffices.
    #[serde(default)]
    pub command_patterns: Option<Vec<String>>,
    /// Dotted-path matchers into the tool input.  A string matcher matches by
    /// equality first, then as a regex; any other JSON value matches by
    /// equality only.
    #[serde(default)]
    pub arg_matchers: Option<BTreeMap<String, serde_json::Value>>,
    /// When set, the rule only applies in (and sorts ahead for) these modes.
    #[serde(default)]
    pub mode: Option<Vec<PermissionMode>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub tier: PolicyTier,
}

/// Turn-level rule: budget caps and turn ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRule {
    pub id: String,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Restrict the rule to specific agent names.
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    #[serde(default)]
    pub mode: Option<Vec<PermissionMode>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub turn_rules: Vec<TurnRule>,
}

/// Load a policy set from a JSON file (`.omniagent/policies.json`).
pub fn load_policies(path: &Path) -> anyhow::Result<PolicySet> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Everything known about one tool call at decision time.
#[derive(Debug, Clone)]
pub struct ToolCallContext<'a> {
    pub tool_name: &'a str,
    pub input: &'a serde_json::Value,
    pub permission_mode: PermissionMode,
    pub agent_name: Option<&'a str>,
    pub turn_count: u32,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct TurnContext<'a> {
    pub agent_name: Option<&'a str>,
    pub turn_count: u32,
    pub cost_usd: f64,
    pub permission_mode: PermissionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub behavior: PolicyBehavior,
    pub reason: Option<String>,
    pub rule_id: Option<String>,
}

impl PolicyDecision {
    fn unmatched() -> Self {
        Self {
            behavior: PolicyBehavior::Allow,
            reason: None,
            rule_id: None,
        }
    }
}

pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    turn_rules: Vec<TurnRule>,
}

impl PolicyEngine {
    pub fn new(set: PolicySet) -> Self {
        Self {
            rules: set.rules,
            turn_rules: set.turn_rules,
        }
    }

    pub fn empty() -> Self {
        Self::new(PolicySet::default())
    }

    /// Evaluate the rule set against one tool call.
    ///
    /// Ordering: rules explicitly bound to the current mode first, then
    /// higher priority, then tier (enterprise > admin > user > workspace >
    /// agent); the first matching rule wins.  No match means allow.
    pub fn evaluate_tool(&self, ctx: &ToolCallContext<'_>) -> PolicyDecision {
        let mut matching: Vec<&PolicyRule> = self
            .rules
            .iter()
            .filter(|r| rule_matches(r, ctx))
            .collect();
        matching.sort_by(|a, b| {
            b.mode
                .is_some()
                .cmp(&a.mode.is_some())
                .then(b.priority.cmp(&a.priority))
                .then(a.tier.rank().cmp(&b.tier.rank()))
        });
        match matching.first() {
            Some(rule) => {
                debug!(tool = ctx.tool_name, rule = %rule.id, effect = ?rule.effect, "policy matched");
                PolicyDecision {
                    behavior: rule.effect,
                    reason: rule.reason.clone(),
                    rule_id: Some(rule.id.clone()),
                }
            }
            None => PolicyDecision::unmatched(),
        }
    }

    /// Turn-level gate applied at the top of every loop iteration.
    pub fn evaluate_turn(&self, ctx: &TurnContext<'_>) -> PolicyDecision {
        for rule in &self.turn_rules {
            if let Some(agents) = &rule.agents {
                let name = ctx.agent_name.unwrap_or("");
                if !agents.iter().any(|a| a == name) {
                    continue;
                }
            }
            if let Some(modes) = &rule.mode {
                if !modes.contains(&ctx.permission_mode) {
                    continue;
                }
            }
            if let Some(max) = rule.max_turns {
                if ctx.turn_count > max {
                    return PolicyDecision {
                        behavior: PolicyBehavior::Deny,
                        reason: Some(
                            rule.reason
                                .clone()
                                .unwrap_or_else(|| format!("turn limit {max} exceeded")),
                        ),
                        rule_id: Some(rule.id.clone()),
                    };
                }
            }
            if let Some(max) = rule.max_cost_usd {
                if ctx.cost_usd > max {
                    return PolicyDecision {
                        behavior: PolicyBehavior::Deny,
                        reason: Some(
                            rule.reason
                                .clone()
                                .unwrap_or_else(|| format!("cost cap ${max:.4} exceeded")),
                        ),
                        rule_id: Some(rule.id.clone()),
                    };
                }
            }
        }
        PolicyDecision::unmatched()
    }
}

fn rule_matches(rule: &PolicyRule, ctx: &ToolCallContext<'_>) -> bool {
    if let Some(modes) = &rule.mode {
        if !modes.contains(&ctx.permission_mode) {
            return false;
        }
    }
    if let Some(tools) = &rule.tools {
        if !tools.iter().any(|t| t == ctx.tool_name) {
            return false;
        }
    }
    if let Some(patterns) = &rule.command_patterns {
        let command = ctx
            .input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let any = patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .any(|re| re.is_match(command));
        if !any {
            return false;
        }
    }
    if let Some(matchers) = &rule.arg_matchers {
        for (path, expected) in matchers {
            let actual = lookup_path(ctx.input, path);
            if !value_matches(actual, expected) {
                return false;
            }
        }
    }
    true
}

/// Resolve a dotted path (`"file.path"`) into the input object.
fn lookup_path<'v>(input: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    let mut cur = input;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

/// Equality first; string expectations additionally match as a regex.
fn value_matches(actual: Option<&serde_json::Value>, expected: &serde_json::Value) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    if actual == expected {
        return true;
    }
    if let (Some(actual_s), Some(expected_s)) = (actual.as_str(), expected.as_str()) {
        if let Ok(re) = Regex::new(expected_s) {
            return re.is_match(actual_s);
        }
    }
    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
