// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Declarative hook rules: markdown files with YAML frontmatter.
//!
//! A rule file looks like
//!
//! ```markdown
//! ---
//! name: block-force-push
//! enabled: true
//! event: PreToolUse
//! action: block
//! tool_matcher: "bash"
//! conditions:
//!   - field: tool_input.command
//!     operator: regex_match
//!     pattern: "push\\s+--force"
//! ---
//! Force pushes are reviewed by a human first.
//! ```
//!
//! The markdown body after the frontmatter is the human-readable reason.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Block,
    Warn,
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    RegexMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the hook context, e.g. `tool_input.command`.
    pub field: String,
    pub operator: ConditionOperator,
    pub pattern: String,
}

impl Condition {
    fn matches(&self, context: &serde_json::Value) -> bool {
        let Some(value) = lookup(context, &self.field) else {
            return false;
        };
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        match self.operator {
            ConditionOperator::Equals => text == self.pattern,
            ConditionOperator::Contains => text.contains(&self.pattern),
            ConditionOperator::RegexMatch => match Regex::new(&self.pattern) {
                Ok(re) => re.is_match(&text),
                Err(e) => {
                    warn!(pattern = %self.pattern, error = %e, "invalid rule regex; condition fails");
                    false
                }
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRule {
    pub name: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Event name this rule listens on (`PreToolUse`, …).
    pub event: String,
    pub action: RuleAction,
    /// Regex over the tool name; absent matches every tool.
    #[serde(default)]
    pub tool_matcher: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Reason text (markdown body of the rule file).
    #[serde(default)]
    pub reason: Option<String>,
}

fn enabled_default() -> bool {
    true
}

impl HookRule {
    /// Whether this rule applies to the given event context.
    ///
    /// All conditions must match (logical AND); an empty condition list
    /// matches whenever the event and tool matcher do.
    pub fn applies(&self, event: &str, context: &serde_json::Value) -> bool {
        if !self.enabled || self.event != event {
            return false;
        }
        if let Some(matcher) = &self.tool_matcher {
            let tool = context
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match Regex::new(matcher) {
                Ok(re) if re.is_match(tool) => {}
                _ => return false,
            }
        }
        self.conditions.iter().all(|c| c.matches(context))
    }
}

/// Parse one markdown-with-frontmatter rule file.
///
/// Returns `None` when the file has no frontmatter or the frontmatter does
/// not describe a rule — non-rule markdown in the hooks directory is ignored
/// rather than treated as an error.
pub fn parse_rule_file(text: &str) -> Option<HookRule> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim();
    match serde_yaml::from_str::<HookRule>(frontmatter) {
        Ok(mut rule) => {
            if rule.reason.is_none() && !body.is_empty() {
                rule.reason = Some(body.to_string());
            }
            Some(rule)
        }
        Err(e) => {
            warn!(error = %e, "skipping malformed hook rule file");
            None
        }
    }
}

fn lookup<'v>(context: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    let mut cur = context;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
