// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user opts out
/// need a named function.
fn default_true() -> bool {
    true
}

fn default_max_turns() -> u32 {
    24
}

fn default_tool_result_token_cap() -> usize {
    4_000
}

fn default_target_ratio() -> f32 {
    0.8
}

fn default_summary_prefix() -> String {
    "Compaction summary".to_string()
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    64
}

fn default_flush_interval_ms() -> u64 {
    250
}

fn default_hook_timeout_secs() -> u64 {
    10
}

fn default_max_parallel() -> usize {
    4
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub team: TeamConfig,
    /// Path to the workspace policy rules file (JSON).  Relative paths are
    /// resolved against the working directory.
    pub policies_file: Option<String>,
}

/// How tool calls requested by the model are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRunnerMode {
    /// The agent loop executes tools itself (the default).
    #[default]
    Loop,
    /// Delegate tool execution to the provider's native tool runner when the
    /// provider implements one; providers without native support fall back to
    /// plain text generation.
    ProviderNative,
}

/// Gate applied to every tool call before execution.
///
/// The mode changes how `ask` policy results collapse and which tool kinds
/// are allowed at all; see the permission manager for the exact semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
    DontAsk,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
            Self::DontAsk => "dontAsk",
        };
        write!(f, "{s}")
    }
}

/// Compaction trigger and target for the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionControl {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Estimated-token threshold above which history is compacted before the
    /// next model call.
    #[serde(default)]
    pub context_token_threshold: usize,
    /// Compaction target as a fraction of `context_token_threshold`.
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f32,
    #[serde(default = "default_true")]
    pub inject_summary: bool,
    #[serde(default = "default_summary_prefix")]
    pub summary_prefix: String,
    #[serde(default = "default_true")]
    pub preserve_system_prompt: bool,
}

impl Default for CompactionControl {
    fn default() -> Self {
        Self {
            enabled: true,
            context_token_threshold: 160_000,
            target_ratio: default_target_ratio(),
            inject_summary: true,
            summary_prefix: default_summary_prefix(),
            preserve_system_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on loop iterations per query.  Reaching it without a terminal
    /// result is a fatal loop failure, not a graceful stop.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Cumulative cost ceiling in USD for one query.  `None` disables the gate.
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub tool_runner_mode: ToolRunnerMode,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub compaction: CompactionControl,
    /// Token cap applied to each tool result before it is recorded in the
    /// conversation.  `0` disables truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Name under which this agent appears in policy rules and team channels.
    pub agent_name: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_cost_usd: None,
            tool_runner_mode: ToolRunnerMode::default(),
            permission_mode: PermissionMode::default(),
            compaction: CompactionControl::default(),
            tool_result_token_cap: default_tool_result_token_cap(),
            agent_name: None,
        }
    }
}

/// Strategy for choosing among multiple OAuth accounts of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStrategy {
    /// Always the first configured account.
    #[default]
    Single,
    /// Rotate through accounts in configuration order.
    RoundRobin,
    /// The account that was used least recently.
    LeastRecent,
    /// All accounts at once (fan-out callers split the work).
    Parallel,
    /// Deterministic pseudo-random pick (seeded, reproducible).
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Cooldown applied to a (provider, model) pair after a recorded failure
    /// when the failure site does not specify its own.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub account_strategy: AccountStrategy,
    /// OAuth account identifiers, in configuration order.
    #[serde(default)]
    pub accounts: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            account_strategy: AccountStrategy::default(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Event log file path.  `None` disables persistence.
    pub path: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Retention window in days for `compact_retention`.
    pub retention_days: Option<u32>,
    /// Maximum retained entries (most recent win) for `compact_retention`.
    pub max_entries: Option<usize>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            retention_days: None,
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Command hooks file (JSON): event name → list of shell commands.
    #[serde(default = "HooksConfig::default_hooks_file")]
    pub hooks_file: String,
    /// Directory scanned for declarative rule files (markdown + frontmatter).
    #[serde(default = "HooksConfig::default_rules_dir")]
    pub rules_dir: String,
    /// Per-command execution timeout; a hook that exceeds it is killed and the
    /// event pipeline continues.
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

impl HooksConfig {
    fn default_hooks_file() -> String {
        ".claude/hooks/hooks.json".to_string()
    }
    fn default_rules_dir() -> String {
        ".claude/hooks".to_string()
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            hooks_file: Self::default_hooks_file(),
            rules_dir: Self::default_rules_dir(),
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Upper bound on concurrently running sibling tasks in a team plan.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Name of the mandatory main channel for task lifecycle messages.
    pub main_channel: Option<String>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            main_channel: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
