// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod bus;
mod commands;
mod compact;
mod events;
mod query;
mod session;
mod structured;
#[cfg(test)]
mod tests;
mod truncate;
mod watch;

pub use agent::{AgentLoop, AgentLoopConfig};
pub use bus::SessionBus;
pub use commands::{CommandContext, CommandOutput, CommandRegistry, SlashCommand};
pub use compact::{compact_history, CompactionOptions, CompactionOutcome};
pub use events::{
    ErrorCode, ErrorInfo, ErrorSource, HookPhase, PlanStep, PlanStepStatus, PlanUpdatePayload,
    ResultKind, SdkEvent, StatusLevel, TaskLifecycle, UserInputOption, UserInputQuestion,
    UserInputRequest,
};
pub use query::QueryHandle;
pub use session::Session;
pub use structured::{extract_json, parse_structured, validate, StructuredOutputConfig};
pub use truncate::truncate_tool_result;
pub use watch::{ConfigChange, ConfigChangeKind, ConfigWatcher, RECOGNIZED_CONFIG_FILES};
