// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod engine;
mod permission;

pub use engine::{
    load_policies, PolicyBehavior, PolicyDecision, PolicyEngine, PolicyRule, PolicySet, PolicyTier,
    ToolCallContext, TurnContext, TurnRule,
};
pub use permission::{PermissionDecision, PermissionManager};
