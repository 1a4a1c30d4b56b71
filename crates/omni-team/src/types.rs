// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Workspace isolation requested for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Run in a fresh working directory created (and removed) around the task.
    Worktree,
}

/// One node of a team plan's task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamTask {
    pub id: String,
    pub query: String,
    /// Named agent definition to run the task with; `None` uses the default.
    #[serde(default)]
    pub agent_name: Option<String>,
    /// Inline agent definition overriding `agent_name`.
    #[serde(default)]
    pub custom_definition: Option<serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub background: bool,
    /// Free-form note prepended to the task prompt.
    #[serde(default)]
    pub collaboration_note: Option<String>,
    /// Run a shell command instead of a sub-agent.
    #[serde(default)]
    pub external_command: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// The parent tool_use this task answers, if any.
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub isolation: Option<Isolation>,
}

impl TeamTask {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            agent_name: None,
            custom_definition: None,
            depends_on: Vec::new(),
            background: false,
            collaboration_note: None,
            external_command: None,
            working_directory: None,
            tool_use_id: None,
            isolation: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamPlan {
    pub tasks: Vec<TeamTask>,
    pub max_parallel: usize,
}

impl TeamPlan {
    pub fn new(tasks: Vec<TeamTask>, max_parallel: usize) -> Self {
        Self {
            tasks,
            max_parallel: max_parallel.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Background,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle record kept per task.
#[derive(Debug, Clone)]
pub struct ManagedTask {
    pub task: TeamTask,
    pub state: TaskState,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl ManagedTask {
    pub fn pending(task: TeamTask) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            result: None,
            error: None,
        }
    }
}
