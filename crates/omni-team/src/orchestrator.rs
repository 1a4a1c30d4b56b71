// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent task orchestration.
//!
//! A team plan is a dependency graph of tasks executed with bounded
//! parallelism.  Every lifecycle transition is announced on the mandatory
//! main channel — orchestration without a communication policy refuses to
//! run, so no task ever executes silently.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use omni_hooks::{HookEvent, HookManager};
use omni_hub::CommunicationHub;

use crate::{Isolation, ManagedTask, TaskState, TeamPlan, TeamTask};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Mandatory communication policy not configured")]
    MandatoryCommsNotConfigured,
    #[error("unresolved dependencies or circular references")]
    UnresolvedDependencies,
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("task '{id}' failed: {message}")]
    TaskFailed { id: String, message: String },
}

/// Executes one task prompt with a sub-agent.  The agent loop implements
/// this; tests plug in scripted runners.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, prompt: &str, task: &TeamTask) -> anyhow::Result<String>;
}

/// Creates and removes isolated working directories for tasks that request
/// worktree isolation.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn create(&self, task_id: &str) -> anyhow::Result<PathBuf>;
    async fn remove(&self, path: &Path) -> anyhow::Result<()>;
}

/// Where task lifecycle messages go.
pub struct CommunicationPolicy {
    pub hub: Arc<Mutex<CommunicationHub>>,
    pub workspace_id: String,
    pub channel_id: String,
    pub sender_id: String,
}

impl CommunicationPolicy {
    /// Posting failures are logged, never fatal: a broken channel must not
    /// take the task down with it.
    fn post(&self, text: &str) {
        let mut hub = self.hub.lock().expect("hub lock poisoned");
        if let Err(e) = hub.post_message(
            &self.workspace_id,
            &self.channel_id,
            &self.sender_id,
            text,
            None,
            None,
        ) {
            warn!(error = %e, "lifecycle message not delivered");
        }
    }
}

pub struct Orchestrator {
    runner: Arc<dyn TaskRunner>,
    hooks: Arc<HookManager>,
    comms: Option<Arc<CommunicationPolicy>>,
    worktrees: Option<Arc<dyn WorktreeManager>>,
    shared_state: Mutex<HashMap<String, String>>,
    tasks: Mutex<HashMap<String, ManagedTask>>,
    background: AsyncMutex<HashMap<String, tokio::task::JoinHandle<Result<String, String>>>>,
    cancelled: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn TaskRunner>, hooks: Arc<HookManager>) -> Self {
        Self {
            runner,
            hooks,
            comms: None,
            worktrees: None,
            shared_state: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            background: AsyncMutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_comms(mut self, comms: CommunicationPolicy) -> Self {
        self.comms = Some(Arc::new(comms));
        self
    }

    pub fn with_worktrees(mut self, worktrees: Arc<dyn WorktreeManager>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    fn comms(&self) -> Result<Arc<CommunicationPolicy>, OrchestratorError> {
        self.comms
            .clone()
            .ok_or(OrchestratorError::MandatoryCommsNotConfigured)
    }

    /// Output of every finished task, keyed by task id.
    pub fn shared_state(&self) -> HashMap<String, String> {
        self.shared_state.lock().expect("state lock poisoned").clone()
    }

    pub fn task_state(&self, id: &str) -> Option<TaskState> {
        self.tasks
            .lock()
            .expect("tasks lock poisoned")
            .get(id)
            .map(|t| t.state)
    }

    fn set_state(&self, id: &str, state: TaskState, result: Option<String>, error: Option<String>) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(t) = tasks.get_mut(id) {
            t.state = state;
            if result.is_some() {
                t.result = result;
            }
            if error.is_some() {
                t.error = error;
            }
        }
    }

    fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.lock().expect("cancel lock poisoned").contains(id)
    }

    /// Mark a task cancelled.  Takes effect at the next task boundary: a
    /// pending task never starts, a running one is reported as cancelled on
    /// completion.
    pub fn cancel_task(&self, id: &str) {
        self.cancelled
            .lock()
            .expect("cancel lock poisoned")
            .insert(id.to_string());
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(t) = tasks.get_mut(id) {
            if t.state == TaskState::Pending {
                t.state = TaskState::Cancelled;
            }
        }
    }

    /// Run a whole plan: schedule tasks whose dependencies completed, at most
    /// `max_parallel` at a time, until the graph drains.
    pub async fn run_plan(
        self: &Arc<Self>,
        plan: TeamPlan,
    ) -> Result<HashMap<String, String>, OrchestratorError> {
        self.comms()?;
        let mut remaining = plan.tasks;
        let mut completed: HashSet<String> = HashSet::new();
        let mut outcomes = HashMap::new();

        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, t)| t.depends_on.iter().all(|d| completed.contains(d)))
                .map(|(i, _)| i)
                .take(plan.max_parallel)
                .collect();
            if ready.is_empty() {
                return Err(OrchestratorError::UnresolvedDependencies);
            }
            let mut batch = Vec::with_capacity(ready.len());
            for i in ready.into_iter().rev() {
                batch.push(remaining.remove(i));
            }
            batch.reverse();

            let futures: Vec<_> = batch
                .into_iter()
                .map(|task| {
                    let this = Arc::clone(self);
                    async move {
                        let id = task.id.clone();
                        (id, this.start_task(task).await)
                    }
                })
                .collect();
            for (id, outcome) in futures::future::join_all(futures).await {
                match outcome {
                    Ok(message) => {
                        outcomes.insert(id.clone(), message);
                    }
                    Err(e) => {
                        // A failed task resolves its dependents' edges; they
                        // run without its output rather than deadlocking the
                        // plan.
                        outcomes.insert(id.clone(), format!("error: {e}"));
                    }
                }
                completed.insert(id);
            }
        }
        Ok(outcomes)
    }

    /// Start one task: record lifecycle, announce, and execute (or spawn,
    /// for background tasks).
    pub async fn start_task(self: &Arc<Self>, task: TeamTask) -> Result<String, OrchestratorError> {
        let comms = self.comms()?;
        self.tasks
            .lock()
            .expect("tasks lock poisoned")
            .entry(task.id.clone())
            .or_insert_with(|| ManagedTask::pending(task.clone()));

        if self.is_cancelled(&task.id) {
            self.set_state(&task.id, TaskState::Cancelled, None, None);
            comms.post(&format!("[task_cancelled] {}", task.id));
            return Ok(format!("Task {} cancelled.", task.id));
        }

        let state = if task.background {
            TaskState::Background
        } else {
            TaskState::Running
        };
        self.set_state(&task.id, state, None, None);
        comms.post(&format!("[task_started] {}: {}", task.id, task.query));
        self.hooks
            .dispatch(
                HookEvent::SubagentStart,
                json!({
                    "event_name": "SubagentStart",
                    "task_id": task.id,
                    "agent_name": task.agent_name,
                }),
            )
            .await;

        if task.background {
            let id = task.id.clone();
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { this.run_and_finish(task).await });
            self.background.lock().await.insert(id.clone(), handle);
            return Ok(format!("Task {id} started in background."));
        }

        let id = task.id.clone();
        Arc::clone(self)
            .run_and_finish(task)
            .await
            .map_err(|message| OrchestratorError::TaskFailed { id, message })
    }

    /// Await the real outcome of a background task.
    pub async fn wait_for_background(&self, id: &str) -> Result<String, OrchestratorError> {
        let handle = self
            .background
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()))?;
        match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(OrchestratorError::TaskFailed {
                id: id.to_string(),
                message,
            }),
            Err(e) => Err(OrchestratorError::TaskFailed {
                id: id.to_string(),
                message: format!("background task panicked: {e}"),
            }),
        }
    }

    /// Execute and do the completion bookkeeping: shared state, hooks,
    /// channel posts, managed-task state.
    async fn run_and_finish(self: Arc<Self>, task: TeamTask) -> Result<String, String> {
        let comms = self.comms.clone().expect("checked by start_task");
        let result = self.execute(&task).await;
        match result {
            Ok(output) => {
                if self.is_cancelled(&task.id) {
                    self.set_state(&task.id, TaskState::Cancelled, None, None);
                    comms.post(&format!("[task_cancelled] {}", task.id));
                    return Err(format!("task '{}' was cancelled", task.id));
                }
                self.shared_state
                    .lock()
                    .expect("state lock poisoned")
                    .insert(task.id.clone(), output.clone());
                self.set_state(&task.id, TaskState::Completed, Some(output.clone()), None);
                self.hooks
                    .dispatch(
                        HookEvent::TaskCompleted,
                        json!({
                            "event_name": "TaskCompleted",
                            "task_id": task.id,
                            "result": output,
                        }),
                    )
                    .await;
                self.hooks
                    .dispatch(
                        HookEvent::SubagentStop,
                        json!({"event_name": "SubagentStop", "task_id": task.id}),
                    )
                    .await;
                self.hooks
                    .dispatch(
                        HookEvent::TeammateIdle,
                        json!({"event_name": "TeammateIdle", "agent_name": task.agent_name}),
                    )
                    .await;
                comms.post(&format!("[task_completed] {}", task.id));
                debug!(task = %task.id, "task completed");
                Ok(output)
            }
            Err(message) => {
                self.set_state(&task.id, TaskState::Failed, None, Some(message.clone()));
                self.hooks
                    .dispatch(
                        HookEvent::SubagentStop,
                        json!({"event_name": "SubagentStop", "task_id": task.id, "error": message}),
                    )
                    .await;
                comms.post(&format!("[task_failed] {}: {}", task.id, message));
                Err(message)
            }
        }
    }

    async fn execute(&self, task: &TeamTask) -> Result<String, String> {
        let mut task = task.clone();
        let mut worktree = None;

        if task.isolation == Some(Isolation::Worktree) {
            if let Some(manager) = &self.worktrees {
                self.hooks
                    .dispatch(
                        HookEvent::WorktreeCreate,
                        json!({"event_name": "WorktreeCreate", "task_id": task.id}),
                    )
                    .await;
                match manager.create(&task.id).await {
                    Ok(path) => {
                        task.working_directory = Some(path.clone());
                        worktree = Some(path);
                    }
                    Err(e) => return Err(format!("worktree creation failed: {e}")),
                }
            }
        }

        let result = if let Some(command) = task.external_command.clone() {
            run_external(&command, &task).await
        } else {
            let prompt = self.build_prompt(&task);
            self.runner
                .run(&prompt, &task)
                .await
                .map_err(|e| e.to_string())
        };

        if let (Some(path), Some(manager)) = (worktree, &self.worktrees) {
            if let Err(e) = manager.remove(&path).await {
                warn!(task = %task.id, error = %e, "worktree removal failed");
            }
            self.hooks
                .dispatch(
                    HookEvent::WorktreeRemove,
                    json!({"event_name": "WorktreeRemove", "task_id": task.id}),
                )
                .await;
        }

        result
    }

    /// Collaborative prompt: note, then each dependency's output, then the
    /// task itself.
    fn build_prompt(&self, task: &TeamTask) -> String {
        let mut parts = Vec::new();
        if let Some(note) = &task.collaboration_note {
            parts.push(note.clone());
        }
        let state = self.shared_state.lock().expect("state lock poisoned");
        for dep in &task.depends_on {
            if let Some(output) = state.get(dep) {
                parts.push(format!("Dependency {dep} output:\n{output}"));
            }
        }
        drop(state);
        parts.push(format!("Task:\n{}", task.query));
        parts.join("\n\n")
    }
}

async fn run_external(command: &str, task: &TeamTask) -> Result<String, String> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .env("OMNI_AGENT_TASK_ID", &task.id)
        .env(
            "OMNI_AGENT_TOOL_USE_ID",
            task.tool_use_id.clone().unwrap_or_default(),
        )
        .env("OMNI_AGENT_TASK_QUERY", &task.query);
    if let Some(dir) = &task.working_directory {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await.map_err(|e| format!("spawn error: {e}"))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    } else {
        Err(format!(
            "[exit {}] {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim_end()
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
