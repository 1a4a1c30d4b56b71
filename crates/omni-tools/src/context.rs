// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a query and its tools.
///
/// The agent loop flips it on interrupt; long-running tools poll it between
/// units of work and bail out with a recoverable error.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Execution environment boundary.
///
/// Concrete sandbox providers (local, containerized) live with the host
/// application; the runtime only needs a label for audit records.
pub trait Sandbox: Send + Sync {
    /// Short identifier, e.g. `"local"` or `"container"`.
    fn kind(&self) -> &str;
}

/// A permissive sandbox for hosts that run tools directly.
#[derive(Debug, Default)]
pub struct LocalSandbox;

impl Sandbox for LocalSandbox {
    fn kind(&self) -> &str {
        "local"
    }
}

/// Per-call context handed to [`crate::Tool::execute`].
#[derive(Clone)]
pub struct ToolContext {
    pub sandbox: Arc<dyn Sandbox>,
    pub working_directory: Option<PathBuf>,
    /// Id of the tool_use event this execution answers.
    pub tool_use_id: String,
    /// Chained to the query's interrupt.
    pub cancel: CancelToken,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            sandbox: Arc::new(LocalSandbox),
            working_directory: None,
            tool_use_id: String::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl ToolContext {
    pub fn for_call(tool_use_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            cancel,
            ..Self::default()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
