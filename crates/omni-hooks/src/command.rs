// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Command hooks: external programs invoked with the event payload as JSON
//! on stdin.  A hook that exits 0 may print a JSON object to stdout, which is
//! merged into the running payload; anything else is logged and ignored.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandHook {
    /// Shell command, run via `sh -c`.
    pub command: String,
    /// Per-hook timeout in seconds; falls back to the manager default.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// The `hooks.json` file shape: event name → ordered list of commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksFile {
    #[serde(default)]
    pub hooks: HashMap<String, Vec<CommandHook>>,
}

impl HooksFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

impl CommandHook {
    /// Run the hook and return its stdout JSON when it succeeded.
    ///
    /// `Ok(None)` covers every non-fatal failure mode: non-zero exit,
    /// timeout, unparseable stdout.  Hook failures never block the caller.
    pub async fn run(&self, payload: &serde_json::Value, default_timeout_secs: u64) -> Option<serde_json::Value> {
        let timeout = Duration::from_secs(self.timeout.unwrap_or(default_timeout_secs));
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out hook is killed when its handle drops.
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(command = %self.command, error = %e, "hook spawn failed");
                return None;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let body = payload.to_string();
            if let Err(e) = stdin.write_all(body.as_bytes()).await {
                warn!(command = %self.command, error = %e, "hook stdin write failed");
            }
            // Close stdin so line-reading hooks terminate.
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(command = %self.command, error = %e, "hook wait failed");
                return None;
            }
            Err(_) => {
                warn!(command = %self.command, timeout_secs = timeout.as_secs(), "hook timed out; killed");
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                command = %self.command,
                code = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "hook exited non-zero; ignored"
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(v) if v.is_object() => {
                debug!(command = %self.command, "hook returned payload mutation");
                Some(v)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(command = %self.command, error = %e, "hook stdout is not JSON; ignored");
                None
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
