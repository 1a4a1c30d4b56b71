// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-turn config change detection.
//!
//! A deliberate mtime diff over a fixed file set, rescanned at turn
//! boundaries — no filesystem watcher, so detection cost and timing are
//! fully deterministic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Files whose changes the loop surfaces as `ConfigChange` hook events.
pub const RECOGNIZED_CONFIG_FILES: &[&str] = &[
    "CLAUDE.md",
    "AGENTS.md",
    ".mcp.json",
    ".claude/settings.json",
    ".claude/hooks/hooks.json",
    ".omniagent/config.json",
    ".omniagent/policies.json",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub path: PathBuf,
    pub change: ConfigChangeKind,
}

pub struct ConfigWatcher {
    root: PathBuf,
    mtimes: HashMap<PathBuf, Option<SystemTime>>,
}

impl ConfigWatcher {
    /// Capture the initial snapshot; the first `scan` reports changes
    /// relative to construction time.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut mtimes = HashMap::new();
        for rel in RECOGNIZED_CONFIG_FILES {
            let path = root.join(rel);
            mtimes.insert(PathBuf::from(rel), mtime(&path));
        }
        Self { root, mtimes }
    }

    /// Diff current mtimes against the snapshot and update it.
    pub fn scan(&mut self) -> Vec<ConfigChange> {
        let mut changes = Vec::new();
        for rel in RECOGNIZED_CONFIG_FILES {
            let rel_path = PathBuf::from(rel);
            let current = mtime(&self.root.join(rel));
            let previous = self.mtimes.get(&rel_path).copied().flatten();
            let change = match (previous, current) {
                (None, Some(_)) => Some(ConfigChangeKind::Created),
                (Some(_), None) => Some(ConfigChangeKind::Deleted),
                (Some(a), Some(b)) if a != b => Some(ConfigChangeKind::Modified),
                _ => None,
            };
            if let Some(change) = change {
                changes.push(ConfigChange {
                    path: rel_path.clone(),
                    change,
                });
            }
            self.mtimes.insert(rel_path, current);
        }
        changes
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
