// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use omni_model::{Message, Role, Usage};

use crate::{compact, CompactionOptions, CompactionOutcome, SessionBus};

/// Process-scoped mutable state for one conversation.
///
/// The session exclusively owns its messages; an agent loop borrows it for
/// the duration of a query.  Messages are append-only — compaction is the
/// only removal path.
pub struct Session {
    pub id: String,
    messages: Vec<Message>,
    usage: Usage,
    cost_usd: f64,
    steering: VecDeque<String>,
    follow_up: VecDeque<String>,
    bus: Arc<SessionBus>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            usage: Usage::default(),
            cost_usd: 0.0,
            steering: VecDeque::new(),
            follow_up: VecDeque::new(),
            bus: Arc::new(SessionBus::new()),
        }
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut s = Self::new();
        s.set_system_prompt(prompt);
        s
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replace or insert the system prompt at index 0.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let msg = Message::system(prompt);
        match self.messages.first() {
            Some(m) if m.role == Role::System => self.messages[0] = msg,
            _ => self.messages.insert(0, msg),
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .and_then(|m| m.as_text())
    }

    /// Drop everything but the system prompt (for `/clear`).
    pub fn clear_history(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    // ── Usage & cost ──────────────────────────────────────────────────────────

    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn add_cost(&mut self, usd: f64) {
        self.cost_usd += usd;
    }

    /// Cumulative estimated spend for this conversation.
    pub fn calculate_approximate_cost(&self) -> f64 {
        self.cost_usd
    }

    // ── Queues ────────────────────────────────────────────────────────────────

    /// Queue text injected as a user message at the next turn boundary.
    pub fn queue_steering(&mut self, text: impl Into<String>) {
        self.steering.push_back(text.into());
    }

    /// Queue text injected after a terminal-intent model reply without tools.
    pub fn queue_follow_up(&mut self, text: impl Into<String>) {
        self.follow_up.push_back(text.into());
    }

    /// Atomically drain both queues.
    pub fn consume_queues(&mut self) -> (Vec<String>, Vec<String>) {
        (
            self.steering.drain(..).collect(),
            self.follow_up.drain(..).collect(),
        )
    }

    // ── Tokens & compaction ───────────────────────────────────────────────────

    /// Estimated tokens for the current message list.
    pub fn estimate_context_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.approx_tokens()).sum()
    }

    pub fn compact_history(&mut self, opts: &CompactionOptions) -> CompactionOutcome {
        compact::compact_history(&mut self.messages, opts)
    }

    // ── Event bus ─────────────────────────────────────────────────────────────

    pub fn bus(&self) -> Arc<SessionBus> {
        Arc::clone(&self.bus)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
