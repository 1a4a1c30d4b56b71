// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use omni_config::PermissionMode;
use omni_model::Role;
use omni_policy::PermissionManager;
use omni_tools::CancelToken;

use crate::{SdkEvent, Session};

/// Consumer handle for one query: a cancellable event iterator.
///
/// Events arrive at the consumer's pace; `interrupt` flips the shared flag
/// and the loop emits its terminal `Result` at the next boundary.  Dropping
/// the handle stops delivery but not the loop — call `close` to stop work.
pub struct QueryHandle {
    rx: mpsc::Receiver<SdkEvent>,
    cancel: CancelToken,
    permissions: Arc<PermissionManager>,
    session: Arc<Mutex<Session>>,
}

impl QueryHandle {
    pub(crate) fn new(
        rx: mpsc::Receiver<SdkEvent>,
        cancel: CancelToken,
        permissions: Arc<PermissionManager>,
        session: Arc<Mutex<Session>>,
    ) -> Self {
        Self {
            rx,
            cancel,
            permissions,
            session,
        }
    }

    /// The next event, or `None` once the query has finished and the stream
    /// is drained.
    pub async fn next_event(&mut self) -> Option<SdkEvent> {
        self.rx.recv().await
    }

    /// Stop the query at its next boundary.  The terminal `Result` event is
    /// still delivered.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Alias for [`interrupt`](Self::interrupt), for scope guards.
    pub fn close(&self) {
        self.interrupt();
    }

    /// Switch the permission mode for the rest of the query.
    pub fn set_permission_mode(&self, mode: PermissionMode) {
        self.permissions.set_mode(mode);
    }

    /// Three follow-up prompts synthesised from the session tail.
    pub fn prompt_suggestion(&self) -> [String; 3] {
        let session = self.session.lock().expect("session lock poisoned");
        let messages = session.messages();

        let last = messages.last();
        let last_tool_error = last
            .map(|m| m.role == Role::ToolResult && m.is_error)
            .unwrap_or(false);
        if last_tool_error {
            let tool = last
                .and_then(|m| m.tool_name.as_deref())
                .unwrap_or("the last tool");
            return [
                format!("Investigate why {tool} failed and gather more context."),
                format!("Retry {tool} with corrected arguments."),
                "Explain the root cause of the failure before proceeding.".to_string(),
            ];
        }

        let last_assistant_text = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.as_text())
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if last_assistant_text {
            return [
                "Continue with the next step.".to_string(),
                "Validate the result before moving on.".to_string(),
                "Summarise the progress so far.".to_string(),
            ];
        }

        [
            "State the goal you want to reach.".to_string(),
            "Propose a plan before making changes.".to_string(),
            "Review the risks of the current approach.".to_string(),
        ]
    }

    /// Drain the stream to completion (test and batch convenience).
    pub async fn collect_events(mut self) -> Vec<SdkEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.rx.recv().await {
            events.push(ev);
        }
        events
    }
}

impl Stream for QueryHandle {
    type Item = SdkEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
