// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic markdown rendering of an event log.
//!
//! One bullet per event, in log order, so two exports of the same log are
//! byte-identical.

use chrono::DateTime;

use crate::EventLogEntry;

fn iso(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}

/// Render the recognised event kinds as markdown bullets; anything else is
/// skipped.
pub fn transcript_to_markdown(entries: &[EventLogEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let p = &e.payload;
        let line = match e.kind.as_str() {
            "message" => {
                let role = p.get("role").and_then(|v| v.as_str()).unwrap_or("unknown");
                let text = p.get("text").and_then(|v| v.as_str()).unwrap_or("");
                format!("- [{}] [{}] {}", iso(e.ts), role, text)
            }
            "tool_use" => {
                let tool = p.get("tool").and_then(|v| v.as_str()).unwrap_or("?");
                let id = p.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or("?");
                format!("- [{}] [tool_use] {} id={}", iso(e.ts), tool, id)
            }
            "tool_result" => {
                let tool = p.get("tool").and_then(|v| v.as_str()).unwrap_or("?");
                let id = p.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or("?");
                let status = if p.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false) {
                    "error"
                } else {
                    "success"
                };
                format!(
                    "- [{}] [tool_result] {} id={} status={}",
                    iso(e.ts),
                    tool,
                    id,
                    status
                )
            }
            "turn_completed" => {
                let status = p.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
                let provider = p.get("provider").and_then(|v| v.as_str()).unwrap_or("?");
                let model = p.get("model").and_then(|v| v.as_str()).unwrap_or("?");
                format!(
                    "- [{}] [turn] status={} provider={} model={}",
                    iso(e.ts),
                    status,
                    provider,
                    model
                )
            }
            _ => continue,
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
