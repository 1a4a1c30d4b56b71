// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic history compaction.
//!
//! Messages are dropped from the front, oldest first, until the estimated
//! token count fits the target.  A message carrying tool calls drags its
//! paired tool results with it, so compaction can never orphan a result.
//! Optionally a single summary message is injected after the system prompt,
//! built from the most recently dropped messages.

use omni_model::{Message, Role};

/// How many of the most recently dropped messages feed the summary.
const SUMMARY_WINDOW: usize = 24;
/// Per-message excerpt length in the summary.
const EXCERPT_CHARS: usize = 220;

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    pub max_tokens: usize,
    pub target_ratio: f32,
    pub inject_summary: bool,
    pub summary_prefix: String,
    pub preserve_system_prompt: bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 160_000,
            target_ratio: 0.8,
            inject_summary: true,
            summary_prefix: "Compaction summary".to_string(),
            preserve_system_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactionOutcome {
    pub dropped: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub summary_injected: bool,
}

fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

/// The droppable unit starting at `idx`: the message itself plus every
/// immediately following tool result answering one of its tool calls.
fn unit_len(messages: &[Message], idx: usize) -> usize {
    let ids: Vec<String> = messages[idx]
        .tool_call_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut len = 1;
    if !ids.is_empty() {
        while idx + len < messages.len() {
            let next = &messages[idx + len];
            let paired = next.role == Role::ToolResult
                && next
                    .tool_call_id
                    .as_deref()
                    .map(|id| ids.iter().any(|x| x == id))
                    .unwrap_or(false);
            if paired {
                len += 1;
            } else {
                break;
            }
        }
    }
    len
}

/// Whether the tail of the list is a tool_call/tool_result pair that must
/// not be split or dropped at the compaction boundary.
fn pinned_tail_len(messages: &[Message]) -> usize {
    let n = messages.len();
    if n < 2 {
        return 0;
    }
    let last = &messages[n - 1];
    if last.role != Role::ToolResult {
        return 0;
    }
    let Some(result_id) = last.tool_call_id.as_deref() else {
        return 0;
    };
    // Walk back over the result block to the assistant message that opened it.
    let mut start = n - 1;
    while start > 0 && messages[start - 1].role == Role::ToolResult {
        start -= 1;
    }
    if start == 0 {
        return 0;
    }
    let opener = &messages[start - 1];
    if opener.tool_call_ids().iter().any(|id| *id == result_id) {
        n - start + 1
    } else {
        0
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::ToolResult => "toolResult",
    }
}

fn excerpt(m: &Message) -> String {
    let text = match m.as_text() {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => match &m.tool_calls {
            Some(calls) if !calls.is_empty() => {
                format!("[tool_call: {}]", calls[0].name)
            }
            _ => "[structured content]".to_string(),
        },
    };
    if text.len() > EXCERPT_CHARS {
        let mut cut = EXCERPT_CHARS;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    } else {
        text
    }
}

fn build_summary(dropped: &[Message], prefix: &str, window: usize) -> Message {
    let window = window.min(dropped.len());
    let slice = &dropped[dropped.len() - window..];
    let mut text = String::from(prefix);
    for m in slice {
        text.push('\n');
        text.push_str(&format!("- {}: {}", role_label(m.role), excerpt(m)));
    }
    Message::assistant(text)
}

/// Compact `messages` in place.
///
/// Guarantees `total ≤ max_tokens · target_ratio` on return unless only the
/// pinned prefix (system prompt) and a pinned trailing tool pair remain.
pub fn compact_history(messages: &mut Vec<Message>, opts: &CompactionOptions) -> CompactionOutcome {
    let tokens_before = total_tokens(messages);
    let target = (opts.max_tokens as f32 * opts.target_ratio) as usize;
    if tokens_before <= target {
        return CompactionOutcome {
            tokens_before,
            tokens_after: tokens_before,
            ..CompactionOutcome::default()
        };
    }

    let pinned_prefix = if opts.preserve_system_prompt
        && messages.first().map(|m| m.role == Role::System).unwrap_or(false)
    {
        1
    } else {
        0
    };
    let pinned_tail = pinned_tail_len(messages);

    let mut dropped: Vec<Message> = Vec::new();
    loop {
        let remaining = total_tokens(messages)
            + if opts.inject_summary && !dropped.is_empty() {
                build_summary(&dropped, &opts.summary_prefix, SUMMARY_WINDOW).approx_tokens()
            } else {
                0
            };
        if remaining <= target {
            break;
        }
        let idx = pinned_prefix;
        if idx >= messages.len() {
            break;
        }
        let len = unit_len(messages, idx);
        if idx + len > messages.len().saturating_sub(pinned_tail) {
            break;
        }
        for _ in 0..len {
            dropped.push(messages.remove(idx));
        }
    }

    // The summary window shrinks when the summary itself would overflow the
    // target; a tiny budget still gets at least a one-line summary.
    let summary_injected = opts.inject_summary && !dropped.is_empty();
    if summary_injected {
        let mut window = SUMMARY_WINDOW.min(dropped.len());
        loop {
            let summary = build_summary(&dropped, &opts.summary_prefix, window);
            if window <= 1 || total_tokens(messages) + summary.approx_tokens() <= target {
                messages.insert(pinned_prefix, summary);
                break;
            }
            window -= 1;
        }
    }

    CompactionOutcome {
        dropped: dropped.len(),
        tokens_before,
        tokens_after: total_tokens(messages),
        summary_injected,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use omni_model::ToolInvocation;

    fn filler(role: Role, n: usize) -> Message {
        let text = "x".repeat(n);
        match role {
            Role::User => Message::user(text),
            Role::Assistant => Message::assistant(text),
            Role::System => Message::system(text),
            Role::ToolResult => Message::tool_result("tc", "t", text),
        }
    }

    fn opts(max_tokens: usize, ratio: f32) -> CompactionOptions {
        CompactionOptions {
            max_tokens,
            target_ratio: ratio,
            ..CompactionOptions::default()
        }
    }

    // ── Target enforcement ────────────────────────────────────────────────────

    #[test]
    fn noop_when_under_target() {
        let mut msgs = vec![Message::system("sys"), Message::user("hi")];
        let outcome = compact_history(&mut msgs, &opts(10_000, 0.8));
        assert_eq!(outcome.dropped, 0);
        assert!(!outcome.summary_injected);
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn compaction_reaches_target_ratio() {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..40 {
            msgs.push(filler(Role::User, 400));
            msgs.push(filler(Role::Assistant, 400));
        }
        let o = compact_history(&mut msgs, &opts(1000, 0.8));
        assert!(o.dropped > 0);
        assert!(
            o.tokens_after <= 800,
            "tokens_after {} exceeds target 800",
            o.tokens_after
        );
        assert_eq!(msgs[0].role, Role::System, "system prompt pinned");
    }

    #[test]
    fn compaction_is_monotone() {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..20 {
            msgs.push(filler(Role::User, 200));
        }
        let o = compact_history(&mut msgs, &opts(500, 0.6));
        assert!(o.tokens_after < o.tokens_before);
    }

    // ── Summary injection ─────────────────────────────────────────────────────

    #[test]
    fn summary_message_sits_after_system_prompt() {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..30 {
            msgs.push(filler(Role::User, 200 + i));
        }
        let o = compact_history(&mut msgs, &opts(400, 0.5));
        assert!(o.summary_injected);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs[1]
            .as_text()
            .unwrap()
            .starts_with("Compaction summary"));
    }

    #[test]
    fn summary_uses_most_recent_dropped_and_truncates_excerpts() {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..40 {
            msgs.push(Message::user(format!("msg-{i} {}", "y".repeat(300))));
        }
        compact_history(&mut msgs, &opts(300, 0.5));
        let summary = msgs[1].as_text().unwrap().to_string();
        let lines = summary.lines().count();
        assert!(lines <= SUMMARY_WINDOW + 1, "prefix line + at most 24 entries");
        assert!(summary.contains("..."), "long excerpts are truncated");
        assert!(summary.contains("- user: "));
    }

    #[test]
    fn summary_can_be_disabled() {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..20 {
            msgs.push(filler(Role::User, 300));
        }
        let mut o = opts(400, 0.5);
        o.inject_summary = false;
        let outcome = compact_history(&mut msgs, &o);
        assert!(outcome.dropped > 0);
        assert!(!outcome.summary_injected);
        assert!(msgs.iter().all(|m| m
            .as_text()
            .map(|t| !t.starts_with("Compaction summary"))
            .unwrap_or(true)));
    }

    #[test]
    fn custom_prefix_is_used() {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..20 {
            msgs.push(filler(Role::User, 300));
        }
        let mut o = opts(400, 0.5);
        o.summary_prefix = "Checkpoint".into();
        compact_history(&mut msgs, &o);
        assert!(msgs[1].as_text().unwrap().starts_with("Checkpoint"));
    }

    // ── Tool pairing (the compaction law) ─────────────────────────────────────

    fn tool_pair(id: &str, padding: usize) -> (Message, Message) {
        let call = Message::assistant_with_tool_calls(
            "",
            vec![ToolInvocation {
                id: id.into(),
                name: "bash".into(),
                args: json!({"command": "x".repeat(padding)}),
            }],
        );
        let result = Message::tool_result(id, "bash", "y".repeat(padding));
        (call, result)
    }

    /// No tool result may remain whose opening tool call was dropped.
    fn assert_no_orphans(msgs: &[Message]) {
        let call_ids: Vec<&str> = msgs.iter().flat_map(|m| m.tool_call_ids()).collect();
        for m in msgs {
            if m.role == Role::ToolResult {
                let id = m.tool_call_id.as_deref().unwrap();
                assert!(
                    call_ids.contains(&id),
                    "orphaned tool result for call id {id}"
                );
            }
        }
    }

    #[test]
    fn dropping_a_tool_call_drops_its_result() {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..10 {
            let (call, result) = tool_pair(&format!("tc-{i}"), 300);
            msgs.push(call);
            msgs.push(result);
        }
        msgs.push(Message::user("latest question"));
        compact_history(&mut msgs, &opts(400, 0.5));
        assert_no_orphans(&msgs);
    }

    #[test]
    fn parallel_tool_calls_drop_all_their_results() {
        let mut msgs = vec![Message::system("sys")];
        let call = Message::assistant_with_tool_calls(
            "",
            vec![
                ToolInvocation { id: "a".into(), name: "bash".into(), args: json!({}) },
                ToolInvocation { id: "b".into(), name: "grep".into(), args: json!({}) },
            ],
        );
        msgs.push(call);
        msgs.push(Message::tool_result("a", "bash", "x".repeat(400)));
        msgs.push(Message::tool_result("b", "grep", "y".repeat(400)));
        for _ in 0..10 {
            msgs.push(filler(Role::User, 300));
        }
        compact_history(&mut msgs, &opts(300, 0.5));
        assert_no_orphans(&msgs);
    }

    #[test]
    fn trailing_tool_pair_is_never_split() {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..10 {
            msgs.push(filler(Role::User, 300));
        }
        let (call, result) = tool_pair("tail", 50);
        msgs.push(call);
        msgs.push(result);
        // A target small enough that everything droppable goes.
        compact_history(&mut msgs, &opts(50, 0.5));
        assert_no_orphans(&msgs);
        let n = msgs.len();
        assert_eq!(msgs[n - 1].role, Role::ToolResult);
        assert_eq!(msgs[n - 1].tool_call_id.as_deref(), Some("tail"));
        assert!(msgs[n - 2].tool_call_ids().contains(&"tail"));
    }

    #[test]
    fn only_system_prompt_may_remain() {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..5 {
            msgs.push(filler(Role::User, 400));
        }
        let mut o = opts(10, 0.5);
        o.inject_summary = false;
        compact_history(&mut msgs, &o);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::System);
    }
}
