// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-result truncation: keep a head and tail window with an explicit
//! omission notice so the model knows more output exists.

/// Truncate `content` to roughly `cap_tokens` (4 bytes per token).
/// A cap of `0` disables truncation.
pub fn truncate_tool_result(content: &str, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }

    let lines: Vec<&str> = content.lines().collect();
    let half = cap_chars / 2;

    let mut head = String::with_capacity(half);
    let mut head_count = 0usize;
    for line in &lines {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev() {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted_lines = lines.len().saturating_sub(head_count + tail_count);
    if omitted_lines == 0 {
        // Single enormous line: hard cut at a char boundary.
        let mut cut = cap_chars.min(content.len());
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        let omitted = content.len() - cut;
        return format!("{}\n[... {omitted} bytes omitted ...]", &content[..cut]);
    }
    let omitted_bytes = content.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n[... {omitted_lines} lines / {omitted_bytes} bytes omitted ...]\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn short_content_passes_through() {
        assert_eq!(truncate_tool_result("hello", 100), "hello");
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let big = "a".repeat(100_000);
        assert_eq!(truncate_tool_result(&big, 0), big);
    }

    #[test]
    fn keeps_head_and_tail_lines() {
        let content = make_lines(500);
        let out = truncate_tool_result(&content, 50);
        assert!(out.contains("line 0"));
        assert!(out.contains("line 499"));
        assert!(out.contains("omitted"));
        assert!(!out.contains("line 250\n"), "middle lines are dropped");
    }

    #[test]
    fn notice_reports_lines_and_bytes() {
        let out = truncate_tool_result(&make_lines(500), 50);
        assert!(out.contains("lines /"));
        assert!(out.contains("bytes omitted"));
    }

    #[test]
    fn single_long_line_hard_cuts() {
        let content = "x".repeat(10_000);
        let out = truncate_tool_result(&content, 10);
        let kept = out.chars().take_while(|&c| c == 'x').count();
        assert_eq!(kept, 40);
        assert!(out.contains("bytes omitted"));
    }

    #[test]
    fn exact_cap_is_untouched() {
        let content = "a".repeat(40);
        assert_eq!(truncate_tool_result(&content, 10), content);
    }
}
