// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The TASKS board file: a markdown kanban with four fixed sections.
//!
//! ```markdown
//! ## Todo
//! - [ ] [t1] Write the parser #core #parser
//! ## In Progress
//! - [ ] [empty] (no tasks)
//! ## Blocked
//! - [ ] [empty] (no tasks)
//! ## Done
//! - [x] [t0] Set up the repo
//! ```
//!
//! The `[empty]` sentinel marks an empty section and is dropped on parse.

use regex::Regex;
use serde::{Deserialize, Serialize};

const SECTIONS: [&str; 4] = ["Todo", "In Progress", "Blocked", "Done"];
const EMPTY_SENTINEL: &str = "- [ ] [empty] (no tasks)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardTask {
    pub id: String,
    pub title: String,
    pub tags: Vec<String>,
    pub done: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksBoard {
    pub todo: Vec<BoardTask>,
    pub in_progress: Vec<BoardTask>,
    pub blocked: Vec<BoardTask>,
    pub done: Vec<BoardTask>,
}

impl TasksBoard {
    pub fn parse(text: &str) -> Self {
        let line_re = Regex::new(r"^- \[([ x])\] \[([^\]]+)\] (.*)$").expect("static regex");
        let mut board = TasksBoard::default();
        let mut current: Option<usize> = None;
        for line in text.lines() {
            let line = line.trim_end();
            if let Some(heading) = line.strip_prefix("## ") {
                current = SECTIONS.iter().position(|s| *s == heading.trim());
                continue;
            }
            let Some(section) = current else { continue };
            if line == EMPTY_SENTINEL {
                continue;
            }
            let Some(caps) = line_re.captures(line) else {
                continue;
            };
            let id = caps[2].to_string();
            if id == "empty" {
                continue;
            }
            let rest = caps[3].trim();
            let mut title_words = Vec::new();
            let mut tags = Vec::new();
            for word in rest.split_whitespace() {
                if let Some(tag) = word.strip_prefix('#') {
                    if !tag.is_empty() {
                        tags.push(tag.to_string());
                        continue;
                    }
                }
                title_words.push(word);
            }
            let task = BoardTask {
                id,
                title: title_words.join(" "),
                tags,
                done: &caps[1] == "x",
            };
            match section {
                0 => board.todo.push(task),
                1 => board.in_progress.push(task),
                2 => board.blocked.push(task),
                _ => board.done.push(task),
            }
        }
        board
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (section, tasks) in [
            ("Todo", &self.todo),
            ("In Progress", &self.in_progress),
            ("Blocked", &self.blocked),
            ("Done", &self.done),
        ] {
            out.push_str("## ");
            out.push_str(section);
            out.push('\n');
            if tasks.is_empty() {
                out.push_str(EMPTY_SENTINEL);
                out.push('\n');
            } else {
                for t in tasks {
                    let mark = if t.done { 'x' } else { ' ' };
                    out.push_str(&format!("- [{mark}] [{}] {}", t.id, t.title));
                    for tag in &t.tags {
                        out.push_str(&format!(" #{tag}"));
                    }
                    out.push('\n');
                }
            }
            out.push('\n');
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
