// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cost;
mod store;
mod transcript;

pub use cost::{
    builtin_rate, estimate_turn_cost, export_cost_summary, parse_turns_jsonl, summarize_turn_costs,
    CostExportFormat, CostOptions, CostSummary, Rate, RateRule, TurnCostRecord,
};
pub use store::{EventLogEntry, EventLogStore, RetentionPolicy};
pub use transcript::transcript_to_markdown;
