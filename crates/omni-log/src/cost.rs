// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Turn-cost aggregation over the persisted event log.
//!
//! Every `turn_completed` event carries token usage; pricing resolves
//! through caller-supplied rate rules first, then a built-in rate card,
//! then a flat default.  All rates are USD per million tokens.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use omni_model::Usage;

use crate::EventLogEntry;

/// USD per million tokens, by token class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub thinking_per_mtok: f64,
}

impl Rate {
    pub const fn flat(input: f64, output: f64) -> Self {
        Self {
            input_per_mtok: input,
            output_per_mtok: output,
            thinking_per_mtok: output,
        }
    }

    pub const ZERO: Self = Self::flat(0.0, 0.0);

    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.input_tokens as f64 / 1e6 * self.input_per_mtok
            + usage.output_tokens as f64 / 1e6 * self.output_per_mtok
            + usage.thinking_tokens as f64 / 1e6 * self.thinking_per_mtok
    }
}

/// Caller-supplied pricing override matched on (provider, model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRule {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub rate: Rate,
}

impl RateRule {
    fn matches(&self, provider: &str, model: &str) -> bool {
        self.provider.as_deref().map(|p| p == provider).unwrap_or(true)
            && self.model.as_deref().map(|m| m == model).unwrap_or(true)
    }
}

/// Built-in rate card.  Local runtimes are free; unknown pairs get a flat
/// mid-range default so estimates stay order-of-magnitude honest.
pub fn builtin_rate(provider: &str, model: &str) -> (Rate, &'static str) {
    match provider {
        "ollama" | "vllm" | "lmstudio" | "mock" => (Rate::ZERO, "rate-card"),
        "anthropic" => {
            if model.contains("opus") {
                (Rate::flat(5.0, 25.0), "rate-card")
            } else if model.contains("haiku") {
                (Rate::flat(1.0, 5.0), "rate-card")
            } else {
                (Rate::flat(3.0, 15.0), "rate-card")
            }
        }
        "openai" => {
            if model.contains("mini") {
                (Rate::flat(0.15, 0.6), "rate-card")
            } else {
                (Rate::flat(2.5, 10.0), "rate-card")
            }
        }
        _ => (Rate::flat(3.0, 15.0), "default"),
    }
}

/// Resolve the rate for one turn: rules first, then the built-in card.
fn resolve_rate(
    provider: &str,
    model: &str,
    rules: &[RateRule],
    default_rate: Option<Rate>,
) -> (Rate, String) {
    for rule in rules {
        if rule.matches(provider, model) {
            return (rule.rate, "rules".to_string());
        }
    }
    if let Some(rate) = default_rate {
        return (rate, "default".to_string());
    }
    let (rate, source) = builtin_rate(provider, model);
    (rate, source.to_string())
}

/// Convenience for the turn path: one turn's estimated cost with built-in
/// pricing only.
pub fn estimate_turn_cost(provider: &str, model: &str, usage: &Usage) -> f64 {
    builtin_rate(provider, model).0.cost(usage)
}

/// One priced `turn_completed` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnCostRecord {
    pub ts: i64,
    pub status: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub usage: Usage,
    pub estimated_cost_usd: f64,
    pub pricing_source: String,
}

#[derive(Debug, Clone, Default)]
pub struct CostOptions {
    pub include_failed_turns: bool,
    pub default_rate: Option<Rate>,
    pub rules: Vec<RateRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub turns: Vec<TurnCostRecord>,
    pub total_usd: f64,
    pub total_usage: Usage,
    pub by_provider: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
}

/// Aggregate every `turn_completed` event in `entries`.
pub fn summarize_turn_costs(entries: &[EventLogEntry], opts: &CostOptions) -> CostSummary {
    let mut summary = CostSummary::default();
    for entry in entries.iter().filter(|e| e.kind == "turn_completed") {
        let status = entry
            .payload
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        if !opts.include_failed_turns && status != "success" {
            continue;
        }
        let provider = entry
            .payload
            .get("provider")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let model = entry
            .payload
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let usage: Usage = entry
            .payload
            .get("usage")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let (rate, pricing_source) = resolve_rate(
            provider.as_deref().unwrap_or(""),
            model.as_deref().unwrap_or(""),
            &opts.rules,
            opts.default_rate,
        );
        let estimated_cost_usd = rate.cost(&usage);

        summary.total_usd += estimated_cost_usd;
        summary.total_usage.add(&usage);
        *summary
            .by_provider
            .entry(provider.clone().unwrap_or_else(|| "unknown".into()))
            .or_insert(0.0) += estimated_cost_usd;
        *summary
            .by_model
            .entry(model.clone().unwrap_or_else(|| "unknown".into()))
            .or_insert(0.0) += estimated_cost_usd;
        summary.turns.push(TurnCostRecord {
            ts: entry.ts,
            status,
            provider,
            model,
            usage,
            estimated_cost_usd,
            pricing_source,
        });
    }
    summary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostExportFormat {
    Json,
    Jsonl,
    Csv,
}

impl CostExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "json" => Self::Json,
            "jsonl" => Self::Jsonl,
            "csv" => Self::Csv,
            _ => return None,
        })
    }
}

/// Fixed CSV column order; tests pin it.
const CSV_HEADER: [&str; 9] = [
    "ts",
    "status",
    "provider",
    "model",
    "input_tokens",
    "output_tokens",
    "thinking_tokens",
    "estimated_cost_usd",
    "pricing_source",
];

/// Write the summary to `path` in the requested format.
pub fn export_cost_summary(
    summary: &CostSummary,
    path: &Path,
    format: CostExportFormat,
) -> anyhow::Result<()> {
    match format {
        CostExportFormat::Json => {
            let text = serde_json::to_string_pretty(summary)?;
            std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        }
        CostExportFormat::Jsonl => {
            let mut f = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            for turn in &summary.turns {
                writeln!(f, "{}", serde_json::to_string(turn)?)?;
            }
        }
        CostExportFormat::Csv => {
            let mut w = csv::Writer::from_path(path)
                .with_context(|| format!("creating {}", path.display()))?;
            w.write_record(CSV_HEADER)?;
            for t in &summary.turns {
                w.write_record([
                    t.ts.to_string(),
                    t.status.clone(),
                    t.provider.clone().unwrap_or_default(),
                    t.model.clone().unwrap_or_default(),
                    t.usage.input_tokens.to_string(),
                    t.usage.output_tokens.to_string(),
                    t.usage.thinking_tokens.to_string(),
                    format!("{:.6}", t.estimated_cost_usd),
                    t.pricing_source.clone(),
                ])?;
            }
            w.flush()?;
        }
    }
    Ok(())
}

/// Read back a `jsonl` cost export.
pub fn parse_turns_jsonl(text: &str) -> Vec<TurnCostRecord> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
