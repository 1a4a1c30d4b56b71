// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thin CLI over the omni runtime: run a query, price an event log,
//! render a transcript.  Real provider drivers are registered by host
//! applications through the library API; the CLI ships the mock driver so
//! the full pipeline can be exercised end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use omni_core::{AgentLoop, AgentLoopConfig, SdkEvent, Session, StatusLevel};
use omni_hooks::HookManager;
use omni_log::{
    export_cost_summary, summarize_turn_costs, transcript_to_markdown, CostExportFormat,
    CostOptions, EventLogEntry, EventLogStore,
};
use omni_model::{MockProvider, ModelRouter};
use omni_policy::{load_policies, PermissionManager, PolicyEngine, PolicySet};
use omni_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "omni", version, about = "A runtime for tool-using conversational agents")]
struct Cli {
    /// Explicit config file (merged over the standard search paths).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one query and print its event stream
    Run {
        prompt: String,
        /// Print raw JSON events instead of human-readable lines
        #[arg(long)]
        json: bool,
    },
    /// Summarize turn costs from an event log
    Cost {
        #[arg(long)]
        log: PathBuf,
        /// Output format: json, jsonl, or csv
        #[arg(long, default_value = "json")]
        format: String,
        /// Write to a file instead of stdout (required for csv/jsonl)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Include failed turns in the summary
        #[arg(long)]
        include_failed: bool,
    },
    /// Render an event log as a markdown transcript
    Transcript {
        #[arg(long)]
        log: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = omni_config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { prompt, json } => run_query(&config, &prompt, json).await,
        Command::Cost {
            log,
            format,
            out,
            include_failed,
        } => cost_report(&log, &format, out.as_deref(), include_failed),
        Command::Transcript { log } => {
            let entries = read_log(&log)?;
            print!("{}", transcript_to_markdown(&entries));
            Ok(())
        }
    }
}

async fn run_query(config: &omni_config::Config, prompt: &str, json: bool) -> anyhow::Result<()> {
    let policies = match &config.policies_file {
        Some(path) => load_policies(Path::new(path))
            .with_context(|| format!("loading policies from {path}"))?,
        None => PolicySet::default(),
    };
    let permissions = Arc::new(PermissionManager::new(
        Arc::new(PolicyEngine::new(policies)),
        config.agent.permission_mode,
    ));
    let hooks = Arc::new(HookManager::load(
        Path::new(&config.hooks.rules_dir),
        Path::new(&config.hooks.hooks_file),
        config.hooks.timeout_secs,
    ));
    let router = Arc::new(ModelRouter::new(config.router.cooldown_ms));
    let provider = Arc::new(MockProvider::default());
    router.refresh_from_provider(provider.as_ref()).await;

    let event_log = config
        .event_log
        .path
        .as_ref()
        .map(|p| EventLogStore::open(p, config.event_log.batch_size, config.event_log.flush_interval_ms));

    let loop_config = AgentLoopConfig::from_agent_config(
        &config.agent,
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    );
    let mut agent = AgentLoop::new(
        Session::new(),
        provider,
        Arc::new(ToolRegistry::new()),
        permissions,
        hooks,
        loop_config,
    )
    .with_router(router);
    if let Some(log) = &event_log {
        agent = agent.with_event_log(Arc::clone(log));
    }
    let agent = Arc::new(agent);

    let mut handle = agent.run(prompt);
    while let Some(event) = handle.next_event().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }
    if let Some(log) = &event_log {
        log.shutdown().await;
    }
    Ok(())
}

fn print_event(event: &SdkEvent) {
    match event {
        SdkEvent::Text { text, .. } => println!("{text}"),
        SdkEvent::Status { subtype, message, .. } => {
            let tag = match subtype {
                StatusLevel::Info => "info",
                StatusLevel::Progress => "progress",
                StatusLevel::Warning => "warning",
                StatusLevel::Error => "error",
            };
            eprintln!("[{tag}] {message}");
        }
        SdkEvent::ToolUse { tool, tool_use_id, .. } => eprintln!("[tool_use] {tool} id={tool_use_id}"),
        SdkEvent::ToolResult {
            tool,
            tool_use_id,
            is_error,
            ..
        } => {
            let status = if is_error.unwrap_or(false) { "error" } else { "ok" };
            eprintln!("[tool_result] {tool} id={tool_use_id} {status}");
        }
        SdkEvent::Result { result, error, .. } => match error {
            Some(e) => eprintln!("[result:error] {} ({:?})", result, e.code),
            None => eprintln!("[result] {result}"),
        },
        other => eprintln!("[event] {}", serde_json::to_string(other).unwrap_or_default()),
    }
}

fn read_log(path: &Path) -> anyhow::Result<Vec<EventLogEntry>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

fn cost_report(
    log: &Path,
    format: &str,
    out: Option<&Path>,
    include_failed: bool,
) -> anyhow::Result<()> {
    let entries = read_log(log)?;
    let summary = summarize_turn_costs(
        &entries,
        &CostOptions {
            include_failed_turns: include_failed,
            ..CostOptions::default()
        },
    );
    let format = CostExportFormat::parse(format)
        .with_context(|| format!("unknown cost format '{format}' (expected json, jsonl, or csv)"))?;
    match out {
        Some(path) => {
            export_cost_summary(&summary, path, format)?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}
