// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static model catalog: fallback metadata for known (provider, model) pairs.
//!
//! The router consults this list when a provider cannot enumerate its own
//! models, and cost estimation uses it for limit defaults.  It is metadata
//! only — driver construction lives with the host application.

/// Context and output limits for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelLimits {
    pub context_window: u32,
    pub max_output_tokens: u32,
}

impl Default for ModelLimits {
    fn default() -> Self {
        // Conservative floor for unknown models.
        Self {
            context_window: 32_768,
            max_output_tokens: 4_096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub provider: &'static str,
    pub model: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
}

impl CatalogEntry {
    pub fn limits(&self) -> ModelLimits {
        ModelLimits {
            context_window: self.context_window,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

pub static CATALOG: &[CatalogEntry] = &[
    // ── Anthropic ─────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "anthropic",
        model: "claude-opus-4-5",
        context_window: 200_000,
        max_output_tokens: 32_000,
    },
    CatalogEntry {
        provider: "anthropic",
        model: "claude-sonnet-4-5",
        context_window: 200_000,
        max_output_tokens: 64_000,
    },
    CatalogEntry {
        provider: "anthropic",
        model: "claude-haiku-4-5",
        context_window: 200_000,
        max_output_tokens: 64_000,
    },
    // ── OpenAI ────────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "openai",
        model: "gpt-4o",
        context_window: 128_000,
        max_output_tokens: 16_384,
    },
    CatalogEntry {
        provider: "openai",
        model: "gpt-4o-mini",
        context_window: 128_000,
        max_output_tokens: 16_384,
    },
    CatalogEntry {
        provider: "openai",
        model: "o3-mini",
        context_window: 200_000,
        max_output_tokens: 100_000,
    },
    // ── Local / OSS ───────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "ollama",
        model: "llama3.2",
        context_window: 128_000,
        max_output_tokens: 8_192,
    },
    CatalogEntry {
        provider: "ollama",
        model: "qwen2.5-coder",
        context_window: 32_768,
        max_output_tokens: 8_192,
    },
    // ── Testing ───────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "mock",
        model: "mock-model",
        context_window: 128_000,
        max_output_tokens: 8_192,
    },
];

/// Look up a catalog entry.  Returns `None` for unknown pairs.
pub fn lookup(provider: &str, model: &str) -> Option<&'static CatalogEntry> {
    CATALOG
        .iter()
        .find(|e| e.provider == provider && e.model == model)
}

/// All catalog model names for one provider, in declaration order.
pub fn models_for_provider(provider: &str) -> Vec<&'static str> {
    CATALOG
        .iter()
        .filter(|e| e.provider == provider)
        .map(|e| e.model)
        .collect()
}
