// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured-output extraction and validation.
//!
//! Models asked for JSON frequently wrap it in prose or a fenced block;
//! extraction tries the raw text first, then fenced blocks, then the first
//! balanced object.  Validation runs the caller's JSON Schema.

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StructuredOutputConfig {
    pub schema: Value,
    /// When false, validation failures degrade to a warning instead of a
    /// terminal error.
    pub fail_on_validation_error: bool,
}

impl StructuredOutputConfig {
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            fail_on_validation_error: true,
        }
    }
}

/// Pull the first JSON value out of model text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }
    if let Some(v) = extract_fenced(trimmed) {
        return Some(v);
    }
    extract_balanced_object(trimmed)
}

/// Look inside ```json fences (and bare ``` fences).
fn extract_fenced(text: &str) -> Option<Value> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let end = body.find("```")?;
        let candidate = body[..end].trim();
        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
            if v.is_object() || v.is_array() {
                return Some(v);
            }
        }
        rest = &body[end + 3..];
    }
    None
}

/// Scan for the first balanced `{...}`, string-aware.
fn extract_balanced_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate `instance` against `schema`.  A schema that fails to compile is
/// skipped rather than blocking the turn.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), Vec<String>> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "uncompilable structured-output schema; skipping validation");
            return Ok(());
        }
    };
    let errors: Vec<String> = validator.iter_errors(instance).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Extract-and-validate in one step; the error string is consumer-facing.
pub fn parse_structured(text: &str, config: &StructuredOutputConfig) -> Result<Value, String> {
    let value = extract_json(text)
        .ok_or_else(|| "Structured output validation failed: no JSON value found".to_string())?;
    match validate(&config.schema, &value) {
        Ok(()) => Ok(value),
        Err(errors) => Err(format!(
            "Structured output validation failed: {}",
            errors.join("; ")
        )),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
