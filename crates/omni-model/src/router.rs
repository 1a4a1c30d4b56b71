// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model availability routing.
//!
//! One table keyed by `(provider, model)` tracks where each model came from,
//! how often it failed, and until when it is cooling down.  The router is
//! shared across agents: mutations take the write lock briefly, readers
//! snapshot under the read lock.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::{catalog, ModelProvider};

/// Where a routing-table entry was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    ProviderApi,
    Catalog,
    Configured,
}

#[derive(Debug, Clone)]
pub struct AvailableModelInfo {
    pub provider: String,
    pub model: String,
    pub source: ModelSource,
    pub failure_count: u32,
    /// A pair is usable iff this is unset or in the past.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub refreshed_at: DateTime<Utc>,
}

impl AvailableModelInfo {
    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|t| t <= now).unwrap_or(true)
    }
}

pub struct ModelRouter {
    table: RwLock<HashMap<(String, String), AvailableModelInfo>>,
    default_cooldown_ms: u64,
}

impl ModelRouter {
    pub fn new(default_cooldown_ms: u64) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            default_cooldown_ms,
        }
    }

    pub fn upsert_models(&self, provider: &str, models: &[String], source: ModelSource) {
        self.upsert_models_at(provider, models, source, Utc::now());
    }

    pub fn upsert_models_at(
        &self,
        provider: &str,
        models: &[String],
        source: ModelSource,
        now: DateTime<Utc>,
    ) {
        let mut table = self.table.write().expect("router table poisoned");
        for model in models {
            let key = (provider.to_string(), model.clone());
            table
                .entry(key)
                .and_modify(|info| {
                    info.source = source;
                    info.refreshed_at = now;
                })
                .or_insert_with(|| AvailableModelInfo {
                    provider: provider.to_string(),
                    model: model.clone(),
                    source,
                    failure_count: 0,
                    cooldown_until: None,
                    last_error: None,
                    refreshed_at: now,
                });
        }
    }

    /// Record a failure and start (or extend) the cooldown for the pair.
    /// Unknown pairs are inserted so that a failing configured model is still
    /// tracked.
    pub fn mark_failure(&self, provider: &str, model: &str, error: &str, cooldown_ms: Option<u64>) {
        self.mark_failure_at(provider, model, error, cooldown_ms, Utc::now());
    }

    pub fn mark_failure_at(
        &self,
        provider: &str,
        model: &str,
        error: &str,
        cooldown_ms: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let cooldown = Duration::milliseconds(cooldown_ms.unwrap_or(self.default_cooldown_ms) as i64);
        let mut table = self.table.write().expect("router table poisoned");
        let info = table
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| AvailableModelInfo {
                provider: provider.to_string(),
                model: model.to_string(),
                source: ModelSource::Configured,
                failure_count: 0,
                cooldown_until: None,
                last_error: None,
                refreshed_at: now,
            });
        info.failure_count += 1;
        info.cooldown_until = Some(now + cooldown);
        info.last_error = Some(error.to_string());
        warn!(provider, model, failures = info.failure_count, "model marked as failed");
    }

    pub fn clear_cooldown(&self, provider: &str, model: &str) {
        let mut table = self.table.write().expect("router table poisoned");
        if let Some(info) = table.get_mut(&(provider.to_string(), model.to_string())) {
            info.cooldown_until = None;
        }
    }

    pub fn is_on_cooldown(&self, provider: &str, model: &str) -> bool {
        self.is_on_cooldown_at(provider, model, Utc::now())
    }

    pub fn is_on_cooldown_at(&self, provider: &str, model: &str, now: DateTime<Utc>) -> bool {
        let table = self.table.read().expect("router table poisoned");
        table
            .get(&(provider.to_string(), model.to_string()))
            .map(|info| !info.usable_at(now))
            .unwrap_or(false)
    }

    /// Snapshot of registered models, optionally filtered by provider and
    /// excluding cooling-down pairs.  Sorted by (provider, model) so output
    /// is stable for display and tests.
    pub fn list_models(&self, provider: Option<&str>, include_cooldown: bool) -> Vec<AvailableModelInfo> {
        self.list_models_at(provider, include_cooldown, Utc::now())
    }

    pub fn list_models_at(
        &self,
        provider: Option<&str>,
        include_cooldown: bool,
        now: DateTime<Utc>,
    ) -> Vec<AvailableModelInfo> {
        let table = self.table.read().expect("router table poisoned");
        let mut out: Vec<AvailableModelInfo> = table
            .values()
            .filter(|info| provider.map(|p| info.provider == p).unwrap_or(true))
            .filter(|info| include_cooldown || info.usable_at(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.provider.as_str(), a.model.as_str()).cmp(&(b.provider.as_str(), b.model.as_str())));
        out
    }

    /// Choose the model to call for `provider`.
    ///
    /// A usable preferred model wins outright.  Otherwise usable candidates
    /// are ordered by ascending failure count, ties broken by most recent
    /// refresh; `None` means nothing is usable.
    pub fn choose_model(&self, provider: &str, preferred: Option<&str>) -> Option<String> {
        self.choose_model_at(provider, preferred, Utc::now())
    }

    pub fn choose_model_at(
        &self,
        provider: &str,
        preferred: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if let Some(p) = preferred {
            if !self.is_on_cooldown_at(provider, p, now) {
                return Some(p.to_string());
            }
        }
        let table = self.table.read().expect("router table poisoned");
        let mut candidates: Vec<&AvailableModelInfo> = table
            .values()
            .filter(|info| info.provider == provider && info.usable_at(now))
            .collect();
        candidates.sort_by(|a, b| {
            a.failure_count
                .cmp(&b.failure_count)
                .then(b.refreshed_at.cmp(&a.refreshed_at))
        });
        candidates.first().map(|info| info.model.clone())
    }

    /// Refresh the table for one provider.
    ///
    /// Live API listing wins; on failure or an empty result the static
    /// catalog is used; when the catalog has nothing either, the provider's
    /// configured model is registered so routing never goes dark.
    pub async fn refresh_from_provider(&self, provider: &dyn ModelProvider) {
        let name = provider.name().to_string();
        match provider.list_available_models().await {
            Ok(models) if !models.is_empty() => {
                debug!(provider = %name, count = models.len(), "refreshed models from provider api");
                self.upsert_models(&name, &models, ModelSource::ProviderApi);
                return;
            }
            Ok(_) => debug!(provider = %name, "provider listed no models; using catalog"),
            Err(e) => debug!(provider = %name, error = %e, "provider listing failed; using catalog"),
        }
        let from_catalog: Vec<String> = catalog::models_for_provider(&name)
            .into_iter()
            .map(str::to_string)
            .collect();
        if !from_catalog.is_empty() {
            self.upsert_models(&name, &from_catalog, ModelSource::Catalog);
        } else {
            self.upsert_models(
                &name,
                &[provider.model_name().to_string()],
                ModelSource::Configured,
            );
        }
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new(60_000)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockProvider;

    fn router_with(models: &[&str]) -> ModelRouter {
        let r = ModelRouter::new(60_000);
        let models: Vec<String> = models.iter().map(|s| s.to_string()).collect();
        r.upsert_models("p", &models, ModelSource::Configured);
        r
    }

    // ── Cooldown lifecycle ────────────────────────────────────────────────────

    #[test]
    fn cooldown_expires_exactly_after_interval() {
        let r = router_with(&["m1"]);
        let t0 = Utc::now();
        r.mark_failure_at("p", "m1", "boom", Some(60_000), t0);
        assert!(r.is_on_cooldown_at("p", "m1", t0));
        assert!(r.is_on_cooldown_at("p", "m1", t0 + Duration::milliseconds(59_999)));
        assert!(!r.is_on_cooldown_at("p", "m1", t0 + Duration::milliseconds(60_000)));
    }

    #[test]
    fn clear_cooldown_restores_usability() {
        let r = router_with(&["m1"]);
        r.mark_failure("p", "m1", "boom", None);
        assert!(r.is_on_cooldown("p", "m1"));
        r.clear_cooldown("p", "m1");
        assert!(!r.is_on_cooldown("p", "m1"));
    }

    #[test]
    fn unknown_pair_is_not_on_cooldown() {
        let r = ModelRouter::default();
        assert!(!r.is_on_cooldown("p", "never-seen"));
    }

    #[test]
    fn mark_failure_inserts_unknown_pair() {
        let r = ModelRouter::default();
        r.mark_failure("p", "new-model", "err", None);
        let listed = r.list_models(Some("p"), true);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].failure_count, 1);
        assert_eq!(listed[0].last_error.as_deref(), Some("err"));
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    #[test]
    fn preferred_model_wins_when_usable() {
        let r = router_with(&["m1", "m2"]);
        assert_eq!(r.choose_model("p", Some("m1")), Some("m1".into()));
    }

    #[test]
    fn fallback_to_other_model_when_preferred_cools_down() {
        let r = router_with(&["m1", "m2"]);
        let t0 = Utc::now();
        r.mark_failure_at("p", "m1", "overloaded", Some(60_000), t0);
        assert_eq!(r.choose_model_at("p", Some("m1"), t0), Some("m2".into()));
        // Only one model remains usable.
        assert_eq!(r.list_models_at(Some("p"), false, t0).len(), 1);
        // After the cooldown window the preferred model is selectable again.
        let later = t0 + Duration::milliseconds(60_000);
        assert_eq!(r.choose_model_at("p", Some("m1"), later), Some("m1".into()));
    }

    #[test]
    fn selection_orders_by_failure_count() {
        let r = router_with(&["a", "b"]);
        let t0 = Utc::now();
        // One expired failure on "a": it is usable but has a worse record.
        r.mark_failure_at("p", "a", "flaky", Some(0), t0 - Duration::seconds(10));
        assert_eq!(r.choose_model_at("p", None, t0), Some("b".into()));
    }

    #[test]
    fn selection_tie_breaks_by_freshness() {
        let r = ModelRouter::default();
        let t0 = Utc::now();
        r.upsert_models_at("p", &["old".into()], ModelSource::Catalog, t0 - Duration::seconds(60));
        r.upsert_models_at("p", &["fresh".into()], ModelSource::Catalog, t0);
        assert_eq!(r.choose_model_at("p", None, t0), Some("fresh".into()));
    }

    #[test]
    fn choose_returns_none_when_everything_cools_down() {
        let r = router_with(&["m1"]);
        let t0 = Utc::now();
        r.mark_failure_at("p", "m1", "down", Some(60_000), t0);
        assert_eq!(r.choose_model_at("p", None, t0), None);
    }

    // ── Refresh ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn refresh_falls_back_to_catalog() {
        // MockProvider does not implement list_available_models, and the
        // catalog knows "mock"/"mock-model".
        let r = ModelRouter::default();
        r.refresh_from_provider(&MockProvider::default()).await;
        let listed = r.list_models(Some("mock"), true);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].source, ModelSource::Catalog);
    }

    #[tokio::test]
    async fn refresh_uses_configured_model_when_catalog_is_empty() {
        let r = ModelRouter::default();
        let p = MockProvider::named("off-catalog", "local-model");
        r.refresh_from_provider(&p).await;
        let listed = r.list_models(Some("off-catalog"), true);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].model, "local-model");
        assert_eq!(listed[0].source, ModelSource::Configured);
    }
}
