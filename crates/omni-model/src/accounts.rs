// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OAuth account selection for providers with multiple configured accounts.
//!
//! Selection must be deterministic for a given construction: tests assert
//! fairness properties, and reruns of a recorded session must route the same
//! way.  `Random` therefore uses a seeded xorshift instead of OS entropy.

use std::collections::HashMap;
use std::sync::Mutex;

use omni_config::AccountStrategy;

struct SelectorState {
    cursor: usize,
    /// Logical clock: bumped on every pick, recorded per account.
    tick: u64,
    last_used: HashMap<String, u64>,
    rng: u64,
}

pub struct AccountSelector {
    strategy: AccountStrategy,
    accounts: Vec<String>,
    state: Mutex<SelectorState>,
}

impl AccountSelector {
    pub fn new(strategy: AccountStrategy, accounts: Vec<String>) -> Self {
        Self::with_seed(strategy, accounts, 0x9E37_79B9_7F4A_7C15)
    }

    pub fn with_seed(strategy: AccountStrategy, accounts: Vec<String>, seed: u64) -> Self {
        Self {
            strategy,
            accounts,
            state: Mutex::new(SelectorState {
                cursor: 0,
                tick: 0,
                last_used: HashMap::new(),
                rng: seed.max(1),
            }),
        }
    }

    pub fn strategy(&self) -> AccountStrategy {
        self.strategy
    }

    /// Pick the account(s) to use for the next request.
    ///
    /// Every strategy returns exactly one account except `Parallel`, which
    /// returns all of them.  Returns an empty vec when no accounts are
    /// configured.
    pub fn select(&self) -> Vec<String> {
        if self.accounts.is_empty() {
            return Vec::new();
        }
        let mut state = self.state.lock().expect("selector state poisoned");
        state.tick += 1;
        let tick = state.tick;
        let picked: Vec<String> = match self.strategy {
            AccountStrategy::Single => vec![self.accounts[0].clone()],
            AccountStrategy::RoundRobin => {
                let account = self.accounts[state.cursor % self.accounts.len()].clone();
                state.cursor += 1;
                vec![account]
            }
            AccountStrategy::LeastRecent => {
                // Configuration order breaks ties, so untouched accounts are
                // drained front to back.
                let account = self
                    .accounts
                    .iter()
                    .min_by_key(|a| state.last_used.get(*a).copied().unwrap_or(0))
                    .expect("accounts non-empty")
                    .clone();
                vec![account]
            }
            AccountStrategy::Parallel => self.accounts.clone(),
            AccountStrategy::Random => {
                // xorshift64 — deterministic for a given seed.
                let mut x = state.rng;
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                state.rng = x;
                vec![self.accounts[(x % self.accounts.len() as u64) as usize].clone()]
            }
        };
        for a in &picked {
            state.last_used.insert(a.clone(), tick);
        }
        picked
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
