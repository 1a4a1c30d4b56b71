// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Companion persistence for the hub: a snapshot JSON plus a JSONL event
//! log replayed in order on load.  Checkpointing folds the event log into a
//! fresh snapshot.

use std::path::{Path, PathBuf};

use anyhow::Context;
use std::io::Write;
use tracing::debug;

use crate::{CommunicationHub, HubEvent, HubState};

pub struct HubStore {
    dir: PathBuf,
}

impl HubStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("hub-snapshot.json")
    }

    fn events_path(&self) -> PathBuf {
        self.dir.join("hub-events.jsonl")
    }

    /// Append the hub's pending events to the event log.
    pub fn persist(&self, hub: &mut CommunicationHub) -> anyhow::Result<usize> {
        let events = hub.take_events();
        if events.is_empty() {
            return Ok(0);
        }
        std::fs::create_dir_all(&self.dir)?;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .with_context(|| format!("opening {}", self.events_path().display()))?;
        for e in &events {
            writeln!(f, "{}", serde_json::to_string(e)?)?;
        }
        Ok(events.len())
    }

    /// Write a full snapshot and truncate the event log.
    pub fn checkpoint(&self, hub: &mut CommunicationHub) -> anyhow::Result<()> {
        // Pending events are already part of the state; a checkpoint makes
        // persisting them separately unnecessary.
        let _ = hub.take_events();
        std::fs::create_dir_all(&self.dir)?;
        let state = hub.export_state();
        let tmp = self.snapshot_path().with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&state)?)?;
        std::fs::rename(&tmp, self.snapshot_path())?;
        let _ = std::fs::remove_file(self.events_path());
        debug!(dir = %self.dir.display(), "hub checkpoint written");
        Ok(())
    }

    /// Rebuild a hub: snapshot first, then the event log in order.
    pub fn load(&self) -> anyhow::Result<CommunicationHub> {
        let mut hub = CommunicationHub::new();
        if self.snapshot_path().is_file() {
            let text = std::fs::read_to_string(self.snapshot_path())?;
            let state: HubState =
                serde_json::from_str(&text).context("parsing hub snapshot")?;
            hub.import_state(state);
        }
        for event in read_events(&self.events_path()) {
            hub.apply_event(&event);
        }
        Ok(hub)
    }
}

fn read_events(path: &Path) -> Vec<HubEvent> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentProfile, ChannelType, WorkspaceRole};

    fn seeded() -> CommunicationHub {
        let mut hub = CommunicationHub::new();
        hub.ensure_workspace("ws");
        hub.register_agent(
            "ws",
            AgentProfile {
                id: "boss".into(),
                name: "boss".into(),
                team: None,
                department: None,
                role: WorkspaceRole::Owner,
            },
        )
        .unwrap();
        hub
    }

    #[test]
    fn persist_then_load_replays_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = HubStore::new(dir.path());
        let mut hub = seeded();
        let ch = hub
            .create_channel("ws", "general", ChannelType::General, "boss", None, None, false)
            .unwrap();
        hub.post_message("ws", &ch.id, "boss", "hello", None, None)
            .unwrap();
        store.persist(&mut hub).unwrap();

        let loaded = store.load().unwrap();
        let msgs = loaded.list_messages("ws", &ch.id, None).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "hello");
    }

    #[test]
    fn checkpoint_folds_events_into_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = HubStore::new(dir.path());
        let mut hub = seeded();
        hub.create_channel("ws", "general", ChannelType::General, "boss", None, None, false)
            .unwrap();
        store.checkpoint(&mut hub).unwrap();
        assert!(dir.path().join("hub-snapshot.json").is_file());
        assert!(!dir.path().join("hub-events.jsonl").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.list_channels("ws").unwrap().len(), 1);
    }

    #[test]
    fn events_after_checkpoint_layer_on_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = HubStore::new(dir.path());
        let mut hub = seeded();
        let ch = hub
            .create_channel("ws", "general", ChannelType::General, "boss", None, None, false)
            .unwrap();
        store.checkpoint(&mut hub).unwrap();
        hub.post_message("ws", &ch.id, "boss", "after checkpoint", None, None)
            .unwrap();
        store.persist(&mut hub).unwrap();

        let loaded = store.load().unwrap();
        let msgs = loaded.list_messages("ws", &ch.id, None).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "after checkpoint");
    }

    #[test]
    fn load_from_empty_dir_is_an_empty_hub() {
        let dir = tempfile::tempdir().unwrap();
        let store = HubStore::new(dir.path().join("nested"));
        let hub = store.load().unwrap();
        assert!(hub.list_channels("ws").is_err());
    }
}
