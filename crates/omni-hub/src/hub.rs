// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workspace-scoped agent messaging with deterministic invariants.
//!
//! Every mutation is validated against RBAC first, then expressed as a
//! [`HubEvent`] and applied through the same code path used for replay, so a
//! persisted event stream reconstructs byte-identical state.

use std::collections::BTreeMap;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::types::*;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),
    #[error("agent '{0}' is not registered in this workspace")]
    AgentNotFound(String),
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("message '{0}' not found")]
    MessageNotFound(String),
    #[error("agent '{agent}' may not {action} channel '{channel}'")]
    AccessDenied {
        agent: String,
        action: &'static str,
        channel: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub agents: BTreeMap<String, AgentProfile>,
    pub channels: BTreeMap<String, CommunicationChannel>,
    /// channel id → messages in post order.
    pub messages: BTreeMap<String, Vec<ChannelMessage>>,
}

/// Complete serializable hub state for snapshot/export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubState {
    pub workspaces: BTreeMap<String, Workspace>,
}

/// Domain events; the only way state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    WorkspaceEnsured {
        workspace_id: String,
    },
    AgentRegistered {
        workspace_id: String,
        agent: AgentProfile,
    },
    ChannelCreated {
        workspace_id: String,
        channel: CommunicationChannel,
    },
    ChannelUpdated {
        workspace_id: String,
        channel_id: String,
        name: Option<String>,
        team: Option<String>,
        department: Option<String>,
        updated_at: chrono::DateTime<Utc>,
    },
    ChannelDeleted {
        workspace_id: String,
        channel_id: String,
    },
    MemberJoined {
        workspace_id: String,
        channel_id: String,
        agent_id: String,
        membership: ChannelMembership,
    },
    MessagePosted {
        workspace_id: String,
        channel_id: String,
        message: ChannelMessage,
        delivery: DeliveryPlan,
    },
    ReactionAdded {
        workspace_id: String,
        channel_id: String,
        message_id: String,
        agent_id: String,
        emoji: String,
    },
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: usize,
    pub message: ChannelMessage,
}

#[derive(Debug, Default)]
pub struct CommunicationHub {
    state: HubState,
    pending_events: Vec<HubEvent>,
}

impl CommunicationHub {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Event plumbing ────────────────────────────────────────────────────────

    /// Apply one event to state without validation.  This is the replay path;
    /// live operations validate first and then go through here too.
    pub fn apply_event(&mut self, event: &HubEvent) {
        match event {
            HubEvent::WorkspaceEnsured { workspace_id } => {
                self.state
                    .workspaces
                    .entry(workspace_id.clone())
                    .or_insert_with(|| Workspace {
                        id: workspace_id.clone(),
                        ..Workspace::default()
                    });
            }
            HubEvent::AgentRegistered { workspace_id, agent } => {
                if let Some(ws) = self.state.workspaces.get_mut(workspace_id) {
                    ws.agents.insert(agent.id.clone(), agent.clone());
                }
            }
            HubEvent::ChannelCreated { workspace_id, channel } => {
                if let Some(ws) = self.state.workspaces.get_mut(workspace_id) {
                    ws.messages.entry(channel.id.clone()).or_default();
                    ws.channels.insert(channel.id.clone(), channel.clone());
                }
            }
            HubEvent::ChannelUpdated {
                workspace_id,
                channel_id,
                name,
                team,
                department,
                updated_at,
            } => {
                if let Some(ch) = self
                    .state
                    .workspaces
                    .get_mut(workspace_id)
                    .and_then(|ws| ws.channels.get_mut(channel_id))
                {
                    if let Some(name) = name {
                        ch.name = name.clone();
                    }
                    if team.is_some() {
                        ch.team = team.clone();
                    }
                    if department.is_some() {
                        ch.department = department.clone();
                    }
                    ch.updated_at = (*updated_at).max(ch.updated_at);
                }
            }
            HubEvent::ChannelDeleted {
                workspace_id,
                channel_id,
            } => {
                if let Some(ws) = self.state.workspaces.get_mut(workspace_id) {
                    ws.channels.remove(channel_id);
                    ws.messages.remove(channel_id);
                }
            }
            HubEvent::MemberJoined {
                workspace_id,
                channel_id,
                agent_id,
                membership,
            } => {
                if let Some(ch) = self
                    .state
                    .workspaces
                    .get_mut(workspace_id)
                    .and_then(|ws| ws.channels.get_mut(channel_id))
                {
                    ch.members.insert(agent_id.clone(), membership.clone());
                    ch.updated_at = membership.joined_at.max(ch.updated_at);
                }
            }
            HubEvent::MessagePosted {
                workspace_id,
                channel_id,
                message,
                ..
            } => {
                if let Some(ws) = self.state.workspaces.get_mut(workspace_id) {
                    if let Some(ch) = ws.channels.get_mut(channel_id) {
                        // Channel timestamps never move backwards.
                        ch.updated_at = message.created_at.max(ch.updated_at);
                    }
                    ws.messages
                        .entry(channel_id.clone())
                        .or_default()
                        .push(message.clone());
                }
            }
            HubEvent::ReactionAdded {
                workspace_id,
                channel_id,
                message_id,
                agent_id,
                emoji,
            } => {
                if let Some(msgs) = self
                    .state
                    .workspaces
                    .get_mut(workspace_id)
                    .and_then(|ws| ws.messages.get_mut(channel_id))
                {
                    if let Some(m) = msgs.iter_mut().find(|m| m.id == *message_id) {
                        let who = m.reactions.entry(emoji.clone()).or_default();
                        if !who.contains(agent_id) {
                            who.push(agent_id.clone());
                        }
                    }
                }
            }
        }
    }

    fn record(&mut self, event: HubEvent) {
        self.apply_event(&event);
        self.pending_events.push(event);
    }

    /// Drain events emitted since the last call (for the companion store).
    pub fn take_events(&mut self) -> Vec<HubEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn export_state(&self) -> HubState {
        self.state.clone()
    }

    pub fn import_state(&mut self, state: HubState) {
        self.state = state;
        self.pending_events.clear();
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    fn ws(&self, id: &str) -> Result<&Workspace, HubError> {
        self.state
            .workspaces
            .get(id)
            .ok_or_else(|| HubError::WorkspaceNotFound(id.to_string()))
    }

    fn agent<'a>(&'a self, ws: &'a Workspace, id: &str) -> Result<&'a AgentProfile, HubError> {
        ws.agents
            .get(id)
            .ok_or_else(|| HubError::AgentNotFound(id.to_string()))
    }

    fn channel<'a>(
        &'a self,
        ws: &'a Workspace,
        id: &str,
    ) -> Result<&'a CommunicationChannel, HubError> {
        ws.channels
            .get(id)
            .ok_or_else(|| HubError::ChannelNotFound(id.to_string()))
    }

    // ── RBAC ──────────────────────────────────────────────────────────────────

    pub fn can_manage_channel(
        &self,
        workspace_id: &str,
        channel_id: &str,
        agent_id: &str,
    ) -> Result<bool, HubError> {
        let ws = self.ws(workspace_id)?;
        let agent = self.agent(ws, agent_id)?;
        let channel = self.channel(ws, channel_id)?;
        Ok(agent.role.is_privileged() || channel.created_by == agent_id)
    }

    fn post_allowed(channel: &CommunicationChannel, agent: &AgentProfile) -> bool {
        if agent.role.is_privileged() {
            return true;
        }
        match channel.channel_type {
            ChannelType::General => true,
            ChannelType::Team => channel.team.is_some() && channel.team == agent.team,
            ChannelType::Department => {
                channel.department.is_some() && channel.department == agent.department
            }
            _ => channel.members.contains_key(&agent.id),
        }
    }

    pub fn can_post(
        &self,
        workspace_id: &str,
        channel_id: &str,
        agent_id: &str,
    ) -> Result<bool, HubError> {
        let ws = self.ws(workspace_id)?;
        let agent = self.agent(ws, agent_id)?;
        let channel = self.channel(ws, channel_id)?;
        Ok(Self::post_allowed(channel, agent))
    }

    /// Reading follows posting, plus explicit membership always grants access.
    pub fn can_access_channel(
        &self,
        workspace_id: &str,
        channel_id: &str,
        agent_id: &str,
    ) -> Result<bool, HubError> {
        let ws = self.ws(workspace_id)?;
        let agent = self.agent(ws, agent_id)?;
        let channel = self.channel(ws, channel_id)?;
        Ok(Self::post_allowed(channel, agent) || channel.members.contains_key(agent_id))
    }

    // ── Workspace / agents ────────────────────────────────────────────────────

    pub fn ensure_workspace(&mut self, workspace_id: &str) {
        if !self.state.workspaces.contains_key(workspace_id) {
            self.record(HubEvent::WorkspaceEnsured {
                workspace_id: workspace_id.to_string(),
            });
        }
    }

    pub fn register_agent(&mut self, workspace_id: &str, agent: AgentProfile) -> Result<(), HubError> {
        self.ws(workspace_id)?;
        self.record(HubEvent::AgentRegistered {
            workspace_id: workspace_id.to_string(),
            agent,
        });
        Ok(())
    }

    // ── Channels ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_channel(
        &mut self,
        workspace_id: &str,
        name: &str,
        channel_type: ChannelType,
        created_by: &str,
        team: Option<String>,
        department: Option<String>,
        is_private: bool,
    ) -> Result<CommunicationChannel, HubError> {
        let ws = self.ws(workspace_id)?;
        self.agent(ws, created_by)?;
        let now = Utc::now();
        let mut members = BTreeMap::new();
        members.insert(
            created_by.to_string(),
            ChannelMembership {
                role: ChannelRole::Owner,
                joined_at: now,
            },
        );
        let channel = CommunicationChannel {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            channel_type,
            created_by: created_by.to_string(),
            team,
            department,
            is_private: is_private || channel_type.is_members_only(),
            members,
            created_at: now,
            updated_at: now,
        };
        debug!(workspace = workspace_id, channel = %channel.name, "channel created");
        self.record(HubEvent::ChannelCreated {
            workspace_id: workspace_id.to_string(),
            channel: channel.clone(),
        });
        Ok(channel)
    }

    pub fn update_channel(
        &mut self,
        workspace_id: &str,
        channel_id: &str,
        by: &str,
        name: Option<String>,
        team: Option<String>,
        department: Option<String>,
    ) -> Result<(), HubError> {
        if !self.can_manage_channel(workspace_id, channel_id, by)? {
            return Err(HubError::AccessDenied {
                agent: by.to_string(),
                action: "update",
                channel: channel_id.to_string(),
            });
        }
        self.record(HubEvent::ChannelUpdated {
            workspace_id: workspace_id.to_string(),
            channel_id: channel_id.to_string(),
            name,
            team,
            department,
            updated_at: Utc::now(),
        });
        Ok(())
    }

    pub fn delete_channel(
        &mut self,
        workspace_id: &str,
        channel_id: &str,
        by: &str,
    ) -> Result<(), HubError> {
        if !self.can_manage_channel(workspace_id, channel_id, by)? {
            return Err(HubError::AccessDenied {
                agent: by.to_string(),
                action: "delete",
                channel: channel_id.to_string(),
            });
        }
        self.record(HubEvent::ChannelDeleted {
            workspace_id: workspace_id.to_string(),
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    pub fn join_channel(
        &mut self,
        workspace_id: &str,
        channel_id: &str,
        agent_id: &str,
    ) -> Result<(), HubError> {
        if !self.can_access_channel(workspace_id, channel_id, agent_id)? {
            return Err(HubError::AccessDenied {
                agent: agent_id.to_string(),
                action: "join",
                channel: channel_id.to_string(),
            });
        }
        self.record(HubEvent::MemberJoined {
            workspace_id: workspace_id.to_string(),
            channel_id: channel_id.to_string(),
            agent_id: agent_id.to_string(),
            membership: ChannelMembership {
                role: ChannelRole::Member,
                joined_at: Utc::now(),
            },
        });
        Ok(())
    }

    /// Add someone else to a channel; requires management rights.
    pub fn add_channel_member(
        &mut self,
        workspace_id: &str,
        channel_id: &str,
        by: &str,
        agent_id: &str,
    ) -> Result<(), HubError> {
        if !self.can_manage_channel(workspace_id, channel_id, by)? {
            return Err(HubError::AccessDenied {
                agent: by.to_string(),
                action: "add members to",
                channel: channel_id.to_string(),
            });
        }
        let ws = self.ws(workspace_id)?;
        self.agent(ws, agent_id)?;
        self.record(HubEvent::MemberJoined {
            workspace_id: workspace_id.to_string(),
            channel_id: channel_id.to_string(),
            agent_id: agent_id.to_string(),
            membership: ChannelMembership {
                role: ChannelRole::Member,
                joined_at: Utc::now(),
            },
        });
        Ok(())
    }

    pub fn list_channels(&self, workspace_id: &str) -> Result<Vec<CommunicationChannel>, HubError> {
        let ws = self.ws(workspace_id)?;
        let mut channels: Vec<_> = ws.channels.values().cloned().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    pub fn list_channels_for_agent(
        &self,
        workspace_id: &str,
        agent_id: &str,
    ) -> Result<Vec<CommunicationChannel>, HubError> {
        let ws = self.ws(workspace_id)?;
        let agent = self.agent(ws, agent_id)?;
        let mut channels: Vec<_> = ws
            .channels
            .values()
            .filter(|ch| Self::post_allowed(ch, agent) || ch.members.contains_key(agent_id))
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Post a message, expanding mentions into a delivery plan.
    ///
    /// Mentioning an agent who is not a channel member delivers to them but
    /// does not change channel membership.
    pub fn post_message(
        &mut self,
        workspace_id: &str,
        channel_id: &str,
        sender_id: &str,
        text: &str,
        thread_root_id: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(ChannelMessage, DeliveryPlan), HubError> {
        if !self.can_post(workspace_id, channel_id, sender_id)? {
            return Err(HubError::AccessDenied {
                agent: sender_id.to_string(),
                action: "post to",
                channel: channel_id.to_string(),
            });
        }
        let ws = self.ws(workspace_id)?;
        let channel = self.channel(ws, channel_id)?;
        let mentions = parse_mentions(text);
        let delivery = build_delivery_plan(ws, channel, sender_id, &mentions);

        let now = Utc::now();
        let message = ChannelMessage {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            created_at: now,
            updated_at: now,
            thread_root_id,
            mentions,
            reactions: BTreeMap::new(),
            metadata,
        };
        self.record(HubEvent::MessagePosted {
            workspace_id: workspace_id.to_string(),
            channel_id: channel_id.to_string(),
            message: message.clone(),
            delivery: delivery.clone(),
        });
        Ok((message, delivery))
    }

    /// The most recent `limit` messages, oldest first.
    pub fn list_messages(
        &self,
        workspace_id: &str,
        channel_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChannelMessage>, HubError> {
        let ws = self.ws(workspace_id)?;
        self.channel(ws, channel_id)?;
        let msgs = ws.messages.get(channel_id).cloned().unwrap_or_default();
        match limit {
            Some(n) if msgs.len() > n => Ok(msgs[msgs.len() - n..].to_vec()),
            _ => Ok(msgs),
        }
    }

    pub fn add_reaction(
        &mut self,
        workspace_id: &str,
        channel_id: &str,
        message_id: &str,
        agent_id: &str,
        emoji: &str,
    ) -> Result<(), HubError> {
        if !self.can_access_channel(workspace_id, channel_id, agent_id)? {
            return Err(HubError::AccessDenied {
                agent: agent_id.to_string(),
                action: "react in",
                channel: channel_id.to_string(),
            });
        }
        let ws = self.ws(workspace_id)?;
        let exists = ws
            .messages
            .get(channel_id)
            .map(|msgs| msgs.iter().any(|m| m.id == message_id))
            .unwrap_or(false);
        if !exists {
            return Err(HubError::MessageNotFound(message_id.to_string()));
        }
        self.record(HubEvent::ReactionAdded {
            workspace_id: workspace_id.to_string(),
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            agent_id: agent_id.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }

    /// Case-insensitive token-containment search over a workspace.
    ///
    /// Score is the count of matched query tokens; ties break toward newer
    /// messages, then message id, so ordering is stable for a given corpus.
    pub fn search_messages(
        &self,
        workspace_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, HubError> {
        let ws = self.ws(workspace_id)?;
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<SearchHit> = ws
            .messages
            .values()
            .flatten()
            .filter_map(|m| {
                let haystack = m.text.to_lowercase();
                let score = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then(|| SearchHit {
                    score,
                    message: m.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.message.created_at.cmp(&a.message.created_at))
                .then(a.message.id.cmp(&b.message.id))
        });
        hits.truncate(limit.unwrap_or(20).max(1));
        Ok(hits)
    }
}

/// Extract `@` tokens: `@channel` broadcasts, `@team:x` / `@department:y`
/// are group mentions, anything else names an agent.
fn parse_mentions(text: &str) -> Vec<Mention> {
    let re = Regex::new(r"@([A-Za-z0-9_:.\-]+)").expect("static regex");
    let mut mentions = Vec::new();
    for cap in re.captures_iter(text) {
        let token = &cap[1];
        let mention = if token == "channel" {
            Mention::Channel
        } else if let Some(name) = token.strip_prefix("team:") {
            Mention::Team {
                name: name.to_string(),
            }
        } else if let Some(name) = token.strip_prefix("department:") {
            Mention::Department {
                name: name.to_string(),
            }
        } else {
            Mention::Agent {
                id: token.to_string(),
            }
        };
        if !mentions.contains(&mention) {
            mentions.push(mention);
        }
    }
    mentions
}

fn build_delivery_plan(
    ws: &Workspace,
    channel: &CommunicationChannel,
    sender_id: &str,
    mentions: &[Mention],
) -> DeliveryPlan {
    let mut plan = DeliveryPlan::default();
    for member in channel.members.keys() {
        plan.recipients.insert(member.clone());
    }
    for mention in mentions {
        match mention {
            Mention::Channel => {
                plan.mentioned_groups.push("channel".to_string());
                for member in channel.members.keys() {
                    plan.recipients.insert(member.clone());
                }
            }
            Mention::Team { name } => {
                plan.mentioned_groups.push(format!("team:{name}"));
                for agent in ws.agents.values() {
                    if agent.team.as_deref() == Some(name.as_str()) {
                        plan.recipients.insert(agent.id.clone());
                    }
                }
            }
            Mention::Department { name } => {
                plan.mentioned_groups.push(format!("department:{name}"));
                for agent in ws.agents.values() {
                    if agent.department.as_deref() == Some(name.as_str()) {
                        plan.recipients.insert(agent.id.clone());
                    }
                }
            }
            Mention::Agent { id } => {
                if ws.agents.contains_key(id) {
                    plan.mentioned_agents.push(id.clone());
                    plan.recipients.insert(id.clone());
                }
            }
        }
    }
    plan.recipients.remove(sender_id);
    plan
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
