// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    General,
    Team,
    Department,
    Project,
    Private,
    Dm,
    Incident,
}

impl ChannelType {
    /// Channel types whose access is strictly membership-based.
    pub fn is_members_only(&self) -> bool {
        matches!(self, Self::Project | Self::Private | Self::Dm | Self::Incident)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceRole {
    Owner,
    Admin,
    Member,
}

impl WorkspaceRole {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Owner,
    Admin,
    Member,
}

/// One registered agent in a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    pub role: WorkspaceRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMembership {
    pub role: ChannelRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationChannel {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub created_by: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    pub is_private: bool,
    pub members: BTreeMap<String, ChannelMembership>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A parsed `@` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mention {
    Agent { id: String },
    Team { name: String },
    Department { name: String },
    Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub thread_root_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    /// emoji → reacting agent ids, insertion-ordered within each emoji.
    #[serde(default)]
    pub reactions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Deterministic recipient set for one posted message.  The sender is never
/// a recipient of their own message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPlan {
    pub recipients: BTreeSet<String>,
    pub mentioned_agents: Vec<String>,
    /// Group mention labels (`team:core`, `department:eng`, `channel`).
    pub mentioned_groups: Vec<String>,
}
