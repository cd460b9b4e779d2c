use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Availability of a registered agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Ready,
    Busy,
    Error,
    Maintenance,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Ready => write!(f, "ready"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Registration request for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentInfo {
    pub fn new<I, S>(agent_type: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Ready,
            metadata: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }
}

/// Registry entry describing a known worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: AgentStatus,
    pub capabilities: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    /// Number of in-flight tasks assigned to this agent.
    pub load: u32,
    /// Monotonic registration order, used as the scheduling tie-break.
    pub registration_seq: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentRecord {
    pub fn can_serve(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Ready
    }
}
