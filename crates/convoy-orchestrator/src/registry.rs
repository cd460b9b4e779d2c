use chrono::{DateTime, Utc};
use convoy_core::{AgentInfo, AgentRecord, AgentStatus, ConvoyError, ConvoyResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Tracks known agents, their capabilities, status and in-flight load.
///
/// Each record sits behind its own lock, so updates to unrelated agents never
/// contend; the outer map lock is only taken for writing on registration.
/// No method awaits.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<Mutex<AgentRecord>>>>,
    next_seq: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Insert or replace an agent. Load starts at 0; an agent that registers
    /// again keeps its original registration order.
    pub fn register(&self, agent_id: &str, info: AgentInfo) -> AgentRecord {
        let now = Utc::now();
        let mut agents = self.agents.write();
        let registration_seq = match agents.get(agent_id) {
            Some(existing) => existing.lock().registration_seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            agent_type: info.agent_type,
            status: info.status,
            capabilities: info.capabilities.into_iter().collect(),
            last_seen: now,
            load: 0,
            registration_seq,
            metadata: info.metadata,
        };
        agents.insert(agent_id.to_string(), Arc::new(Mutex::new(record.clone())));
        info!(
            agent_id = %agent_id,
            agent_type = %record.agent_type,
            capabilities = ?record.capabilities,
            "Agent registered"
        );
        record
    }

    fn entry(&self, agent_id: &str) -> Option<Arc<Mutex<AgentRecord>>> {
        self.agents.read().get(agent_id).cloned()
    }

    fn entry_or_err(&self, agent_id: &str) -> ConvoyResult<Arc<Mutex<AgentRecord>>> {
        self.entry(agent_id)
            .ok_or_else(|| ConvoyError::AgentNotFound(agent_id.to_string()))
    }

    /// Snapshot of every record in registration order.
    pub fn list(&self) -> Vec<AgentRecord> {
        let entries: Vec<_> = self.agents.read().values().cloned().collect();
        let mut records: Vec<AgentRecord> = entries.iter().map(|e| e.lock().clone()).collect();
        records.sort_by_key(|r| r.registration_seq);
        records
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.entry(agent_id).map(|e| e.lock().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set an agent's status and last-seen time.
    pub fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        last_seen: DateTime<Utc>,
    ) -> ConvoyResult<()> {
        let entry = self.entry_or_err(agent_id)?;
        let mut record = entry.lock();
        if record.status != status {
            debug!(agent_id = %agent_id, from = %record.status, to = %status, "Agent status changed");
        }
        record.status = status;
        record.last_seen = record.last_seen.max(last_seen);
        Ok(())
    }

    /// Refresh last-seen without changing status. Returns false for unknown agents.
    pub fn touch(&self, agent_id: &str, at: DateTime<Utc>) -> bool {
        match self.entry(agent_id) {
            Some(entry) => {
                let mut record = entry.lock();
                record.last_seen = record.last_seen.max(at);
                true
            }
            None => false,
        }
    }

    /// Add one in-flight task to the agent. Returns the new load.
    pub fn inc_load(&self, agent_id: &str) -> ConvoyResult<u32> {
        let entry = self.entry_or_err(agent_id)?;
        let mut record = entry.lock();
        record.load = record.load.saturating_add(1);
        Ok(record.load)
    }

    /// Remove one in-flight task from the agent, never going below zero.
    /// Returns the new load, or `None` for an unknown agent.
    pub fn dec_load(&self, agent_id: &str) -> Option<u32> {
        let entry = self.entry(agent_id)?;
        let mut record = entry.lock();
        record.load = record.load.saturating_sub(1);
        Some(record.load)
    }

    /// Ready agents advertising `task_type`, optionally restricted to one
    /// agent type, in registration order.
    pub fn eligible(&self, task_type: &str, agent_type: Option<&str>) -> Vec<AgentRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.is_available() && r.can_serve(task_type))
            .filter(|r| agent_type.map_or(true, |t| r.agent_type == t))
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
