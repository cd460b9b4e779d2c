use crate::registry::AgentRegistry;
use crate::transport::Transport;
use chrono::Utc;
use convoy_core::{AgentStatus, Envelope, HealthCheck, MessageType};
use convoy_store::{AuditEntry, AuditLog, AuditOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodically probes registered agents.
///
/// Each round sends a `health_check` to every agent not in maintenance,
/// waits out the grace window and moves any agent that has not been heard
/// from since the probe went out to `error`. Replies are recorded by the
/// supervisor's inbound handler, which refreshes `last_seen`.
pub struct HealthMonitor {
    sender_id: String,
    interval: Duration,
    grace: Duration,
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn Transport>,
    audit: Arc<AuditLog>,
}

impl HealthMonitor {
    pub fn new(
        sender_id: impl Into<String>,
        interval: Duration,
        grace: Duration,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn Transport>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            interval,
            grace,
            registry,
            transport,
            audit,
        }
    }

    /// Run one probe round. Returns the ids of agents marked `error`.
    pub async fn probe_all(&self) -> Vec<String> {
        let probe_time = Utc::now();
        let mut probed = Vec::new();
        let mut unreachable = Vec::new();

        for agent in self.registry.list() {
            if agent.status == AgentStatus::Maintenance {
                continue;
            }
            let envelope = match Envelope::new(
                &self.sender_id,
                &agent.agent_id,
                MessageType::HealthCheck,
                &HealthCheck {
                    timestamp: probe_time,
                },
            ) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(agent_id = %agent.agent_id, error = %e, "Cannot build health probe");
                    continue;
                }
            };
            let message_id = envelope.id;
            let outcome = match self.transport.publish(envelope).await {
                Ok(()) => AuditOutcome::Success,
                Err(e) => {
                    debug!(agent_id = %agent.agent_id, error = %e, "Health probe not delivered");
                    AuditOutcome::Error
                }
            };
            self.audit.log(AuditEntry {
                timestamp: probe_time,
                actor: self.sender_id.clone(),
                action: "message_sent".into(),
                subject: Some(agent.agent_id.clone()),
                message_id: Some(message_id),
                details: serde_json::json!({ "message_type": MessageType::HealthCheck }),
                outcome,
            });
            if outcome == AuditOutcome::Success {
                probed.push(agent.agent_id);
            } else {
                unreachable.push(agent.agent_id);
            }
        }

        if !probed.is_empty() {
            tokio::time::sleep(self.grace).await;
        }

        let mut failed = Vec::new();
        for agent_id in probed.into_iter().chain(unreachable) {
            let Some(record) = self.registry.get(&agent_id) else {
                continue;
            };
            if record.last_seen >= probe_time || record.status == AgentStatus::Error {
                continue;
            }
            if self
                .registry
                .update_status(&agent_id, AgentStatus::Error, record.last_seen)
                .is_ok()
            {
                warn!(agent_id = %agent_id, last_seen = %record.last_seen, "Agent failed health check");
                self.audit.log_action(
                    &self.sender_id,
                    "agent_unhealthy",
                    Some(agent_id.clone()),
                    serde_json::json!({ "last_seen": record.last_seen }),
                    AuditOutcome::Error,
                );
                failed.push(agent_id);
            }
        }
        failed
    }

    /// Probe every `interval` until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Health monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; agents have just registered.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let failed = self.probe_all().await;
                if !failed.is_empty() {
                    info!(count = failed.len(), "Agents marked unhealthy");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::InProcessBus;
    use convoy_core::AgentInfo;

    fn monitor(registry: Arc<AgentRegistry>, bus: Arc<InProcessBus>) -> HealthMonitor {
        HealthMonitor::new(
            "supervisor",
            Duration::from_secs(30),
            Duration::from_secs(10),
            registry,
            bus,
            Arc::new(AuditLog::in_memory(16)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_marked_error() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register("silent", AgentInfo::new("collector", ["fetch"]));
        let bus = Arc::new(InProcessBus::new());
        let _inbox = bus.subscribe("silent");

        let failed = monitor(registry.clone(), bus).probe_all().await;
        assert_eq!(failed, vec!["silent"]);
        assert_eq!(registry.get("silent").unwrap().status, AgentStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_heard_during_grace_stays_ready() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register("chatty", AgentInfo::new("collector", ["fetch"]));
        let bus = Arc::new(InProcessBus::new());
        let mut inbox = bus.subscribe("chatty");

        let answering = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let probe = inbox.recv().await.unwrap();
                assert_eq!(probe.message_type, MessageType::HealthCheck);
                registry.touch("chatty", Utc::now());
            })
        };

        let failed = monitor(registry.clone(), bus).probe_all().await;
        answering.await.unwrap();
        assert!(failed.is_empty());
        assert_eq!(registry.get("chatty").unwrap().status, AgentStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_and_maintenance_agents() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register("gone", AgentInfo::new("collector", ["fetch"]));
        registry.register(
            "resting",
            AgentInfo::new("collector", ["fetch"]).with_status(AgentStatus::Maintenance),
        );
        let bus = Arc::new(InProcessBus::new());

        let failed = monitor(registry.clone(), bus).probe_all().await;
        assert_eq!(failed, vec!["gone"]);
        assert_eq!(
            registry.get("resting").unwrap().status,
            AgentStatus::Maintenance
        );
    }
}
