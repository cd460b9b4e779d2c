use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult, Envelope};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Point-to-point messaging addressed by agent id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `envelope.recipient`. An error means the message
    /// was not handed off.
    async fn publish(&self, envelope: Envelope) -> ConvoyResult<()>;
}

/// In-process transport: one unbounded mailbox per address.
#[derive(Default)]
pub struct InProcessBus {
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox for `address`, replacing any previous one.
    pub fn subscribe(&self, address: impl Into<String>) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().insert(address.into(), tx);
        rx
    }

    pub fn unsubscribe(&self, address: &str) -> bool {
        self.mailboxes.write().remove(address).is_some()
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.mailboxes
            .read()
            .get(address)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Transport for InProcessBus {
    async fn publish(&self, envelope: Envelope) -> ConvoyResult<()> {
        let recipient = envelope.recipient.clone();
        let tx = self.mailboxes.read().get(&recipient).cloned();
        let Some(tx) = tx else {
            return Err(ConvoyError::Transport(format!(
                "no mailbox for '{recipient}'"
            )));
        };
        debug!(
            message_id = %envelope.id,
            message_type = %envelope.message_type,
            recipient = %recipient,
            "Publishing envelope"
        );
        if tx.send(envelope).is_err() {
            warn!(recipient = %recipient, "Mailbox closed, dropping subscription");
            self.mailboxes.write().remove(&recipient);
            return Err(ConvoyError::Transport(format!(
                "mailbox for '{recipient}' is closed"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::{HealthCheck, MessageType};

    fn probe(to: &str) -> Envelope {
        Envelope::new(
            "supervisor",
            to,
            MessageType::HealthCheck,
            &HealthCheck {
                timestamp: chrono::Utc::now(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = InProcessBus::new();
        let mut rx = bus.subscribe("agent-1");
        let envelope = probe("agent-1");
        bus.publish(envelope.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_address_fails() {
        let bus = InProcessBus::new();
        let err = bus.publish(probe("nobody")).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_removed() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe("agent-1");
        drop(rx);
        assert!(!bus.is_subscribed("agent-1"));
        assert!(bus.publish(probe("agent-1")).await.is_err());
        assert!(!bus.unsubscribe("agent-1"));
    }
}
