use crate::agent::AgentStatus;
use crate::error::ConvoyResult;
use crate::task::{Payload, TaskPriority};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of message carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    HealthCheck,
    ErrorReport,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::StatusUpdate => "status_update",
            MessageType::HealthCheck => "health_check",
            MessageType::ErrorReport => "error_report",
        };
        f.write_str(s)
    }
}

/// Generic message exchanged between the supervisor and agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Id of the message this one answers.
    pub correlation_id: Option<Uuid>,
    /// 1 = low, 10 = critical.
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    1
}

impl Envelope {
    /// Build an envelope, serializing `payload` to JSON.
    pub fn new<P: Serialize>(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: MessageType,
        payload: &P,
    ) -> ConvoyResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
            correlation_id: None,
            priority: default_priority(),
        })
    }

    /// Build an answer addressed to this envelope's sender.
    pub fn reply<P: Serialize>(
        &self,
        sender: impl Into<String>,
        message_type: MessageType,
        payload: &P,
    ) -> ConvoyResult<Self> {
        let mut reply = Self::new(sender, self.sender.clone(), message_type, payload)?;
        reply.correlation_id = Some(self.id);
        reply.priority = self.priority;
        Ok(reply)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Deserialize the payload into a typed message body.
    pub fn decode<P: DeserializeOwned>(&self) -> ConvoyResult<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Body of a `task_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: Uuid,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Payload,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Dispatch attempt number, starting at 1.
    #[serde(default)]
    pub attempt: u32,
}

/// Outcome reported in a `task_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Completed,
    Failed,
    /// Acknowledges an inbound task request.
    Accepted,
}

/// Body of a `task_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: Payload,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn completed(task_id: Uuid, result: Payload) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Completed,
            result,
            error: None,
        }
    }

    pub fn failed(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Failed,
            result: Payload::new(),
            error: Some(error.into()),
        }
    }

    pub fn accepted(task_id: Uuid) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Accepted,
            result: Payload::new(),
            error: None,
        }
    }
}

/// Inbound request to create a task, sent as a `task_request` to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Payload,
    #[serde(default)]
    pub priority: TaskPriority,
}

/// Body of a `health_check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub timestamp: DateTime<Utc>,
}

/// Body of a `status_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub active_tasks: u32,
}

/// Body of an `error_report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub original_message_id: Uuid,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_is_correlated() {
        let request = Envelope::new(
            "supervisor",
            "agent-1",
            MessageType::HealthCheck,
            &HealthCheck {
                timestamp: Utc::now(),
            },
        )
        .unwrap()
        .with_priority(5);

        let reply = request
            .reply(
                "agent-1",
                MessageType::StatusUpdate,
                &StatusUpdate {
                    agent_id: "agent-1".into(),
                    status: AgentStatus::Ready,
                    active_tasks: 0,
                },
            )
            .unwrap();

        assert_eq!(reply.recipient, "supervisor");
        assert_eq!(reply.correlation_id, Some(request.id));
        assert_eq!(reply.priority, 5);
    }

    #[test]
    fn test_decode_task_response() {
        let task_id = Uuid::new_v4();
        let env = Envelope::new(
            "agent-1",
            "supervisor",
            MessageType::TaskResponse,
            &TaskResponse::failed(task_id, "upstream 503"),
        )
        .unwrap();

        let body: TaskResponse = env.decode().unwrap();
        assert_eq!(body.task_id, task_id);
        assert_eq!(body.status, ResponseStatus::Failed);
        assert_eq!(body.error.as_deref(), Some("upstream 503"));
    }

    #[test]
    fn test_decode_wrong_shape_is_error() {
        let env = Envelope::new(
            "agent-1",
            "supervisor",
            MessageType::TaskResponse,
            &serde_json::json!({"nonsense": true}),
        )
        .unwrap();
        let err = env.decode::<TaskResponse>().unwrap_err();
        assert_eq!(err.kind(), "json");
    }

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::ErrorReport).unwrap();
        assert_eq!(json, "\"error_report\"");
        assert_eq!(MessageType::TaskRequest.to_string(), "task_request");
    }
}
