#![allow(clippy::unwrap_used, clippy::expect_used)]

use convoy_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. A task dispatch request survives the wire and drives the state machine
// ---------------------------------------------------------------------------

#[test]
fn task_request_over_envelope_drives_lifecycle() {
    let mut requirements = Payload::new();
    requirements.insert("symbol".into(), serde_json::json!("ACME"));
    let mut task = Task::new("fetch", "Fetch quotes")
        .with_priority(TaskPriority::High)
        .with_requirements(requirements);

    let request = Envelope::new(
        "supervisor",
        "collector-1",
        MessageType::TaskRequest,
        &TaskRequest {
            task_id: task.id,
            task_type: task.task_type.clone(),
            description: task.description.clone(),
            requirements: task.requirements.clone(),
            priority: task.priority,
            attempt: 1,
        },
    )
    .unwrap()
    .with_priority(task.priority.weight());

    task.start("collector-1", request.id).unwrap();

    let wire = serde_json::to_string(&request).unwrap();
    let received: Envelope = serde_json::from_str(&wire).unwrap();
    let body: TaskRequest = received.decode().unwrap();
    assert_eq!(body.task_id, task.id);
    assert_eq!(body.requirements["symbol"], "ACME");
    assert_eq!(received.priority, 5);

    let mut result = Payload::new();
    result.insert("confidence_score".into(), serde_json::json!(0.93));
    let response = received
        .reply(
            "collector-1",
            MessageType::TaskResponse,
            &TaskResponse::completed(task.id, result),
        )
        .unwrap();

    assert_eq!(response.correlation_id, task.delivery_id);
    let body: TaskResponse = response.decode().unwrap();
    task.complete(body.result).unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_ref().unwrap()["confidence_score"], 0.93);
}

// ---------------------------------------------------------------------------
// 2. Error kinds are stable strings
// ---------------------------------------------------------------------------

#[test]
fn error_kinds_are_stable() {
    let cases: Vec<(ConvoyError, &str)> = vec![
        (
            ConvoyError::NoEligibleAgent {
                task_type: "x".into(),
            },
            "no_eligible_agent",
        ),
        (ConvoyError::DispatchFailure("x".into()), "dispatch_failure"),
        (
            ConvoyError::AgentReportedFailure("x".into()),
            "agent_reported_failure",
        ),
        (ConvoyError::Timeout { seconds: 1 }, "timeout"),
        (
            ConvoyError::CircularDependency("x".into()),
            "circular_dependency",
        ),
        (
            ConvoyError::QualityBelowThreshold("x".into()),
            "quality_below_threshold",
        ),
        (ConvoyError::TaskNotFound(Uuid::nil()), "task_not_found"),
    ];
    for (err, kind) in cases {
        assert_eq!(err.kind(), kind);
    }
}

// ---------------------------------------------------------------------------
// 3. Workflow definitions parse from the inbound JSON shape
// ---------------------------------------------------------------------------

#[test]
fn workflow_definition_from_json() {
    let steps: Vec<WorkflowStep> = serde_json::from_value(serde_json::json!([
        {"id": "collect", "agent_type": "collector", "task_type": "fetch",
         "parameters": {"source": "rss"}, "timeout": 60},
        {"id": "analyze", "agent_type": "analyzer", "task_type": "analyze",
         "depends_on": ["collect"]}
    ]))
    .unwrap();

    let workflow = Workflow::new("daily", "daily digest", steps);
    workflow.validate().unwrap();
    assert_eq!(workflow.steps[0].timeout, 60);
    assert_eq!(workflow.steps[1].timeout, 300);
    assert_eq!(workflow.steps[0].parameters["source"], "rss");
}
