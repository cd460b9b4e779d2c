use crate::config::QualityThresholds;
use convoy_core::{ConvoyError, ConvoyResult, Task};

/// Result key carrying a worker's self-reported confidence.
pub const CONFIDENCE_KEY: &str = "confidence_score";

/// Check a completed task against the thresholds.
///
/// The error is informational: a rejected result stays COMPLETED.
pub fn assess(task: &Task, thresholds: &QualityThresholds) -> ConvoyResult<()> {
    if let Some(confidence) = task
        .result
        .as_ref()
        .and_then(|r| r.get(CONFIDENCE_KEY))
        .and_then(serde_json::Value::as_f64)
    {
        if confidence < thresholds.confidence_floor {
            return Err(ConvoyError::QualityBelowThreshold(format!(
                "confidence {confidence:.2} below floor {:.2}",
                thresholds.confidence_floor
            )));
        }
    }

    if let Some(elapsed) = task.execution_time() {
        let ceiling = thresholds.completion_time_secs as i64;
        if elapsed.num_seconds() > ceiling {
            return Err(ConvoyError::QualityBelowThreshold(format!(
                "took {}s, ceiling is {ceiling}s",
                elapsed.num_seconds()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::Payload;
    use uuid::Uuid;

    fn completed(result: Payload) -> Task {
        let mut task = Task::new("analyze", "");
        task.start("analyzer-1", Uuid::new_v4()).unwrap();
        task.complete(result).unwrap();
        task
    }

    #[test]
    fn test_low_confidence_rejected() {
        let task = completed(Payload::from([(CONFIDENCE_KEY.to_string(), 0.4.into())]));
        let err = assess(&task, &QualityThresholds::default()).unwrap_err();
        assert_eq!(err.kind(), "quality_below_threshold");
    }

    #[test]
    fn test_confident_or_unscored_result_passes() {
        let scored = completed(Payload::from([(CONFIDENCE_KEY.to_string(), 0.95.into())]));
        assert!(assess(&scored, &QualityThresholds::default()).is_ok());
        let unscored = completed(Payload::new());
        assert!(assess(&unscored, &QualityThresholds::default()).is_ok());
    }

    #[test]
    fn test_slow_completion_rejected() {
        let mut task = completed(Payload::new());
        task.started_at = task.completed_at.map(|t| t - chrono::Duration::seconds(600));
        let err = assess(&task, &QualityThresholds::default()).unwrap_err();
        assert!(err.to_string().contains("ceiling is 300s"));
    }
}
