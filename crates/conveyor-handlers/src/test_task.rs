//! `test-task`: simulated work used to exercise the pipeline.

use conveyor_jobs::{ArgType, Handler, HandlerError, JobArguments, KindDefinition};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const KIND: &str = "test-task";

/// Built-in deadline.
pub const DEADLINE: Duration = Duration::from_secs(12);

/// Sleeps for a fixed time, then reports the file id it was given.
#[derive(Debug, Clone)]
pub struct TestTask {
    delay: Duration,
}

impl TestTask {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn definition(self, deadline: Duration) -> KindDefinition {
        KindDefinition::new(KIND, self)
            .deadline(deadline)
            .param("file_id", ArgType::Integer)
    }
}

impl Handler for TestTask {
    fn call(&self, args: &JobArguments) -> Result<Value, HandlerError> {
        let file_id = args.require_i64("file_id")?;
        debug!(file_id, delay_ms = self.delay.as_millis() as u64, "Test task running");

        std::thread::sleep(self.delay);
        Ok(Value::String(format!("First Task completed! file: {}", file_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_file_id() {
        let task = TestTask::new(Duration::ZERO);
        let out = task.call(&JobArguments::new().with("file_id", 12)).unwrap();
        assert_eq!(out, Value::String("First Task completed! file: 12".into()));
    }

    #[test]
    fn test_missing_file_id() {
        let task = TestTask::new(Duration::ZERO);
        let err = task.call(&JobArguments::new()).unwrap_err();
        assert!(err.message.contains("file_id"));
    }
}
