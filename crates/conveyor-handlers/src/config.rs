//! Handler configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the built-in handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlersConfig {
    /// Where `image-resize` writes its output.
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,

    /// Simulated work duration of `test-task`, in milliseconds.
    #[serde(default = "default_test_task_delay")]
    pub test_task_delay_ms: u64,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            processed_dir: default_processed_dir(),
            test_task_delay_ms: default_test_task_delay(),
        }
    }
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("processed")
}

fn default_test_task_delay() -> u64 {
    4000
}

impl HandlersConfig {
    pub fn test_task_delay(&self) -> Duration {
        Duration::from_millis(self.test_task_delay_ms)
    }
}
