//! # Conveyor Handlers
//!
//! Built-in job kinds:
//!
//! | Kind | Arguments | Default deadline |
//! |---|---|---|
//! | `test-task` | `file_id: integer` | 12 s |
//! | `text-analysis` | `text: string`, `analysis_type: string` | 30 s |
//! | `image-resize` | `file_id: integer`, `original_path: string` | 40 s |
//!
//! Deadlines can be overridden per kind with `jobs.kinds.<kind>.deadline_secs`.

pub mod config;
pub mod image_resize;
pub mod test_task;
pub mod text_analysis;

pub use config::HandlersConfig;
pub use image_resize::ImageResize;
pub use test_task::TestTask;
pub use text_analysis::{TextAnalysis, TextStats};

use conveyor_jobs::{JobError, JobRegistry, JobsConfig, JobsResult};

/// Registers every built-in kind into `registry`.
pub fn register_builtin(
    registry: &mut JobRegistry,
    jobs: &JobsConfig,
    handlers: &HandlersConfig,
) -> JobsResult<()> {
    registry.register(
        TestTask::new(handlers.test_task_delay())
            .definition(jobs.deadline_for(test_task::KIND, Some(test_task::DEADLINE))),
    )?;

    let text = TextAnalysis::new()
        .map_err(|e| JobError::Configuration(format!("Invalid word pattern: {}", e)))?;
    registry.register(
        text.definition(jobs.deadline_for(text_analysis::KIND, Some(text_analysis::DEADLINE))),
    )?;

    registry.register(
        ImageResize::new(&handlers.processed_dir)
            .definition(jobs.deadline_for(image_resize::KIND, Some(image_resize::DEADLINE))),
    )?;

    Ok(())
}

/// Builds a registry holding only the built-in kinds.
pub fn builtin_registry(jobs: &JobsConfig, handlers: &HandlersConfig) -> JobsResult<JobRegistry> {
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, jobs, handlers)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_jobs::config::KindConfig;
    use std::time::Duration;

    #[test]
    fn test_builtin_kinds_and_deadlines() {
        let registry = builtin_registry(&JobsConfig::default(), &HandlersConfig::default()).unwrap();
        let kinds: Vec<String> = registry.kinds().into_iter().map(|k| k.kind).collect();
        assert_eq!(kinds, vec!["image-resize", "test-task", "text-analysis"]);

        assert_eq!(registry.lookup("test-task").unwrap().deadline(), Duration::from_secs(12));
        assert_eq!(registry.lookup("text-analysis").unwrap().deadline(), Duration::from_secs(30));
        assert_eq!(registry.lookup("image-resize").unwrap().deadline(), Duration::from_secs(40));
    }

    #[test]
    fn test_configured_deadline_overrides_builtin() {
        let mut jobs = JobsConfig::default();
        jobs.kinds
            .insert("text-analysis".to_string(), KindConfig { deadline_secs: 5 });

        let registry = builtin_registry(&jobs, &HandlersConfig::default()).unwrap();
        assert_eq!(registry.lookup("text-analysis").unwrap().deadline(), Duration::from_secs(5));
    }

    #[test]
    fn test_register_twice_fails() {
        let mut registry = builtin_registry(&JobsConfig::default(), &HandlersConfig::default()).unwrap();
        let err = register_builtin(&mut registry, &JobsConfig::default(), &HandlersConfig::default())
            .unwrap_err();
        assert!(matches!(err, JobError::DuplicateKind(_)));
    }
}
