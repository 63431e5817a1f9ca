//! Built-in kinds driven through the whole pipeline.

use conveyor_handlers::{builtin_registry, HandlersConfig};
use conveyor_jobs::{
    AckMode, Dispatcher, FailureKind, InMemoryBroker, JobArguments, JobError, JobId, JobStatus,
    JobsConfig, StatusResolver, WorkerPool, WorkerPoolConfig,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    dispatcher: Dispatcher,
    resolver: StatusResolver,
    pool: WorkerPool,
}

async fn pipeline(processed_dir: &Path) -> Pipeline {
    let handlers = HandlersConfig {
        processed_dir: processed_dir.to_path_buf(),
        test_task_delay_ms: 20,
    };
    let registry = Arc::new(builtin_registry(&JobsConfig::default(), &handlers).unwrap());
    let broker = Arc::new(InMemoryBroker::new(AckMode::Late));

    let pool = WorkerPool::new(
        broker.clone(),
        registry.clone(),
        WorkerPoolConfig::default().with_concurrency(2),
    );
    pool.start().await.unwrap();

    Pipeline {
        dispatcher: Dispatcher::new(broker.clone(), registry),
        resolver: StatusResolver::new(broker),
        pool,
    }
}

impl Pipeline {
    async fn run(&self, kind: &str, arguments: JobArguments) -> JobStatus {
        let id = self.dispatcher.enqueue(kind, arguments).await.unwrap();
        for _ in 0..1000 {
            let status = self.resolver.status(&id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} job {} did not finish", kind, id);
    }
}

fn failure_message(status: JobStatus) -> String {
    match status {
        JobStatus::Failed { error } => {
            assert_eq!(error.kind, FailureKind::HandlerError);
            error.message
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_text_analysis_quick_brown_fox() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path()).await;

    let status = p
        .run(
            "text-analysis",
            JobArguments::new()
                .with("text", "the quick brown fox")
                .with("analysis_type", "full"),
        )
        .await;

    assert_eq!(
        status,
        JobStatus::Succeeded {
            result: json!({"word_count": 4, "char_count": 19, "avg_word_length": 4.0})
        }
    );
    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_text_analysis_empty_text_fails() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path()).await;

    let status = p
        .run(
            "text-analysis",
            JobArguments::new().with("text", "").with("analysis_type", "full"),
        )
        .await;

    assert!(failure_message(status).contains("Empty text"));
    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_text_analysis_partial_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path()).await;

    let status = p
        .run(
            "text-analysis",
            JobArguments::new().with("text", "abc").with("analysis_type", "partial"),
        )
        .await;

    assert!(failure_message(status).contains("unsupported analysis_type"));
    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_image_resize_success() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("upload.png");
    image::RgbImage::from_pixel(123, 77, image::Rgb([10, 200, 30]))
        .save(&source)
        .unwrap();

    let processed = dir.path().join("processed");
    let p = pipeline(&processed).await;

    let status = p
        .run(
            "image-resize",
            JobArguments::new()
                .with("file_id", 5)
                .with("original_path", source.to_string_lossy().to_string()),
        )
        .await;

    let result = match status {
        JobStatus::Succeeded { result } => result,
        other => panic!("expected success, got {:?}", other),
    };
    assert_eq!(result["width"], 400);
    assert_eq!(result["height"], 400);
    assert_eq!(result["file_id"], 5);

    let output = processed.join("processed_5.jpg");
    assert_eq!(result["processed_path"], &*output.to_string_lossy());
    let decoded = image::open(&output).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (400, 400));

    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_image_resize_corrupt_input_fails_with_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("broken.jpg");
    std::fs::write(&source, b"\xff\xd8 truncated jpeg").unwrap();
    let p = pipeline(&dir.path().join("processed")).await;

    let status = p
        .run(
            "image-resize",
            JobArguments::new()
                .with("file_id", 6)
                .with("original_path", source.to_string_lossy().to_string()),
        )
        .await;

    assert!(!failure_message(status).is_empty());
    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_test_task_reports_file_id() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path()).await;

    let status = p.run("test-task", JobArguments::new().with("file_id", 77)).await;
    assert_eq!(
        status,
        JobStatus::Succeeded { result: json!("First Task completed! file: 77") }
    );
    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_wrong_argument_type_rejected_at_enqueue() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path()).await;

    let err = p
        .dispatcher
        .enqueue("test-task", JobArguments::new().with("file_id", "seven"))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidArguments { .. }));

    let err = p.resolver.status(&JobId::from("unknown")).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
    p.pool.shutdown().await;
}
