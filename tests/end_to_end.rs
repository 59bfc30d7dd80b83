//! End-to-end scenarios driving the engine against a mocked upload server.

use filechunk_pro::host::LocalFileSource;
use filechunk_pro::queue::UploadQueueDb;
use filechunk_pro::{Engine, EnqueueOptions, EngineConfig, Event};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn new_engine(server: &MockServer, chunk_size: u64) -> (Engine, tempfile::TempDir) {
    new_engine_with_max_attempts(server, chunk_size, 3).await
}

async fn new_engine_with_max_attempts(
    server: &MockServer,
    chunk_size: u64,
    max_attempts: u32,
) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(UploadQueueDb::with_path(dir.path().join("queue.db")).unwrap());
    let host: Arc<dyn filechunk_pro::host::FileSource> = Arc::new(LocalFileSource);

    let mut config = EngineConfig::new(server.uri());
    config.chunk_size = chunk_size;
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.max_attempts = max_attempts;

    let engine = Engine::new(config, host, queue).unwrap();
    (engine, dir)
}

async fn wait_for_completion(
    mut rx: tokio::sync::broadcast::Receiver<Event>,
    upload_id: &str,
    timeout: Duration,
) -> Event {
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await.unwrap() {
                ev @ Event::UploadCompleted { upload_id: id, .. } if id == upload_id => return ev,
                ev @ Event::UploadFailed { upload_id: id, .. } if id == upload_id => return ev,
                _ => continue,
            }
        }
    })
    .await
    .expect("upload did not reach a terminal state in time")
}

#[tokio::test]
async fn small_file_fresh_upload_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "exists": false,
            "uploadedChunks": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chunk"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/merge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "url": "https://cdn.example/a.bin"
        })))
        .mount(&server)
        .await;

    let (engine, dir) = new_engine(&server, 4).await;
    let rx = engine.subscribe();

    let file_path = dir.path().join("a.bin");
    std::fs::write(&file_path, b"0123456789").unwrap(); // 10 bytes -> 3 chunks of 4/4/2

    let id = engine.enqueue(file_path, EnqueueOptions::default()).await.unwrap();
    let event = wait_for_completion(rx, &id, Duration::from_secs(5)).await;

    match event {
        Event::UploadCompleted { url, .. } => assert_eq!(url, "https://cdn.example/a.bin"),
        other => panic!("expected completion, got {other:?}"),
    }

    let record = engine.status(&id).await.unwrap().unwrap();
    assert_eq!(record.uploaded_indices.len(), 3);
    assert_eq!(record.result_url.as_deref(), Some("https://cdn.example/a.bin"));
}

#[tokio::test]
async fn deduplicated_file_skips_chunk_and_commit_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "exists": true,
            "url": "https://cdn.example/existing"
        })))
        .mount(&server)
        .await;

    let (engine, dir) = new_engine(&server, 65536).await;
    let rx = engine.subscribe();

    let file_path = dir.path().join("big.bin");
    std::fs::write(&file_path, vec![9u8; 1024]).unwrap();

    let id = engine.enqueue(file_path, EnqueueOptions::default()).await.unwrap();
    let event = wait_for_completion(rx, &id, Duration::from_secs(5)).await;

    match event {
        Event::UploadCompleted { url, .. } => assert_eq!(url, "https://cdn.example/existing"),
        other => panic!("expected completion, got {other:?}"),
    }

    // No /chunk or /merge mocks were registered; wiremock would have
    // panicked on an unexpected request if either had been called.
}

#[tokio::test]
async fn resume_after_partial_upload_sends_only_missing_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "exists": false,
            "uploadedChunks": [0, 2]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chunk"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/merge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "url": "https://cdn.example/resumed"
        })))
        .mount(&server)
        .await;

    let (engine, dir) = new_engine(&server, 4).await;
    let rx = engine.subscribe();

    let file_path = dir.path().join("c.bin");
    std::fs::write(&file_path, b"abcdefghijkl").unwrap(); // 12 bytes -> 3 chunks of 4

    let id = engine.enqueue(file_path, EnqueueOptions::default()).await.unwrap();
    let event = wait_for_completion(rx, &id, Duration::from_secs(5)).await;

    assert!(matches!(event, Event::UploadCompleted { .. }));
    let record = engine.status(&id).await.unwrap().unwrap();
    assert_eq!(record.uploaded_indices.len(), 3);
}

#[tokio::test]
async fn transient_chunk_failure_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "exists": false,
            "uploadedChunks": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chunk"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chunk"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/merge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "url": "https://cdn.example/retried"
        })))
        .mount(&server)
        .await;

    let (engine, dir) = new_engine(&server, 4).await;
    let rx = engine.subscribe();

    let file_path = dir.path().join("d.bin");
    std::fs::write(&file_path, b"abcd").unwrap();

    let id = engine.enqueue(file_path, EnqueueOptions::default()).await.unwrap();
    let event = wait_for_completion(rx, &id, Duration::from_secs(5)).await;
    assert!(matches!(event, Event::UploadCompleted { .. }));
}

#[tokio::test]
async fn exhausted_retries_marks_upload_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "exists": false,
            "uploadedChunks": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chunk"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (engine, dir) = new_engine_with_max_attempts(&server, 4, 2).await;
    let rx = engine.subscribe();
    let file_path = dir.path().join("e.bin");
    std::fs::write(&file_path, b"abcd").unwrap();

    let id = engine.enqueue(file_path, EnqueueOptions::default()).await.unwrap();
    let event = wait_for_completion(rx, &id, Duration::from_secs(5)).await;

    match event {
        Event::UploadFailed { error_kind, .. } => assert_eq!(error_kind, "server_transient"),
        other => panic!("expected failure, got {other:?}"),
    }

    let record = engine.status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, filechunk_pro::UploadStatus::Failed);
}
