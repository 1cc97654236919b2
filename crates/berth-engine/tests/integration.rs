//! Integration tests for berth-engine.
//!
//! These tests require a reachable Docker daemon (`DOCKER_HOST` or the
//! default socket) and network access to pull `alpine:3.19`.
//!
//! Run with: `cargo test -p berth-engine -- --ignored`

use berth_engine::{
    collect_logs, ContainerRequest, ContainerStatus, DockerEngine, EngineClient, EngineError,
};

fn image() -> String {
    std::env::var("BERTH_TEST_IMAGE").unwrap_or_else(|_| "alpine:3.19".to_string())
}

/// Full container lifecycle: create -> start -> inspect -> stop -> remove
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_container_lifecycle() {
    let engine = DockerEngine::connect().expect("Failed to connect to Docker");

    let request = ContainerRequest::builder(image())
        .command(["sleep", "30"])
        .label("org.berth.test", "lifecycle")
        .build()
        .unwrap();

    let id = engine.create(&request).await.expect("Failed to create");
    engine.start(&id).await.expect("Failed to start");

    let inspection = engine.inspect(&id).await.expect("Failed to inspect");
    assert_eq!(inspection.status, ContainerStatus::Running);

    engine.stop(&id).await.expect("Failed to stop");
    let code = engine.wait_for_exit(&id).await.expect("Failed to wait");
    assert_ne!(code, 0);

    engine.remove(&id).await.expect("Failed to remove");
    assert!(matches!(
        engine.inspect(&id).await,
        Err(EngineError::NotFound(_))
    ));
}

/// Exit code and output of a short-lived container
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_exit_code_and_logs() {
    let engine = DockerEngine::connect().expect("Failed to connect to Docker");

    let request = ContainerRequest::builder(image())
        .command(["sh", "-c", "echo hello from berth; exit 3"])
        .build()
        .unwrap();

    let id = engine.create(&request).await.unwrap();
    engine.start(&id).await.unwrap();

    assert_eq!(engine.wait_for_exit(&id).await.unwrap(), 3);
    let logs = collect_logs(&engine, &id).await.unwrap();
    assert!(logs.contains("hello from berth"));

    let inspection = engine.inspect(&id).await.unwrap();
    assert_eq!(inspection.exit_code, Some(3));

    engine.remove(&id).await.unwrap();
}

/// Exec inside a running container and published ports
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_exec_and_ports() {
    let engine = DockerEngine::connect().expect("Failed to connect to Docker");

    let request = ContainerRequest::builder(image())
        .command(["sleep", "30"])
        .expose(8080)
        .build()
        .unwrap();

    let id = engine.create(&request).await.unwrap();
    engine.start(&id).await.unwrap();

    let inspection = engine.inspect(&id).await.unwrap();
    assert!(inspection.ports.contains_key(&8080));

    let output = engine
        .execute(&id, &["sh".into(), "-c".into(), "echo out; echo err >&2".into()])
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "out");
    assert_eq!(output.stderr.trim(), "err");

    engine.remove(&id).await.unwrap();
}
