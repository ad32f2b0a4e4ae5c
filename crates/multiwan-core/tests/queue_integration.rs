//! Integration tests for FIFO dispatch over interfaces.

mod support;

use std::sync::Arc;

use multiwan_core::types::{DownloadRequest, TaskEvent};
use multiwan_core::{InterfaceQueue, TaskRegistry};
use support::{body, config, mount_file, wait_terminal, LOOPBACK};
use tempfile::TempDir;
use wiremock::MockServer;

#[tokio::test]
async fn one_task_per_interface_in_queue_order() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let first = body(64 * 1024);
    let second = body(32 * 1024);
    mount_file(&server, "/first.bin", &first).await;
    mount_file(&server, "/second.bin", &second).await;

    let registry = Arc::new(TaskRegistry::new(config(temp_dir.path())));
    let mut events = registry.subscribe();
    let queue = Arc::new(InterfaceQueue::new(registry.clone()));

    for name in ["first.bin", "second.bin"] {
        let request = DownloadRequest::new(
            format!("{}/{}", server.uri(), name),
            LOOPBACK,
            temp_dir.path().to_path_buf(),
        )
        .with_speed_limit(Some(0.5));
        queue.enqueue(request).await.unwrap();
    }

    let started = queue.dispatch().await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(queue.len().await, 1);
    assert!(registry.is_interface_busy(LOOPBACK).await);

    // A second pass while the interface is held starts nothing
    assert!(queue.dispatch().await.unwrap().is_empty());

    let handle = queue.clone().spawn();

    let first_id = started[0];
    assert!(matches!(
        wait_terminal(&mut events, first_id).await,
        TaskEvent::Completed { .. }
    ));

    let second_id = first_id + 1;
    assert!(matches!(
        wait_terminal(&mut events, second_id).await,
        TaskEvent::Completed { .. }
    ));
    assert!(queue.is_empty().await);

    let snapshot = registry.get(second_id).await.unwrap();
    assert!(snapshot.url.ends_with("/second.bin"));
    assert_eq!(std::fs::read(temp_dir.path().join("first.bin")).unwrap(), first);
    assert_eq!(std::fs::read(temp_dir.path().join("second.bin")).unwrap(), second);

    handle.abort();
}

#[tokio::test]
async fn busy_interface_does_not_block_other_interfaces() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let registry = Arc::new(TaskRegistry::new(config(temp_dir.path())));
    let queue = InterfaceQueue::new(registry.clone());

    // Hold 10.2.0.1 with a paused task that never runs
    let held = registry
        .add_task("http://127.0.0.1:9/held", "10.2.0.1", temp_dir.path(), None, None)
        .await
        .unwrap();
    registry.pause(held).await.unwrap();

    let dir = temp_dir.path().to_path_buf();
    queue
        .enqueue(DownloadRequest::new("http://127.0.0.1:9/a", "10.2.0.1", dir.clone()))
        .await
        .unwrap();
    queue
        .enqueue(DownloadRequest::new("http://127.0.0.1:9/b", "10.2.0.2", dir.clone()))
        .await
        .unwrap();
    queue
        .enqueue(DownloadRequest::new("http://127.0.0.1:9/c", "10.2.0.2", dir))
        .await
        .unwrap();

    let started = queue.dispatch().await.unwrap();
    assert_eq!(started.len(), 1);
    let running = registry.get(started[0]).await.unwrap();
    assert_eq!(running.source_ip, "10.2.0.2");
    assert!(running.url.ends_with("/b"));

    let left: Vec<String> = queue.pending().await.into_iter().map(|r| r.url).collect();
    assert_eq!(left, vec!["http://127.0.0.1:9/a", "http://127.0.0.1:9/c"]);

    registry.cancel_all().await;
}
