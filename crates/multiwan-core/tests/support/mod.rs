//! Shared helpers for integration tests: mock file servers and event waits.

#![allow(dead_code)]

use std::time::Duration;

use multiwan_core::types::{EngineConfig, TaskEvent, TaskId};
use tokio::sync::broadcast::{self, error::RecvError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Loopback address every test binds its client to.
pub const LOOPBACK: &str = "127.0.0.1";

/// Deterministic file body of `len` bytes.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Engine config with a temp download dir and a fast progress interval.
pub fn config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        default_download_dir: dir.to_path_buf(),
        progress_interval_ms: 50,
        ..EngineConfig::default()
    }
}

/// Mounts HEAD and GET for `route` serving `content` in full.
pub async fn mount_file(server: &MockServer, route: &str, content: &[u8]) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", content.len().to_string().as_str())
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(server)
        .await;
}

/// Mounts a 206 reply for `Range: bytes=<offset>-` on `route`.
pub async fn mount_range(server: &MockServer, route: &str, content: &[u8], offset: usize) {
    let range = format!("bytes={}-", offset);
    let content_range = format!("bytes {}-{}/{}", offset, content.len() - 1, content.len());
    Mock::given(method("GET"))
        .and(path(route))
        .and(header("Range", range.as_str()))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", content_range.as_str())
                .set_body_bytes(content[offset..].to_vec()),
        )
        .with_priority(1)
        .expect(1)
        .mount(server)
        .await;
}

/// Waits for the terminal event of task `id`.
pub async fn wait_terminal(events: &mut broadcast::Receiver<TaskEvent>, id: TaskId) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(event) if event.task_id() == id && event.is_terminal() => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed before task {} ended", id),
            }
        }
    })
    .await
    .expect("timed out waiting for terminal event")
}

/// Polls `check` every 10 ms until it holds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
