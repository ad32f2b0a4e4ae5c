//! Download worker - the execution unit of one task
//!
//! Probes the URL, resolves the destination path and drives the transfer
//! engine. Progress samples are forwarded to the event channel.

use crate::engine::transfer::{TransferEngine, TransferOutcome};
use crate::error::EngineError;
use multiwan_types::{DownloadRequest, EngineConfig, TaskEvent, TaskId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Terminal result of a worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed(PathBuf),
    Failed(String),
    Cancelled,
}

/// Worker that runs a single download for the registry
pub struct DownloadWorker {
    id: TaskId,
    request: DownloadRequest,
    engine: TransferEngine,
    /// Destination path, known once the filename is resolved
    file_path: Mutex<Option<PathBuf>>,
    event_tx: broadcast::Sender<TaskEvent>,
}

impl DownloadWorker {
    pub fn new(
        id: TaskId,
        request: DownloadRequest,
        config: Arc<EngineConfig>,
        event_tx: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            id,
            request,
            engine: TransferEngine::new(config),
            file_path: Mutex::new(None),
            event_tx,
        }
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Run the download to its terminal outcome
    pub async fn run(&self) -> WorkerOutcome {
        info!(
            "Starting task {}: {} via {}",
            self.id, self.request.url, self.request.source_ip
        );

        let result = self.execute().await;
        self.engine.state().clear_speed();

        match result {
            Ok(TransferOutcome::Completed { path, bytes }) => {
                info!("Task {} completed: {} ({} bytes)", self.id, path.display(), bytes);
                WorkerOutcome::Completed(path)
            }
            Ok(TransferOutcome::Cancelled { downloaded }) => {
                info!("Task {} cancelled after {} bytes", self.id, downloaded);
                // The file may have been created after cancel() looked for it
                self.remove_partial_file().await;
                WorkerOutcome::Cancelled
            }
            Err(_) if self.is_cancelled() => {
                self.remove_partial_file().await;
                WorkerOutcome::Cancelled
            }
            Err(e) => {
                error!("Task {} failed: {}", self.id, e);
                WorkerOutcome::Failed(e.failure_message())
            }
        }
    }

    async fn execute(&self) -> Result<TransferOutcome, EngineError> {
        let request = &self.request;

        tokio::fs::create_dir_all(&request.destination)
            .await
            .map_err(|e| EngineError::filesystem(&request.destination, e))?;

        let info = self
            .engine
            .get_download_info(&request.url, &request.source_ip)
            .await?;

        if self.is_cancelled() {
            return Ok(TransferOutcome::Cancelled { downloaded: 0 });
        }

        let filename = request
            .filename
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(info.filename);
        let path = request.destination.join(filename);
        *self.file_path.lock() = Some(path.clone());
        self.engine.state().set_total(info.file_size);

        let id = self.id;
        let events = self.event_tx.clone();
        self.engine
            .download_file(
                &request.url,
                &request.source_ip,
                &path,
                request.speed_limit,
                |update| {
                    let _ = events.send(TaskEvent::Progress {
                        id,
                        progress: update.clone(),
                    });
                },
            )
            .await
    }

    pub fn pause(&self) {
        self.engine.pause();
        info!("Task {} paused", self.id);
    }

    pub fn resume(&self) {
        self.engine.resume();
        info!("Task {} resumed", self.id);
    }

    /// Stop the transfer and delete the partial file
    pub async fn cancel(&self) {
        self.engine.cancel();
        self.remove_partial_file().await;
        info!("Task {} cancelled", self.id);
    }

    pub fn is_paused(&self) -> bool {
        self.engine.control().is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.engine.control().is_cancelled()
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.file_path.lock().clone()
    }

    pub fn downloaded(&self) -> u64 {
        self.engine.state().downloaded()
    }

    pub fn total(&self) -> u64 {
        self.engine.state().total()
    }

    /// Most recent speed sample in MB/s
    pub fn speed_mbps(&self) -> f64 {
        self.engine.state().speed_mbps()
    }

    pub fn eta(&self) -> String {
        self.engine.state().eta()
    }

    async fn remove_partial_file(&self) {
        let Some(path) = self.file_path() else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed partial file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(dir: &std::path::Path) -> DownloadWorker {
        let (event_tx, _) = broadcast::channel(16);
        let request = DownloadRequest::new("http://127.0.0.1:9/data.bin", "127.0.0.1", dir.to_path_buf());
        DownloadWorker::new(1, request, Arc::new(EngineConfig::default()), event_tx)
    }

    #[tokio::test]
    async fn cancel_deletes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let worker = worker(dir.path());
        *worker.file_path.lock() = Some(path.clone());
        worker.cancel().await;

        assert!(worker.is_cancelled());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cancel_without_file_only_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path());
        worker.cancel().await;
        assert!(worker.is_cancelled());
        assert_eq!(worker.file_path(), None);
    }

    #[tokio::test]
    async fn pause_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0u8; 128]).unwrap();

        let worker = worker(dir.path());
        *worker.file_path.lock() = Some(path.clone());
        worker.pause();
        assert!(worker.is_paused());
        assert!(path.exists());
        worker.resume();
        assert!(!worker.is_paused());
    }
}
