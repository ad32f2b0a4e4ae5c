//! Task registry - owns all tasks and their execution units
//!
//! This is the top-level coordinator that:
//! - Assigns task IDs and creates workers
//! - Starts/pauses/resumes/cancels tasks
//! - Answers the per-interface busy check used for admission control
//! - Aggregates statistics over downloading tasks
//!
//! The registry does not refuse to start a task on a busy interface.
//! Callers check `is_interface_busy` first, or use `start_if_idle` which
//! performs the check and the start under one lock.

use crate::engine::session::parse_source_ip;
use crate::engine::worker::{DownloadWorker, WorkerOutcome};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use multiwan_types::{DownloadRequest, EngineConfig, TaskEvent, TaskId, TaskSnapshot, TaskStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type TaskMap = Arc<RwLock<BTreeMap<TaskId, TaskEntry>>>;

/// A registered task and its worker
struct TaskEntry {
    status: TaskStatus,
    worker: Arc<DownloadWorker>,
    /// Join handle of the current execution unit
    handle: Option<JoinHandle<()>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    fn unit_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn source_ip(&self) -> &str {
        &self.worker.request().source_ip
    }

    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        let request = self.worker.request();
        TaskSnapshot {
            id,
            url: request.url.clone(),
            source_ip: request.source_ip.clone(),
            destination: request.destination.clone(),
            filename: request.filename.clone(),
            file_path: self.worker.file_path(),
            speed_limit: request.speed_limit,
            status: self.status,
            downloaded: self.worker.downloaded(),
            total: self.worker.total(),
            speed_mbps: self.worker.speed_mbps(),
            eta: self.worker.eta(),
            error: self.error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Registry that coordinates all tasks
pub struct TaskRegistry {
    tasks: TaskMap,
    next_id: AtomicU64,
    config: Arc<EngineConfig>,
    event_tx: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    /// Create a new registry
    pub fn new(config: EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tasks: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
            config: Arc::new(config),
            event_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to task events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    /// Register a new queued task; it is not started
    pub async fn add_task(
        &self,
        url: &str,
        source_ip: &str,
        destination: impl Into<std::path::PathBuf>,
        filename: Option<String>,
        speed_limit: Option<f64>,
    ) -> Result<TaskId, EngineError> {
        let mut request = DownloadRequest::new(url, source_ip, destination.into());
        request.filename = filename;
        request.speed_limit = speed_limit;
        self.add_request(request).await
    }

    /// Register a new queued task from a prepared request
    pub async fn add_request(&self, request: DownloadRequest) -> Result<TaskId, EngineError> {
        validate_request(&request)?;
        let mut tasks = self.tasks.write().await;
        Ok(self.insert(&mut tasks, request))
    }

    fn insert(&self, tasks: &mut BTreeMap<TaskId, TaskEntry>, request: DownloadRequest) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        info!("Adding task {}: {} via {}", id, request.url, request.source_ip);

        let worker = DownloadWorker::new(id, request, self.config.clone(), self.event_tx.clone());
        tasks.insert(
            id,
            TaskEntry {
                status: TaskStatus::Queued,
                worker: Arc::new(worker),
                handle: None,
                error: None,
                created_at: Utc::now(),
                finished_at: None,
            },
        );
        id
    }

    /// Start a queued or paused task
    pub async fn start(&self, id: TaskId) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        match entry.status {
            TaskStatus::Queued | TaskStatus::Paused => {
                self.activate(id, entry);
                Ok(())
            }
            other => Err(EngineError::InvalidOperation(format!(
                "cannot start task {} while {}",
                id, other
            ))),
        }
    }

    /// Start a queued or paused task only if no other task holds its interface
    ///
    /// Returns `false` and leaves the task untouched when the interface is busy.
    pub async fn try_start_exclusive(&self, id: TaskId) -> Result<bool, EngineError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get(&id).ok_or(EngineError::NotFound(id))?;
        if !matches!(entry.status, TaskStatus::Queued | TaskStatus::Paused) {
            return Err(EngineError::InvalidOperation(format!(
                "cannot start task {} while {}",
                id, entry.status
            )));
        }
        let ip = entry.source_ip().to_string();
        let held_elsewhere = tasks
            .iter()
            .any(|(other, e)| *other != id && e.source_ip() == ip && e.status.holds_interface());
        if held_elsewhere {
            return Ok(false);
        }
        if let Some(entry) = tasks.get_mut(&id) {
            self.activate(id, entry);
        }
        Ok(true)
    }

    /// Register and start a task only if its interface is idle
    ///
    /// Returns `None` and registers nothing when the interface is busy.
    pub async fn start_if_idle(&self, request: DownloadRequest) -> Result<Option<TaskId>, EngineError> {
        validate_request(&request)?;
        let mut tasks = self.tasks.write().await;
        if busy(&tasks, &request.source_ip) {
            debug!("Interface {} busy, not starting {}", request.source_ip, request.url);
            return Ok(None);
        }

        let id = self.insert(&mut tasks, request);
        if let Some(entry) = tasks.get_mut(&id) {
            self.activate(id, entry);
        }
        Ok(Some(id))
    }

    /// Pause a queued or downloading task
    pub async fn pause(&self, id: TaskId) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        match entry.status {
            TaskStatus::Queued | TaskStatus::Downloading => {
                self.suspend(id, entry);
                Ok(())
            }
            other => Err(EngineError::InvalidOperation(format!(
                "cannot pause task {} while {}",
                id, other
            ))),
        }
    }

    /// Resume a paused task; a task that never ran is started
    pub async fn resume(&self, id: TaskId) -> Result<(), EngineError> {
        self.start(id).await
    }

    /// Cancel a task, delete its partial file and remove it from the registry
    pub async fn cancel(&self, id: TaskId) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        let status = tasks.get(&id).ok_or(EngineError::NotFound(id))?.status;
        if status == TaskStatus::Completed {
            return Err(EngineError::InvalidOperation(format!(
                "task {} already completed; use remove",
                id
            )));
        }
        let removed = tasks.remove(&id);
        drop(tasks);

        if let Some(entry) = removed {
            self.abort(id, entry).await;
        }
        Ok(())
    }

    /// Remove a completed or failed task, leaving its file in place
    pub async fn remove(&self, id: TaskId) -> Result<TaskSnapshot, EngineError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get(&id).ok_or(EngineError::NotFound(id))?;
        if !entry.status.is_terminal() {
            return Err(EngineError::InvalidOperation(format!(
                "task {} is {}; cancel it instead",
                id, entry.status
            )));
        }
        let snapshot = entry.snapshot(id);
        tasks.remove(&id);
        Ok(snapshot)
    }

    /// Pause every downloading task
    pub async fn pause_all(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.write().await;
        let mut paused = Vec::new();
        for (id, entry) in tasks.iter_mut() {
            if entry.status == TaskStatus::Downloading {
                self.suspend(*id, entry);
                paused.push(*id);
            }
        }
        paused
    }

    /// Resume every paused task
    pub async fn resume_all(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.write().await;
        let mut resumed = Vec::new();
        for (id, entry) in tasks.iter_mut() {
            if entry.status == TaskStatus::Paused {
                self.activate(*id, entry);
                resumed.push(*id);
            }
        }
        resumed
    }

    /// Cancel every task that has not completed
    pub async fn cancel_all(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.write().await;
        let ids: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, entry)| entry.status != TaskStatus::Completed)
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<(TaskId, TaskEntry)> = ids
            .iter()
            .filter_map(|id| tasks.remove(id).map(|entry| (*id, entry)))
            .collect();
        drop(tasks);

        for (id, entry) in removed {
            self.abort(id, entry).await;
        }
        ids
    }

    /// True iff a task bound to `ip` is downloading or paused
    pub async fn is_interface_busy(&self, ip: &str) -> bool {
        busy(&*self.tasks.read().await, ip)
    }

    /// Number of downloading tasks
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|entry| entry.status == TaskStatus::Downloading)
            .count()
    }

    /// Sum of the latest speed samples of downloading tasks, in MB/s
    pub async fn total_speed(&self) -> f64 {
        self.tasks
            .read()
            .await
            .values()
            .filter(|entry| entry.status == TaskStatus::Downloading)
            .map(|entry| entry.worker.speed_mbps())
            .sum()
    }

    pub async fn get(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.read().await.get(&id).map(|entry| entry.snapshot(id))
    }

    /// Snapshots of all tasks, ordered by ID
    pub async fn list(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|(id, entry)| entry.snapshot(*id))
            .collect()
    }

    /// Move a task to downloading, spawning a unit unless one is alive
    fn activate(&self, id: TaskId, entry: &mut TaskEntry) {
        entry.worker.resume();
        if entry.unit_alive() {
            info!("Unpaused running task {}", id);
        } else {
            info!("Launching task {} on {}", id, entry.source_ip());
            entry.handle = Some(self.spawn_unit(id, entry.worker.clone()));
        }
        entry.status = TaskStatus::Downloading;
        self.emit(TaskEvent::StatusChanged {
            id,
            status: TaskStatus::Downloading,
        });
    }

    fn suspend(&self, id: TaskId, entry: &mut TaskEntry) {
        entry.worker.pause();
        entry.status = TaskStatus::Paused;
        self.emit(TaskEvent::StatusChanged {
            id,
            status: TaskStatus::Paused,
        });
    }

    /// Cancel a task that has already been taken out of the map
    ///
    /// Must be called without the map lock held; the partial file is
    /// deleted here.
    async fn abort(&self, id: TaskId, entry: TaskEntry) {
        entry.worker.cancel().await;
        self.emit(TaskEvent::Cancelled { id });
    }

    fn spawn_unit(&self, id: TaskId, worker: Arc<DownloadWorker>) -> JoinHandle<()> {
        let tasks = self.tasks.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = worker.run().await;
            finish(&tasks, &event_tx, id, &worker, outcome).await;
        })
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Record the outcome of an execution unit and report it once
async fn finish(
    tasks: &TaskMap,
    event_tx: &broadcast::Sender<TaskEvent>,
    id: TaskId,
    worker: &DownloadWorker,
    outcome: WorkerOutcome,
) {
    let mut tasks = tasks.write().await;
    let Some(entry) = tasks.get_mut(&id) else {
        debug!("Task {} finished after removal", id);
        return;
    };
    // Cancellation was already reported by the registry
    if worker.is_cancelled() {
        return;
    }

    entry.finished_at = Some(Utc::now());
    let event = match outcome {
        WorkerOutcome::Completed(path) => {
            entry.status = TaskStatus::Completed;
            TaskEvent::Completed { id, path }
        }
        WorkerOutcome::Failed(message) => {
            entry.status = TaskStatus::Failed;
            entry.error = Some(message.clone());
            TaskEvent::Failed { id, message }
        }
        WorkerOutcome::Cancelled => {
            warn!("Task {} reported cancellation without a cancel request", id);
            entry.status = TaskStatus::Cancelled;
            TaskEvent::Cancelled { id }
        }
    };
    let _ = event_tx.send(event);
}

fn busy(tasks: &BTreeMap<TaskId, TaskEntry>, ip: &str) -> bool {
    tasks
        .values()
        .any(|entry| entry.source_ip() == ip && entry.status.holds_interface())
}

pub(crate) fn validate_request(request: &DownloadRequest) -> Result<(), EngineError> {
    let parsed = url::Url::parse(&request.url)
        .map_err(|_| EngineError::InvalidUrl(request.url.clone()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(EngineError::InvalidUrl(request.url.clone()));
    }
    parse_source_ip(&request.source_ip)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let registry = registry();
        let a = registry
            .add_task("http://example.com/a", "127.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();
        let b = registry
            .add_task("http://example.com/b", "127.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(registry.get(a).await.unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn rejects_bad_urls_and_ips() {
        let registry = registry();
        let err = registry
            .add_task("ftp://example.com/a", "127.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidUrl(_)));

        let err = registry
            .add_task("http://example.com/a", "wlan0", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSourceIp(_)));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn queued_task_does_not_hold_interface() {
        let registry = registry();
        registry
            .add_task("http://example.com/a", "10.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();
        assert!(!registry.is_interface_busy("10.0.0.1").await);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn pause_then_cancel_queued_task() {
        let registry = registry();
        let mut events = registry.subscribe();
        let id = registry
            .add_task("http://example.com/a", "10.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();

        registry.pause(id).await.unwrap();
        assert_eq!(registry.get(id).await.unwrap().status, TaskStatus::Paused);
        assert!(registry.is_interface_busy("10.0.0.1").await);

        registry.cancel(id).await.unwrap();
        assert!(registry.get(id).await.is_none());
        assert!(!registry.is_interface_busy("10.0.0.1").await);

        let mut saw_cancel = false;
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::Cancelled { id: cancelled } = event {
                assert_eq!(cancelled, id);
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let registry = registry();
        assert!(matches!(registry.start(42).await, Err(EngineError::NotFound(42))));
        assert!(matches!(registry.pause(42).await, Err(EngineError::NotFound(42))));
        assert!(matches!(registry.cancel(42).await, Err(EngineError::NotFound(42))));
    }

    #[tokio::test]
    async fn exclusive_start_refuses_held_interface() {
        let registry = registry();
        let held = registry
            .add_task("http://example.com/a", "10.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();
        let waiting = registry
            .add_task("http://example.com/b", "10.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();
        registry.pause(held).await.unwrap();

        assert!(!registry.try_start_exclusive(waiting).await.unwrap());
        assert_eq!(registry.get(waiting).await.unwrap().status, TaskStatus::Queued);

        let queued = DownloadRequest::new("http://example.com/c", "10.0.0.1", PathBuf::from("/tmp"));
        assert_eq!(registry.start_if_idle(queued).await.unwrap(), None);
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn remove_refuses_live_tasks() {
        let registry = registry();
        let id = registry
            .add_task("http://example.com/a", "10.0.0.1", PathBuf::from("/tmp"), None, None)
            .await
            .unwrap();
        assert!(matches!(
            registry.remove(id).await,
            Err(EngineError::InvalidOperation(_))
        ));
    }
}
