//! Interface queue - FIFO of pending requests, one active task per interface

use crate::engine::{validate_request, TaskRegistry};
use crate::error::EngineError;
use multiwan_types::{DownloadRequest, TaskEvent, TaskId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Holds requests until their interface is idle
///
/// Requests leave the queue in order. A request whose interface is busy
/// does not block requests behind it that are bound to another interface.
pub struct InterfaceQueue {
    registry: Arc<TaskRegistry>,
    pending: Mutex<VecDeque<DownloadRequest>>,
}

impl InterfaceQueue {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Append a request to the end of the queue
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<(), EngineError> {
        validate_request(&request)?;
        debug!("Queued {} for {}", request.url, request.source_ip);
        self.pending.lock().await.push_back(request);
        Ok(())
    }

    /// Pending requests in queue order
    pub async fn pending(&self) -> Vec<DownloadRequest> {
        self.pending.lock().await.iter().cloned().collect()
    }

    pub async fn pending_for(&self, ip: &str) -> Vec<DownloadRequest> {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|request| request.source_ip == ip)
            .cloned()
            .collect()
    }

    /// Drop the pending request at `index`
    pub async fn remove(&self, index: usize) -> Option<DownloadRequest> {
        self.pending.lock().await.remove(index)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Start the first pending request of every idle interface
    ///
    /// Returns the IDs of the tasks that were started. Holding the queue lock
    /// for the whole pass serializes concurrent dispatches.
    pub async fn dispatch(&self) -> Result<Vec<TaskId>, EngineError> {
        let mut pending = self.pending.lock().await;
        let mut started = Vec::new();
        let mut busy: HashSet<String> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(pending.len());

        while let Some(request) = pending.pop_front() {
            if busy.contains(&request.source_ip) {
                remaining.push_back(request);
                continue;
            }

            let ip = request.source_ip.clone();
            match self.registry.start_if_idle(request.clone()).await {
                Ok(Some(id)) => {
                    info!("Dispatched task {} on {}", id, ip);
                    started.push(id);
                }
                Ok(None) => remaining.push_back(request),
                Err(e) => {
                    // Put the unstarted tail back before reporting
                    remaining.push_back(request);
                    remaining.extend(pending.drain(..));
                    *pending = remaining;
                    return Err(e);
                }
            }
            busy.insert(ip);
        }

        *pending = remaining;
        Ok(started)
    }

    /// Re-dispatch whenever a task reaches a terminal state
    ///
    /// Returns once the event channel closes.
    pub async fn run(&self, mut events: broadcast::Receiver<TaskEvent>) {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() => self.redispatch().await,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Queue lagged behind {} events", skipped);
                    self.redispatch().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Dispatch once, then keep dispatching in the background
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let events = self.registry.subscribe();
        tokio::spawn(async move {
            self.redispatch().await;
            self.run(events).await;
        })
    }

    async fn redispatch(&self) {
        if let Err(e) = self.dispatch().await {
            warn!("Queue dispatch failed: {}", e);
        }
    }
}
