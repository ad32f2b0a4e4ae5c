//! Transfer engine - streams one file through a source-bound client
//!
//! Handles resume detection, range negotiation, fixed-size chunking,
//! cooperative pause/cancel, per-chunk throttling and progress sampling.

use crate::engine::probe::{self, content_length};
use crate::engine::progress::ProgressTracker;
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::session::create_bound_session;
use crate::error::EngineError;
use bytes::BytesMut;
use futures::StreamExt;
use multiwan_types::{DownloadInfo, EngineConfig, ProgressUpdate, ETA_CALCULATING};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Pause and cancel flags shared between a transfer and its controllers
#[derive(Debug, Default)]
pub struct TransferControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl TransferControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Progress fields of a transfer
///
/// Written only by the transfer's own execution unit, read by pollers.
/// Readers may see slightly stale values.
#[derive(Debug)]
pub struct TransferState {
    downloaded: AtomicU64,
    total: AtomicU64,
    /// f64 bits of the last speed sample in MB/s
    speed_bits: AtomicU64,
    eta: Mutex<String>,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            speed_bits: AtomicU64::new(0f64.to_bits()),
            eta: Mutex::new(ETA_CALCULATING.to_string()),
        }
    }
}

impl TransferState {
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn speed_mbps(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    pub fn eta(&self) -> String {
        self.eta.lock().clone()
    }

    pub(crate) fn set_downloaded(&self, bytes: u64) {
        self.downloaded.store(bytes, Ordering::Release);
    }

    pub(crate) fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::Release);
    }

    pub(crate) fn record_sample(&self, update: &ProgressUpdate) {
        self.speed_bits
            .store(update.speed_mbps.to_bits(), Ordering::Release);
        *self.eta.lock() = update.eta.clone();
    }

    /// Speed drops to zero once the transfer stops
    pub(crate) fn clear_speed(&self) {
        self.speed_bits.store(0f64.to_bits(), Ordering::Release);
    }
}

/// How a transfer that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { path: PathBuf, bytes: u64 },
    /// The destination file is left on disk
    Cancelled { downloaded: u64 },
}

/// Engine for downloading one file with source IP binding
pub struct TransferEngine {
    config: Arc<EngineConfig>,
    control: Arc<TransferControl>,
    state: Arc<TransferState>,
}

impl TransferEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            control: Arc::new(TransferControl::default()),
            state: Arc::new(TransferState::default()),
        }
    }

    pub fn control(&self) -> Arc<TransferControl> {
        self.control.clone()
    }

    pub fn state(&self) -> Arc<TransferState> {
        self.state.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Stop at the next chunk boundary; the file is not touched
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub async fn get_download_info(&self, url: &str, source_ip: &str) -> Result<DownloadInfo, EngineError> {
        probe::get_download_info(url, source_ip, &self.config).await
    }

    /// Download `url` through `source_ip` into `dest_path`
    ///
    /// An existing `dest_path` is resumed with a `Range` request. A server that
    /// answers the range with 200 restarts the file from zero. `on_progress`
    /// is called at most once per progress interval.
    pub async fn download_file<F>(
        &self,
        url: &str,
        source_ip: &str,
        dest_path: &Path,
        speed_limit: Option<f64>,
        mut on_progress: F,
    ) -> Result<TransferOutcome, EngineError>
    where
        F: FnMut(&ProgressUpdate),
    {
        let client = create_bound_session(source_ip, &self.config)?;

        let mut resume_position = existing_size(dest_path).await?;
        self.state.set_downloaded(resume_position);

        if self.control.is_cancelled() {
            return Ok(TransferOutcome::Cancelled {
                downloaded: resume_position,
            });
        }

        let mut request = client.get(url);
        if resume_position > 0 {
            info!("Resuming {} from byte {}", dest_path.display(), resume_position);
            request = request.header(RANGE, format!("bytes={}-", resume_position));
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::network(e, resume_position))?;

        let status = response.status();
        if !status.is_success() {
            warn!("GET {} returned {}", url, status);
            return Err(EngineError::Network {
                message: format!("HTTP status {} for {}", status, url),
                downloaded: resume_position,
            });
        }

        let headers = response.headers();
        let total = if resume_position > 0 && status == StatusCode::PARTIAL_CONTENT {
            content_range_total(headers)
                .unwrap_or_else(|| content_length(headers).unwrap_or(0) + resume_position)
        } else {
            if resume_position > 0 {
                warn!(
                    "Server ignored range request for {} ({}), restarting from 0",
                    url, status
                );
                resume_position = 0;
                self.state.set_downloaded(0);
            }
            content_length(headers).unwrap_or(0)
        };
        self.state.set_total(total);
        debug!("Transfer of {}: status {}, total {} bytes", url, status, total);

        let file = open_destination(dest_path, resume_position > 0).await?;

        let mut writer = ChunkWriter {
            file,
            path: dest_path,
            downloaded: resume_position,
            total,
            limiter: RateLimiter::new(speed_limit),
            tracker: ProgressTracker::new(
                Duration::from_millis(self.config.progress_interval_ms),
                resume_position,
            ),
            poll_interval: Duration::from_millis(self.config.pause_poll_interval_ms),
            control: &self.control,
            state: &self.state,
        };

        let chunk_size = self.config.chunk_size.max(1);
        let mut pending = BytesMut::with_capacity(chunk_size * 2);
        let mut stream = response.bytes_stream();

        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| EngineError::network(e, writer.downloaded))?;
            pending.extend_from_slice(&frame);

            while pending.len() >= chunk_size {
                let chunk = pending.split_to(chunk_size);
                if let Some(outcome) = writer.push(&chunk, &mut on_progress).await? {
                    return Ok(outcome);
                }
            }
        }

        if !pending.is_empty() {
            let chunk = pending.split();
            if let Some(outcome) = writer.push(&chunk, &mut on_progress).await? {
                return Ok(outcome);
            }
        }

        writer.finish().await?;
        info!(
            "Transfer complete: {} ({} bytes)",
            dest_path.display(),
            writer.downloaded
        );

        Ok(TransferOutcome::Completed {
            path: dest_path.to_path_buf(),
            bytes: writer.downloaded,
        })
    }
}

/// Writes fixed-size chunks and applies pause, cancel, throttle and sampling
struct ChunkWriter<'a> {
    file: File,
    path: &'a Path,
    downloaded: u64,
    total: u64,
    limiter: RateLimiter,
    tracker: ProgressTracker,
    poll_interval: Duration,
    control: &'a TransferControl,
    state: &'a TransferState,
}

impl ChunkWriter<'_> {
    /// Returns an outcome when the transfer must stop early
    async fn push<F>(&mut self, chunk: &[u8], on_progress: &mut F) -> Result<Option<TransferOutcome>, EngineError>
    where
        F: FnMut(&ProgressUpdate),
    {
        if self.control.is_cancelled() {
            return Ok(Some(self.cancelled().await));
        }

        while self.control.is_paused() {
            tokio::time::sleep(self.poll_interval).await;
            if self.control.is_cancelled() {
                return Ok(Some(self.cancelled().await));
            }
        }

        self.file
            .write_all(chunk)
            .await
            .map_err(|e| EngineError::filesystem(self.path, e))?;
        self.downloaded += chunk.len() as u64;
        self.state.set_downloaded(self.downloaded);

        self.limiter.throttle(chunk.len()).await;

        if let Some(update) = self.tracker.sample(self.downloaded, self.total) {
            self.state.record_sample(&update);
            on_progress(&update);
        }

        Ok(None)
    }

    async fn cancelled(&mut self) -> TransferOutcome {
        info!(
            "Transfer of {} cancelled after {} bytes",
            self.path.display(),
            self.downloaded
        );
        if let Err(e) = self.file.flush().await {
            debug!("Flush after cancel failed: {}", e);
        }
        TransferOutcome::Cancelled {
            downloaded: self.downloaded,
        }
    }

    async fn finish(&mut self) -> Result<(), EngineError> {
        self.file
            .flush()
            .await
            .map_err(|e| EngineError::filesystem(self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| EngineError::filesystem(self.path, e))
    }
}

/// Size of a partial file at `path`, 0 if there is none
async fn existing_size(path: &Path) -> Result<u64, EngineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(EngineError::filesystem(
            path,
            std::io::Error::new(std::io::ErrorKind::Other, "destination is not a regular file"),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(EngineError::filesystem(path, e)),
    }
}

async fn open_destination(path: &Path, append: bool) -> Result<File, EngineError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| EngineError::filesystem(path, e))
}

/// Total length from `Content-Range: bytes a-b/total`; `*` means unknown
pub(crate) fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
