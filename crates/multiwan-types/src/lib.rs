//! Shared types for multiwan
//!
//! This crate contains the data structures shared between the core
//! engine and the CLI: task snapshots, progress events and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Numeric task identifier, assigned by the registry starting at 1
pub type TaskId = u64;

/// Literal shown while no speed sample is available yet
pub const ETA_CALCULATING: &str = "Calculating...";

/// Filename used when neither the server nor the URL provide one
pub const FALLBACK_FILENAME: &str = "downloaded_file";

// ============================================================================
// Task Types
// ============================================================================

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task occupies its interface
    pub fn holds_interface(&self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Everything needed to create a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub source_ip: String,
    pub destination: PathBuf,
    /// Overrides the probed filename
    pub filename: Option<String>,
    /// MB/s, `None` or `0` means unlimited
    pub speed_limit: Option<f64>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, source_ip: impl Into<String>, destination: PathBuf) -> Self {
        Self {
            url: url.into(),
            source_ip: source_ip.into(),
            destination,
            filename: None,
            speed_limit: None,
        }
    }

    pub fn with_speed_limit(mut self, speed_limit: Option<f64>) -> Self {
        self.speed_limit = speed_limit;
        self
    }
}

/// Point-in-time view of a registered task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub url: String,
    pub source_ip: String,
    pub destination: PathBuf,
    pub filename: Option<String>,
    /// Full destination path once the filename is resolved
    pub file_path: Option<PathBuf>,
    pub speed_limit: Option<f64>,
    pub status: TaskStatus,
    pub downloaded: u64,
    /// 0 until known
    pub total: u64,
    pub speed_mbps: f64,
    pub eta: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Integer percentage, 0 while the total is unknown
    pub fn percentage(&self) -> u8 {
        percentage(self.downloaded, self.total)
    }
}

/// `floor(downloaded * 100 / total)`, clamped to 100, 0 when total is unknown
pub fn percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (downloaded as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// A local interface a task can be bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceBinding {
    pub name: String,
    pub ip: String,
}

impl std::fmt::Display for InterfaceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name == self.ip {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{} ({})", self.name, self.ip)
        }
    }
}

/// Parses `name=ip`, or a bare `ip` which doubles as the name
impl std::str::FromStr for InterfaceBinding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, ip) = match s.split_once('=') {
            Some((name, ip)) => (name.trim(), ip.trim()),
            None => (s.trim(), s.trim()),
        };
        if name.is_empty() || ip.is_empty() {
            return Err(format!("invalid interface binding: {:?}", s));
        }
        Ok(Self {
            name: name.to_string(),
            ip: ip.to_string(),
        })
    }
}

// ============================================================================
// Probe Types
// ============================================================================

/// Metadata learned from a HEAD probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    /// Content-Length, 0 when absent
    pub file_size: u64,
    pub filename: String,
    pub supports_resume: bool,
    pub content_type: String,
    /// URL after redirects
    pub final_url: String,
}

// ============================================================================
// Event Types
// ============================================================================

/// A progress sample, emitted at most once per second per task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percentage: u8,
    pub downloaded: u64,
    pub total: u64,
    pub speed_mbps: f64,
    pub eta: String,
}

/// Events emitted by the core to its consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TaskEvent {
    Progress {
        id: TaskId,
        progress: ProgressUpdate,
    },
    StatusChanged {
        id: TaskId,
        status: TaskStatus,
    },
    Completed {
        id: TaskId,
        path: PathBuf,
    },
    Failed {
        id: TaskId,
        message: String,
    },
    Cancelled {
        id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Progress { id, .. }
            | TaskEvent::StatusChanged { id, .. }
            | TaskEvent::Completed { id, .. }
            | TaskEvent::Failed { id, .. }
            | TaskEvent::Cancelled { id } => *id,
        }
    }

    /// Completion, failure and cancellation free the task's interface
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
        )
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_download_dir: PathBuf,
    /// Streaming chunk size in bytes
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Verify TLS certificates
    pub verify_tls: bool,
    /// How often a paused transfer re-checks its flags
    pub pause_poll_interval_ms: u64,
    /// Minimum spacing between progress samples
    pub progress_interval_ms: u64,
    /// MB/s applied by the CLI when no limit is given
    pub default_speed_limit: Option<f64>,
    /// Not used by the engine; kept for higher layers
    pub max_retry_attempts: u32,
    /// Not used by the engine; kept for higher layers
    pub retry_delay_secs: u64,
    /// Echo service answering `{"origin": "<caller ip>"}`, used to check
    /// that traffic really leaves through a source address
    pub ip_check_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_download_dir: dirs::home_dir()
                .map(|p| p.join("Downloads"))
                .unwrap_or_else(|| PathBuf::from(".")),
            chunk_size: 8192,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            verify_tls: false,
            pause_poll_interval_ms: 100,
            progress_interval_ms: 1000,
            default_speed_limit: None,
            max_retry_attempts: 3,
            retry_delay_secs: 5,
            ip_check_url: "http://httpbin.org/ip".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_floors_and_clamps() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(500, 0), 0);
        assert_eq!(percentage(999_999, 1_000_000), 99);
        assert_eq!(percentage(1_000_000, 1_000_000), 100);
        assert_eq!(percentage(2_000, 1_000), 100);
    }

    #[test]
    fn only_active_states_hold_interface() {
        assert!(TaskStatus::Downloading.holds_interface());
        assert!(TaskStatus::Paused.holds_interface());
        assert!(!TaskStatus::Queued.holds_interface());
        assert!(!TaskStatus::Completed.holds_interface());
        assert!(!TaskStatus::Failed.holds_interface());
        assert!(!TaskStatus::Cancelled.holds_interface());
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "chunk_size": 4096, "verify_tls": true }"#).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert!(config.verify_tls);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.read_timeout_secs, 60);
        assert_eq!(config.pause_poll_interval_ms, 100);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.ip_check_url, "http://httpbin.org/ip");
    }

    #[test]
    fn interface_binding_parses_named_and_bare() {
        let named: InterfaceBinding = "wan1=192.168.1.20".parse().unwrap();
        assert_eq!(named.name, "wan1");
        assert_eq!(named.ip, "192.168.1.20");
        assert_eq!(named.to_string(), "wan1 (192.168.1.20)");

        let bare: InterfaceBinding = "10.0.0.2".parse().unwrap();
        assert_eq!(bare.name, "10.0.0.2");
        assert_eq!(bare.to_string(), "10.0.0.2");

        assert!("wan1=".parse::<InterfaceBinding>().is_err());
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = TaskEvent::Failed {
            id: 7,
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Failed");
        assert_eq!(json["payload"]["id"], 7);
        assert!(event.is_terminal());
        assert_eq!(event.task_id(), 7);
    }
}
