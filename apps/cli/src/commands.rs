//! CLI command implementations

use crate::output::{format_bytes, format_size, print_output};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{bail, Result};
use console::style;
use multiwan_core::{
    get_download_info, verify_source_ip, InterfaceQueue, SourceIpCheck, TaskRegistry,
};
use multiwan_types::{
    DownloadInfo, DownloadRequest, EngineConfig, InterfaceBinding, TaskEvent, TaskSnapshot,
    TaskStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Fetch
// ============================================================================

/// Pair every URL with a source address, cycling through the addresses
fn assign_round_robin<'a>(
    urls: &'a [String],
    bindings: &'a [InterfaceBinding],
) -> Vec<(&'a str, &'a InterfaceBinding)> {
    urls.iter()
        .zip(bindings.iter().cycle())
        .map(|(url, binding)| (url.as_str(), binding))
        .collect()
}

/// Interface name for every bound address
///
/// Keyed by address so the same URL fetched through two interfaces keeps
/// distinct labels.
fn interface_labels(assignments: &[(&str, &InterfaceBinding)]) -> HashMap<String, String> {
    assignments
        .iter()
        .map(|(_, binding)| (binding.ip.clone(), binding.name.clone()))
        .collect()
}

pub async fn fetch(
    config: EngineConfig,
    urls: Vec<String>,
    bindings: Vec<InterfaceBinding>,
    dir: Option<PathBuf>,
    limit: Option<f64>,
    format: OutputFormat,
) -> Result<()> {
    if bindings.is_empty() {
        bail!("at least one --source-ip is required");
    }

    let destination = dir.unwrap_or_else(|| config.default_download_dir.clone());
    let limit = limit.or(config.default_speed_limit);

    let registry = Arc::new(TaskRegistry::new(config));
    let queue = Arc::new(InterfaceQueue::new(registry.clone()));

    let assignments = assign_round_robin(&urls, &bindings);
    let labels = interface_labels(&assignments);
    for (url, binding) in assignments {
        let request = DownloadRequest::new(url, binding.ip.as_str(), destination.clone())
            .with_speed_limit(limit);
        queue.enqueue(request).await?;
    }

    let mut events = registry.subscribe();
    let dispatcher = queue.clone().spawn();
    let mut progress = DownloadProgress::new();
    let mut remaining = urls.len();
    let mut failed = 0usize;

    while remaining > 0 {
        let event = tokio::select! {
            received = events.recv() => received,
            _ = tokio::signal::ctrl_c() => {
                registry.cancel_all().await;
                progress.clear();
                dispatcher.abort();
                bail!("interrupted");
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        if let TaskEvent::StatusChanged {
            id,
            status: TaskStatus::Downloading,
        } = &event
        {
            if matches!(format, OutputFormat::Human) {
                if let Some(snapshot) = registry.get(*id).await {
                    let via = labels
                        .get(&snapshot.source_ip)
                        .cloned()
                        .unwrap_or_else(|| snapshot.source_ip.clone());
                    progress.add_task(*id, &format!("#{} {} via {}", id, short_name(&snapshot.url), via));
                }
            }
        }

        if matches!(format, OutputFormat::Human) {
            progress.handle_event(&event);
        }

        if event.is_terminal() {
            remaining -= 1;
            if matches!(event, TaskEvent::Failed { .. }) {
                failed += 1;
            }
        }
    }

    dispatcher.abort();

    if let OutputFormat::Json = format {
        let tasks: Vec<TaskSnapshot> = registry.list().await;
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        let tasks = registry.list().await;
        let bytes: u64 = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.downloaded)
            .sum();
        println!(
            "{} {} of {} downloads finished ({})",
            style("✓").green().bold(),
            urls.len() - failed,
            urls.len(),
            format_bytes(bytes)
        );
    }

    if failed > 0 {
        bail!("{} download(s) failed", failed);
    }
    Ok(())
}

/// Last path segment of a URL, for progress labels
fn short_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(url)
}

// ============================================================================
// Probe
// ============================================================================

#[derive(Debug, Serialize)]
struct ProbeResult {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<DownloadInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ProbeReport(Vec<ProbeResult>);

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.0 {
            match (&result.info, &result.error) {
                (Some(info), _) => {
                    writeln!(f, "{} {}", style("✓").green(), info.filename)?;
                    writeln!(f, "    Size: {}", format_size(info.file_size))?;
                    writeln!(f, "    Type: {}", info.content_type)?;
                    writeln!(
                        f,
                        "    Resumable: {}",
                        if info.supports_resume {
                            style("Yes").green()
                        } else {
                            style("No").yellow()
                        }
                    )?;
                    if info.final_url != result.url {
                        writeln!(f, "    Final URL: {}", info.final_url)?;
                    }
                }
                (None, error) => {
                    writeln!(
                        f,
                        "{} {}: {}",
                        style("✗").red(),
                        result.url,
                        style(error.as_deref().unwrap_or("unknown error")).red()
                    )?;
                }
            }
        }
        Ok(())
    }
}

pub async fn probe_urls(
    config: &EngineConfig,
    urls: Vec<String>,
    source_ip: &str,
    format: OutputFormat,
) -> Result<()> {
    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        let result = match get_download_info(&url, source_ip, config).await {
            Ok(info) => ProbeResult {
                url,
                info: Some(info),
                error: None,
            },
            Err(e) => ProbeResult {
                url,
                info: None,
                error: Some(e.to_string()),
            },
        };
        results.push(result);
    }

    print_output(&ProbeReport(results), format)
}

// ============================================================================
// Verify
// ============================================================================

#[derive(Debug, Serialize)]
struct VerifyResult {
    name: String,
    #[serde(flatten)]
    check: Option<SourceIpCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct VerifyReport(Vec<VerifyResult>);

impl VerifyReport {
    fn all_verified(&self) -> bool {
        self.0
            .iter()
            .all(|r| r.check.as_ref().is_some_and(|c| c.matches))
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.0 {
            match (&result.check, &result.error) {
                (Some(check), _) if check.matches => {
                    writeln!(f, "{} {} ({})", style("✓").green(), result.name, check.source_ip)?;
                }
                (Some(check), _) => {
                    writeln!(
                        f,
                        "{} {} ({}): seen as {}",
                        style("✗").red(),
                        result.name,
                        check.source_ip,
                        style(&check.observed).yellow()
                    )?;
                }
                (None, error) => {
                    writeln!(
                        f,
                        "{} {}: {}",
                        style("✗").red(),
                        result.name,
                        style(error.as_deref().unwrap_or("unknown error")).red()
                    )?;
                }
            }
        }
        Ok(())
    }
}

pub async fn verify_sources(
    config: &EngineConfig,
    bindings: Vec<InterfaceBinding>,
    format: OutputFormat,
) -> Result<()> {
    let mut results = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let result = match verify_source_ip(&binding.ip, config).await {
            Ok(check) => VerifyResult {
                name: binding.name,
                check: Some(check),
                error: None,
            },
            Err(e) => VerifyResult {
                name: binding.name,
                check: None,
                error: Some(e.to_string()),
            },
        };
        results.push(result);
    }

    let report = VerifyReport(results);
    print_output(&report, format)?;
    if !report.all_verified() {
        bail!("some source addresses did not verify");
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config_action(
    config: &EngineConfig,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(config)?);
            }
            OutputFormat::Human => {
                println!("multiwan Configuration:");
                println!();
                println!(
                    "  Default download dir: {}",
                    config.default_download_dir.display()
                );
                println!("  Chunk size: {}", format_bytes(config.chunk_size as u64));
                println!(
                    "  Timeouts: connect {}s, read {}s",
                    config.connect_timeout_secs, config.read_timeout_secs
                );
                println!("  Verify TLS: {}", config.verify_tls);
                println!(
                    "  Default speed limit: {}",
                    config
                        .default_speed_limit
                        .map(|l| format!("{} MB/s", l))
                        .unwrap_or_else(|| "Unlimited".to_string())
                );
                println!("  Progress interval: {} ms", config.progress_interval_ms);
                println!("  IP check URL: {}", config.ip_check_url);
            }
        },
    }

    Ok(())
}
