//! Metadata probing
//!
//! Issues a HEAD request through a source-bound client to learn the size,
//! filename, resume support and content type of a remote file.

use crate::engine::session::create_bound_session;
use crate::error::EngineError;
use multiwan_types::{DownloadInfo, EngineConfig, FALLBACK_FILENAME};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Probe `url` through `source_ip` without downloading the body
pub async fn get_download_info(
    url: &str,
    source_ip: &str,
    config: &EngineConfig,
) -> Result<DownloadInfo, EngineError> {
    info!("Probing {} via {}", url, source_ip);

    let client = create_bound_session(source_ip, config)?;
    let response = client
        .head(url)
        .timeout(Duration::from_secs(config.connect_timeout_secs))
        .send()
        .await
        .map_err(|e| EngineError::network(e, 0))?;

    let status = response.status();
    if !status.is_success() {
        warn!("Probe of {} returned {}", url, status);
        return Err(EngineError::Network {
            message: format!("HTTP status {} for {}", status, url),
            downloaded: 0,
        });
    }

    let headers = response.headers();
    let info = DownloadInfo {
        file_size: content_length(headers).unwrap_or(0),
        filename: extract_filename(url, headers),
        supports_resume: headers.contains_key(ACCEPT_RANGES),
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string(),
        final_url: response.url().to_string(),
    };

    info!(
        "Probed {}: {} bytes, filename={}, resumable={}",
        url, info.file_size, info.filename, info.supports_resume
    );
    Ok(info)
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Content-Disposition first, then the URL path, then `downloaded_file`
pub fn extract_filename(url: &str, headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

/// Pulls the `filename=` token out of a Content-Disposition value
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let (_, raw) = value.rsplit_once("filename=")?;
    let raw = raw.split(';').next().unwrap_or(raw);
    let raw = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    non_empty(basename(&percent_decode(raw)))
}

/// Last path segment of the URL with the query string removed
pub fn filename_from_url(url: &str) -> Option<String> {
    let segment = match url::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)?,
        Err(_) => {
            let path = url.split(['?', '#']).next().unwrap_or(url);
            path.rsplit('/').next()?.to_string()
        }
    };
    non_empty(percent_decode(&segment))
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

// Never let a header walk out of the destination directory
fn basename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

fn non_empty(name: String) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        None
    } else {
        Some(trimmed.to_string())
    }
}
